//! Filesystem blob store.
//!
//! Object `{bucket}/{request_uuid}/{sample_uuid}` is a file of raw frame
//! bytes under the root directory. Its shape lives next to it in
//! `{sample_uuid}.meta`, so the pixel array can be rebuilt on read.

use async_trait::async_trait;
use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use super::{BlobStore, namespace_segment};
use crate::error::{Error, Result};
use crate::model::{Frame, FrameShape, RequestId};

const META_EXT: &str = "meta";

pub struct FsBlobStore {
    root: PathBuf,
    bucket: String,
}

impl FsBlobStore {
    /// Open (and create) `root/bucket`.
    pub async fn open(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Result<Self> {
        let store = Self {
            root: root.into(),
            bucket: bucket.into(),
        };
        if store.bucket.is_empty() || store.bucket.contains('/') {
            return Err(Error::Blob(format!("invalid bucket name {:?}", store.bucket)));
        }
        tokio::fs::create_dir_all(store.root.join(&store.bucket)).await?;
        Ok(store)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn namespace_dir(&self, request: &RequestId) -> Result<PathBuf> {
        let segment = namespace_segment(request)?;
        Ok(self.root.join(&self.bucket).join(segment))
    }

    /// Map an object id onto the filesystem. Only `{bucket}/{request}/{sample}`
    /// ids inside this bucket are accepted.
    fn object_path(&self, object_id: &str) -> Result<PathBuf> {
        let relative = Path::new(object_id);
        let components: Vec<Component<'_>> = relative.components().collect();
        let well_formed = components.len() == 3
            && components.iter().all(|c| matches!(c, Component::Normal(_)))
            && components[0] == Component::Normal(OsStr::new(&self.bucket));
        if !well_formed {
            return Err(Error::Blob(format!("object id outside bucket: {object_id}")));
        }
        Ok(self.root.join(relative))
    }
}

fn meta_path(object: &Path) -> PathBuf {
    object.with_extension(META_EXT)
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put_frame(&self, request: &RequestId, frame: &Frame) -> Result<String> {
        let dir = self.namespace_dir(request)?;
        tokio::fs::create_dir_all(&dir).await?;

        let segment = namespace_segment(request)?;
        let frame_id = format!("{}/{}/{}", self.bucket, segment, Uuid::new_v4());
        let path = self.object_path(&frame_id)?;
        let meta = serde_json::to_vec(&frame.shape)?;
        // Metadata first: a data file without it would be unreadable.
        tokio::fs::write(meta_path(&path), meta).await?;
        tokio::fs::write(&path, &frame.data).await?;

        info!(%frame_id, shape = %frame.shape, "frame saved");
        Ok(frame_id)
    }

    async fn get_frame(&self, frame_id: &str) -> Result<Option<Frame>> {
        let path = self.object_path(frame_id)?;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(frame_id, "frame not in storage");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let meta = match tokio::fs::read(meta_path(&path)).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let shape: FrameShape = serde_json::from_slice(&meta)
            .map_err(|e| Error::Blob(format!("bad shape metadata for {frame_id}: {e}")))?;

        let frame = Frame::new(shape, data);
        if !frame.is_consistent() {
            return Err(Error::Blob(format!(
                "frame {frame_id} has {} bytes, shape {shape} needs {}",
                frame.data.len(),
                shape.byte_len()
            )));
        }
        Ok(Some(frame))
    }

    async fn clear(&self, request: &RequestId) -> Result<()> {
        let dir = self.namespace_dir(request)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(request_uuid = %request, "blob storage cleared");
        Ok(())
    }
}
