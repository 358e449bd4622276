//! Decoded video frames.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Dimensions needed to rebuild the pixel array from raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameShape {
    pub height: u32,
    pub width: u32,
    pub channels: u32,
}

impl FrameShape {
    pub fn rgb(width: u32, height: u32) -> Self {
        Self {
            height,
            width,
            channels: 3,
        }
    }

    /// Bytes in one packed frame.
    pub fn byte_len(&self) -> usize {
        self.height as usize * self.width as usize * self.channels as usize
    }
}

impl std::fmt::Display for FrameShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{}", self.height, self.width, self.channels)
    }
}

/// One packed (row-major, interleaved) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub shape: FrameShape,
    pub data: Bytes,
}

impl Frame {
    pub fn new(shape: FrameShape, data: impl Into<Bytes>) -> Self {
        Self {
            shape,
            data: data.into(),
        }
    }

    /// Does the payload length agree with the shape?
    pub fn is_consistent(&self) -> bool {
        self.data.len() == self.shape.byte_len()
    }
}
