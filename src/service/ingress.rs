//! Command ingress: validates start/stop commands and puts them on the bus.

use std::sync::Arc;
use tracing::{info, warn};

use crate::bus::{Bus, Topic};
use crate::error::Result;
use crate::model::{Event, EventKind, LifecycleState, RequestId};

/// An external command for one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start analysing `stream_source`. A fresh request id replaces a missing,
    /// empty or sentinel one.
    Start {
        stream_source: String,
        request_uuid: Option<RequestId>,
    },
    /// Stop the stream identified by `request_uuid`.
    Stop { request_uuid: Option<RequestId> },
}

fn usable(id: &RequestId) -> bool {
    !id.is_empty() && !id.is_invalid()
}

#[derive(Clone)]
pub struct Ingress {
    bus: Arc<dyn Bus>,
}

impl Ingress {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    /// Validate and publish `command`.
    ///
    /// Returns the request id the command applies to, or the `"-1"`
    /// sentinel when the command is rejected. A rejected command publishes
    /// nothing.
    pub async fn submit(&self, command: Command) -> Result<RequestId> {
        match command {
            Command::Start {
                stream_source,
                request_uuid,
            } => {
                if stream_source.trim().is_empty() {
                    warn!("start rejected: no stream source");
                    return Ok(RequestId::invalid());
                }
                // The sentinel is reserved for rejections and never names a stream.
                let request = request_uuid.filter(usable).unwrap_or_default();
                let start = Event::new(EventKind::Start, request.clone(), stream_source);
                let state = Some(LifecycleState::InitStartup);

                self.bus.publish(&start, Topic::IngressState, state).await?;
                self.bus.publish(&start, Topic::Command, state).await?;
                info!(
                    request_uuid = %request,
                    stream_source = %start.stream_source,
                    "start accepted"
                );
                Ok(request)
            }
            Command::Stop { request_uuid } => {
                let Some(request) = request_uuid.filter(usable) else {
                    warn!("stop rejected: no request id");
                    return Ok(RequestId::invalid());
                };
                let stop = Event::new(EventKind::Stop, request.clone(), "");
                self.bus
                    .publish(&stop, Topic::Command, Some(LifecycleState::InitShutdown))
                    .await?;
                info!(request_uuid = %request, "stop accepted");
                Ok(request)
            }
        }
    }
}
