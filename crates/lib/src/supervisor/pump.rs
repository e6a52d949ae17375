//! Stream pump: forwards one process output stream to the client, a line at a time.

use crate::gateway::{EventSink, OutboundEvent, StreamKind};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One running pump. The token is both the stop request and the "finished" signal:
/// the pump cancels it itself when its stream ends.
pub struct StreamPump {
    kind: StreamKind,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl StreamPump {
    pub fn spawn<R>(reader: R, kind: StreamKind, id: String, sink: Arc<dyn EventSink>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pump(reader, kind, id, sink, cancel.clone()));
        Self {
            kind,
            cancel,
            handle,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Ask the pump to stop. Takes effect after the read in progress returns.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True while the pump task has not returned.
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Token cancelled when the pump stops for any reason.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

async fn pump<R>(
    reader: R,
    kind: StreamKind,
    id: String,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    log::debug!("started pump for {} of {}", kind.as_str(), id);
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    while !cancel.is_cancelled() {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if cancel.is_cancelled() {
                    break;
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                sink.emit(OutboundEvent::line(&id, kind, line));
            }
            Err(e) => {
                log::debug!("{} read failed for {}: {}", kind.as_str(), id, e);
                break;
            }
        }
    }
    cancel.cancel();
}
