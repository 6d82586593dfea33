use crate::server::service::handler::CallProxy;
use bytes::Bytes;
use core::{
    pin::{Pin, pin},
    task::{Context, Poll},
};
use futures::{Stream, StreamExt};
use gantry_core::{Error, envelope::CallContext};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::DropGuard;
use tonic::Status;

/// Forwards the messages of a bidirectional call to the worker pool, one at a
/// time and in arrival order.
///
/// Each inbound message becomes its own envelope. Results are sent to
/// `resp_tx` as soon as they are available, so the client sees them in the
/// order it sent the requests.
///
/// # Behavior
///
/// - Returns `Ok(())` once the inbound stream ends.
/// - The first failed execution is sent to the client and ends the call.
/// - An inbound decode error is echoed to the client and ends the call.
/// - Exits early when the client stops reading, or when the call is
///   cancelled or times out.
pub async fn forward_stream<S>(
    proxy: Arc<CallProxy>,
    method: String,
    context: CallContext,
    inbound: S,
    resp_tx: mpsc::Sender<Result<Bytes, Status>>,
) -> gantry_core::Result<()>
where
    S: Stream<Item = Result<Bytes, Status>> + Send + 'static,
{
    let mut inbound = pin!(inbound);

    loop {
        let message = tokio::select! {
            biased;
            err = context.done() => {
                // Best effort: the client may already be gone.
                let _ = resp_tx.send(Err(err.clone().into())).await;
                return Err(err);
            }
            () = resp_tx.closed() => return Err(Error::Cancelled),
            message = inbound.next() => message,
        };

        let payload = match message {
            None => return Ok(()),
            Some(Ok(payload)) => payload,
            Some(Err(status)) => {
                let err = Error::InvalidArgument {
                    reason: status.message().to_owned(),
                };
                let _ = resp_tx.send(Err(status)).await;
                return Err(err);
            }
        };

        match proxy.execute(&method, payload, &context).await {
            Ok(response) => {
                // Send the result back to the client. If it fails here the
                // client disconnected; there is nobody left to answer.
                if resp_tx.send(Ok(response)).await.is_err() {
                    return Err(Error::Cancelled);
                }
            }
            Err(e) => {
                if let Err(_e) = resp_tx.send(Err(e.clone().into())).await {
                    tracing::warn!("Failed to forward err: {}", _e);
                }
                return Err(e);
            }
        }
    }
}

/// The response side of a streaming call.
///
/// Holds the call's [`DropGuard`]: when the transport drops the stream
/// (client reset, server shutdown) the call's context is cancelled and any
/// in-flight execution is abandoned.
pub struct CallStream {
    inner: ReceiverStream<Result<Bytes, Status>>,
    _guard: DropGuard,
}

impl CallStream {
    pub fn new(rx: mpsc::Receiver<Result<Bytes, Status>>, guard: DropGuard) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
            _guard: guard,
        }
    }
}

impl Stream for CallStream {
    type Item = Result<Bytes, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
