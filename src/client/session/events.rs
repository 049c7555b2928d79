// Watches ride on a stream of their own. The subscribe call only returns once
// the server has confirmed the subscription with a handshake message, the
// stream ended, or the handshake timed out. After that, a receiver task owns
// the stream: it records every response against the session, lets
// `Stream::serialize` drop anything stale, and forwards translated events to
// the caller's channel until the stream ends, the caller cancels, or the
// session goes away.

use std::{sync::Arc, time::Duration};

use futures::{stream::BoxStream, StreamExt};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, warn, Instrument};

use super::{Session, Shared, Status, Stream};
use crate::client::{
    error::{Error, TransportError},
    headers::{RequestHeader, StreamResponse},
};

/// How long a subscribe call waits for the server's handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// The response side of a server-streaming call, as produced by an RPC stub.
///
/// Dropping it half-closes the outbound side, the same as calling
/// [`close_send`](Self::close_send).
pub struct EventStream<R> {
    responses: BoxStream<'static, Result<R, TransportError>>,
    close_send: Option<oneshot::Sender<()>>,
}

impl<R> EventStream<R> {
    pub fn new(
        responses: BoxStream<'static, Result<R, TransportError>>,
        close_send: oneshot::Sender<()>,
    ) -> Self {
        Self {
            responses,
            close_send: Some(close_send),
        }
    }

    /// Wraps a response stream. The returned receiver resolves once the
    /// client half-closes.
    pub fn from_stream<S>(responses: S) -> (Self, oneshot::Receiver<()>)
    where
        S: futures::Stream<Item = Result<R, TransportError>> + Send + 'static,
    {
        let (close_send, closed) = oneshot::channel();
        (Self::new(responses.boxed(), close_send), closed)
    }

    async fn recv(&mut self) -> Option<Result<R, TransportError>> {
        self.responses.next().await
    }

    pub fn close_send(&mut self) {
        if let Some(close_send) = self.close_send.take() {
            let _ = close_send.send(());
        }
    }
}

impl<R> Drop for EventStream<R> {
    fn drop(&mut self) {
        self.close_send();
    }
}

enum Step<R> {
    Next(Option<Result<R, TransportError>>),
    Cancelled,
    SessionChanged { open: bool },
}

impl Session {
    /// Runs the watch protocol over a stream opened with
    /// [`next_stream`](Session::next_stream).
    ///
    /// `request` is the header the subscribe request went out with and
    /// `responses` is what the server sent back. Handshake messages are never
    /// passed to `translate`; responses it maps to `None` are skipped.
    ///
    /// Returns the event channel once the handshake arrived, or if the stream
    /// ended cleanly before it did (the channel is then already closed).
    /// Cancelling `cancel` half-closes the outbound stream and the channel
    /// closes once the server ends the stream, or straight away if the
    /// channel is full and nobody is draining it.
    pub async fn watch<R, E, F>(
        &self,
        stream: Stream,
        request: RequestHeader,
        responses: EventStream<R>,
        cancel: CancellationToken,
        translate: F,
    ) -> Result<mpsc::Receiver<E>, Error>
    where
        R: StreamResponse + Send + 'static,
        E: Send + 'static,
        F: FnMut(R) -> Option<E> + Send + 'static,
    {
        let (events_tx, events_rx) =
            mpsc::channel(self.shared.options.event_buffer.max(1));
        let (open_tx, open_rx) = oneshot::channel();
        let span = debug_span!(
            "watch",
            session = self.shared.id,
            stream = stream.id()
        );
        let receiver = Receiver {
            session: self.shared.clone(),
            stream,
            request,
            responses,
            cancel,
            events: events_tx,
            open: Some(open_tx),
            translate,
        };
        let task = tokio::spawn(receiver.run().instrument(span));

        match timeout(HANDSHAKE_TIMEOUT, open_rx).await {
            Ok(Ok(result)) => result.map(|()| events_rx),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                // Aborting drops the stream and half-closes the subscription.
                task.abort();
                warn!(session = self.shared.id, "watch handshake timed out");
                Err(Error::HandshakeTimeout(HANDSHAKE_TIMEOUT))
            }
        }
    }
}

struct Receiver<R, E, F> {
    session: Arc<Shared>,
    stream: Stream,
    request: RequestHeader,
    responses: EventStream<R>,
    cancel: CancellationToken,
    events: mpsc::Sender<E>,
    open: Option<oneshot::Sender<Result<(), Error>>>,
    translate: F,
}

impl<R, E, F> Receiver<R, E, F>
where
    R: StreamResponse + Send + 'static,
    E: Send + 'static,
    F: FnMut(R) -> Option<E> + Send + 'static,
{
    /// Unblocks the subscribe call, if it is still waiting.
    fn settle(&mut self, result: Result<(), Error>) {
        if let Some(open) = self.open.take() {
            let _ = open.send(result);
        }
    }

    async fn run(mut self) {
        let mut status = self.session.status.subscribe();
        let current = *status.borrow_and_update();
        if current != Status::Open {
            self.settle(Err(Error::SessionExpired(self.session.id)));
            return;
        }
        let mut half_closed = false;

        loop {
            let step = select! {
                next = self.responses.recv() => Step::Next(next),
                _ = self.cancel.cancelled(), if !half_closed => Step::Cancelled,
                changed = status.changed() => Step::SessionChanged {
                    open: changed.is_ok()
                        && self.session.status() == Status::Open,
                },
            };

            match step {
                Step::Cancelled => {
                    debug!("watch cancelled, half-closing stream");
                    self.responses.close_send();
                    half_closed = true;
                }
                Step::SessionChanged { open: true } => {}
                Step::SessionChanged { open: false } => {
                    debug!("session closed, ending watch");
                    self.settle(Err(Error::SessionExpired(self.session.id)));
                    break;
                }
                Step::Next(None) => {
                    debug!("event stream ended");
                    self.settle(Ok(()));
                    break;
                }
                Step::Next(Some(Err(e))) => {
                    error!(error = %e, "failed to receive event stream");
                    self.settle(Err(Error::Transport(e)));
                    break;
                }
                Step::Next(Some(Ok(response))) => {
                    self.session.record_response(&self.request, response.header());
                    if !self.stream.serialize(response.header()) {
                        continue;
                    }
                    self.settle(Ok(()));
                    if response.is_handshake() {
                        continue;
                    }
                    let Some(event) = (self.translate)(response) else {
                        continue;
                    };
                    // Delivery gives way to cancellation and session shutdown.
                    let delivered = select! {
                        biased;
                        sent = self.events.send(event) => {
                            if sent.is_err() {
                                debug!("event receiver dropped, half-closing stream");
                            }
                            sent.is_ok()
                        }
                        _ = self.cancel.cancelled() => {
                            debug!("watch cancelled while blocked on delivery");
                            false
                        }
                        _ = status.changed() => {
                            debug!("session closed while blocked on delivery");
                            false
                        }
                    };
                    if !delivered {
                        self.responses.close_send();
                        break;
                    }
                }
            }
        }
        self.stream.close();
    }
}
