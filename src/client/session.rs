use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::{
    select,
    sync::watch,
    task::JoinHandle,
    time::{interval_at, timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, debug_span, trace, warn, Instrument};
use typed_builder::TypedBuilder;

use super::{
    error::{Error, TransportError},
    headers::{
        Index, RequestHeader, Response, ResponseHeader, ResponseStatus,
        SessionId, StreamAck, StreamId,
    },
    primitive::{Name, PrimitiveType},
};

mod events;
mod stream;

pub use events::{EventStream, HANDSHAKE_TIMEOUT};
pub use stream::Stream;

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_EVENT_BUFFER: usize = 64;
/// Floor for the keep-alive period, which `interval_at` requires non-zero.
pub const MIN_KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(1);

/// Session configuration.
///
/// ```
/// # use std::time::Duration;
/// # use consort::SessionOptions;
/// let options = SessionOptions::builder()
///     .timeout(Duration::from_secs(10))
///     .build();
/// assert_eq!(options.keep_alive_interval(), Duration::from_secs(5));
/// ```
#[derive(TypedBuilder, Clone, Debug)]
pub struct SessionOptions {
    /// How long the server keeps the session without hearing from us. Also
    /// bounds each create, keep-alive and close round-trip.
    #[builder(default = DEFAULT_SESSION_TIMEOUT)]
    pub timeout: Duration,
    /// Upper bound on a single command or query.
    #[builder(default = DEFAULT_REQUEST_TIMEOUT)]
    pub request_timeout: Duration,
    /// Capacity of the channel each watch delivers events on.
    #[builder(default = DEFAULT_EVENT_BUFFER)]
    pub event_buffer: usize,
}

impl SessionOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::builder().timeout(timeout).build()
    }

    /// Keep-alives go out twice per session timeout so that a single lost
    /// heartbeat does not expire the session. Never below
    /// [`MIN_KEEP_ALIVE_INTERVAL`].
    pub fn keep_alive_interval(&self) -> Duration {
        (self.timeout / 2).max(MIN_KEEP_ALIVE_INTERVAL)
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateRequest {
    pub header: RequestHeader,
    pub primitive: PrimitiveType,
    pub timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeepAliveRequest {
    pub header: RequestHeader,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseRequest {
    pub header: RequestHeader,
    /// Also discard the primitive's state on the server.
    pub delete: bool,
}

/// The session RPCs of one primitive type.
///
/// Each primitive hands the session a small shim that forwards these to its
/// own service stub, so the session never needs to know primitive types.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn create(
        &self,
        request: CreateRequest,
    ) -> Result<ResponseHeader, TransportError>;

    async fn keep_alive(
        &self,
        request: KeepAliveRequest,
    ) -> Result<ResponseHeader, TransportError>;

    async fn close(
        &self,
        request: CloseRequest,
    ) -> Result<ResponseHeader, TransportError>;
}

/// `Open -> Closed | Failed`. Both outcomes are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Open,
    Closed,
    Failed,
}

struct State {
    index: Index,
    /// Last allocated command sequence number.
    sequence: u64,
    /// Last accepted response of every open stream. Each counter is written
    /// only by the stream that owns it.
    streams: HashMap<StreamId, Arc<AtomicU64>>,
}

/// The part of a session shared with its background tasks and streams.
struct Shared {
    id: SessionId,
    name: Name,
    options: SessionOptions,
    state: Mutex<State>,
    status: watch::Sender<Status>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> Status {
        *self.status.borrow()
    }

    fn ensure_open(&self) -> Result<(), Error> {
        match self.status() {
            Status::Open => Ok(()),
            _ => Err(Error::SessionExpired(self.id)),
        }
    }

    /// Moves an open session to `to` and drops every stream it still holds.
    /// Returns false if the session had already left `Open`.
    fn terminate(&self, to: Status) -> bool {
        let moved = self.status.send_if_modified(|status| {
            if *status == Status::Open {
                *status = to;
                true
            } else {
                false
            }
        });
        if moved {
            let streams = std::mem::take(&mut self.lock().streams);
            debug!(
                session = self.id,
                status = ?to,
                streams = streams.len(),
                "session terminated"
            );
        }
        moved
    }

    fn header(
        &self,
        state: &State,
        request_id: u64,
        stream_id: Option<StreamId>,
    ) -> RequestHeader {
        RequestHeader {
            name: self.name.clone(),
            session_id: self.id,
            index: state.index,
            request_id,
            stream_id,
            streams: Vec::new(),
        }
    }

    fn keep_alive_header(&self) -> RequestHeader {
        let state = self.lock();
        let mut header = self.header(&state, state.sequence, None);
        header.streams = state
            .streams
            .iter()
            .map(|(&stream_id, ack)| StreamAck {
                stream_id,
                response_id: ack.load(Ordering::Acquire),
            })
            .collect();
        header.streams.sort_by_key(|ack| ack.stream_id);
        header
    }

    fn observe_index(&self, index: Index) {
        let mut state = self.lock();
        if index > state.index {
            state.index = index;
        }
    }

    fn record_response(&self, request: &RequestHeader, response: &ResponseHeader) {
        self.observe_index(response.index);
        trace!(
            session = self.id,
            request = request.request_id,
            stream = response.stream_id,
            response = response.response_id,
            index = response.index,
            "recorded response"
        );
    }

    fn unregister(&self, stream: StreamId) {
        self.lock().streams.remove(&stream);
    }

    fn check(&self, header: &ResponseHeader) -> Result<(), Error> {
        match header.status {
            ResponseStatus::Ok => Ok(()),
            ResponseStatus::PreconditionFailed => Err(Error::PreconditionFailed),
            ResponseStatus::UnknownSession => {
                warn!(session = self.id, "server no longer knows the session");
                self.terminate(Status::Failed);
                Err(Error::SessionExpired(self.id))
            }
        }
    }
}

/// A client's attachment to one server-hosted primitive instance.
///
/// Opening a session performs the create round-trip and starts a background
/// keep-alive. Every command goes out with the next sequence number of the
/// session; the counter is never rewound, so a command abandoned mid-flight
/// still consumes its number. Once the session is closed or its keep-alive
/// fails, every further operation fails with [`Error::SessionExpired`]
/// without touching the network.
pub struct Session {
    shared: Arc<Shared>,
    handler: Arc<dyn SessionHandler>,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    pub async fn open(
        name: Name,
        primitive: PrimitiveType,
        handler: Arc<dyn SessionHandler>,
        options: SessionOptions,
    ) -> Result<Self, Error> {
        let span = debug_span!("session", primitive = %name);
        async move {
            debug!("creating session");
            let request = CreateRequest {
                header: RequestHeader {
                    name: name.clone(),
                    ..Default::default()
                },
                primitive,
                timeout: options.timeout,
            };
            let response =
                match timeout(options.timeout, handler.create(request)).await {
                    Ok(Ok(response)) if response.status != ResponseStatus::Ok => {
                        warn!(status = ?response.status, "session create refused");
                        return Err(Error::CreateFailed(TransportError::Refused(
                            response.status,
                        )));
                    }
                    Ok(Ok(response)) => response,
                    Ok(Err(e)) => {
                        warn!(error = %e, "failed to create session");
                        return Err(Error::CreateFailed(e));
                    }
                    Err(_) => {
                        warn!("session create timed out");
                        return Err(Error::CreateFailed(
                            TransportError::DeadlineExceeded,
                        ));
                    }
                };
            debug!(
                session = response.session_id,
                index = response.index,
                "session created"
            );

            let (status, _) = watch::channel(Status::Open);
            let shared = Arc::new(Shared {
                id: response.session_id,
                name,
                options,
                state: Mutex::new(State {
                    index: response.index,
                    sequence: 0,
                    streams: HashMap::new(),
                }),
                status,
            });
            let keep_alive = tokio::spawn(
                keep_alive(shared.clone(), handler.clone())
                    .instrument(debug_span!("keep_alive", session = shared.id)),
            );
            Ok(Self {
                shared,
                handler,
                keep_alive: Mutex::new(Some(keep_alive)),
            })
        }
        .instrument(span)
        .await
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn name(&self) -> &Name {
        &self.shared.name
    }

    pub fn options(&self) -> &SessionOptions {
        &self.shared.options
    }

    /// Highest server index observed so far.
    pub fn index(&self) -> Index {
        self.shared.lock().index
    }

    pub fn status(&self) -> Status {
        self.shared.status()
    }

    /// Receives every status transition of the session.
    pub fn subscribe_status(&self) -> watch::Receiver<Status> {
        self.shared.status.subscribe()
    }

    pub fn open_streams(&self) -> usize {
        self.shared.lock().streams.len()
    }

    /// Allocates the next command sequence number.
    pub fn next_sequence(&self) -> Result<RequestHeader, Error> {
        self.shared.ensure_open()?;
        let mut state = self.shared.lock();
        state.sequence += 1;
        Ok(self.shared.header(&state, state.sequence, None))
    }

    /// Header for a read. Carries the last allocated sequence number instead
    /// of allocating a new one.
    pub fn get_request(&self) -> Result<RequestHeader, Error> {
        self.shared.ensure_open()?;
        let state = self.shared.lock();
        Ok(self.shared.header(&state, state.sequence, None))
    }

    /// Allocates a sequence number and opens a stream identified by it.
    pub fn next_stream(&self) -> Result<(Stream, RequestHeader), Error> {
        self.shared.ensure_open()?;
        let mut state = self.shared.lock();
        state.sequence += 1;
        let id = state.sequence;
        let ack = Arc::new(AtomicU64::new(0));
        state.streams.insert(id, ack.clone());
        let header = self.shared.header(&state, id, Some(id));
        trace!(session = self.shared.id, stream = id, "opened stream");
        Ok((Stream::new(id, ack, Arc::downgrade(&self.shared)), header))
    }

    pub fn record_response(
        &self,
        request: &RequestHeader,
        response: &ResponseHeader,
    ) {
        self.shared.record_response(request, response);
    }

    /// Issues a command on its own stream, bounded by the request timeout.
    ///
    /// If the session is closed or fails while the call is in flight, the
    /// reply is discarded and the command fails with
    /// [`Error::SessionExpired`].
    pub async fn command<R, F, Fut>(&self, call: F) -> Result<R, Error>
    where
        R: Response,
        F: FnOnce(RequestHeader) -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        self.command_within(Some(self.shared.options.request_timeout), call)
            .await
    }

    /// Like [`command`](Self::command) with an explicit bound; `None` waits
    /// for as long as the server takes.
    pub async fn command_within<R, F, Fut>(
        &self,
        deadline: Option<Duration>,
        call: F,
    ) -> Result<R, Error>
    where
        R: Response,
        F: FnOnce(RequestHeader) -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        let (mut stream, header) = self.next_stream()?;
        let result = bounded(deadline, call(header.clone())).await;
        stream.close();
        let response = result?;
        // A close that raced the call wins.
        self.shared.ensure_open()?;
        self.record_response(&header, response.header());
        self.shared.check(response.header())?;
        Ok(response)
    }

    /// Issues a read that does not consume a sequence number.
    pub async fn query<R, F, Fut>(&self, call: F) -> Result<R, Error>
    where
        R: Response,
        F: FnOnce(RequestHeader) -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        let header = self.get_request()?;
        let response = bounded(
            Some(self.shared.options.request_timeout),
            call(header.clone()),
        )
        .await?;
        self.shared.ensure_open()?;
        self.record_response(&header, response.header());
        self.shared.check(response.header())?;
        Ok(response)
    }

    /// Closes the session on the server and stops its keep-alive. Closing a
    /// session that is already closed or failed does nothing.
    pub async fn close(&self) -> Result<(), Error> {
        self.shutdown(false).await
    }

    /// Closes the session and discards the primitive's state on the server.
    pub async fn delete(&self) -> Result<(), Error> {
        self.shutdown(true).await
    }

    async fn shutdown(&self, delete: bool) -> Result<(), Error> {
        let header = {
            let state = self.shared.lock();
            self.shared.header(&state, state.sequence, None)
        };
        if !self.shared.terminate(Status::Closed) {
            debug!(session = self.shared.id, "session already closed");
            return Ok(());
        }
        self.stop_keep_alive();
        debug!(session = self.shared.id, delete, "closing session");
        let request = CloseRequest { header, delete };
        match timeout(self.shared.options.timeout, self.handler.close(request))
            .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::DeadlineExceeded.into()),
        }
    }

    fn stop_keep_alive(&self) {
        let task = self
            .keep_alive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.shared.terminate(Status::Closed) {
            debug!(
                session = self.shared.id,
                "session dropped while open, leaving it to expire on the server"
            );
        }
        self.stop_keep_alive();
    }
}

async fn bounded<T, Fut>(deadline: Option<Duration>, call: Fut) -> Result<T, Error>
where
    Fut: Future<Output = Result<T, TransportError>>,
{
    match deadline {
        Some(deadline) => match timeout(deadline, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Cancelled),
        },
        None => Ok(call.await?),
    }
}

/// Heartbeats until the session leaves `Open`. The first failure expires the
/// session and ends the task.
async fn keep_alive(shared: Arc<Shared>, handler: Arc<dyn SessionHandler>) {
    let ttl = shared.options.timeout;
    let period = shared.options.keep_alive_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut status = shared.status.subscribe();
    loop {
        select! {
            _ = ticker.tick() => {}
            changed = status.changed() => {
                if changed.is_err() || shared.status() != Status::Open {
                    debug!("session no longer open, stopping keep-alive");
                    return;
                }
                continue;
            }
        }

        let request = KeepAliveRequest {
            header: shared.keep_alive_header(),
        };
        let failure = match timeout(ttl, handler.keep_alive(request)).await {
            Ok(Ok(response))
                if response.status == ResponseStatus::UnknownSession =>
            {
                TransportError::SessionNotFound(shared.id)
            }
            Ok(Ok(response)) => {
                shared.observe_index(response.index);
                trace!(index = response.index, "session kept alive");
                continue;
            }
            Ok(Err(e)) => e,
            Err(_) => TransportError::DeadlineExceeded,
        };
        warn!(error = %failure, "keep-alive failed, expiring session");
        shared.terminate(Status::Failed);
        return;
    }
}
