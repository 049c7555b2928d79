#![allow(dead_code)]

//! In-memory stand-ins for the partition services.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use consort::{
    client::{
        headers::{RequestHeader, ResponseHeader, ResponseStatus},
        meta::{ObjectMeta, Revision},
        session::{CloseRequest, CreateRequest, EventStream, KeepAliveRequest},
    },
    primitives::{
        election::{
            CandidateRequest, ElectionService, EventRequest, EventResponse,
            EventResponseKind, GetTermRequest, Term, TermResponse,
        },
        lock::{
            GetLockRequest, GetLockResponse, LockRequest, LockResponse, LockService,
            LockState, LockStatus, UnlockRequest, UnlockResponse,
        },
        map::{
            ClearRequest, Entry, EntryResponse, EventsRequest, EventsResponse,
            GetRequest, MapService, PutRequest, RemoveRequest, SizeRequest,
            SizeResponse,
        },
    },
    SessionHandler, TransportError,
};
use futures::stream;
use tokio::sync::{mpsc, oneshot};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub type FeedSender<R> = mpsc::UnboundedSender<Result<R, TransportError>>;

/// A server-streaming response the test pushes messages into. The receiver
/// resolves once the client half-closes.
pub fn feed<R: Send + 'static>() -> (FeedSender<R>, EventStream<R>, oneshot::Receiver<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let responses =
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
    let (events, closed) = EventStream::from_stream(responses);
    (tx, events, closed)
}

pub fn stream_header(stream_id: u64, response_id: u64) -> ResponseHeader {
    ResponseHeader {
        session_id: 1,
        index: 10,
        stream_id,
        response_id,
        status: ResponseStatus::Ok,
    }
}

/// Session bookkeeping shared by every fake service.
pub struct Sessions {
    next_id: AtomicU64,
    pub index: AtomicU64,
    pub creates: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_keep_alive: AtomicBool,
    /// Keep-alives never get a reply.
    pub hang_keep_alive: AtomicBool,
    pub create_status: Mutex<ResponseStatus>,
    pub keep_alive_status: Mutex<ResponseStatus>,
    pub keep_alive_attempts: AtomicUsize,
    pub keep_alives: Mutex<Vec<KeepAliveRequest>>,
    pub closes: Mutex<Vec<CloseRequest>>,
}

impl Default for Sessions {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            index: AtomicU64::new(10),
            creates: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            fail_keep_alive: AtomicBool::new(false),
            hang_keep_alive: AtomicBool::new(false),
            create_status: Mutex::new(ResponseStatus::Ok),
            keep_alive_status: Mutex::new(ResponseStatus::Ok),
            keep_alive_attempts: AtomicUsize::new(0),
            keep_alives: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
        }
    }
}

impl Sessions {
    pub fn respond(&self, request: &RequestHeader) -> ResponseHeader {
        ResponseHeader {
            session_id: request.session_id,
            index: self.index.load(Ordering::SeqCst),
            stream_id: request.stream_id.unwrap_or_default(),
            response_id: 1,
            status: ResponseStatus::Ok,
        }
    }

    pub fn keep_alive_count(&self) -> usize {
        self.keep_alives.lock().unwrap().len()
    }

    pub fn close_count(&self) -> usize {
        self.closes.lock().unwrap().len()
    }
}

#[async_trait]
impl SessionHandler for Sessions {
    async fn create(
        &self,
        _request: CreateRequest,
    ) -> Result<ResponseHeader, TransportError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("partition down".into()));
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ResponseHeader {
            session_id: id,
            index: self.index.load(Ordering::SeqCst),
            status: *self.create_status.lock().unwrap(),
            ..Default::default()
        })
    }

    async fn keep_alive(
        &self,
        request: KeepAliveRequest,
    ) -> Result<ResponseHeader, TransportError> {
        self.keep_alive_attempts.fetch_add(1, Ordering::SeqCst);
        if self.hang_keep_alive.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        if self.fail_keep_alive.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("partition down".into()));
        }
        let mut response = self.respond(&request.header);
        response.status = *self.keep_alive_status.lock().unwrap();
        self.keep_alives.lock().unwrap().push(request);
        Ok(response)
    }

    async fn close(
        &self,
        request: CloseRequest,
    ) -> Result<ResponseHeader, TransportError> {
        let response = self.respond(&request.header);
        self.closes.lock().unwrap().push(request);
        Ok(response)
    }
}

/// Keeps the candidate queue the way the election service does: the head of
/// the queue leads and every change of leader starts a new term.
#[derive(Default)]
pub struct FakeElection {
    pub sessions: Sessions,
    term: Mutex<Term>,
    pub headers: Mutex<Vec<RequestHeader>>,
    feeds: Mutex<VecDeque<EventStream<EventResponse>>>,
}

impl FakeElection {
    /// Queues the response stream handed to the next `events` call.
    pub fn push_feed(&self) -> (FeedSender<EventResponse>, oneshot::Receiver<()>) {
        let (tx, events, closed) = feed();
        self.feeds.lock().unwrap().push_back(events);
        (tx, closed)
    }

    fn update(
        &self,
        request: CandidateRequest,
        change: impl FnOnce(&mut Vec<String>, &str),
    ) -> Result<TermResponse, TransportError> {
        let mut term = self.term.lock().unwrap();
        let leader = term.candidates.first().cloned();
        change(&mut term.candidates, &request.candidate_id);
        let next = term.candidates.first().cloned();
        if next != leader {
            term.id += 1;
        }
        term.leader = next.unwrap_or_default();
        let header = self.sessions.respond(&request.header);
        self.headers.lock().unwrap().push(request.header);
        Ok(TermResponse {
            header,
            term: Some(term.clone()),
        })
    }
}

pub fn election_event(response_id: u64, kind: EventResponseKind, term_id: u64) -> EventResponse {
    EventResponse {
        header: stream_header(1, response_id),
        kind,
        term: match kind {
            EventResponseKind::Open => None,
            EventResponseKind::Changed => Some(Term {
                id: term_id,
                ..Default::default()
            }),
        },
    }
}

#[async_trait]
impl ElectionService for FakeElection {
    async fn create(
        &self,
        request: CreateRequest,
    ) -> Result<ResponseHeader, TransportError> {
        SessionHandler::create(&self.sessions, request).await
    }

    async fn keep_alive(
        &self,
        request: KeepAliveRequest,
    ) -> Result<ResponseHeader, TransportError> {
        SessionHandler::keep_alive(&self.sessions, request).await
    }

    async fn close(
        &self,
        request: CloseRequest,
    ) -> Result<ResponseHeader, TransportError> {
        SessionHandler::close(&self.sessions, request).await
    }

    async fn get_term(
        &self,
        request: GetTermRequest,
    ) -> Result<TermResponse, TransportError> {
        let header = self.sessions.respond(&request.header);
        self.headers.lock().unwrap().push(request.header);
        Ok(TermResponse {
            header,
            term: Some(self.term.lock().unwrap().clone()),
        })
    }

    async fn enter(
        &self,
        request: CandidateRequest,
    ) -> Result<TermResponse, TransportError> {
        self.update(request, |candidates, id| {
            if !candidates.iter().any(|c| c == id) {
                candidates.push(id.to_owned());
            }
        })
    }

    async fn withdraw(
        &self,
        request: CandidateRequest,
    ) -> Result<TermResponse, TransportError> {
        self.update(request, |candidates, id| candidates.retain(|c| c != id))
    }

    async fn anoint(
        &self,
        request: CandidateRequest,
    ) -> Result<TermResponse, TransportError> {
        self.update(request, |candidates, id| {
            if let Some(pos) = candidates.iter().position(|c| c == id) {
                let candidate = candidates.remove(pos);
                candidates.insert(0, candidate);
            }
        })
    }

    async fn promote(
        &self,
        request: CandidateRequest,
    ) -> Result<TermResponse, TransportError> {
        self.update(request, |candidates, id| {
            if let Some(pos) = candidates.iter().position(|c| c == id) {
                if pos > 0 {
                    candidates.swap(pos, pos - 1);
                }
            }
        })
    }

    async fn evict(
        &self,
        request: CandidateRequest,
    ) -> Result<TermResponse, TransportError> {
        self.update(request, |candidates, id| candidates.retain(|c| c != id))
    }

    async fn events(
        &self,
        request: EventRequest,
    ) -> Result<EventStream<EventResponse>, TransportError> {
        self.headers.lock().unwrap().push(request.header);
        self.feeds
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TransportError::Unavailable("no event feed".into()))
    }
}

/// A lock that is granted immediately when free and never while another
/// client holds it.
#[derive(Default)]
pub struct FakeLock {
    pub sessions: Sessions,
    state: Mutex<LockState>,
    revision: AtomicU64,
    pub requests: Mutex<Vec<LockRequest>>,
}

impl FakeLock {
    fn state(&self) -> LockState {
        self.state.lock().unwrap().clone()
    }
}

#[async_trait]
impl LockService for FakeLock {
    async fn create(
        &self,
        request: CreateRequest,
    ) -> Result<ResponseHeader, TransportError> {
        SessionHandler::create(&self.sessions, request).await
    }

    async fn keep_alive(
        &self,
        request: KeepAliveRequest,
    ) -> Result<ResponseHeader, TransportError> {
        SessionHandler::keep_alive(&self.sessions, request).await
    }

    async fn close(
        &self,
        request: CloseRequest,
    ) -> Result<ResponseHeader, TransportError> {
        SessionHandler::close(&self.sessions, request).await
    }

    async fn lock(&self, request: LockRequest) -> Result<LockResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let header = self.sessions.respond(&request.header);
        let granted = {
            let mut state = self.state.lock().unwrap();
            match &state.owner {
                Some(owner) if *owner != request.client_id => None,
                _ => {
                    let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
                    *state = LockState {
                        meta: ObjectMeta::new(revision),
                        status: LockStatus::Locked,
                        owner: Some(request.client_id.clone()),
                    };
                    Some(state.clone())
                }
            }
        };
        match granted {
            Some(lock) => Ok(LockResponse { header, lock }),
            None => std::future::pending().await,
        }
    }

    async fn unlock(
        &self,
        request: UnlockRequest,
    ) -> Result<UnlockResponse, TransportError> {
        let mut header = self.sessions.respond(&request.header);
        let mut state = self.state.lock().unwrap();
        let expected = request.lock.meta.revision;
        if expected != Revision(0) && expected != state.meta.revision {
            header.status = ResponseStatus::PreconditionFailed;
            return Ok(UnlockResponse {
                header,
                unlocked: false,
            });
        }
        let unlocked = state.owner.as_deref() == Some(request.client_id.as_str());
        if unlocked {
            state.status = LockStatus::Unlocked;
            state.owner = None;
        }
        Ok(UnlockResponse { header, unlocked })
    }

    async fn get_lock(
        &self,
        request: GetLockRequest,
    ) -> Result<GetLockResponse, TransportError> {
        let header = self.sessions.respond(&request.header);
        let state = self.state();
        let expected = request.lock.meta.revision;
        let lock = if expected != Revision(0) && expected != state.meta.revision {
            LockState::default()
        } else {
            state
        };
        Ok(GetLockResponse { header, lock })
    }
}

/// An ordered map that checks revision preconditions the way the map
/// service does.
#[derive(Default)]
pub struct FakeMap {
    pub sessions: Sessions,
    entries: Mutex<BTreeMap<String, Entry>>,
    revision: AtomicU64,
    feeds: Mutex<VecDeque<EventStream<EventsResponse>>>,
    pub subscriptions: Mutex<Vec<EventsRequest>>,
}

impl FakeMap {
    pub fn push_feed(&self) -> (FeedSender<EventsResponse>, oneshot::Receiver<()>) {
        let (tx, events, closed) = feed();
        self.feeds.lock().unwrap().push_back(events);
        (tx, closed)
    }

    fn precondition_holds(current: Option<&Entry>, expected: Revision) -> bool {
        expected == Revision(0) || current.map(|e| e.meta.revision) == Some(expected)
    }
}

#[async_trait]
impl MapService for FakeMap {
    async fn create(
        &self,
        request: CreateRequest,
    ) -> Result<ResponseHeader, TransportError> {
        SessionHandler::create(&self.sessions, request).await
    }

    async fn keep_alive(
        &self,
        request: KeepAliveRequest,
    ) -> Result<ResponseHeader, TransportError> {
        SessionHandler::keep_alive(&self.sessions, request).await
    }

    async fn close(
        &self,
        request: CloseRequest,
    ) -> Result<ResponseHeader, TransportError> {
        SessionHandler::close(&self.sessions, request).await
    }

    async fn put(&self, request: PutRequest) -> Result<EntryResponse, TransportError> {
        let mut header = self.sessions.respond(&request.header);
        let mut entries = self.entries.lock().unwrap();
        let key = request.entry.key.clone();
        if !Self::precondition_holds(entries.get(&key), request.entry.meta.revision) {
            header.status = ResponseStatus::PreconditionFailed;
            return Ok(EntryResponse {
                header,
                entry: None,
            });
        }
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = Entry {
            meta: ObjectMeta::new(revision),
            ..request.entry
        };
        let previous = entries.insert(key, entry);
        Ok(EntryResponse {
            header,
            entry: previous,
        })
    }

    async fn get(&self, request: GetRequest) -> Result<EntryResponse, TransportError> {
        let header = self.sessions.respond(&request.header);
        let entry = self.entries.lock().unwrap().get(&request.key).cloned();
        Ok(EntryResponse { header, entry })
    }

    async fn remove(
        &self,
        request: RemoveRequest,
    ) -> Result<EntryResponse, TransportError> {
        let mut header = self.sessions.respond(&request.header);
        let mut entries = self.entries.lock().unwrap();
        let key = &request.entry.key;
        if !Self::precondition_holds(entries.get(key), request.entry.meta.revision) {
            header.status = ResponseStatus::PreconditionFailed;
            return Ok(EntryResponse {
                header,
                entry: None,
            });
        }
        let entry = entries.remove(key);
        Ok(EntryResponse { header, entry })
    }

    async fn size(&self, request: SizeRequest) -> Result<SizeResponse, TransportError> {
        let header = self.sessions.respond(&request.header);
        let size = self.entries.lock().unwrap().len();
        Ok(SizeResponse { header, size })
    }

    async fn clear(
        &self,
        request: ClearRequest,
    ) -> Result<ResponseHeader, TransportError> {
        self.entries.lock().unwrap().clear();
        Ok(self.sessions.respond(&request.header))
    }

    async fn events(
        &self,
        request: EventsRequest,
    ) -> Result<EventStream<EventsResponse>, TransportError> {
        self.subscriptions.lock().unwrap().push(request);
        self.feeds
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TransportError::Unavailable("no event feed".into()))
    }
}
