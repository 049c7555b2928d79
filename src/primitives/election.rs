use std::sync::Arc;

use async_trait::async_trait;
use rkyv::{Archive, Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Primitive;
use crate::client::{
    error::{Error, TransportError},
    headers::{RequestHeader, Response, ResponseHeader, StreamResponse},
    partition,
    primitive::{Name, PrimitiveType},
    session::{
        CloseRequest, CreateRequest, EventStream, KeepAliveRequest, Session,
        SessionHandler, SessionOptions,
    },
};

pub const TYPE: PrimitiveType = PrimitiveType::Election;

/// A leadership term.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Term {
    /// Globally unique and monotonically increasing.
    pub id: u64,
    /// Candidate id of the leader, empty while nobody leads.
    pub leader: String,
    /// Candidates in priority order, the leader first.
    pub candidates: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Changed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub term: Term,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetTermRequest {
    pub header: RequestHeader,
}

/// Request shared by enter, withdraw, anoint, promote and evict.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidateRequest {
    pub header: RequestHeader,
    pub candidate_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TermResponse {
    pub header: ResponseHeader,
    pub term: Option<Term>,
}

impl Response for TermResponse {
    fn header(&self) -> &ResponseHeader {
        &self.header
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRequest {
    pub header: RequestHeader,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventResponseKind {
    /// Handshake confirming the subscription.
    Open,
    Changed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventResponse {
    pub header: ResponseHeader,
    pub kind: EventResponseKind,
    pub term: Option<Term>,
}

impl Response for EventResponse {
    fn header(&self) -> &ResponseHeader {
        &self.header
    }
}

impl StreamResponse for EventResponse {
    fn is_handshake(&self) -> bool {
        self.kind == EventResponseKind::Open
    }
}

/// RPC surface of the election service on one partition.
#[async_trait]
pub trait ElectionService: Send + Sync + 'static {
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

    async fn get_term(
        &self,
        request: GetTermRequest,
    ) -> Result<TermResponse, TransportError>;
    async fn enter(
        &self,
        request: CandidateRequest,
    ) -> Result<TermResponse, TransportError>;
    async fn withdraw(
        &self,
        request: CandidateRequest,
    ) -> Result<TermResponse, TransportError>;
    async fn anoint(
        &self,
        request: CandidateRequest,
    ) -> Result<TermResponse, TransportError>;
    async fn promote(
        &self,
        request: CandidateRequest,
    ) -> Result<TermResponse, TransportError>;
    async fn evict(
        &self,
        request: CandidateRequest,
    ) -> Result<TermResponse, TransportError>;

    async fn events(
        &self,
        request: EventRequest,
    ) -> Result<EventStream<EventResponse>, TransportError>;
}

struct Handler(Arc<dyn ElectionService>);

#[async_trait]
impl SessionHandler for Handler {
    async fn create(
        &self,
        request: CreateRequest,
    ) -> Result<ResponseHeader, TransportError> {
        self.0.create(request).await
    }

    async fn keep_alive(
        &self,
        request: KeepAliveRequest,
    ) -> Result<ResponseHeader, TransportError> {
        self.0.keep_alive(request).await
    }

    async fn close(
        &self,
        request: CloseRequest,
    ) -> Result<ResponseHeader, TransportError> {
        self.0.close(request).await
    }
}

#[derive(Clone, Copy, Debug)]
enum Action {
    Enter,
    Withdraw,
    Anoint,
    Promote,
    Evict,
}

/// Distributed leader election.
///
/// The session id doubles as this instance's candidate id.
pub struct Election {
    id: String,
    client: Arc<dyn ElectionService>,
    session: Session,
}

impl Election {
    pub async fn new(
        name: Name,
        partitions: &[Arc<dyn ElectionService>],
        options: SessionOptions,
    ) -> Result<Self, Error> {
        let client = partition::select(&name.name, partitions)?.clone();
        let handler = Arc::new(Handler(client.clone()));
        let session = Session::open(name, TYPE, handler, options).await?;
        Ok(Self {
            id: session.id().to_string(),
            client,
            session,
        })
    }

    /// Candidate id of this instance.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn get_term(&self) -> Result<Term, Error> {
        let response = self
            .session
            .query(|header| self.client.get_term(GetTermRequest { header }))
            .await?;
        Ok(response.term.unwrap_or_default())
    }

    /// Enters this instance into the election.
    pub async fn enter(&self) -> Result<Term, Error> {
        self.update(Action::Enter, &self.id).await
    }

    /// Withdraws this instance from the election.
    pub async fn leave(&self) -> Result<Term, Error> {
        self.update(Action::Withdraw, &self.id).await
    }

    /// Hands leadership to the given candidate.
    pub async fn anoint(&self, id: &str) -> Result<Term, Error> {
        self.update(Action::Anoint, id).await
    }

    /// Moves the given candidate up one place in the queue.
    pub async fn promote(&self, id: &str) -> Result<Term, Error> {
        self.update(Action::Promote, id).await
    }

    /// Removes the given candidate from the election.
    pub async fn evict(&self, id: &str) -> Result<Term, Error> {
        self.update(Action::Evict, id).await
    }

    async fn update(&self, action: Action, candidate: &str) -> Result<Term, Error> {
        let response = self
            .session
            .command(|header| {
                let request = CandidateRequest {
                    header,
                    candidate_id: candidate.to_owned(),
                };
                match action {
                    Action::Enter => self.client.enter(request),
                    Action::Withdraw => self.client.withdraw(request),
                    Action::Anoint => self.client.anoint(request),
                    Action::Promote => self.client.promote(request),
                    Action::Evict => self.client.evict(request),
                }
            })
            .await?;
        let term = response.term.unwrap_or_default();
        debug!(
            election = %self.session.name(),
            ?action,
            candidate,
            term = term.id,
            leader = %term.leader,
            "election updated"
        );
        Ok(term)
    }

    /// Subscribes to term changes. The channel closes when the server ends
    /// the stream, after `cancel` fires, or when the session goes away.
    pub async fn watch(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Event>, Error> {
        let (stream, header) = self.session.next_stream()?;
        let responses = self
            .client
            .events(EventRequest {
                header: header.clone(),
            })
            .await?;
        self.session
            .watch(stream, header, responses, cancel, |response: EventResponse| {
                response.term.map(|term| Event {
                    kind: EventKind::Changed,
                    term,
                })
            })
            .await
    }
}

#[async_trait]
impl Primitive for Election {
    fn session(&self) -> &Session {
        &self.session
    }
}
