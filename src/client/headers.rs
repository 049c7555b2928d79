use rkyv::{Archive, Deserialize, Serialize};

use super::primitive::Name;

pub type SessionId = u64;

/// Logical timestamp of the server state a response reflects.
pub type Index = u64;

/// Streams are identified by the sequence number that opened them.
pub type StreamId = u64;

/// Header sent with every request issued through a session.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct RequestHeader {
    pub name: Name,
    pub session_id: SessionId,
    /// Highest index the session has observed.
    pub index: Index,
    /// Command sequence number. Commands carry a freshly allocated one;
    /// queries and keep-alives carry the last allocated one.
    pub request_id: u64,
    /// Set when the request opens a stream.
    pub stream_id: Option<StreamId>,
    /// Per-stream acknowledgements, only populated on keep-alives.
    pub streams: Vec<StreamAck>,
}

/// The last response a stream has accepted, so the server can discard
/// everything up to it.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct StreamAck {
    pub stream_id: StreamId,
    pub response_id: u64,
}

/// Outcome the server attaches to a response.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum ResponseStatus {
    #[default]
    Ok,
    /// A revision precondition on the request did not hold.
    PreconditionFailed,
    /// The server no longer knows the session.
    UnknownSession,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct ResponseHeader {
    pub session_id: SessionId,
    pub index: Index,
    pub stream_id: StreamId,
    /// Position of this response within its stream, starting at 1.
    pub response_id: u64,
    pub status: ResponseStatus,
}

/// A reply that carries a response header.
pub trait Response {
    fn header(&self) -> &ResponseHeader;
}

impl Response for ResponseHeader {
    fn header(&self) -> &ResponseHeader {
        self
    }
}

/// A message received on a streaming call.
pub trait StreamResponse: Response {
    /// True for the handshake message that confirms a subscription and
    /// carries no payload.
    fn is_handshake(&self) -> bool;
}
