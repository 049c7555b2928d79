use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use tracing::trace;

use super::Shared;
use crate::client::headers::{ResponseHeader, StreamId};

/// An ordered channel nested in a session.
///
/// Every response that arrives for the stream goes through
/// [`serialize`](Self::serialize), which lets each response position through
/// exactly once and in increasing order. Closing is idempotent and also
/// happens on drop, so a stream can be opened and forgotten about on every
/// path out of a call.
pub struct Stream {
    id: StreamId,
    last_response: u64,
    ack: Arc<AtomicU64>,
    session: Weak<Shared>,
    closed: bool,
}

impl Stream {
    pub(super) fn new(
        id: StreamId,
        ack: Arc<AtomicU64>,
        session: Weak<Shared>,
    ) -> Self {
        Self {
            id,
            last_response: 0,
            ack,
            session,
            closed: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Position of the last response accepted, 0 before the first one.
    pub fn last_response(&self) -> u64 {
        self.last_response
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns true if the response should be delivered. Retransmissions and
    /// responses that arrive behind a later one are dropped.
    pub fn serialize(&mut self, header: &ResponseHeader) -> bool {
        if self.closed || header.response_id <= self.last_response {
            trace!(
                stream = self.id,
                response = header.response_id,
                last = self.last_response,
                "dropping stale response"
            );
            return false;
        }
        self.last_response = header.response_id;
        self.ack.store(header.response_id, Ordering::Release);
        true
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(session) = self.session.upgrade() {
            session.unregister(self.id);
        }
        trace!(stream = self.id, "closed stream");
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close();
    }
}
