// Consort is the client half of a partitioned coordination service. The
// service hosts strongly consistent primitives (elections, locks, maps) as
// replicated state machines, one instance per partition. Clients never take
// part in consensus themselves; instead they attach a session to the instance
// they care about and let the session carry ordering and liveness.
//
// A session stamps every command with a monotonically increasing sequence
// number so the server can detect duplicates and gaps, heartbeats in the
// background for as long as it stays open, and hosts any number of streams.
// Streams carry push events (watches) and are strictly ordered: anything the
// transport re-delivers or reorders is dropped before it reaches the caller.
//
// Each primitive is a thin typed veneer. It routes its name to a partition,
// opens a session through a small capability object that knows how to speak
// the primitive's create/keep-alive/close RPCs, and issues its domain calls
// through the session.

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "primitives")]
pub mod primitives;

#[cfg(feature = "client")]
pub use client::{
    error::{Error, TransportError},
    primitive::{Name, PrimitiveType},
    session::{Session, SessionHandler, SessionOptions, Status},
};
