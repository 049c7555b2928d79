pub mod error;
pub mod headers;
pub mod hex;
pub mod meta;
pub mod partition;
pub mod primitive;
pub mod session;

// Everything in here is transport agnostic. The RPC stubs of each primitive
// are supplied from outside as trait objects, and the session layer only sees
// the headers they exchange. Background work (keep-alives, watch receivers) is
// spawned on the ambient tokio runtime and reports back over channels rather
// than shared flags.
