pub mod election;
pub mod lock;
pub mod map;

use async_trait::async_trait;

use crate::client::{error::Error, primitive::Name, session::Session};

// Each primitive follows the same recipe: route its name to a partition, open
// a session against that partition through a shim implementing
// `SessionHandler`, then push every domain call through the session. Commands
// go through `Session::command` (one stream per call), reads through
// `Session::query`, and subscriptions through `Session::watch`.

/// Behaviour shared by every primitive.
#[async_trait]
pub trait Primitive: Send + Sync {
    fn session(&self) -> &Session;

    fn name(&self) -> &Name {
        self.session().name()
    }

    /// Closes the primitive's session. The server keeps its state.
    async fn close(&self) -> Result<(), Error> {
        self.session().close().await
    }

    /// Closes the session and discards the primitive's state on the server.
    async fn delete(&self) -> Result<(), Error> {
        self.session().delete().await
    }
}
