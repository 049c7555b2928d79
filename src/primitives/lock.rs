use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::debug;
use typed_builder::TypedBuilder;

use super::Primitive;
use crate::client::{
    error::{Error, TransportError},
    headers::{RequestHeader, Response, ResponseHeader},
    hex::HexDisplayExt,
    meta::{apply_match, IfMatch, Object, ObjectMeta, WithMeta},
    partition,
    primitive::{Name, PrimitiveType},
    session::{
        CloseRequest, CreateRequest, KeepAliveRequest, Session, SessionHandler,
        SessionOptions,
    },
};

pub const TYPE: PrimitiveType = PrimitiveType::Lock;

fn random_client_id() -> String {
    rand::random::<[u8; 16]>().hex().to_string()
}

#[derive(TypedBuilder, Clone, Debug)]
pub struct LockOptions {
    /// Identifies this client as the lock owner. Random unless set.
    #[builder(default = random_client_id(), setter(into))]
    pub client_id: String,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum LockStatus {
    #[default]
    Unlocked,
    Locked,
}

/// The lock as the server last reported it. The revision changes every time
/// the lock is acquired.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct LockState {
    pub meta: ObjectMeta,
    pub status: LockStatus,
    pub owner: Option<String>,
}

impl Object for LockState {
    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockRequest {
    pub header: RequestHeader,
    pub client_id: String,
    /// Give up if the lock cannot be acquired within this long.
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockResponse {
    pub header: ResponseHeader,
    pub lock: LockState,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnlockRequest {
    pub header: RequestHeader,
    pub client_id: String,
    pub lock: LockState,
}

impl WithMeta for UnlockRequest {
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.lock.meta
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnlockResponse {
    pub header: ResponseHeader,
    pub unlocked: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GetLockRequest {
    pub header: RequestHeader,
    pub lock: LockState,
}

impl WithMeta for GetLockRequest {
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.lock.meta
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetLockResponse {
    pub header: ResponseHeader,
    pub lock: LockState,
}

macro_rules! impl_response {
    ($($ty:ty),*) => {
        $(impl Response for $ty {
            fn header(&self) -> &ResponseHeader {
                &self.header
            }
        })*
    };
}

impl_response!(LockResponse, UnlockResponse, GetLockResponse);

/// RPC surface of the lock service on one partition.
#[async_trait]
pub trait LockService: Send + Sync + 'static {
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

    async fn lock(
        &self,
        request: LockRequest,
    ) -> Result<LockResponse, TransportError>;
    async fn unlock(
        &self,
        request: UnlockRequest,
    ) -> Result<UnlockResponse, TransportError>;
    async fn get_lock(
        &self,
        request: GetLockRequest,
    ) -> Result<GetLockResponse, TransportError>;
}

struct Handler(Arc<dyn LockService>);

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

fn unlock_request(
    header: RequestHeader,
    client_id: &str,
    precondition: Option<IfMatch>,
) -> UnlockRequest {
    let mut request = UnlockRequest {
        header,
        client_id: client_id.to_owned(),
        ..Default::default()
    };
    apply_match(precondition, &mut request);
    request
}

fn get_lock_request(
    header: RequestHeader,
    precondition: Option<IfMatch>,
) -> GetLockRequest {
    let mut request = GetLockRequest {
        header,
        ..Default::default()
    };
    apply_match(precondition, &mut request);
    request
}

/// Distributed mutual exclusion.
pub struct Lock {
    options: LockOptions,
    client: Arc<dyn LockService>,
    session: Session,
}

impl Lock {
    pub async fn new(
        name: Name,
        partitions: &[Arc<dyn LockService>],
        options: LockOptions,
        session_options: SessionOptions,
    ) -> Result<Self, Error> {
        let client = partition::select(&name.name, partitions)?.clone();
        let handler = Arc::new(Handler(client.clone()));
        let session = Session::open(name, TYPE, handler, session_options).await?;
        Ok(Self {
            options,
            client,
            session,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.options.client_id
    }

    /// Acquires the lock, waiting at most `timeout` for it when given and
    /// indefinitely otherwise. The returned state carries the revision to
    /// pass to [`unlock`](Self::unlock) as a precondition.
    pub async fn lock(&self, timeout: Option<Duration>) -> Result<LockState, Error> {
        let deadline =
            timeout.map(|timeout| timeout + self.session.options().request_timeout);
        let response = self
            .session
            .command_within(deadline, |header| {
                self.client.lock(LockRequest {
                    header,
                    client_id: self.options.client_id.clone(),
                    timeout,
                })
            })
            .await?;
        debug!(
            lock = %self.session.name(),
            status = ?response.lock.status,
            revision = %response.lock.meta.revision,
            "lock requested"
        );
        Ok(response.lock)
    }

    /// Releases the lock. Returns false if this client did not hold it.
    pub async fn unlock(&self, precondition: Option<IfMatch>) -> Result<bool, Error> {
        let response = self
            .session
            .command(|header| {
                self.client.unlock(unlock_request(
                    header,
                    &self.options.client_id,
                    precondition,
                ))
            })
            .await?;
        Ok(response.unlocked)
    }

    /// Reads the lock. With a precondition, reports the lock as held only if
    /// it is still held at that revision.
    pub async fn get(&self, precondition: Option<IfMatch>) -> Result<LockState, Error> {
        let response = self
            .session
            .query(|header| {
                self.client.get_lock(get_lock_request(header, precondition))
            })
            .await?;
        Ok(response.lock)
    }

    pub async fn is_locked(&self, precondition: Option<IfMatch>) -> Result<bool, Error> {
        Ok(self.get(precondition).await?.status == LockStatus::Locked)
    }
}

#[async_trait]
impl Primitive for Lock {
    fn session(&self) -> &Session {
        &self.session
    }
}
