use std::sync::Arc;

use async_trait::async_trait;
use rkyv::{Archive, Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::Primitive;
use crate::client::{
    error::{Error, TransportError},
    headers::{RequestHeader, Response, ResponseHeader, StreamResponse},
    meta::{apply_match, IfMatch, Object, ObjectMeta, WithMeta},
    partition,
    primitive::{Name, PrimitiveType},
    session::{
        CloseRequest, CreateRequest, EventStream, KeepAliveRequest, Session,
        SessionHandler, SessionOptions,
    },
};

pub const TYPE: PrimitiveType = PrimitiveType::Map;

/// A key/value pair and the revision it was written at.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Entry {
    pub meta: ObjectMeta,
    pub key: String,
    pub value: Vec<u8>,
}

impl Object for Entry {
    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// An entry that existed when the watch started.
    Replayed,
    Inserted,
    Updated,
    Removed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub entry: Entry,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Deliver every existing entry before live changes.
    pub replay: bool,
}

impl WatchOptions {
    pub fn replay() -> Self {
        Self { replay: true }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PutRequest {
    pub header: RequestHeader,
    pub entry: Entry,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoveRequest {
    pub header: RequestHeader,
    pub entry: Entry,
}

macro_rules! impl_with_meta {
    ($($ty:ty),*) => {
        $(impl WithMeta for $ty {
            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.entry.meta
            }
        })*
    };
}

impl_with_meta!(PutRequest, RemoveRequest);

/// Reply to put, get and remove. `entry` is the previous value for put and
/// remove, the current one for get.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryResponse {
    pub header: ResponseHeader,
    pub entry: Option<Entry>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetRequest {
    pub header: RequestHeader,
    pub key: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SizeRequest {
    pub header: RequestHeader,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SizeResponse {
    pub header: ResponseHeader,
    pub size: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClearRequest {
    pub header: RequestHeader,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventsRequest {
    pub header: RequestHeader,
    pub replay: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventResponseKind {
    /// Handshake confirming the subscription.
    Open,
    Replay,
    Inserted,
    Updated,
    Removed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventsResponse {
    pub header: ResponseHeader,
    pub kind: EventResponseKind,
    pub entry: Entry,
}

impl StreamResponse for EventsResponse {
    fn is_handshake(&self) -> bool {
        self.kind == EventResponseKind::Open
    }
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

impl_response!(EntryResponse, SizeResponse, EventsResponse);

/// RPC surface of the map service on one partition.
#[async_trait]
pub trait MapService: Send + Sync + 'static {
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

    async fn put(&self, request: PutRequest) -> Result<EntryResponse, TransportError>;
    async fn get(&self, request: GetRequest) -> Result<EntryResponse, TransportError>;
    async fn remove(
        &self,
        request: RemoveRequest,
    ) -> Result<EntryResponse, TransportError>;
    async fn size(&self, request: SizeRequest) -> Result<SizeResponse, TransportError>;
    async fn clear(
        &self,
        request: ClearRequest,
    ) -> Result<ResponseHeader, TransportError>;
    async fn events(
        &self,
        request: EventsRequest,
    ) -> Result<EventStream<EventsResponse>, TransportError>;
}

struct Handler(Arc<dyn MapService>);

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

fn put_request(
    header: RequestHeader,
    key: &str,
    value: Vec<u8>,
    precondition: Option<IfMatch>,
) -> PutRequest {
    let mut request = PutRequest {
        header,
        entry: Entry {
            key: key.to_owned(),
            value,
            ..Default::default()
        },
    };
    apply_match(precondition, &mut request);
    request
}

fn remove_request(
    header: RequestHeader,
    key: &str,
    precondition: Option<IfMatch>,
) -> RemoveRequest {
    let mut request = RemoveRequest {
        header,
        entry: Entry {
            key: key.to_owned(),
            ..Default::default()
        },
    };
    apply_match(precondition, &mut request);
    request
}

fn events_request(header: RequestHeader, options: WatchOptions) -> EventsRequest {
    EventsRequest {
        header,
        replay: options.replay,
    }
}

fn translate(response: EventsResponse) -> Option<Event> {
    let kind = match response.kind {
        EventResponseKind::Open => return None,
        EventResponseKind::Replay => EventKind::Replayed,
        EventResponseKind::Inserted => EventKind::Inserted,
        EventResponseKind::Updated => EventKind::Updated,
        EventResponseKind::Removed => EventKind::Removed,
    };
    Some(Event {
        kind,
        entry: response.entry,
    })
}

/// A replicated key/value map.
pub struct Map {
    client: Arc<dyn MapService>,
    session: Session,
}

impl Map {
    pub async fn new(
        name: Name,
        partitions: &[Arc<dyn MapService>],
        options: SessionOptions,
    ) -> Result<Self, Error> {
        let client = partition::select(&name.name, partitions)?.clone();
        let handler = Arc::new(Handler(client.clone()));
        let session = Session::open(name, TYPE, handler, options).await?;
        Ok(Self { client, session })
    }

    /// Writes `value` under `key` and returns the entry it replaced.
    pub async fn put(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        precondition: Option<IfMatch>,
    ) -> Result<Option<Entry>, Error> {
        let value = value.into();
        let response = self
            .session
            .command(|header| {
                self.client
                    .put(put_request(header, key, value, precondition))
            })
            .await?;
        trace!(map = %self.session.name(), key, "put entry");
        Ok(response.entry)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Entry>, Error> {
        let response = self
            .session
            .query(|header| {
                self.client.get(GetRequest {
                    header,
                    key: key.to_owned(),
                })
            })
            .await?;
        Ok(response.entry)
    }

    /// Removes `key` and returns the entry it held.
    pub async fn remove(
        &self,
        key: &str,
        precondition: Option<IfMatch>,
    ) -> Result<Option<Entry>, Error> {
        let response = self
            .session
            .command(|header| {
                self.client.remove(remove_request(header, key, precondition))
            })
            .await?;
        trace!(map = %self.session.name(), key, "removed entry");
        Ok(response.entry)
    }

    pub async fn size(&self) -> Result<usize, Error> {
        let response = self
            .session
            .query(|header| self.client.size(SizeRequest { header }))
            .await?;
        Ok(response.size)
    }

    pub async fn clear(&self) -> Result<(), Error> {
        self.session
            .command(|header| self.client.clear(ClearRequest { header }))
            .await?;
        Ok(())
    }

    /// Subscribes to changes. With [`WatchOptions::replay`], every entry
    /// present when the watch starts is delivered first as
    /// [`EventKind::Replayed`].
    pub async fn watch(
        &self,
        options: WatchOptions,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Event>, Error> {
        let (stream, header) = self.session.next_stream()?;
        let responses = self
            .client
            .events(events_request(header.clone(), options))
            .await?;
        self.session
            .watch(stream, header, responses, cancel, translate)
            .await
    }
}

#[async_trait]
impl Primitive for Map {
    fn session(&self) -> &Session {
        &self.session
    }
}
