//! Event records describing layer pushes and pulls, and a lifecycle guard for
//! the sinks which deliver them.
//!
//! Delivery itself belongs to a [`Transport`]. This module only builds the
//! records and makes sure nothing is sent through a transport after it has
//! been shut down.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::digest::Digest;
use crate::layer::Layer;

/// Media type of layer content.
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.docker.container.image.rootfs.diff+x-gtar";

/// What happened to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Content was uploaded.
    Push,
    /// Content was fetched.
    Pull,
}

/// A single registry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique event id.
    pub id: Uuid,

    /// When the event happened.
    pub timestamp: DateTime<Utc>,

    /// What happened.
    pub action: Action,

    /// What it happened to.
    pub target: Target,

    /// The request which caused it.
    pub request: RequestRecord,

    /// Who made the request.
    pub actor: ActorRecord,

    /// The registry instance which produced the event.
    pub source: SourceRecord,
}

/// The object an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Repository name.
    pub repository: String,

    /// URL the content can be fetched from.
    pub url: String,

    /// Description of the content.
    pub descriptor: Descriptor,
}

/// Describes a piece of content by type, size and digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the content.
    pub media_type: String,

    /// Size in bytes.
    pub length: u64,

    /// Content digest.
    pub digest: Digest,
}

/// Provenance of the request which caused an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Request id.
    pub id: String,

    /// Client address.
    pub addr: String,

    /// Host the request was addressed to.
    pub host: String,

    /// HTTP method.
    pub method: String,

    /// Client user agent.
    #[serde(rename = "useragent")]
    pub user_agent: String,
}

/// The authenticated agent behind a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRecord {
    /// Actor name, empty for anonymous requests.
    pub name: String,
}

/// The registry node which produced an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Address of the node.
    pub addr: String,

    /// Instance id of the node.
    #[serde(rename = "instanceID")]
    pub instance_id: String,
}

impl Event {
    fn for_layer(
        action: Action,
        layer: &Layer,
        url: String,
        request: RequestRecord,
        actor: ActorRecord,
        source: SourceRecord,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action,
            target: Target {
                repository: layer.repository.clone(),
                url,
                descriptor: layer.descriptor(),
            },
            request,
            actor,
            source,
        }
    }

    /// An event for a layer which was just uploaded.
    pub fn push(
        layer: &Layer,
        url: impl Into<String>,
        request: RequestRecord,
        actor: ActorRecord,
        source: SourceRecord,
    ) -> Self {
        Self::for_layer(Action::Push, layer, url.into(), request, actor, source)
    }

    /// An event for a layer which was just fetched.
    pub fn pull(
        layer: &Layer,
        url: impl Into<String>,
        request: RequestRecord,
        actor: ActorRecord,
        source: SourceRecord,
    ) -> Self {
        Self::for_layer(Action::Pull, layer, url.into(), request, actor, source)
    }
}

/// Builds events for one registry instance.
#[derive(Debug, Clone)]
pub struct EventBridge {
    base_url: String,
    source: SourceRecord,
}

impl EventBridge {
    /// Create a bridge for the instance described by `source`, serving
    /// content under `base_url`.
    pub fn new(base_url: impl Into<String>, source: SourceRecord) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url, source }
    }

    /// The URL a layer can be fetched from.
    pub fn layer_url(&self, layer: &Layer) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            self.base_url, layer.repository, layer.digest
        )
    }

    /// Describe a completed upload.
    pub fn layer_pushed(&self, layer: &Layer, request: RequestRecord, actor: ActorRecord) -> Event {
        Event::push(
            layer,
            self.layer_url(layer),
            request,
            actor,
            self.source.clone(),
        )
    }

    /// Describe a completed fetch.
    pub fn layer_pulled(&self, layer: &Layer, request: RequestRecord, actor: ActorRecord) -> Event {
        Event::pull(
            layer,
            self.layer_url(layer),
            request,
            actor,
            self.source.clone(),
        )
    }
}

/// Delivers events to a remote receiver.
#[async_trait::async_trait]
pub trait Transport: fmt::Debug + Send {
    /// Delivery errors.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Deliver a batch of events.
    async fn publish(&mut self, events: &[Event]) -> Result<(), Self::Error>;

    /// Release the connection. No further calls are made afterwards.
    async fn shutdown(&mut self) -> Result<(), Self::Error>;
}

/// Errors from writing to a sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The sink was closed.
    #[error("sink closed")]
    Closed,

    /// The transport failed.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl SinkError {
    fn transport<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        SinkError::Transport(Box::new(err))
    }
}

/// Lifecycle of a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    /// Accepting events.
    Open,
    /// Shutting down the transport.
    Closing,
    /// The transport has been released.
    Closed,
}

#[derive(Debug)]
struct SinkInner<T> {
    state: SinkState,
    transport: Option<T>,
}

/// Guards a [`Transport`] so it is never used after being shut down.
///
/// Sends and the close both run under one lock, so a close waits for any send
/// in flight and no send can start once closing has begun.
#[derive(Debug)]
pub struct SinkGuard<T> {
    inner: Mutex<SinkInner<T>>,
}

impl<T: Transport> SinkGuard<T> {
    /// Wrap an open transport.
    pub fn new(transport: T) -> Self {
        Self {
            inner: Mutex::new(SinkInner {
                state: SinkState::Open,
                transport: Some(transport),
            }),
        }
    }

    /// The current lifecycle state.
    pub async fn state(&self) -> SinkState {
        self.inner.lock().await.state
    }

    /// Send events through the transport.
    pub async fn write(&self, events: &[Event]) -> Result<(), SinkError> {
        let mut inner = self.inner.lock().await;
        if inner.state != SinkState::Open {
            return Err(SinkError::Closed);
        }
        let transport = inner.transport.as_mut().ok_or(SinkError::Closed)?;
        transport.publish(events).await.map_err(SinkError::transport)
    }

    /// Shut the transport down. Closing an already closed sink does nothing.
    pub async fn close(&self) -> Result<(), SinkError> {
        let mut inner = self.inner.lock().await;
        if inner.state == SinkState::Closed {
            return Ok(());
        }
        inner.state = SinkState::Closing;

        if let Some(transport) = inner.transport.as_mut() {
            transport.shutdown().await.map_err(SinkError::transport)?;
        }

        inner.transport = None;
        inner.state = SinkState::Closed;
        tracing::debug!("Closed event sink");
        Ok(())
    }
}
