//! The per-call filter chain over outgoing/incoming metadata and messages.
//!
//! Send hooks run in registration order and receive hooks in reverse, so
//! each filter wraps the ones registered after it symmetrically.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;

use crate::metadata::Metadata;
use crate::status::Status;

/// A message travelling through the chain: the payload plus the wire flag
/// saying whether it is compressed.
#[derive(Clone, Debug, PartialEq)]
pub struct WireMessage {
    pub payload: Bytes,
    pub compressed: bool,
}

impl WireMessage {
    pub fn plain(payload: Bytes) -> WireMessage {
        WireMessage {
            payload,
            compressed: false,
        }
    }
}

/// Hooks applied around one call. Every hook is asynchronous and may fail;
/// failures terminate the call, as INTERNAL unless the filter chose a more
/// specific status.
#[async_trait]
pub trait Filter: Send + Sync {
    async fn send_metadata(&self, metadata: Metadata) -> Result<Metadata, Status> {
        Ok(metadata)
    }

    async fn receive_metadata(&self, metadata: Metadata) -> Result<Metadata, Status> {
        Ok(metadata)
    }

    async fn send_message(&self, message: WireMessage) -> Result<WireMessage, Status> {
        Ok(message)
    }

    async fn receive_message(&self, message: WireMessage) -> Result<WireMessage, Status> {
        Ok(message)
    }

    /// Maps a received trailer block to a final status. `current` carries the
    /// result of filters later in the chain; returning `None` defers to the
    /// transport-level mapping.
    fn receive_trailers(&self, _trailers: &HeaderMap, current: Option<Status>) -> Option<Status> {
        current
    }
}

/// The attributes of a call available when instantiating its filters.
pub struct CallInfo {
    pub method: String,
    pub authority: String,
    pub deadline: Option<Instant>,
    /// Cancels the call with the given status, e.g. from a deadline timer.
    pub cancel: Arc<dyn Fn(Status) + Send + Sync>,
}

/// Creates one filter instance per call.
pub trait FilterFactory: Send + Sync {
    fn create(&self, call: &CallInfo) -> Arc<dyn Filter>;
}

/// An ordered chain of per-call filters.
pub struct FilterStack {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterStack {
    pub fn new(factories: &[Arc<dyn FilterFactory>], call: &CallInfo) -> FilterStack {
        FilterStack {
            filters: factories.iter().map(|f| f.create(call)).collect(),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_filters(filters: Vec<Arc<dyn Filter>>) -> FilterStack {
        FilterStack { filters }
    }

    pub async fn send_metadata(&self, mut metadata: Metadata) -> Result<Metadata, Status> {
        for filter in &self.filters {
            metadata = filter.send_metadata(metadata).await?;
        }
        Ok(metadata)
    }

    pub async fn receive_metadata(&self, mut metadata: Metadata) -> Result<Metadata, Status> {
        for filter in self.filters.iter().rev() {
            metadata = filter.receive_metadata(metadata).await?;
        }
        Ok(metadata)
    }

    pub async fn send_message(&self, mut message: WireMessage) -> Result<WireMessage, Status> {
        for filter in &self.filters {
            message = filter.send_message(message).await?;
        }
        Ok(message)
    }

    pub async fn receive_message(&self, mut message: WireMessage) -> Result<WireMessage, Status> {
        for filter in self.filters.iter().rev() {
            message = filter.receive_message(message).await?;
        }
        Ok(message)
    }

    pub fn receive_trailers(&self, trailers: &HeaderMap) -> Option<Status> {
        let mut current = None;
        for filter in self.filters.iter().rev() {
            current = filter.receive_trailers(trailers, current);
        }
        current
    }
}
