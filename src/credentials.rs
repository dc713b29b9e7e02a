//! Credential contracts consumed by the channel core.
//!
//! The core does not implement transport security. Channel credentials only
//! tell the connection layer whether to establish a secure context (and the
//! call-credential hook, if any); the actual security primitives live behind
//! the transport.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{metadata::Metadata, status::Status};

/// Options a channel credential contributes to new connections.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Whether connections should be established over a secure transport.
    /// Secure transports use the `https` scheme and verify the peer against
    /// the channel authority (or its `ssl_target_name_override`).
    pub secure: bool,
}

/// Produces per-call metadata, typically auth tokens.
#[async_trait]
pub trait CallCredentials: Send + Sync {
    /// Generates metadata to merge into the outgoing metadata of one call.
    async fn metadata(&self, context: &CallCredentialsContext) -> Result<Metadata, Status>;
}

/// The call attributes visible to a [`CallCredentials`] implementation.
pub struct CallCredentialsContext {
    /// The `:authority` of the call being made.
    pub authority: String,
    /// The full method path of the call, e.g. `/pkg.Service/Method`.
    pub method: String,
}

/// A channel credential: decides the connection security context and may
/// attach call credentials applied to every call on the channel.
pub trait ChannelCredentials: Send + Sync {
    /// Returns connection options if this credential is able to create
    /// connections, or `None` for call-credentials-only composites.
    fn connection_options(&self) -> Option<ConnectionOptions>;

    /// Returns the attached call credentials, if any.
    fn call_credentials(&self) -> Option<Arc<dyn CallCredentials>>;
}

/// Plaintext connections, no call credentials.
#[derive(Default)]
pub struct InsecureChannelCredentials;

impl InsecureChannelCredentials {
    pub fn new() -> Arc<dyn ChannelCredentials> {
        Arc::new(InsecureChannelCredentials)
    }
}

impl ChannelCredentials for InsecureChannelCredentials {
    fn connection_options(&self) -> Option<ConnectionOptions> {
        Some(ConnectionOptions { secure: false })
    }

    fn call_credentials(&self) -> Option<Arc<dyn CallCredentials>> {
        None
    }
}

/// Composes a connection-capable credential with call credentials.
pub struct ComposedChannelCredentials {
    channel: Arc<dyn ChannelCredentials>,
    call: Arc<dyn CallCredentials>,
}

impl ComposedChannelCredentials {
    pub fn new(
        channel: Arc<dyn ChannelCredentials>,
        call: Arc<dyn CallCredentials>,
    ) -> Arc<dyn ChannelCredentials> {
        Arc::new(ComposedChannelCredentials { channel, call })
    }
}

impl ChannelCredentials for ComposedChannelCredentials {
    fn connection_options(&self) -> Option<ConnectionOptions> {
        self.channel.connection_options()
    }

    fn call_credentials(&self) -> Option<Arc<dyn CallCredentials>> {
        match self.channel.call_credentials() {
            Some(inner) => Some(Arc::new(ComposedCallCredentials {
                first: inner,
                second: self.call.clone(),
            })),
            None => Some(self.call.clone()),
        }
    }
}

struct ComposedCallCredentials {
    first: Arc<dyn CallCredentials>,
    second: Arc<dyn CallCredentials>,
}

#[async_trait]
impl CallCredentials for ComposedCallCredentials {
    async fn metadata(&self, context: &CallCredentialsContext) -> Result<Metadata, Status> {
        let mut metadata = self.first.metadata(context).await?;
        metadata.merge(self.second.metadata(context).await?);
        Ok(metadata)
    }
}

/// Call credentials carrying a static bearer token.
pub struct AccessTokenCallCredentials {
    header_value: String,
}

impl AccessTokenCallCredentials {
    pub fn new(token: impl Into<String>) -> Arc<dyn CallCredentials> {
        Arc::new(AccessTokenCallCredentials {
            header_value: format!("Bearer {}", token.into()),
        })
    }
}

#[async_trait]
impl CallCredentials for AccessTokenCallCredentials {
    async fn metadata(&self, _context: &CallCredentialsContext) -> Result<Metadata, Status> {
        let mut metadata = Metadata::new();
        metadata
            .insert("authorization", self.header_value.as_str())
            .map_err(|e| Status::internal(format!("invalid access token: {e}")))?;
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn access_token_produces_authorization_header() {
        let creds = AccessTokenCallCredentials::new("tok123");
        let context = CallCredentialsContext {
            authority: "example.com".into(),
            method: "/svc/Method".into(),
        };
        let md = creds.metadata(&context).await.unwrap();
        assert_eq!(
            md.get("authorization").unwrap().as_str(),
            Some("Bearer tok123")
        );
    }

    #[tokio::test]
    async fn composed_credentials_merge_in_order() {
        let base = InsecureChannelCredentials::new();
        let first = ComposedChannelCredentials::new(base, AccessTokenCallCredentials::new("a"));
        let second = ComposedChannelCredentials::new(first, AccessTokenCallCredentials::new("b"));

        let context = CallCredentialsContext {
            authority: "example.com".into(),
            method: "/svc/Method".into(),
        };
        let md = second
            .call_credentials()
            .unwrap()
            .metadata(&context)
            .await
            .unwrap();
        let values: Vec<_> = md
            .get_all("authorization")
            .map(|v| v.as_str().unwrap().to_owned())
            .collect();
        assert_eq!(values, vec!["Bearer a", "Bearer b"]);
        assert_eq!(
            second.connection_options(),
            Some(ConnectionOptions { secure: false })
        );
    }
}
