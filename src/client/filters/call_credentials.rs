//! The call-credentials filter: resolves per-call credentials to metadata
//! and merges it into the outgoing block.

use std::sync::Arc;

use async_trait::async_trait;

use crate::client::filter::{CallInfo, Filter, FilterFactory};
use crate::credentials::{CallCredentials, CallCredentialsContext};
use crate::metadata::Metadata;
use crate::status::Status;

pub struct CallCredentialsFilterFactory {
    credentials: Arc<dyn CallCredentials>,
}

impl CallCredentialsFilterFactory {
    pub fn new(credentials: Arc<dyn CallCredentials>) -> CallCredentialsFilterFactory {
        CallCredentialsFilterFactory { credentials }
    }
}

impl FilterFactory for CallCredentialsFilterFactory {
    fn create(&self, call: &CallInfo) -> Arc<dyn Filter> {
        Arc::new(CallCredentialsFilter {
            credentials: self.credentials.clone(),
            context: CallCredentialsContext {
                authority: call.authority.clone(),
                method: call.method.clone(),
            },
        })
    }
}

struct CallCredentialsFilter {
    credentials: Arc<dyn CallCredentials>,
    context: CallCredentialsContext,
}

#[async_trait]
impl Filter for CallCredentialsFilter {
    async fn send_metadata(&self, mut metadata: Metadata) -> Result<Metadata, Status> {
        let extra = self.credentials.metadata(&self.context).await?;
        metadata.merge(extra);
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::AccessTokenCallCredentials;

    fn call_info() -> CallInfo {
        CallInfo {
            method: "/svc/Method".to_owned(),
            authority: "example.com".to_owned(),
            deadline: None,
            cancel: Arc::new(|_| {}),
        }
    }

    #[tokio::test]
    async fn merges_credential_metadata() {
        let factory =
            CallCredentialsFilterFactory::new(AccessTokenCallCredentials::new("secret"));
        let filter = factory.create(&call_info());

        let mut metadata = Metadata::new();
        metadata.append("x-app", "1").unwrap();
        let out = filter.send_metadata(metadata).await.unwrap();
        assert_eq!(out.get("x-app").unwrap().as_str(), Some("1"));
        assert_eq!(
            out.get("authorization").unwrap().as_str(),
            Some("Bearer secret")
        );
    }

    struct FailingCredentials;

    #[async_trait]
    impl CallCredentials for FailingCredentials {
        async fn metadata(&self, _context: &CallCredentialsContext) -> Result<Metadata, Status> {
            Err(Status::new(
                crate::status::Code::Unauthenticated,
                "token expired",
            ))
        }
    }

    #[tokio::test]
    async fn credential_failure_fails_the_call() {
        let factory = CallCredentialsFilterFactory::new(Arc::new(FailingCredentials));
        let filter = factory.create(&call_info());
        let err = filter.send_metadata(Metadata::new()).await.unwrap_err();
        assert_eq!(err.code(), crate::status::Code::Unauthenticated);
    }
}
