//! The metadata-status filter: a header block carrying `grpc-status` is a
//! trailers-only response, and terminates the call with that status.

use std::sync::Arc;

use http::HeaderMap;

use crate::client::filter::{CallInfo, Filter, FilterFactory};
use crate::status::Status;

pub struct MetadataStatusFilterFactory;

impl FilterFactory for MetadataStatusFilterFactory {
    fn create(&self, _call: &CallInfo) -> Arc<dyn Filter> {
        Arc::new(MetadataStatusFilter)
    }
}

struct MetadataStatusFilter;

impl Filter for MetadataStatusFilter {
    fn receive_trailers(&self, trailers: &HeaderMap, current: Option<Status>) -> Option<Status> {
        // A status derived by a later filter wins; otherwise read the block.
        current.or_else(|| Status::from_header_map(trailers))
    }
}
