//! The deadline filter: emits the `grpc-timeout` request header and cancels
//! the call with DEADLINE_EXCEEDED when the deadline passes.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::client::filter::{CallInfo, Filter, FilterFactory};
use crate::metadata::Metadata;
use crate::status::Status;

pub(crate) const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Renders a timeout in the `grpc-timeout` wire form: at most 8 digits plus
/// a unit, choosing the finest unit that fits.
pub(crate) fn encode_timeout(timeout: Duration) -> String {
    const MAX_VALUE: u128 = 99_999_999;
    let nanos = timeout.as_nanos();
    if nanos <= MAX_VALUE {
        format!("{nanos}n")
    } else if nanos / 1_000 <= MAX_VALUE {
        format!("{}u", nanos / 1_000)
    } else if nanos / 1_000_000 <= MAX_VALUE {
        format!("{}m", nanos / 1_000_000)
    } else if nanos / 1_000_000_000 <= MAX_VALUE {
        format!("{}S", nanos / 1_000_000_000)
    } else if nanos / 60_000_000_000 <= MAX_VALUE {
        format!("{}M", nanos / 60_000_000_000)
    } else {
        format!("{}H", (nanos / 3_600_000_000_000).min(MAX_VALUE))
    }
}

pub struct DeadlineFilterFactory;

impl FilterFactory for DeadlineFilterFactory {
    fn create(&self, call: &CallInfo) -> Arc<dyn Filter> {
        let timer = call.deadline.map(|deadline| {
            let cancel = call.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
                cancel(Status::deadline_exceeded("Deadline exceeded"));
            })
        });
        Arc::new(DeadlineFilter {
            deadline: call.deadline,
            timer: Mutex::new(timer),
        })
    }
}

struct DeadlineFilter {
    deadline: Option<Instant>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Filter for DeadlineFilter {
    async fn send_metadata(&self, mut metadata: Metadata) -> Result<Metadata, Status> {
        if let Some(deadline) = self.deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            metadata
                .insert(GRPC_TIMEOUT_HEADER, encode_timeout(remaining))
                .map_err(|e| Status::internal(format!("failed to set timeout header: {e}")))?;
        }
        Ok(metadata)
    }
}

impl Drop for DeadlineFilter {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.abort();
        }
    }
}
