//! Deduplicates subchannels with identical identity so channels pointed at
//! the same backends share connections.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

use crate::client::name_resolution::Address;
use crate::client::subchannel::{Subchannel, SubchannelKey};
use crate::client::transport::{Connector, H2Connector};
use crate::client::ChannelOptions;
use crate::credentials::ChannelCredentials;

/// How often unused entries are swept out.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

static GLOBAL_POOL: LazyLock<Arc<SubchannelPool>> =
    LazyLock::new(|| SubchannelPool::new(Arc::new(H2Connector)));

/// The process-wide pool shared by all channels that do not opt into a local
/// one.
pub fn global_subchannel_pool() -> Arc<SubchannelPool> {
    GLOBAL_POOL.clone()
}

struct PoolInner {
    entries: HashMap<SubchannelKey, Arc<Subchannel>>,
    sweep_task: Option<JoinHandle<()>>,
}

/// A pool of subchannels keyed by
/// `(channel target, address, options, credentials)`.
pub struct SubchannelPool {
    connector: Arc<dyn Connector>,
    inner: Mutex<PoolInner>,
}

impl SubchannelPool {
    pub fn new(connector: Arc<dyn Connector>) -> Arc<SubchannelPool> {
        Arc::new(SubchannelPool {
            connector,
            inner: Mutex::new(PoolInner {
                entries: HashMap::new(),
                sweep_task: None,
            }),
        })
    }

    /// Returns the pooled subchannel for the given identity, creating it if
    /// absent, and takes a channel reference on behalf of the caller.
    pub fn get_or_create_subchannel(
        self: &Arc<Self>,
        channel_target: &str,
        address: &Address,
        options: &ChannelOptions,
        credentials: &Arc<dyn ChannelCredentials>,
        default_authority: &str,
    ) -> Arc<Subchannel> {
        let key = SubchannelKey {
            channel_target: channel_target.to_owned(),
            address: address.clone(),
            options_fingerprint: options.fingerprint(),
            credentials_id: Arc::as_ptr(credentials) as *const () as usize,
        };

        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.entries.get(&key) {
            existing.channel_ref();
            return existing.clone();
        }

        trace!(address = %address, "creating pooled subchannel");
        let subchannel = Subchannel::new(
            key.clone(),
            options.clone(),
            credentials,
            self.connector.clone(),
            default_authority.to_owned(),
        );
        subchannel.channel_ref();
        inner.entries.insert(key, subchannel.clone());
        self.ensure_sweep_scheduled(&mut inner);
        subchannel
    }

    /// Removes entries whose channel reference count reached zero. Returns
    /// whether the pool is now empty.
    fn sweep(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.retain(|key, subchannel| {
            let keep = subchannel.channel_ref_count() > 0;
            if !keep {
                trace!(address = %key.address, "removing unused subchannel from pool");
            }
            keep
        });
        let empty = inner.entries.is_empty();
        if empty {
            if let Some(task) = inner.sweep_task.take() {
                task.abort();
            }
        }
        empty
    }

    /// Forces an immediate sweep; once the pool is empty the periodic task
    /// stops until a new entry arrives.
    pub fn unref_unused_subchannels(&self) {
        self.sweep();
    }

    fn ensure_sweep_scheduled(self: &Arc<Self>, inner: &mut PoolInner) {
        if inner.sweep_task.is_some() {
            return;
        }
        // The periodic sweep runs only while the pool has members and holds
        // the pool weakly so per-channel pools can be dropped.
        let weak: Weak<SubchannelPool> = Arc::downgrade(self);
        inner.sweep_task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(CLEANUP_INTERVAL).await;
                let Some(pool) = weak.upgrade() else {
                    return;
                };
                if pool.sweep() {
                    return;
                }
            }
        }));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::{ConnectedTransport, TransportOptions};
    use crate::credentials::InsecureChannelCredentials;
    use async_trait::async_trait;

    struct NeverConnector;

    #[async_trait]
    impl Connector for NeverConnector {
        async fn connect(
            &self,
            _address: &Address,
            _options: &TransportOptions,
        ) -> Result<Arc<dyn ConnectedTransport>, String> {
            Err("unused".to_owned())
        }
    }

    fn pool() -> Arc<SubchannelPool> {
        SubchannelPool::new(Arc::new(NeverConnector))
    }

    #[tokio::test(start_paused = true)]
    async fn identical_keys_share_a_subchannel() {
        let pool = pool();
        let credentials = InsecureChannelCredentials::new();
        let options = ChannelOptions::default();
        let address = Address::new("10.0.0.1:443");

        let first = pool.get_or_create_subchannel(
            "dns:example.com",
            &address,
            &options,
            &credentials,
            "example.com",
        );
        let second = pool.get_or_create_subchannel(
            "dns:example.com",
            &address,
            &options,
            &credentials,
            "example.com",
        );
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);
        assert_eq!(first.channel_ref_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn differing_identities_do_not_share() {
        let pool = pool();
        let credentials = InsecureChannelCredentials::new();
        let address = Address::new("10.0.0.1:443");

        let plain = pool.get_or_create_subchannel(
            "dns:example.com",
            &address,
            &ChannelOptions::default(),
            &credentials,
            "example.com",
        );
        let overridden = pool.get_or_create_subchannel(
            "dns:example.com",
            &address,
            &ChannelOptions {
                ssl_target_name_override: Some("other.test".to_owned()),
                ..Default::default()
            },
            &credentials,
            "example.com",
        );
        assert!(!Arc::ptr_eq(&plain, &overridden));
        assert_eq!(pool.len(), 2);

        let other_credentials = InsecureChannelCredentials::new();
        let recredentialed = pool.get_or_create_subchannel(
            "dns:example.com",
            &address,
            &ChannelOptions::default(),
            &other_credentials,
            "example.com",
        );
        assert!(!Arc::ptr_eq(&plain, &recredentialed));
        assert_eq!(pool.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unused_entries_are_swept_within_one_interval() {
        let pool = pool();
        let credentials = InsecureChannelCredentials::new();
        let address = Address::new("10.0.0.1:443");

        let subchannel = pool.get_or_create_subchannel(
            "dns:example.com",
            &address,
            &ChannelOptions::default(),
            &credentials,
            "example.com",
        );
        assert_eq!(pool.len(), 1);

        subchannel.channel_unref();
        tokio::time::sleep(CLEANUP_INTERVAL + Duration::from_millis(100)).await;
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_sweep_removes_immediately() {
        let pool = pool();
        let credentials = InsecureChannelCredentials::new();
        let address = Address::new("10.0.0.1:443");

        let subchannel = pool.get_or_create_subchannel(
            "dns:example.com",
            &address,
            &ChannelOptions::default(),
            &credentials,
            "example.com",
        );
        subchannel.channel_unref();
        pool.unref_unused_subchannels();
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn live_entries_survive_sweeps() {
        let pool = pool();
        let credentials = InsecureChannelCredentials::new();
        let address = Address::new("10.0.0.1:443");

        let _subchannel = pool.get_or_create_subchannel(
            "dns:example.com",
            &address,
            &ChannelOptions::default(),
            &credentials,
            "example.com",
        );
        tokio::time::sleep(CLEANUP_INTERVAL * 3).await;
        assert_eq!(pool.len(), 1);
    }
}
