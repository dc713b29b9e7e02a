//! The user-facing channel: creates call streams against a target and routes
//! them through the current picker, queueing while connectivity settles.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::client::call::{CallOptions, CallStream};
use crate::client::filter::{CallInfo, FilterFactory, FilterStack};
use crate::client::filters::{
    CallCredentialsFilterFactory, CompressionFilterFactory, DeadlineFilterFactory,
    MetadataStatusFilterFactory,
};
use crate::client::load_balancing::{
    ChannelControlHelper, PickRequest, PickResult, Picker, QueuePicker,
};
use crate::client::name_resolution::dns::DnsResolverFactory;
use crate::client::name_resolution::{Address, ResolverFactory, Target};
use crate::client::resolving_load_balancer::ResolvingLoadBalancer;
use crate::client::service_config::{parse_proto_duration, ServiceConfig};
use crate::client::subchannel::Subchannel;
use crate::client::subchannel_pool::{global_subchannel_pool, SubchannelPool};
use crate::client::{ChannelOptions, ConnectivityState};
use crate::credentials::ChannelCredentials;
#[cfg(test)]
use crate::status::Code;
use crate::status::Status;

/// The error produced when a channel cannot be constructed.
#[derive(Debug)]
pub struct ChannelError {
    message: String,
}

impl ChannelError {
    fn new(message: impl Into<String>) -> ChannelError {
        ChannelError {
            message: message.into(),
        }
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to create channel: {}", self.message)
    }
}

impl std::error::Error for ChannelError {}

struct QueuedPick {
    call: Arc<CallStream>,
    options: CallOptions,
}

struct Watcher {
    id: usize,
    last_observed: ConnectivityState,
    tx: oneshot::Sender<ConnectivityState>,
}

struct ChannelState {
    connectivity: ConnectivityState,
    picker: Arc<dyn Picker>,
    /// Bumped on every picker swap; lets `try_pick` detect that a queue
    /// drain ran between its pick and its enqueue.
    picker_version: u64,
    pick_queue: Vec<QueuedPick>,
    watchers: Vec<Watcher>,
    next_watcher_id: usize,
    closed: bool,
}

struct ChannelCore {
    target: Target,
    target_string: String,
    default_authority: String,
    options: ChannelOptions,
    credentials: Arc<dyn ChannelCredentials>,
    pool: Arc<SubchannelPool>,
    filter_factories: Vec<Arc<dyn FilterFactory>>,
    default_service_config: Option<ServiceConfig>,
    resolving_lb: OnceLock<ResolvingLoadBalancer>,
    state: Mutex<ChannelState>,
}

/// A virtual connection to a target, multiplexing calls over pooled
/// subchannels selected by the configured load balancing policy.
#[derive(Clone)]
pub struct Channel {
    core: Arc<ChannelCore>,
}

impl Channel {
    /// Creates a channel using the system DNS resolver and the process-wide
    /// subchannel pool.
    pub fn new(
        target: &str,
        credentials: Arc<dyn ChannelCredentials>,
        options: ChannelOptions,
    ) -> Result<Channel, ChannelError> {
        let factory = DnsResolverFactory::system().map_err(ChannelError::new)?;
        Channel::with_parts(target, credentials, options, &factory, global_subchannel_pool())
    }

    /// Creates a channel with an explicit resolver factory and pool. Passing
    /// a fresh pool isolates this channel's connections from other channels.
    pub fn with_parts(
        target: &str,
        credentials: Arc<dyn ChannelCredentials>,
        options: ChannelOptions,
        resolver_factory: &dyn ResolverFactory,
        pool: Arc<SubchannelPool>,
    ) -> Result<Channel, ChannelError> {
        let parsed: Target = target.parse().map_err(|e| ChannelError::new(format!("{e}")))?;
        let default_authority = options
            .default_authority
            .clone()
            .unwrap_or_else(|| parsed.default_authority());

        let default_service_config = match &options.service_config_json {
            Some(json) => Some(ServiceConfig::from_json(json).map_err(ChannelError::new)?),
            None => None,
        };

        let mut filter_factories: Vec<Arc<dyn FilterFactory>> = Vec::new();
        if let Some(call_credentials) = credentials.call_credentials() {
            filter_factories.push(Arc::new(CallCredentialsFilterFactory::new(call_credentials)));
        }
        filter_factories.push(Arc::new(DeadlineFilterFactory));
        filter_factories.push(Arc::new(MetadataStatusFilterFactory));
        filter_factories.push(Arc::new(CompressionFilterFactory::default()));

        let core = Arc::new(ChannelCore {
            target: parsed.clone(),
            target_string: target.to_owned(),
            default_authority,
            options,
            credentials,
            pool,
            filter_factories,
            default_service_config: default_service_config.clone(),
            resolving_lb: OnceLock::new(),
            state: Mutex::new(ChannelState {
                connectivity: ConnectivityState::Idle,
                picker: Arc::new(QueuePicker),
                picker_version: 0,
                pick_queue: Vec::new(),
                watchers: Vec::new(),
                next_watcher_id: 0,
                closed: false,
            }),
        });

        let helper = Arc::new(ChannelHelper {
            core: Arc::downgrade(&core),
        });
        let resolving_lb = ResolvingLoadBalancer::new(
            parsed,
            helper,
            resolver_factory,
            default_service_config,
        );
        core.resolving_lb
            .set(resolving_lb)
            .unwrap_or_else(|_| unreachable!("resolving balancer installed twice"));

        Ok(Channel { core })
    }

    /// The `:authority` used for calls on this channel.
    pub fn authority(&self) -> &str {
        &self.core.default_authority
    }

    /// The channel's current connectivity state. With `connect` set, an IDLE
    /// channel begins connecting.
    pub fn state(&self, connect: bool) -> ConnectivityState {
        let state = self.core.state.lock().unwrap().connectivity;
        if connect && state == ConnectivityState::Idle {
            if let Some(lb) = self.core.resolving_lb.get() {
                lb.exit_idle();
            }
        }
        state
    }

    /// Waits for the first transition away from `last_observed`, or until
    /// `deadline`. One-shot: the watcher is removed after it fires.
    pub async fn watch_connectivity_state(
        &self,
        last_observed: ConnectivityState,
        deadline: Option<Instant>,
    ) -> Result<ConnectivityState, Status> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.core.state.lock().unwrap();
            if state.connectivity != last_observed {
                return Ok(state.connectivity);
            }
            let id = state.next_watcher_id;
            state.next_watcher_id += 1;
            state.watchers.push(Watcher {
                id,
                last_observed,
                tx,
            });
            id
        };

        let result = match deadline {
            Some(deadline) => {
                tokio::select! {
                    changed = rx => changed.ok(),
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => None,
                }
            }
            None => rx.await.ok(),
        };

        match result {
            Some(state) => Ok(state),
            None => {
                self.core
                    .state
                    .lock()
                    .unwrap()
                    .watchers
                    .retain(|w| w.id != id);
                Err(Status::deadline_exceeded(
                    "Deadline expired while waiting for connectivity state change",
                ))
            }
        }
    }

    /// Creates a new call stream. The call is routed through the current
    /// picker, queueing until the channel can place it on a connection.
    pub fn create_call(&self, method: &str, options: CallOptions) -> Result<Arc<CallStream>, Status> {
        if self.core.state.lock().unwrap().closed {
            return Err(Status::unavailable("Channel has been shut down"));
        }

        let mut options = options;
        self.apply_method_defaults(method, &mut options);

        // The deadline filter needs a cancel hook before the call exists;
        // bind it through a cell filled in right after construction.
        let cancel_target: Arc<OnceLock<Arc<crate::client::call::CallShared>>> =
            Arc::new(OnceLock::new());
        let cancel = {
            let target = cancel_target.clone();
            Arc::new(move |status: Status| {
                if let Some(shared) = target.get() {
                    shared.cancel_with_status(status);
                }
            })
        };
        let info = CallInfo {
            method: method.to_owned(),
            authority: self.core.default_authority.clone(),
            deadline: options.deadline,
            cancel,
        };
        let filters = FilterStack::new(&self.core.filter_factories, &info);
        let call = CallStream::new(
            method.to_owned(),
            self.core.default_authority.clone(),
            filters,
        );
        let _ = cancel_target.set(call.shared());

        self.core.try_pick(call.clone(), options);
        if self.core.state.lock().unwrap().connectivity == ConnectivityState::Idle {
            if let Some(lb) = self.core.resolving_lb.get() {
                lb.exit_idle();
            }
        }
        Ok(call)
    }

    /// Applies wait-for-ready and timeout defaults from the channel's own
    /// service config.
    fn apply_method_defaults(&self, method: &str, options: &mut CallOptions) {
        let Some(config) = &self.core.default_service_config else {
            return;
        };
        let Some(method_config) = config.method_config(method) else {
            return;
        };
        if !options.wait_for_ready {
            options.wait_for_ready = method_config.wait_for_ready.unwrap_or(false);
        }
        if options.deadline.is_none() {
            if let Some(timeout) = method_config
                .timeout
                .as_deref()
                .and_then(parse_proto_duration)
            {
                options.deadline = Some(Instant::now() + timeout);
            }
        }
    }

    /// Shuts the channel down: every queued pick fails, the balancer and
    /// resolver are destroyed, and further `create_call`s fail.
    pub fn close(&self) {
        debug!(target = %self.core.target, "closing channel");
        let (queued, watchers) = {
            let mut state = self.core.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.connectivity = ConnectivityState::Shutdown;
            (
                std::mem::take(&mut state.pick_queue),
                std::mem::take(&mut state.watchers),
            )
        };
        for pick in queued {
            pick.call.fail(Status::unavailable("Channel closed"));
        }
        for watcher in watchers {
            let _ = watcher.tx.send(ConnectivityState::Shutdown);
        }
        if let Some(lb) = self.core.resolving_lb.get() {
            lb.destroy();
        }
        self.core.pool.unref_unused_subchannels();
    }
}

impl ChannelCore {
    /// Routes one call through the current picker.
    fn try_pick(self: &Arc<Self>, call: Arc<CallStream>, options: CallOptions) {
        loop {
            let (picker, version, closed) = {
                let state = self.state.lock().unwrap();
                (state.picker.clone(), state.picker_version, state.closed)
            };
            if closed {
                call.fail(Status::unavailable("Channel has been shut down"));
                return;
            }

            let request = PickRequest {
                method: call.method().to_owned(),
                metadata: options.metadata.clone(),
            };
            let queue = match picker.pick(&request) {
                PickResult::Complete {
                    subchannel: Some(subchannel),
                } => {
                    let core = self.clone();
                    tokio::spawn(async move {
                        core.start_call(call, options, subchannel).await;
                    });
                    return;
                }
                PickResult::Complete { subchannel: None } => {
                    call.fail(Status::unavailable(
                        "Request dropped by load balancing policy",
                    ));
                    return;
                }
                PickResult::Queue => true,
                PickResult::TransientFailure(status) => {
                    if !options.wait_for_ready {
                        call.fail(status);
                        return;
                    }
                    true
                }
            };

            if queue {
                let mut state = self.state.lock().unwrap();
                // A newer picker drained the queue while this pick ran;
                // retry against it rather than stranding the call.
                if state.picker_version != version {
                    continue;
                }
                trace!(method = call.method(), "queueing call until a picker is ready");
                state.pick_queue.push(QueuedPick { call, options });
                return;
            }
        }
    }

    async fn start_call(
        self: &Arc<Self>,
        call: Arc<CallStream>,
        options: CallOptions,
        subchannel: Arc<Subchannel>,
    ) {
        let metadata = match call.outgoing_metadata(options.metadata.clone()).await {
            Ok(metadata) => metadata,
            Err(status) => {
                call.fail(status);
                return;
            }
        };
        // The picker ran against a snapshot; the connection may be gone by
        // the time the metadata filters finish.
        if subchannel.state() != ConnectivityState::Ready {
            call.fail(Status::unavailable("Connection dropped while starting call"));
            return;
        }
        match subchannel
            .start_call_stream(&call.shared().authority, call.method(), &metadata)
            .await
        {
            Ok((send, recv)) => call.attach(subchannel, send, recv),
            Err(_) => {
                call.fail(Status::unavailable("Connection dropped while starting call"));
            }
        }
    }

    /// A new picker (and possibly state) arrived from the balancer.
    fn on_balancer_state(self: &Arc<Self>, connectivity: ConnectivityState, picker: Arc<dyn Picker>) {
        let (queued, fired_watchers) = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            let changed = state.connectivity != connectivity;
            state.connectivity = connectivity;
            state.picker = picker;
            state.picker_version += 1;

            let queued = std::mem::take(&mut state.pick_queue);
            let mut fired = Vec::new();
            if changed {
                trace!(state = %connectivity, "channel connectivity changed");
                let mut remaining = Vec::new();
                for watcher in state.watchers.drain(..) {
                    if watcher.last_observed != connectivity {
                        fired.push(watcher);
                    } else {
                        remaining.push(watcher);
                    }
                }
                state.watchers = remaining;
            }
            (queued, fired)
        };

        // Replay queued picks in FIFO order against the new picker.
        for pick in queued {
            self.try_pick(pick.call, pick.options);
        }
        for watcher in fired_watchers {
            let _ = watcher.tx.send(connectivity);
        }
    }
}

struct ChannelHelper {
    core: Weak<ChannelCore>,
}

impl ChannelControlHelper for ChannelHelper {
    fn create_subchannel(&self, address: &Address) -> Arc<Subchannel> {
        let core = self.core.upgrade().expect("channel outlives its balancer");
        core.pool.get_or_create_subchannel(
            &core.target_string,
            address,
            &core.options,
            &core.credentials,
            &core.default_authority,
        )
    }

    fn update_state(&self, state: ConnectivityState, picker: Arc<dyn Picker>) {
        if let Some(core) = self.core.upgrade() {
            core.on_balancer_state(state, picker);
        }
    }

    fn request_reresolution(&self) {
        // Re-resolution is handled inside the resolving balancer before
        // updates reach the channel.
    }
}
