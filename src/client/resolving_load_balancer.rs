//! Glues the resolver to the load balancing policy: applies the service
//! config selection algorithm, instantiates the configured policy, and hot
//! swaps policies without dropping a READY connection.

use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tracing::{debug, warn};

use crate::client::backoff::BackoffTimer;
use crate::client::load_balancing::{
    global_lb_registry, ChannelControlHelper, LoadBalancer, LoadBalancerRegistry, Picker,
    QueuePicker, UnavailablePicker,
};
use crate::client::name_resolution::{
    Address, ResolutionListener, Resolver, ResolverFactory, Target,
};
use crate::client::service_config::ServiceConfig;
use crate::client::ConnectivityState;
use crate::status::Status;

const DEFAULT_POLICY: &str = "pick_first";

/// One constructed policy together with its cached latest published state.
struct ActivePolicy {
    name: String,
    policy: Arc<dyn LoadBalancer>,
    helper_id: usize,
    latest: (ConnectivityState, Arc<dyn Picker>),
}

struct State {
    /// The policy serving picks. `None` before the first resolution.
    inner: Option<ActivePolicy>,
    /// A replacement being warmed up while `inner` is still READY.
    /// Invariant: `inner` is `None` implies `pending` is `None`.
    pending: Option<ActivePolicy>,
    previous_service_config: Option<ServiceConfig>,
    resolution_started: bool,
    continue_resolving: bool,
    destroyed: bool,
    next_helper_id: usize,
}

struct Core {
    target: Target,
    channel_helper: Arc<dyn ChannelControlHelper>,
    registry: &'static LoadBalancerRegistry,
    default_service_config: Option<ServiceConfig>,
    resolver: Mutex<Option<Box<dyn Resolver>>>,
    backoff: BackoffTimer,
    state: Mutex<State>,
}

/// Combines a [`Resolver`] with the configured [`LoadBalancer`], swapping
/// policies when the service config changes.
pub struct ResolvingLoadBalancer {
    core: Arc<Core>,
}

impl ResolvingLoadBalancer {
    pub fn new(
        target: Target,
        channel_helper: Arc<dyn ChannelControlHelper>,
        resolver_factory: &dyn ResolverFactory,
        default_service_config: Option<ServiceConfig>,
    ) -> ResolvingLoadBalancer {
        let core = Arc::new(Core {
            target: target.clone(),
            channel_helper,
            registry: global_lb_registry(),
            default_service_config,
            resolver: Mutex::new(None),
            backoff: BackoffTimer::with_defaults(),
            state: Mutex::new(State {
                inner: None,
                pending: None,
                previous_service_config: None,
                resolution_started: false,
                continue_resolving: false,
                destroyed: false,
                next_helper_id: 0,
            }),
        });

        let listener = Arc::new(Listener {
            core: Arc::downgrade(&core),
        });
        let resolver = resolver_factory.create(&target, listener);
        *core.resolver.lock().unwrap() = Some(resolver);

        ResolvingLoadBalancer { core }
    }

    /// Kicks off (or resumes) resolution and connection establishment.
    pub fn exit_idle(&self) {
        let inner = {
            let state = self.core.state.lock().unwrap();
            if state.destroyed {
                return;
            }
            state.inner.as_ref().map(|active| active.policy.clone())
        };
        match inner {
            Some(policy) => policy.exit_idle(),
            None => self.core.request_resolution(),
        }
    }

    pub fn reset_backoff(&self) {
        self.core.backoff.reset();
        let (inner, pending) = {
            let state = self.core.state.lock().unwrap();
            (
                state.inner.as_ref().map(|a| a.policy.clone()),
                state.pending.as_ref().map(|a| a.policy.clone()),
            )
        };
        if let Some(policy) = inner {
            policy.reset_backoff();
        }
        if let Some(policy) = pending {
            policy.reset_backoff();
        }
    }

    /// Tears everything down. No further state updates are published.
    pub fn destroy(&self) {
        let (inner, pending) = {
            let mut state = self.core.state.lock().unwrap();
            state.destroyed = true;
            (state.inner.take(), state.pending.take())
        };
        if let Some(active) = inner {
            active.policy.destroy();
        }
        if let Some(active) = pending {
            active.policy.destroy();
        }
        if let Some(resolver) = self.core.resolver.lock().unwrap().take() {
            resolver.destroy();
        }
        self.core.backoff.stop();
    }
}

struct Listener {
    core: Weak<Core>,
}

impl ResolutionListener for Listener {
    fn on_successful_resolution(
        &self,
        addresses: Vec<Address>,
        service_config: Option<ServiceConfig>,
        service_config_error: Option<Status>,
    ) {
        if let Some(core) = self.core.upgrade() {
            core.handle_resolution(addresses, service_config, service_config_error);
        }
    }

    fn on_error(&self, error: Status) {
        if let Some(core) = self.core.upgrade() {
            core.handle_resolution_failure(error);
        }
    }
}

/// The helper handed to each constructed policy. Updates are cached so the
/// hot swap can activate the replacement's state and picker atomically.
struct PolicyHelper {
    core: Weak<Core>,
    id: usize,
}

impl ChannelControlHelper for PolicyHelper {
    fn create_subchannel(&self, address: &Address) -> Arc<crate::client::subchannel::Subchannel> {
        let core = self.core.upgrade().expect("channel outlives its policies");
        let helper = core.channel_helper.clone();
        helper.create_subchannel(address)
    }

    fn update_state(&self, state: ConnectivityState, picker: Arc<dyn Picker>) {
        if let Some(core) = self.core.upgrade() {
            core.on_policy_state(self.id, state, picker);
        }
    }

    fn request_reresolution(&self) {
        if let Some(core) = self.core.upgrade() {
            core.request_resolution();
        }
    }
}

/// What to do with a resolution result, decided under the state lock and
/// executed outside it.
struct Apply {
    policy: Arc<dyn LoadBalancer>,
    replaced: Option<ActivePolicy>,
}

impl Core {
    fn new_policy(self: &Arc<Self>, state: &mut State, name: &str) -> ActivePolicy {
        let builder = self
            .registry
            .get(name)
            .expect("caller verified the policy is registered");
        let id = state.next_helper_id;
        state.next_helper_id += 1;
        let helper = Arc::new(PolicyHelper {
            core: Arc::downgrade(self),
            id,
        });
        let policy = builder.build(helper);
        ActivePolicy {
            name: name.to_owned(),
            policy,
            helper_id: id,
            latest: (ConnectivityState::Connecting, Arc::new(QueuePicker)),
        }
    }

    /// The service config selection ladder of §4.6.
    fn select_working_config(
        &self,
        state: &mut State,
        service_config: Option<ServiceConfig>,
        service_config_error: Option<Status>,
    ) -> Result<Option<ServiceConfig>, Status> {
        match (service_config, service_config_error) {
            (Some(config), _) => {
                state.previous_service_config = Some(config.clone());
                Ok(Some(config))
            }
            (None, None) => {
                state.previous_service_config = None;
                Ok(self.default_service_config.clone())
            }
            (None, Some(error)) => {
                if let Some(previous) = &state.previous_service_config {
                    Ok(Some(previous.clone()))
                } else if let Some(default) = &self.default_service_config {
                    Ok(Some(default.clone()))
                } else {
                    Err(error)
                }
            }
        }
    }

    /// Picks the first registered policy from the working config, falling
    /// back to pick_first for configs that list none.
    fn choose_policy(&self, config: Option<&ServiceConfig>) -> Result<(String, Option<Value>), Status> {
        let Some(config) = config else {
            return Ok((DEFAULT_POLICY.to_owned(), None));
        };
        let mut listed_any = false;
        for name in config.lb_policy_names() {
            listed_any = true;
            if self.registry.get(name).is_some() {
                let policy_config = config.lb_policy_config(name).cloned();
                return Ok((name.to_owned(), policy_config));
            }
        }
        if listed_any {
            return Err(Status::unavailable(
                "Service config lists no supported load balancing policy",
            ));
        }
        Ok((DEFAULT_POLICY.to_owned(), None))
    }

    fn handle_resolution(
        self: &Arc<Self>,
        addresses: Vec<Address>,
        service_config: Option<ServiceConfig>,
        service_config_error: Option<Status>,
    ) {
        let (apply, config_value) = {
            let mut state = self.state.lock().unwrap();
            if state.destroyed {
                return;
            }
            let working = match self.select_working_config(
                &mut state,
                service_config,
                service_config_error,
            ) {
                Ok(working) => working,
                Err(error) => {
                    drop(state);
                    self.handle_resolution_failure(error);
                    return;
                }
            };

            let (name, config_value) = match self.choose_policy(working.as_ref()) {
                Ok(choice) => choice,
                Err(error) => {
                    drop(state);
                    self.handle_resolution_failure(error);
                    return;
                }
            };

            let apply = self.plan_policy_update(&mut state, &name);
            (apply, config_value)
        };

        if let Some(replaced) = apply.replaced {
            replaced.policy.destroy();
        }
        apply.policy.update_address_list(addresses, config_value.as_ref());
    }

    /// Decides which policy instance receives this update, constructing or
    /// replacing instances as the config demands.
    fn plan_policy_update(self: &Arc<Self>, state: &mut State, name: &str) -> Apply {
        // Updates always land on the newest policy: the pending one if a
        // swap is in progress.
        if let Some(pending) = &state.pending {
            if pending.name == name {
                return Apply {
                    policy: pending.policy.clone(),
                    replaced: None,
                };
            }
            debug!(from = %pending.name, to = name, "replacing pending policy");
            let replaced = state.pending.take();
            let new_pending = self.new_policy(state, name);
            let policy = new_pending.policy.clone();
            state.pending = Some(new_pending);
            return Apply { policy, replaced };
        }

        match &state.inner {
            None => {
                let active = self.new_policy(state, name);
                let policy = active.policy.clone();
                state.inner = Some(active);
                Apply {
                    policy,
                    replaced: None,
                }
            }
            Some(active) if active.name == name => Apply {
                policy: active.policy.clone(),
                replaced: None,
            },
            Some(active) => {
                if active.latest.0 == ConnectivityState::Ready {
                    // Warm the replacement while the active policy keeps
                    // serving.
                    debug!(from = %active.name, to = name, "starting graceful policy switch");
                    let pending = self.new_policy(state, name);
                    let policy = pending.policy.clone();
                    state.pending = Some(pending);
                    Apply {
                        policy,
                        replaced: None,
                    }
                } else {
                    debug!(from = %active.name, to = name, "replacing policy immediately");
                    let replaced = state.inner.take();
                    let active = self.new_policy(state, name);
                    let policy = active.policy.clone();
                    state.inner = Some(active);
                    Apply { policy, replaced }
                }
            }
        }
    }

    /// A policy published a state update through its helper.
    fn on_policy_state(self: &Arc<Self>, helper_id: usize, state: ConnectivityState, picker: Arc<dyn Picker>) {
        let mut publish = None;
        let mut retired = None;
        {
            let mut guard = self.state.lock().unwrap();
            if guard.destroyed {
                return;
            }

            if guard
                .pending
                .as_ref()
                .is_some_and(|p| p.helper_id == helper_id)
            {
                if let Some(pending) = guard.pending.as_mut() {
                    pending.latest = (state, picker);
                }
                // The replacement activates once it is READY.
                if state == ConnectivityState::Ready {
                    retired = guard.inner.take();
                    let activated = guard.pending.take();
                    if let Some(activated) = activated {
                        publish = Some(activated.latest.clone());
                        guard.inner = Some(activated);
                    }
                }
            } else if guard
                .inner
                .as_ref()
                .is_some_and(|a| a.helper_id == helper_id)
            {
                if let Some(inner) = guard.inner.as_mut() {
                    inner.latest = (state, picker.clone());
                }
                publish = Some((state, picker));
                // The active policy left READY: activate the replacement.
                if state != ConnectivityState::Ready && guard.pending.is_some() {
                    retired = guard.inner.take();
                    let activated = guard.pending.take();
                    if let Some(activated) = activated {
                        publish = Some(activated.latest.clone());
                        guard.inner = Some(activated);
                    }
                }
            } else {
                // A retired policy still publishing; ignore it.
                return;
            }
        }

        if let Some(retired) = retired {
            // The retiring policy may be the caller, holding its own lock;
            // tear it down off this stack.
            tokio::spawn(async move {
                retired.policy.destroy();
            });
        }
        if let Some((state, picker)) = publish {
            self.channel_helper.update_state(state, picker);
        }
    }

    /// Resolution failed, or produced a config this channel cannot use.
    fn handle_resolution_failure(self: &Arc<Self>, error: Status) {
        warn!(target = %self.target, %error, "name resolution failed");
        let publish = {
            let state = self.state.lock().unwrap();
            if state.destroyed {
                return;
            }
            match &state.inner {
                None => true,
                Some(active) => active.latest.0 == ConnectivityState::Idle,
            }
        };
        if publish {
            self.channel_helper.update_state(
                ConnectivityState::TransientFailure,
                Arc::new(UnavailablePicker::new(error)),
            );
        }

        let core = self.clone();
        self.backoff.run_once(move || {
            core.on_resolution_backoff_expired();
        });
    }

    fn on_resolution_backoff_expired(self: &Arc<Self>) {
        let resolve = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.continue_resolving)
        };
        if resolve {
            self.resolve_now();
        }
    }

    /// Re-resolution requests coalesce while the resolution backoff runs.
    fn request_resolution(self: &Arc<Self>) {
        if self.backoff.is_running() {
            self.state.lock().unwrap().continue_resolving = true;
            return;
        }
        self.resolve_now();
    }

    fn resolve_now(self: &Arc<Self>) {
        let started = {
            let mut state = self.state.lock().unwrap();
            if state.destroyed {
                return;
            }
            std::mem::replace(&mut state.resolution_started, true)
        };
        let resolver = self.resolver.lock().unwrap();
        if let Some(resolver) = resolver.as_ref() {
            if started {
                resolver.update_resolution();
            } else {
                resolver.start_resolution();
            }
        }
    }
}
