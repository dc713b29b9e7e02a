//! The round_robin policy: connect to every address and rotate READY
//! connections across calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::trace;

use super::{
    aggregate_connectivity_state, ChannelControlHelper, LoadBalancer, LoadBalancerBuilder,
    PickRequest, PickResult, Picker, QueuePicker, UnavailablePicker,
};
use crate::client::name_resolution::Address;
use crate::client::subchannel::Subchannel;
use crate::client::ConnectivityState;
use crate::status::Status;

pub const POLICY_NAME: &str = "round_robin";

pub struct RoundRobinBuilder;

impl LoadBalancerBuilder for RoundRobinBuilder {
    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn build(&self, helper: Arc<dyn ChannelControlHelper>) -> Arc<dyn LoadBalancer> {
        Arc::new(RoundRobinLoadBalancer {
            core: Arc::new(Core {
                helper,
                state: Mutex::new(State {
                    children: Vec::new(),
                    destroyed: false,
                }),
            }),
        })
    }
}

struct Child {
    subchannel: Arc<Subchannel>,
    listener_id: usize,
    state: ConnectivityState,
}

impl Child {
    fn teardown(&self) {
        self.subchannel
            .remove_connectivity_state_listener(self.listener_id);
        self.subchannel.channel_unref();
    }
}

struct State {
    children: Vec<Child>,
    destroyed: bool,
}

struct Core {
    helper: Arc<dyn ChannelControlHelper>,
    state: Mutex<State>,
}

pub struct RoundRobinLoadBalancer {
    core: Arc<Core>,
}

impl Core {
    fn watch(self: &Arc<Self>, subchannel: &Arc<Subchannel>) -> usize {
        let weak: Weak<Core> = Arc::downgrade(self);
        let weak_subchannel = Arc::downgrade(subchannel);
        subchannel.add_connectivity_state_listener(Arc::new(move |_previous, current| {
            let (Some(core), Some(subchannel)) = (weak.upgrade(), weak_subchannel.upgrade())
            else {
                return;
            };
            core.on_subchannel_state(&subchannel, current);
        }))
    }

    fn on_subchannel_state(self: &Arc<Self>, subchannel: &Arc<Subchannel>, current: ConnectivityState) {
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return;
        }
        let Some(child) = state
            .children
            .iter_mut()
            .find(|child| Arc::ptr_eq(&child.subchannel, subchannel))
        else {
            return;
        };
        child.state = current;

        match current {
            ConnectivityState::Idle => {
                // Round robin keeps every connection alive.
                subchannel.start_connecting();
            }
            ConnectivityState::TransientFailure => {
                self.helper.request_reresolution();
            }
            _ => {}
        }
        self.publish(&state);
    }

    fn publish(&self, state: &State) {
        let states: Vec<ConnectivityState> =
            state.children.iter().map(|child| child.state).collect();
        let aggregate = aggregate_connectivity_state(&states);
        let picker: Arc<dyn Picker> = match aggregate {
            ConnectivityState::Ready => {
                let ready: Vec<Arc<Subchannel>> = state
                    .children
                    .iter()
                    .filter(|child| child.state == ConnectivityState::Ready)
                    .map(|child| child.subchannel.clone())
                    .collect();
                Arc::new(RoundRobinPicker::new(ready))
            }
            ConnectivityState::TransientFailure => Arc::new(UnavailablePicker::new(
                Status::unavailable("No connection established to any address"),
            )),
            _ => Arc::new(QueuePicker),
        };
        self.helper.update_state(aggregate, picker);
    }
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn update_address_list(&self, addresses: Vec<Address>, _config: Option<&serde_json::Value>) {
        let mut state = self.core.state.lock().unwrap();
        if state.destroyed {
            return;
        }

        trace!(count = addresses.len(), "round_robin received address list");
        for child in state.children.drain(..) {
            child.teardown();
        }

        if addresses.is_empty() {
            self.core.helper.update_state(
                ConnectivityState::TransientFailure,
                Arc::new(UnavailablePicker::new(Status::unavailable(
                    "Resolver returned an empty address list",
                ))),
            );
            self.core.helper.request_reresolution();
            return;
        }

        for address in &addresses {
            let subchannel = self.core.helper.create_subchannel(address);
            let listener_id = self.core.watch(&subchannel);
            let child_state = subchannel.state();
            subchannel.start_connecting();
            state.children.push(Child {
                subchannel,
                listener_id,
                state: child_state,
            });
        }
        self.core.publish(&state);
    }

    fn exit_idle(&self) {
        let state = self.core.state.lock().unwrap();
        for child in &state.children {
            child.subchannel.start_connecting();
        }
    }

    fn reset_backoff(&self) {
        let state = self.core.state.lock().unwrap();
        for child in &state.children {
            child.subchannel.reset_backoff();
        }
    }

    fn destroy(&self) {
        let mut state = self.core.state.lock().unwrap();
        state.destroyed = true;
        for child in state.children.drain(..) {
            child.teardown();
        }
    }
}

/// Rotates over the READY subchannels with a shared index.
struct RoundRobinPicker {
    subchannels: Vec<Arc<Subchannel>>,
    next: AtomicUsize,
}

impl RoundRobinPicker {
    fn new(subchannels: Vec<Arc<Subchannel>>) -> RoundRobinPicker {
        RoundRobinPicker {
            subchannels,
            next: AtomicUsize::new(0),
        }
    }
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _request: &PickRequest) -> PickResult {
        if self.subchannels.is_empty() {
            return PickResult::Queue;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.subchannels.len();
        PickResult::Complete {
            subchannel: Some(self.subchannels[index].clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::load_balancing::test_utils::{await_state, new_request, setup};

    fn addresses(list: &[&str]) -> Vec<Address> {
        list.iter().map(|a| Address::new(*a)).collect()
    }

    fn picked_address(picker: &Arc<dyn Picker>) -> Address {
        match picker.pick(&new_request()) {
            PickResult::Complete { subchannel } => subchannel.unwrap().address().clone(),
            _ => panic!("expected a complete pick"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rotates_across_ready_backends() {
        let (mut events, _connector, helper) = setup();
        let policy = RoundRobinBuilder.build(helper);

        policy.update_address_list(addresses(&["10.0.0.1:80", "10.0.0.2:80"]), None);

        // Both backends connect; wait for a picker that rotates over both.
        let mut picker = await_state(&mut events, ConnectivityState::Ready).await;
        loop {
            let first = picked_address(&picker);
            let second = picked_address(&picker);
            if first != second {
                let third = picked_address(&picker);
                assert_eq!(first, third, "rotation should wrap");
                break;
            }
            // Only one backend was READY at publish time; await the next
            // picker.
            picker = await_state(&mut events, ConnectivityState::Ready).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn all_backends_failing_is_transient_failure() {
        let (mut events, connector, helper) = setup();
        connector.fail_address(&Address::new("10.0.0.1:80"), "refused");
        connector.fail_address(&Address::new("10.0.0.2:80"), "refused");
        let policy = RoundRobinBuilder.build(helper);

        policy.update_address_list(addresses(&["10.0.0.1:80", "10.0.0.2:80"]), None);
        let picker = await_state(&mut events, ConnectivityState::TransientFailure).await;
        assert!(matches!(
            picker.pick(&new_request()),
            PickResult::TransientFailure(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn single_backend_ready() {
        let (mut events, _connector, helper) = setup();
        let policy = RoundRobinBuilder.build(helper);

        policy.update_address_list(addresses(&["10.0.0.1:80"]), None);
        let picker = await_state(&mut events, ConnectivityState::Ready).await;
        assert_eq!(picked_address(&picker), Address::new("10.0.0.1:80"));
        assert_eq!(picked_address(&picker), Address::new("10.0.0.1:80"));
    }
}
