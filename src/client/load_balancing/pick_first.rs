//! The pick_first policy: connect to addresses in order, one at a time, and
//! route every call to the first one that becomes READY.

use std::sync::{Arc, Mutex, Weak};

use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::{debug, trace};

use super::{
    ChannelControlHelper, CompletePicker, LoadBalancer, LoadBalancerBuilder, QueuePicker,
    UnavailablePicker,
};
use crate::client::name_resolution::Address;
use crate::client::subchannel::Subchannel;
use crate::client::ConnectivityState;
use crate::status::Status;

pub const POLICY_NAME: &str = "pick_first";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PickFirstConfig {
    #[serde(default)]
    shuffle_address_list: Option<bool>,
}

pub struct PickFirstBuilder;

impl LoadBalancerBuilder for PickFirstBuilder {
    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn build(&self, helper: Arc<dyn ChannelControlHelper>) -> Arc<dyn LoadBalancer> {
        Arc::new(PickFirstLoadBalancer {
            core: Arc::new(Core {
                helper,
                state: Mutex::new(State {
                    addresses: Vec::new(),
                    attempt: None,
                    attempt_index: 0,
                    current_pick: None,
                    destroyed: false,
                }),
            }),
        })
    }

    fn validate_config(&self, config: &serde_json::Value) -> Result<(), String> {
        serde_json::from_value::<PickFirstConfig>(config.clone())
            .map(|_| ())
            .map_err(|e| format!("invalid pick_first config: {e}"))
    }
}

struct Child {
    subchannel: Arc<Subchannel>,
    listener_id: usize,
}

impl Child {
    fn matches(&self, subchannel: &Arc<Subchannel>) -> bool {
        Arc::ptr_eq(&self.subchannel, subchannel)
    }

    fn teardown(&self) {
        self.subchannel
            .remove_connectivity_state_listener(self.listener_id);
        self.subchannel.channel_unref();
    }
}

struct State {
    addresses: Vec<Address>,
    /// The subchannel currently being connected, while no pick exists.
    attempt: Option<Child>,
    attempt_index: usize,
    /// The READY subchannel serving all picks.
    current_pick: Option<Child>,
    destroyed: bool,
}

struct Core {
    helper: Arc<dyn ChannelControlHelper>,
    state: Mutex<State>,
}

/// See the module docs. The policy state lives in an inner core shared
/// weakly with subchannel listeners.
pub struct PickFirstLoadBalancer {
    core: Arc<Core>,
}

impl Core {
    /// Attaches a listener forwarding this subchannel's transitions back into
    /// the policy.
    fn watch(self: &Arc<Self>, subchannel: &Arc<Subchannel>) -> Child {
        let weak: Weak<Core> = Arc::downgrade(self);
        let weak_subchannel = Arc::downgrade(subchannel);
        let listener_id =
            subchannel.add_connectivity_state_listener(Arc::new(move |_previous, current| {
                let (Some(core), Some(subchannel)) = (weak.upgrade(), weak_subchannel.upgrade())
                else {
                    return;
                };
                core.on_subchannel_state(&subchannel, current);
            }));
        Child {
            subchannel: subchannel.clone(),
            listener_id,
        }
    }

    fn on_subchannel_state(self: &Arc<Self>, subchannel: &Arc<Subchannel>, current: ConnectivityState) {
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return;
        }

        if state
            .current_pick
            .as_ref()
            .is_some_and(|p| p.matches(subchannel))
        {
            if current != ConnectivityState::Ready {
                // The connection serving picks went away: back to IDLE and
                // queue calls until the channel asks us to reconnect.
                trace!(address = %subchannel.address(), "current pick left READY");
                if let Some(pick) = state.current_pick.take() {
                    pick.teardown();
                }
                self.helper
                    .update_state(ConnectivityState::Idle, Arc::new(QueuePicker));
            }
            return;
        }

        if state.attempt.as_ref().is_some_and(|a| a.matches(subchannel)) {
            match current {
                ConnectivityState::Ready => {
                    if let Some(attempt) = state.attempt.take() {
                        self.promote(&mut state, attempt);
                    }
                }
                ConnectivityState::TransientFailure => {
                    if let Some(attempt) = state.attempt.take() {
                        attempt.teardown();
                    }
                    let next = state.attempt_index + 1;
                    self.connect_from(&mut state, next);
                }
                ConnectivityState::Connecting => {
                    self.helper
                        .update_state(ConnectivityState::Connecting, Arc::new(QueuePicker));
                }
                ConnectivityState::Idle => {
                    // Backoff expired; resume the attempt.
                    subchannel.start_connecting();
                }
                ConnectivityState::Shutdown => {}
            }
        }
        // Transitions of superseded subchannels are ignored.
    }

    fn promote(&self, state: &mut State, child: Child) {
        debug!(address = %child.subchannel.address(), "connection established");
        let picker = Arc::new(CompletePicker::new(child.subchannel.clone()));
        state.current_pick = Some(child);
        self.helper.update_state(ConnectivityState::Ready, picker);
    }

    /// Walks the address list starting at `index`, creating one subchannel at
    /// a time, until an attempt is in flight, a READY subchannel is found, or
    /// the list is exhausted.
    fn connect_from(self: &Arc<Self>, state: &mut State, index: usize) {
        state.attempt_index = index;
        loop {
            if state.attempt_index >= state.addresses.len() {
                state.attempt = None;
                self.helper.update_state(
                    ConnectivityState::TransientFailure,
                    Arc::new(UnavailablePicker::new(Status::unavailable(
                        "No connection established",
                    ))),
                );
                self.helper.request_reresolution();
                return;
            }

            let address = state.addresses[state.attempt_index].clone();
            let subchannel = self.helper.create_subchannel(&address);
            let child = self.watch(&subchannel);
            match subchannel.state() {
                ConnectivityState::Ready => {
                    // A pooled subchannel another channel already connected.
                    self.promote(state, child);
                    return;
                }
                ConnectivityState::Idle => {
                    subchannel.start_connecting();
                    state.attempt = Some(child);
                    self.helper
                        .update_state(ConnectivityState::Connecting, Arc::new(QueuePicker));
                    return;
                }
                ConnectivityState::Connecting => {
                    state.attempt = Some(child);
                    self.helper
                        .update_state(ConnectivityState::Connecting, Arc::new(QueuePicker));
                    return;
                }
                ConnectivityState::TransientFailure | ConnectivityState::Shutdown => {
                    child.teardown();
                    state.attempt_index += 1;
                }
            }
        }
    }
}

impl LoadBalancer for PickFirstLoadBalancer {
    fn update_address_list(&self, mut addresses: Vec<Address>, config: Option<&serde_json::Value>) {
        let shuffle = config
            .and_then(|c| serde_json::from_value::<PickFirstConfig>(c.clone()).ok())
            .and_then(|c| c.shuffle_address_list)
            .unwrap_or(false);
        if shuffle {
            addresses.shuffle(&mut rand::rng());
        }

        let mut state = self.core.state.lock().unwrap();
        if state.destroyed {
            return;
        }

        // A restarted attempt must not keep connecting to dropped addresses.
        if let Some(attempt) = state.attempt.take() {
            attempt.teardown();
        }

        if let Some(pick) = &state.current_pick {
            if addresses.contains(pick.subchannel.address()) {
                // The connected backend is still valid: keep serving from it.
                state.addresses = addresses;
                return;
            }
            trace!("current pick no longer in address list, dropping it");
            if let Some(pick) = state.current_pick.take() {
                pick.teardown();
            }
        }

        state.addresses = addresses;
        if state.addresses.is_empty() {
            self.core.helper.update_state(
                ConnectivityState::TransientFailure,
                Arc::new(UnavailablePicker::new(Status::unavailable(
                    "Resolver returned an empty address list",
                ))),
            );
            self.core.helper.request_reresolution();
            return;
        }
        self.core.connect_from(&mut state, 0);
    }

    fn exit_idle(&self) {
        let mut state = self.core.state.lock().unwrap();
        if state.destroyed
            || state.current_pick.is_some()
            || state.attempt.is_some()
            || state.addresses.is_empty()
        {
            return;
        }
        self.core.connect_from(&mut state, 0);
    }

    fn reset_backoff(&self) {
        let state = self.core.state.lock().unwrap();
        if let Some(attempt) = &state.attempt {
            attempt.subchannel.reset_backoff();
        }
        if let Some(pick) = &state.current_pick {
            pick.subchannel.reset_backoff();
        }
    }

    fn destroy(&self) {
        let mut state = self.core.state.lock().unwrap();
        state.destroyed = true;
        if let Some(attempt) = state.attempt.take() {
            attempt.teardown();
        }
        if let Some(pick) = state.current_pick.take() {
            pick.teardown();
        }
        state.addresses.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::load_balancing::test_utils::{await_state, new_request, setup, TestEvent};
    use crate::client::load_balancing::PickResult;
    use crate::client::transport::TransportEvent;
    use std::time::Duration;

    fn addresses(list: &[&str]) -> Vec<Address> {
        list.iter().map(|a| Address::new(*a)).collect()
    }

    async fn expect_subchannel_created(
        events: &mut tokio::sync::mpsc::UnboundedReceiver<TestEvent>,
        address: &str,
    ) {
        loop {
            match events.recv().await.expect("event stream ended") {
                TestEvent::CreateSubchannel(created) => {
                    assert_eq!(created, Address::new(address));
                    return;
                }
                TestEvent::UpdateState(..) => continue,
                TestEvent::RequestReresolution => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_address_reaches_ready() {
        let (mut events, _connector, helper) = setup();
        let policy = PickFirstBuilder.build(helper);

        policy.update_address_list(addresses(&["10.0.0.1:80"]), None);
        expect_subchannel_created(&mut events, "10.0.0.1:80").await;

        let picker = await_state(&mut events, ConnectivityState::Ready).await;
        match picker.pick(&new_request()) {
            PickResult::Complete { subchannel } => {
                assert_eq!(subchannel.unwrap().address(), &Address::new("10.0.0.1:80"));
            }
            _ => panic!("expected a complete pick"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn advances_past_failing_address() {
        let (mut events, connector, helper) = setup();
        connector.fail_address(&Address::new("10.0.0.1:80"), "connection refused");
        let policy = PickFirstBuilder.build(helper);

        policy.update_address_list(addresses(&["10.0.0.1:80", "10.0.0.2:80"]), None);
        expect_subchannel_created(&mut events, "10.0.0.1:80").await;
        expect_subchannel_created(&mut events, "10.0.0.2:80").await;

        let picker = await_state(&mut events, ConnectivityState::Ready).await;
        match picker.pick(&new_request()) {
            PickResult::Complete { subchannel } => {
                assert_eq!(subchannel.unwrap().address(), &Address::new("10.0.0.2:80"));
            }
            _ => panic!("expected a complete pick"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_the_list_publishes_transient_failure() {
        let (mut events, connector, helper) = setup();
        connector.fail_address(&Address::new("10.0.0.1:80"), "refused");
        connector.fail_address(&Address::new("10.0.0.2:80"), "refused");
        let policy = PickFirstBuilder.build(helper);

        policy.update_address_list(addresses(&["10.0.0.1:80", "10.0.0.2:80"]), None);
        let picker = await_state(&mut events, ConnectivityState::TransientFailure).await;
        match picker.pick(&new_request()) {
            PickResult::TransientFailure(status) => {
                assert_eq!(status.code(), crate::status::Code::Unavailable);
            }
            _ => panic!("expected a failing pick"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pick_leaving_ready_publishes_idle_queue() {
        let (mut events, connector, helper) = setup();
        let policy = PickFirstBuilder.build(helper);

        policy.update_address_list(addresses(&["10.0.0.1:80"]), None);
        let _ = await_state(&mut events, ConnectivityState::Ready).await;

        // Kill the connection out from under the pick.
        connector
            .transport_for(&Address::new("10.0.0.1:80"))
            .events_tx
            .send(TransportEvent::Closed)
            .unwrap();

        let picker = await_state(&mut events, ConnectivityState::Idle).await;
        assert!(matches!(picker.pick(&new_request()), PickResult::Queue));
    }

    #[tokio::test(start_paused = true)]
    async fn update_keeping_current_address_causes_no_churn() {
        let (mut events, _connector, helper) = setup();
        let policy = PickFirstBuilder.build(helper);

        policy.update_address_list(addresses(&["10.0.0.1:80"]), None);
        let _ = await_state(&mut events, ConnectivityState::Ready).await;

        // New list still contains the connected backend.
        policy.update_address_list(addresses(&["10.0.0.1:80", "10.0.0.9:80"]), None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            events.try_recv().is_err(),
            "no events expected when the pick is kept"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn update_dropping_current_address_reconnects() {
        let (mut events, _connector, helper) = setup();
        let policy = PickFirstBuilder.build(helper);

        policy.update_address_list(addresses(&["10.0.0.1:80"]), None);
        let _ = await_state(&mut events, ConnectivityState::Ready).await;

        policy.update_address_list(addresses(&["10.0.0.9:80"]), None);
        expect_subchannel_created(&mut events, "10.0.0.9:80").await;
        let _ = await_state(&mut events, ConnectivityState::Ready).await;
    }

    #[tokio::test(start_paused = true)]
    async fn empty_address_list_fails() {
        let (mut events, _connector, helper) = setup();
        let policy = PickFirstBuilder.build(helper);

        policy.update_address_list(Vec::new(), None);
        let picker = await_state(&mut events, ConnectivityState::TransientFailure).await;
        assert!(matches!(
            picker.pick(&new_request()),
            PickResult::TransientFailure(_)
        ));
    }

    #[test]
    fn config_validation() {
        let builder = PickFirstBuilder;
        assert!(builder
            .validate_config(&serde_json::json!({"shuffleAddressList": true}))
            .is_ok());
        assert!(builder.validate_config(&serde_json::json!({})).is_ok());
        assert!(builder
            .validate_config(&serde_json::json!({"shuffleAddressList": "yes"}))
            .is_err());
    }
}
