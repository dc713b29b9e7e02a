//! Load balancing: policies own a set of subchannels and publish pickers
//! that route individual calls.

use std::sync::Arc;

use crate::client::name_resolution::Address;
use crate::client::subchannel::Subchannel;
use crate::client::ConnectivityState;
use crate::metadata::Metadata;
use crate::status::Status;

pub mod pick_first;
mod registry;
pub mod round_robin;

pub use registry::{global_lb_registry, LoadBalancerRegistry};

/// The data available to a picker for routing one call.
pub struct PickRequest {
    /// The full method path of the call.
    pub method: String,
    /// The call's outgoing metadata.
    pub metadata: Metadata,
}

/// The outcome of routing one call through a picker.
pub enum PickResult {
    /// Use the given subchannel. `None` means the policy dropped the call;
    /// the channel fails it without retrying on later pickers.
    Complete { subchannel: Option<Arc<Subchannel>> },
    /// Connectivity is not settled; the channel queues the call and replays
    /// it against the next picker.
    Queue,
    /// Connections are failing; the call fails with this status unless it is
    /// wait-for-ready, in which case it queues.
    TransientFailure(Status),
}

/// A pure selector from an outgoing call to a routing outcome.
///
/// `pick` must be total and side-effect free: the channel may invoke it any
/// number of times, including replays of queued calls against newer pickers.
pub trait Picker: Send + Sync {
    fn pick(&self, request: &PickRequest) -> PickResult;
}

/// Queues every pick. Published while connectivity is being established.
pub struct QueuePicker;

impl Picker for QueuePicker {
    fn pick(&self, _request: &PickRequest) -> PickResult {
        PickResult::Queue
    }
}

/// Fails every pick with a fixed status.
pub struct UnavailablePicker {
    status: Status,
}

impl UnavailablePicker {
    pub fn new(status: Status) -> UnavailablePicker {
        UnavailablePicker { status }
    }
}

impl Picker for UnavailablePicker {
    fn pick(&self, _request: &PickRequest) -> PickResult {
        PickResult::TransientFailure(self.status.clone())
    }
}

/// Always returns the one connected subchannel.
pub struct CompletePicker {
    subchannel: Arc<Subchannel>,
}

impl CompletePicker {
    pub fn new(subchannel: Arc<Subchannel>) -> CompletePicker {
        CompletePicker { subchannel }
    }
}

impl Picker for CompletePicker {
    fn pick(&self, _request: &PickRequest) -> PickResult {
        PickResult::Complete {
            subchannel: Some(self.subchannel.clone()),
        }
    }
}

/// The channel-side contract load balancers operate against.
pub trait ChannelControlHelper: Send + Sync {
    /// Creates (or retrieves from the pool) a subchannel for `address`,
    /// taking a reference on behalf of the policy.
    fn create_subchannel(&self, address: &Address) -> Arc<Subchannel>;

    /// Publishes the policy's aggregate state and its new picker.
    fn update_state(&self, state: ConnectivityState, picker: Arc<dyn Picker>);

    /// Asks the resolver for fresh addresses, typically after connections
    /// fail.
    fn request_reresolution(&self);
}

/// A load balancing policy instance.
pub trait LoadBalancer: Send + Sync {
    /// Delivers a new address list and the policy's config from the service
    /// config.
    fn update_address_list(&self, addresses: Vec<Address>, config: Option<&serde_json::Value>);

    /// Requests connections be (re)established after the policy went idle.
    fn exit_idle(&self);

    /// Resets the reconnection backoff of every owned subchannel.
    fn reset_backoff(&self);

    /// Releases every owned subchannel and detaches listeners. The policy
    /// publishes nothing afterwards.
    fn destroy(&self);
}

/// Constructs registered policies by name.
pub trait LoadBalancerBuilder: Send + Sync {
    fn name(&self) -> &'static str;

    fn build(&self, helper: Arc<dyn ChannelControlHelper>) -> Arc<dyn LoadBalancer>;

    /// Validates the policy's config object from the service config.
    fn validate_config(&self, _config: &serde_json::Value) -> Result<(), String> {
        Ok(())
    }
}

/// The aggregation rule shared by policies: READY if any child is READY,
/// else CONNECTING if any is CONNECTING, else IDLE if any is IDLE, else
/// TRANSIENT_FAILURE.
pub fn aggregate_connectivity_state(states: &[ConnectivityState]) -> ConnectivityState {
    if states.contains(&ConnectivityState::Ready) {
        ConnectivityState::Ready
    } else if states.contains(&ConnectivityState::Connecting) {
        ConnectivityState::Connecting
    } else if states.contains(&ConnectivityState::Idle) {
        ConnectivityState::Idle
    } else {
        ConnectivityState::TransientFailure
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::client::subchannel::SubchannelKey;
    use crate::client::transport::{
        ConnectedTransport, Connector, StreamPair, TransportEvent, TransportOptions,
    };
    use crate::client::ChannelOptions;
    use crate::credentials::InsecureChannelCredentials;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Events a policy under test emits through its helper.
    pub(crate) enum TestEvent {
        CreateSubchannel(Address),
        UpdateState(ConnectivityState, Arc<dyn Picker>),
        RequestReresolution,
    }

    impl std::fmt::Debug for TestEvent {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestEvent::CreateSubchannel(address) => write!(f, "CreateSubchannel({address})"),
                TestEvent::UpdateState(state, _) => write!(f, "UpdateState({state})"),
                TestEvent::RequestReresolution => write!(f, "RequestReresolution"),
            }
        }
    }

    /// A transport whose event stream the test controls.
    pub(crate) struct ScriptedTransport {
        events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
        pub(crate) events_tx: mpsc::UnboundedSender<TransportEvent>,
    }

    impl ScriptedTransport {
        pub(crate) fn new() -> Arc<ScriptedTransport> {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(ScriptedTransport {
                events: Mutex::new(Some(rx)),
                events_tx: tx,
            })
        }
    }

    /// Discards writes; streams in these tests only carry responses.
    struct NullStreamSend;

    #[async_trait]
    impl crate::client::transport::Http2StreamSend for NullStreamSend {
        async fn send_data(&mut self, _data: bytes::Bytes, _end_stream: bool) -> Result<(), Status> {
            Ok(())
        }

        fn cancel(&mut self) {}
    }

    /// Answers every stream with a trailers-only OK response.
    struct TrailersOnlyOkRecv;

    #[async_trait]
    impl crate::client::transport::Http2StreamRecv for TrailersOnlyOkRecv {
        async fn recv_headers(&mut self) -> Result<crate::client::transport::ResponseHead, Status> {
            let mut headers = http::HeaderMap::new();
            headers.insert("grpc-status", "0".parse().unwrap());
            Ok(crate::client::transport::ResponseHead {
                status: http::StatusCode::OK,
                headers,
            })
        }

        async fn recv_data(&mut self) -> Result<Option<bytes::Bytes>, Status> {
            Ok(None)
        }

        async fn recv_trailers(&mut self) -> Result<Option<http::HeaderMap>, Status> {
            Ok(None)
        }
    }

    #[async_trait]
    impl ConnectedTransport for ScriptedTransport {
        async fn open_stream(
            &self,
            _request: http::Request<()>,
        ) -> Result<StreamPair, Status> {
            Ok((Box::new(NullStreamSend), Box::new(TrailersOnlyOkRecv)))
        }

        async fn ping(&self) -> Result<(), Status> {
            Ok(())
        }

        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
            self.events.lock().unwrap().take()
        }

        fn close(&self) {}
    }

    /// A connector scripted per address: connect attempts succeed with a
    /// fresh [`ScriptedTransport`] unless the address was marked failing.
    pub(crate) struct ScriptedConnector {
        failing: Mutex<HashMap<Address, String>>,
        pub(crate) connected: Mutex<HashMap<Address, Arc<ScriptedTransport>>>,
    }

    impl ScriptedConnector {
        pub(crate) fn new() -> Arc<ScriptedConnector> {
            Arc::new(ScriptedConnector {
                failing: Mutex::new(HashMap::new()),
                connected: Mutex::new(HashMap::new()),
            })
        }

        pub(crate) fn fail_address(&self, address: &Address, error: &str) {
            self.failing
                .lock()
                .unwrap()
                .insert(address.clone(), error.to_owned());
        }

        pub(crate) fn transport_for(&self, address: &Address) -> Arc<ScriptedTransport> {
            self.connected.lock().unwrap().get(address).unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(
            &self,
            address: &Address,
            _options: &TransportOptions,
        ) -> Result<Arc<dyn ConnectedTransport>, String> {
            if let Some(error) = self.failing.lock().unwrap().get(address) {
                return Err(error.clone());
            }
            let transport = ScriptedTransport::new();
            self.connected
                .lock()
                .unwrap()
                .insert(address.clone(), transport.clone());
            Ok(transport)
        }
    }

    pub(crate) struct TestHelper {
        pub(crate) events: mpsc::UnboundedSender<TestEvent>,
        pub(crate) connector: Arc<ScriptedConnector>,
    }

    impl ChannelControlHelper for TestHelper {
        fn create_subchannel(&self, address: &Address) -> Arc<Subchannel> {
            let credentials = InsecureChannelCredentials::new();
            let subchannel = Subchannel::new(
                SubchannelKey {
                    channel_target: "test:target".to_owned(),
                    address: address.clone(),
                    options_fingerprint: ChannelOptions::default().fingerprint(),
                    credentials_id: 0,
                },
                ChannelOptions::default(),
                &credentials,
                self.connector.clone(),
                "test.invalid".to_owned(),
            );
            subchannel.channel_ref();
            let _ = self.events.send(TestEvent::CreateSubchannel(address.clone()));
            subchannel
        }

        fn update_state(&self, state: ConnectivityState, picker: Arc<dyn Picker>) {
            let _ = self.events.send(TestEvent::UpdateState(state, picker));
        }

        fn request_reresolution(&self) {
            let _ = self.events.send(TestEvent::RequestReresolution);
        }
    }

    /// Builds the policy-facing fixtures shared by the policy tests.
    pub(crate) fn setup() -> (
        mpsc::UnboundedReceiver<TestEvent>,
        Arc<ScriptedConnector>,
        Arc<TestHelper>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = ScriptedConnector::new();
        let helper = Arc::new(TestHelper {
            events: tx,
            connector: connector.clone(),
        });
        (rx, connector, helper)
    }

    pub(crate) fn new_request() -> PickRequest {
        PickRequest {
            method: "/test.Service/Method".to_owned(),
            metadata: Metadata::new(),
        }
    }

    /// Receives helper events until one `UpdateState` with the wanted state
    /// arrives, skipping intermediate events. Returns its picker.
    pub(crate) async fn await_state(
        events: &mut mpsc::UnboundedReceiver<TestEvent>,
        want: ConnectivityState,
    ) -> Arc<dyn Picker> {
        loop {
            match events.recv().await.expect("helper event stream ended") {
                TestEvent::UpdateState(state, picker) if state == want => return picker,
                _ => continue,
            }
        }
    }
}
