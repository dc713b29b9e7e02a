//! Subchannels: a single-backend connection with its own connectivity state
//! machine, reconnection backoff, and keepalive pings.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, TE, USER_AGENT};
use http::Version;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::client::backoff::BackoffTimer;
use crate::client::name_resolution::Address;
use crate::client::transport::{
    ConnectedTransport, Connector, StreamPair, TransportEvent, TransportOptions,
};
use crate::client::{ChannelOptions, ConnectivityState};
use crate::credentials::ChannelCredentials;
use crate::metadata::Metadata;
use crate::status::Status;

/// Minimum budget for one connection attempt before declaring failure.
const MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Smallest meaningful keepalive interval.
const MIN_KEEPALIVE_TIME: Duration = Duration::from_secs(1);

/// Default wait for a keepalive ping acknowledgement.
const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(20);

/// Keepalive intervals saturate at the 31-bit signed millisecond maximum.
const MAX_KEEPALIVE_TIME: Duration = Duration::from_millis(i32::MAX as u64);

/// The GOAWAY debug payload servers send when pings arrive too often.
const TOO_MANY_PINGS: &str = "too_many_pings";

/// Identifies a shareable subchannel: channels with equal keys share one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubchannelKey {
    pub channel_target: String,
    pub address: Address,
    pub options_fingerprint: String,
    /// Pointer identity of the channel credentials.
    pub credentials_id: usize,
}

/// Observes subchannel state transitions. Invoked with `(previous, current)`
/// after each update.
pub type StateListener = Arc<dyn Fn(ConnectivityState, ConnectivityState) + Send + Sync>;

enum Event {
    ConnectRequested,
    BackoffExpired,
    ConnectSucceeded(Arc<dyn ConnectedTransport>),
    ConnectFailed(String),
    TransportClosed(Arc<dyn ConnectedTransport>),
    GoAway {
        transport: Arc<dyn ConnectedTransport>,
        reason: h2::Reason,
        debug_data: Bytes,
    },
    KeepaliveTimedOut(Arc<dyn ConnectedTransport>),
    Shutdown,
}

struct Inner {
    state: ConnectivityState,
    transport: Option<Arc<dyn ConnectedTransport>>,
    listeners: Vec<(usize, StateListener)>,
    next_listener_id: usize,
    /// Set when a connect is requested during TRANSIENT_FAILURE; consumed on
    /// backoff expiry to go straight to CONNECTING.
    continue_connecting: bool,
    keepalive_time: Option<Duration>,
    call_refs: usize,
    channel_refs: usize,
    connect_task: Option<JoinHandle<()>>,
    transport_events_task: Option<JoinHandle<()>>,
    keepalive_task: Option<JoinHandle<()>>,
}

/// A connection to one backend address, shared between channels via the pool.
///
/// The state machine starts IDLE. Transitions outside the permitted source
/// states are no-ops; all transitions are serialized on one event pump task.
pub struct Subchannel {
    key: SubchannelKey,
    options: ChannelOptions,
    connector: Arc<dyn Connector>,
    transport_options: TransportOptions,
    backoff: BackoffTimer,
    events: mpsc::UnboundedSender<Event>,
    inner: Mutex<Inner>,
}

impl Subchannel {
    pub(crate) fn new(
        key: SubchannelKey,
        options: ChannelOptions,
        credentials: &Arc<dyn ChannelCredentials>,
        connector: Arc<dyn Connector>,
        default_authority: String,
    ) -> Arc<Subchannel> {
        let connection_options = credentials.connection_options();
        let secure = connection_options.map(|o| o.secure).unwrap_or(false);
        let server_name = if secure {
            Some(
                options
                    .ssl_target_name_override
                    .clone()
                    .unwrap_or(default_authority),
            )
        } else {
            None
        };
        let transport_options = TransportOptions {
            secure,
            server_name,
            connect_timeout: Some(MIN_CONNECT_TIMEOUT),
        };

        let keepalive_time = options.keepalive_time.map(|t| t.max(MIN_KEEPALIVE_TIME));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let subchannel = Arc::new(Subchannel {
            key,
            options,
            connector,
            transport_options,
            backoff: BackoffTimer::with_defaults(),
            events: events_tx,
            inner: Mutex::new(Inner {
                state: ConnectivityState::Idle,
                transport: None,
                listeners: Vec::new(),
                next_listener_id: 0,
                continue_connecting: false,
                keepalive_time,
                call_refs: 0,
                channel_refs: 0,
                connect_task: None,
                transport_events_task: None,
                keepalive_task: None,
            }),
        });

        // The event pump serializes every state transition. It holds a weak
        // reference so dropping the last strong reference ends the task.
        let weak = Arc::downgrade(&subchannel);
        tokio::spawn(Subchannel::run_event_pump(weak, events_rx));
        subchannel
    }

    async fn run_event_pump(weak: Weak<Subchannel>, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            let Some(subchannel) = weak.upgrade() else {
                return;
            };
            let shutdown = matches!(event, Event::Shutdown);
            subchannel.handle_event(event);
            if shutdown {
                return;
            }
        }
    }

    fn handle_event(self: &Arc<Self>, event: Event) {
        match event {
            Event::ConnectRequested => self.move_to_connecting(),
            Event::BackoffExpired => self.on_backoff_expired(),
            Event::ConnectSucceeded(transport) => self.move_to_ready(transport),
            Event::ConnectFailed(error) => self.move_to_transient_failure(error),
            Event::TransportClosed(transport) => {
                if self.is_current_transport(&transport) {
                    self.move_to_idle();
                }
            }
            Event::GoAway {
                transport,
                reason,
                debug_data,
            } => {
                if !self.is_current_transport(&transport) {
                    return;
                }
                if reason == h2::Reason::ENHANCE_YOUR_CALM
                    && String::from_utf8_lossy(&debug_data).contains(TOO_MANY_PINGS)
                {
                    self.double_keepalive_time();
                }
                self.move_to_idle();
            }
            Event::KeepaliveTimedOut(transport) => {
                if self.is_current_transport(&transport) {
                    debug!(subchannel = %self.key.address, "keepalive ping timed out");
                    self.move_to_idle();
                }
            }
            Event::Shutdown => self.force_shutdown(),
        }
    }

    fn is_current_transport(&self, transport: &Arc<dyn ConnectedTransport>) -> bool {
        // Events from superseded transports are dropped.
        let inner = self.inner.lock().unwrap();
        inner
            .transport
            .as_ref()
            .map(|current| Arc::ptr_eq(current, transport))
            .unwrap_or(false)
    }

    // {IDLE} -> CONNECTING
    fn move_to_connecting(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ConnectivityState::Idle {
            return;
        }
        let previous = inner.state;
        inner.state = ConnectivityState::Connecting;

        let connector = self.connector.clone();
        let address = self.key.address.clone();
        let transport_options = self.transport_options.clone();
        let events = self.events.clone();
        inner.connect_task = Some(tokio::spawn(async move {
            let attempt = connector.connect(&address, &transport_options);
            tokio::select! {
                _ = tokio::time::sleep(MIN_CONNECT_TIMEOUT) => {
                    let _ = events.send(Event::ConnectFailed(
                        "connection attempt timed out".to_owned(),
                    ));
                }
                result = attempt => match result {
                    Ok(transport) => {
                        let _ = events.send(Event::ConnectSucceeded(transport));
                    }
                    Err(error) => {
                        let _ = events.send(Event::ConnectFailed(error));
                    }
                },
            }
        }));

        let events = self.events.clone();
        self.backoff.run_once(move || {
            let _ = events.send(Event::BackoffExpired);
        });
        drop(inner);
        self.notify_listeners(previous, ConnectivityState::Connecting);
    }

    // {CONNECTING} -> READY
    fn move_to_ready(self: &Arc<Self>, transport: Arc<dyn ConnectedTransport>) {
        let events_rx = transport.take_events();
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ConnectivityState::Connecting {
            // A competing transition already closed this attempt.
            transport.close();
            return;
        }
        let previous = inner.state;
        inner.state = ConnectivityState::Ready;
        inner.transport = Some(transport.clone());
        if let Some(task) = inner.connect_task.take() {
            task.abort();
        }
        self.backoff.stop();
        self.backoff.reset();

        // Disconnect listener, bound to this specific transport.
        if let Some(mut events_rx) = events_rx {
            let events = self.events.clone();
            let event_transport = transport.clone();
            inner.transport_events_task = Some(tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    match event {
                        TransportEvent::GoAway { reason, debug_data } => {
                            let _ = events.send(Event::GoAway {
                                transport: event_transport.clone(),
                                reason,
                                debug_data,
                            });
                        }
                        TransportEvent::Closed => {
                            let _ = events.send(Event::TransportClosed(event_transport.clone()));
                            return;
                        }
                    }
                }
            }));
        }

        if inner.call_refs > 0 {
            self.start_keepalive_locked(&mut inner, &transport);
        }
        drop(inner);
        self.notify_listeners(previous, ConnectivityState::Ready);
    }

    // {CONNECTING} -> TRANSIENT_FAILURE
    fn move_to_transient_failure(self: &Arc<Self>, error: String) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ConnectivityState::Connecting {
            return;
        }
        debug!(subchannel = %self.key.address, error = %error, "connection attempt failed");
        let previous = inner.state;
        inner.state = ConnectivityState::TransientFailure;
        self.teardown_transport_locked(&mut inner);
        if let Some(task) = inner.connect_task.take() {
            task.abort();
        }
        let backoff_pending = self.backoff.is_running();
        drop(inner);
        self.notify_listeners(previous, ConnectivityState::TransientFailure);

        // The backoff started with this attempt gates the retry. If it has
        // already expired, leave TRANSIENT_FAILURE immediately.
        if !backoff_pending {
            self.on_backoff_expired();
        }
    }

    // {READY} -> IDLE, and keepalive/goaway teardown.
    fn move_to_idle(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ConnectivityState::Ready {
            return;
        }
        let previous = inner.state;
        inner.state = ConnectivityState::Idle;
        self.teardown_transport_locked(&mut inner);
        drop(inner);
        self.notify_listeners(previous, ConnectivityState::Idle);
    }

    // {TRANSIENT_FAILURE} -> IDLE or CONNECTING on backoff expiry.
    fn on_backoff_expired(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ConnectivityState::TransientFailure {
            return;
        }
        let previous = inner.state;
        let continue_connecting = std::mem::take(&mut inner.continue_connecting);
        inner.state = ConnectivityState::Idle;
        drop(inner);
        self.notify_listeners(previous, ConnectivityState::Idle);

        if continue_connecting {
            let _ = self.events.send(Event::ConnectRequested);
        }
    }

    // {CONNECTING, IDLE, READY} -> TRANSIENT_FAILURE when both refcounts hit
    // zero.
    fn force_shutdown(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        let previous = inner.state;
        if !matches!(
            previous,
            ConnectivityState::Connecting | ConnectivityState::Idle | ConnectivityState::Ready
        ) {
            return;
        }
        trace!(subchannel = %self.key.address, "shutting down");
        inner.state = ConnectivityState::TransientFailure;
        self.teardown_transport_locked(&mut inner);
        if let Some(task) = inner.connect_task.take() {
            task.abort();
        }
        inner.listeners.clear();
        drop(inner);
        self.backoff.stop();
    }

    fn teardown_transport_locked(&self, inner: &mut Inner) {
        if let Some(transport) = inner.transport.take() {
            transport.close();
        }
        if let Some(task) = inner.transport_events_task.take() {
            task.abort();
        }
        if let Some(task) = inner.keepalive_task.take() {
            task.abort();
        }
    }

    fn notify_listeners(&self, previous: ConnectivityState, current: ConnectivityState) {
        if previous == current {
            return;
        }
        // Snapshot so listeners may detach during dispatch.
        let listeners: Vec<StateListener> = {
            let inner = self.inner.lock().unwrap();
            inner.listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in listeners {
            listener(previous, current);
        }
    }

    fn double_keepalive_time(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(time) = inner.keepalive_time {
            let doubled = time.saturating_mul(2).min(MAX_KEEPALIVE_TIME);
            warn!(
                subchannel = %self.key.address,
                new_interval_ms = doubled.as_millis() as u64,
                "server asked for fewer pings, doubling keepalive interval"
            );
            inner.keepalive_time = Some(doubled);
        }
    }

    fn start_keepalive_locked(&self, inner: &mut Inner, transport: &Arc<dyn ConnectedTransport>) {
        let Some(interval) = inner.keepalive_time else {
            return;
        };
        if inner.keepalive_task.is_some() {
            return;
        }
        let timeout = self.options.keepalive_timeout.unwrap_or(DEFAULT_KEEPALIVE_TIMEOUT);
        let events = self.events.clone();
        let transport = transport.clone();
        inner.keepalive_task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let outcome = tokio::select! {
                    result = transport.ping() => result,
                    _ = tokio::time::sleep(timeout) => Err(Status::unavailable("keepalive timeout")),
                };
                if outcome.is_err() {
                    let _ = events.send(Event::KeepaliveTimedOut(transport.clone()));
                    return;
                }
            }
        }));
    }

    fn stop_keepalive(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.keepalive_task.take() {
            task.abort();
        }
    }

    /// Requests a connection. From IDLE this begins CONNECTING; from
    /// TRANSIENT_FAILURE it marks the subchannel to reconnect as soon as the
    /// backoff expires. Any other state is a no-op.
    pub fn start_connecting(&self) {
        let state = self.state();
        match state {
            ConnectivityState::Idle => {
                let _ = self.events.send(Event::ConnectRequested);
            }
            ConnectivityState::TransientFailure => {
                self.inner.lock().unwrap().continue_connecting = true;
            }
            _ => {}
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.inner.lock().unwrap().state
    }

    pub fn address(&self) -> &Address {
        &self.key.address
    }

    pub(crate) fn keepalive_interval(&self) -> Option<Duration> {
        self.inner.lock().unwrap().keepalive_time
    }

    /// Registers a state listener; returns an id for removal.
    pub fn add_connectivity_state_listener(&self, listener: StateListener) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.push((id, listener));
        id
    }

    pub fn remove_connectivity_state_listener(&self, id: usize) {
        self.inner
            .lock()
            .unwrap()
            .listeners
            .retain(|(listener_id, _)| *listener_id != id);
    }

    /// Resets the reconnection backoff to its initial delay.
    pub fn reset_backoff(&self) {
        self.backoff.reset();
    }

    /// Takes a call reference. Keepalive runs while calls are active.
    pub fn call_ref(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.call_refs += 1;
        if inner.call_refs == 1 && inner.state == ConnectivityState::Ready {
            if let Some(transport) = inner.transport.clone() {
                self.start_keepalive_locked(&mut inner, &transport);
            }
        }
    }

    pub fn call_unref(&self) {
        let shutdown = {
            let mut inner = self.inner.lock().unwrap();
            debug_assert!(inner.call_refs > 0, "call_unref without call_ref");
            inner.call_refs = inner.call_refs.saturating_sub(1);
            inner.call_refs == 0 && inner.channel_refs == 0
        };
        self.stop_keepalive();
        if shutdown {
            let _ = self.events.send(Event::Shutdown);
        }
    }

    /// Takes a channel (pool retention) reference.
    pub fn channel_ref(&self) {
        self.inner.lock().unwrap().channel_refs += 1;
    }

    pub fn channel_unref(&self) {
        let shutdown = {
            let mut inner = self.inner.lock().unwrap();
            debug_assert!(inner.channel_refs > 0, "channel_unref without channel_ref");
            inner.channel_refs = inner.channel_refs.saturating_sub(1);
            inner.call_refs == 0 && inner.channel_refs == 0
        };
        if shutdown {
            let _ = self.events.send(Event::Shutdown);
        }
    }

    pub(crate) fn channel_ref_count(&self) -> usize {
        self.inner.lock().unwrap().channel_refs
    }

    /// Opens an HTTP/2 stream for one call, composing the request headers.
    /// Must only be invoked while READY.
    pub async fn start_call_stream(
        &self,
        host: &str,
        method: &str,
        metadata: &Metadata,
    ) -> Result<StreamPair, Status> {
        let transport = {
            let inner = self.inner.lock().unwrap();
            if inner.state != ConnectivityState::Ready {
                return Err(Status::unavailable("subchannel is not connected"));
            }
            inner
                .transport
                .clone()
                .ok_or_else(|| Status::unavailable("subchannel has no transport"))?
        };

        let scheme = if self.transport_options.secure { "https" } else { "http" };
        let uri = http::Uri::builder()
            .scheme(scheme)
            .authority(host)
            .path_and_query(method)
            .build()
            .map_err(|err| Status::internal(format!("invalid call path: {err}")))?;

        let mut request = http::Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .version(Version::HTTP_2)
            .body(())
            .map_err(|err| Status::internal(format!("failed to build request: {err}")))?;

        let headers = request.headers_mut();
        headers.insert(CONTENT_TYPE, http::HeaderValue::from_static("application/grpc"));
        headers.insert(TE, http::HeaderValue::from_static("trailers"));
        if let Ok(user_agent) = http::HeaderValue::from_str(&self.options.user_agent()) {
            headers.insert(USER_AGENT, user_agent);
        }
        // The iterator yields `None` for repeated names; reuse the last one.
        let mut last_name = None;
        for (name, value) in metadata.to_header_map() {
            if name.is_some() {
                last_name = name;
            }
            if let Some(name) = &last_name {
                headers.append(name.clone(), value);
            }
        }

        transport.open_stream(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::InsecureChannelCredentials;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_key(address: &str) -> SubchannelKey {
        SubchannelKey {
            channel_target: "dns:example.com".to_owned(),
            address: Address::new(address),
            options_fingerprint: ChannelOptions::default().fingerprint(),
            credentials_id: 0,
        }
    }

    struct FakeTransport {
        events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
        closed: AtomicUsize,
        ping_should_hang: bool,
    }

    impl FakeTransport {
        fn new(ping_should_hang: bool) -> Arc<FakeTransport> {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(FakeTransport {
                events: Mutex::new(Some(rx)),
                events_tx: tx,
                closed: AtomicUsize::new(0),
                ping_should_hang,
            })
        }
    }

    #[async_trait]
    impl ConnectedTransport for FakeTransport {
        async fn open_stream(
            &self,
            _request: http::Request<()>,
        ) -> Result<StreamPair, Status> {
            Err(Status::unimplemented("no streams in fake transport"))
        }

        async fn ping(&self) -> Result<(), Status> {
            if self.ping_should_hang {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
            self.events.lock().unwrap().take()
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeConnector {
        transports: Mutex<Vec<Result<Arc<FakeTransport>, String>>>,
        attempts: AtomicUsize,
    }

    impl FakeConnector {
        fn new(transports: Vec<Result<Arc<FakeTransport>, String>>) -> Arc<FakeConnector> {
            Arc::new(FakeConnector {
                transports: Mutex::new(transports),
                attempts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            _address: &Address,
            _options: &TransportOptions,
        ) -> Result<Arc<dyn ConnectedTransport>, String> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let mut transports = self.transports.lock().unwrap();
            if transports.is_empty() {
                return Err("connection refused".to_owned());
            }
            transports.remove(0).map(|t| t as Arc<dyn ConnectedTransport>)
        }
    }

    fn new_subchannel(
        connector: Arc<dyn Connector>,
        options: ChannelOptions,
    ) -> (Arc<Subchannel>, mpsc::UnboundedReceiver<(ConnectivityState, ConnectivityState)>) {
        let credentials = InsecureChannelCredentials::new();
        let subchannel = Subchannel::new(
            test_key("10.0.0.1:50051"),
            options,
            &credentials,
            connector,
            "example.com".to_owned(),
        );
        subchannel.channel_ref();

        let (tx, rx) = mpsc::unbounded_channel();
        subchannel.add_connectivity_state_listener(Arc::new(move |prev, next| {
            let _ = tx.send((prev, next));
        }));
        (subchannel, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn successful_connect_reaches_ready() {
        let transport = FakeTransport::new(false);
        let connector = FakeConnector::new(vec![Ok(transport)]);
        let (subchannel, mut states) = new_subchannel(connector, ChannelOptions::default());

        subchannel.start_connecting();
        assert_eq!(
            states.recv().await.unwrap(),
            (ConnectivityState::Idle, ConnectivityState::Connecting)
        );
        assert_eq!(
            states.recv().await.unwrap(),
            (ConnectivityState::Connecting, ConnectivityState::Ready)
        );
        assert_eq!(subchannel.state(), ConnectivityState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_backs_off_to_idle() {
        let connector = FakeConnector::new(vec![Err("connection refused".to_owned())]);
        let (subchannel, mut states) = new_subchannel(connector, ChannelOptions::default());

        subchannel.start_connecting();
        assert_eq!(
            states.recv().await.unwrap(),
            (ConnectivityState::Idle, ConnectivityState::Connecting)
        );
        assert_eq!(
            states.recv().await.unwrap(),
            (ConnectivityState::Connecting, ConnectivityState::TransientFailure)
        );

        // Backoff expiry returns the subchannel to IDLE (first delay is ~1s).
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(
            states.recv().await.unwrap(),
            (ConnectivityState::TransientFailure, ConnectivityState::Idle)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_during_backoff_continues_connecting() {
        let transport = FakeTransport::new(false);
        let connector = FakeConnector::new(vec![
            Err("connection refused".to_owned()),
            Ok(transport),
        ]);
        let (subchannel, mut states) = new_subchannel(connector, ChannelOptions::default());

        subchannel.start_connecting();
        let _ = states.recv().await.unwrap(); // Idle -> Connecting
        let _ = states.recv().await.unwrap(); // Connecting -> TransientFailure

        // Request while failed: reconnect immediately once backoff expires.
        subchannel.start_connecting();
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(
            states.recv().await.unwrap(),
            (ConnectivityState::TransientFailure, ConnectivityState::Idle)
        );
        assert_eq!(
            states.recv().await.unwrap(),
            (ConnectivityState::Idle, ConnectivityState::Connecting)
        );
        assert_eq!(
            states.recv().await.unwrap(),
            (ConnectivityState::Connecting, ConnectivityState::Ready)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transport_close_returns_to_idle() {
        let transport = FakeTransport::new(false);
        let events_tx = transport.events_tx.clone();
        let connector = FakeConnector::new(vec![Ok(transport)]);
        let (subchannel, mut states) = new_subchannel(connector, ChannelOptions::default());

        subchannel.start_connecting();
        let _ = states.recv().await.unwrap();
        let _ = states.recv().await.unwrap();
        assert_eq!(subchannel.state(), ConnectivityState::Ready);

        events_tx.send(TransportEvent::Closed).unwrap();
        assert_eq!(
            states.recv().await.unwrap(),
            (ConnectivityState::Ready, ConnectivityState::Idle)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn goaway_too_many_pings_doubles_keepalive() {
        let transport = FakeTransport::new(false);
        let events_tx = transport.events_tx.clone();
        let connector = FakeConnector::new(vec![Ok(transport)]);
        let options = ChannelOptions {
            keepalive_time: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        let (subchannel, mut states) = new_subchannel(connector, options);

        subchannel.start_connecting();
        let _ = states.recv().await.unwrap();
        let _ = states.recv().await.unwrap();

        events_tx
            .send(TransportEvent::GoAway {
                reason: h2::Reason::ENHANCE_YOUR_CALM,
                debug_data: Bytes::from_static(b"too_many_pings"),
            })
            .unwrap();
        assert_eq!(
            states.recv().await.unwrap(),
            (ConnectivityState::Ready, ConnectivityState::Idle)
        );
        assert_eq!(subchannel.keepalive_interval(), Some(Duration::from_secs(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_interval_saturates() {
        let transport = FakeTransport::new(false);
        let events_tx = transport.events_tx.clone();
        let connector = FakeConnector::new(vec![Ok(transport)]);
        let options = ChannelOptions {
            keepalive_time: Some(MAX_KEEPALIVE_TIME - Duration::from_millis(1)),
            ..Default::default()
        };
        let (subchannel, mut states) = new_subchannel(connector, options);

        subchannel.start_connecting();
        let _ = states.recv().await.unwrap();
        let _ = states.recv().await.unwrap();

        events_tx
            .send(TransportEvent::GoAway {
                reason: h2::Reason::ENHANCE_YOUR_CALM,
                debug_data: Bytes::from_static(b"too_many_pings"),
            })
            .unwrap();
        let _ = states.recv().await.unwrap();
        assert_eq!(subchannel.keepalive_interval(), Some(MAX_KEEPALIVE_TIME));
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_keepalive_ping_disconnects() {
        let transport = FakeTransport::new(true);
        let connector = FakeConnector::new(vec![Ok(transport)]);
        let options = ChannelOptions {
            keepalive_time: Some(Duration::from_secs(10)),
            keepalive_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let (subchannel, mut states) = new_subchannel(connector, options);

        subchannel.call_ref();
        subchannel.start_connecting();
        let _ = states.recv().await.unwrap();
        let _ = states.recv().await.unwrap();
        assert_eq!(subchannel.state(), ConnectivityState::Ready);

        // Interval (10s) elapses, ping hangs, timeout (5s) elapses.
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(
            states.recv().await.unwrap(),
            (ConnectivityState::Ready, ConnectivityState::Idle)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_both_refcounts_forces_shutdown() {
        let transport = FakeTransport::new(false);
        let closed_probe = transport.clone();
        let connector = FakeConnector::new(vec![Ok(transport)]);
        let (subchannel, mut states) = new_subchannel(connector, ChannelOptions::default());

        subchannel.start_connecting();
        let _ = states.recv().await.unwrap();
        let _ = states.recv().await.unwrap();

        subchannel.call_ref();
        subchannel.call_unref();
        subchannel.channel_unref();
        tokio::task::yield_now().await;
        assert_eq!(subchannel.state(), ConnectivityState::TransientFailure);
        assert!(closed_probe.closed.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_call_stream_outside_ready_fails() {
        let connector = FakeConnector::new(vec![]);
        let (subchannel, _states) = new_subchannel(connector, ChannelOptions::default());

        let err = match subchannel
            .start_call_stream("example.com", "/svc/Method", &Metadata::new())
            .await
        {
            Err(status) => status,
            Ok(_) => panic!("expected start_call_stream to fail outside READY"),
        };
        assert_eq!(err.code(), crate::status::Code::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_transport_events_are_dropped() {
        let first = FakeTransport::new(false);
        let first_events = first.events_tx.clone();
        let second = FakeTransport::new(false);
        let connector = FakeConnector::new(vec![Ok(first), Ok(second)]);
        let (subchannel, mut states) = new_subchannel(connector, ChannelOptions::default());

        subchannel.start_connecting();
        let _ = states.recv().await.unwrap();
        let _ = states.recv().await.unwrap();

        // Drop the first transport; reconnect to the second.
        first_events.send(TransportEvent::Closed).unwrap();
        let _ = states.recv().await.unwrap(); // Ready -> Idle
        subchannel.start_connecting();
        let _ = states.recv().await.unwrap(); // Idle -> Connecting
        let _ = states.recv().await.unwrap(); // Connecting -> Ready

        // A late close event from the first transport must not disturb the
        // second connection.
        first_events.send(TransportEvent::Closed).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(subchannel.state(), ConnectivityState::Ready);
    }
}
