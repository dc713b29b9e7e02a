//! The per-call stream driver: application messages out, HTTP/2 frames in,
//! and a single final status.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
#[cfg(test)]
use http::HeaderMap;
use tokio::sync::{mpsc, watch};
use tracing::trace;

use crate::client::filter::{FilterStack, WireMessage};
use crate::client::subchannel::Subchannel;
use crate::client::transport::{encode_frame, FrameDecoder, Http2StreamRecv, Http2StreamSend};
use crate::client::ConnectivityState;
use crate::metadata::Metadata;
use crate::status::{Code, Status, GRPC_STATUS_HEADER};

/// How many fully filtered inbound messages may be buffered before the
/// reader stops pulling from the HTTP/2 stream.
const INBOUND_MESSAGE_BUFFER: usize = 4;

/// The per-call options supplied at call creation.
#[derive(Clone, Default)]
pub struct CallOptions {
    pub deadline: Option<Instant>,
    pub metadata: Metadata,
    /// Queue rather than fail when the channel is in TRANSIENT_FAILURE.
    pub wait_for_ready: bool,
}

enum WriteOp {
    Message(WireMessage),
    HalfClose,
}

pub(crate) struct CallShared {
    pub(crate) method: String,
    pub(crate) authority: String,
    filters: FilterStack,
    final_status: Mutex<Option<Status>>,
    status_tx: watch::Sender<Option<Status>>,
    /// Signals the writer to reset the stream with CANCEL.
    reset_tx: watch::Sender<bool>,
    /// The attached subchannel and our listener on it, released at call end.
    attachment: Mutex<Option<(Arc<Subchannel>, usize)>>,
    initial_metadata_tx: watch::Sender<Option<Metadata>>,
    /// Dropped at call end so the application's message stream terminates.
    message_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
}

/// A single RPC in flight. Created by the channel; the application writes
/// messages, reads messages, and awaits the final status.
pub struct CallStream {
    shared: Arc<CallShared>,
    write_tx: mpsc::UnboundedSender<WriteOp>,
    /// Taken by the writer task at attach time.
    write_rx: Mutex<Option<mpsc::UnboundedReceiver<WriteOp>>>,
    message_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    status_rx: watch::Receiver<Option<Status>>,
    initial_metadata_rx: watch::Receiver<Option<Metadata>>,
}

impl CallStream {
    pub(crate) fn new(method: String, authority: String, filters: FilterStack) -> Arc<CallStream> {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::channel(INBOUND_MESSAGE_BUFFER);
        let (status_tx, status_rx) = watch::channel(None);
        let (reset_tx, _) = watch::channel(false);
        let (initial_metadata_tx, initial_metadata_rx) = watch::channel(None);

        Arc::new(CallStream {
            shared: Arc::new(CallShared {
                method,
                authority,
                filters,
                final_status: Mutex::new(None),
                status_tx,
                reset_tx,
                attachment: Mutex::new(None),
                initial_metadata_tx,
                message_tx: Mutex::new(Some(message_tx)),
            }),
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            message_rx: Mutex::new(Some(message_rx)),
            status_rx,
            initial_metadata_rx,
        })
    }

    pub fn method(&self) -> &str {
        &self.shared.method
    }

    pub(crate) fn shared(&self) -> Arc<CallShared> {
        self.shared.clone()
    }

    /// Queues one message. Messages written before the call is attached to a
    /// connection are buffered and flushed in order at attach time.
    pub fn send_message(&self, payload: Bytes) -> Result<(), Status> {
        if let Some(status) = self.shared.final_status.lock().unwrap().clone() {
            return Err(status);
        }
        self.write_tx
            .send(WriteOp::Message(WireMessage::plain(payload)))
            .map_err(|_| Status::internal("call writer is gone"))
    }

    /// Signals that no further messages will be sent.
    pub fn half_close(&self) {
        let _ = self.write_tx.send(WriteOp::HalfClose);
    }

    /// Receives the next filtered inbound message; `None` after the final
    /// one.
    pub async fn next_message(&self) -> Option<Bytes> {
        let mut rx = self.message_rx.lock().unwrap().take()?;
        let message = rx.recv().await;
        *self.message_rx.lock().unwrap() = Some(rx);
        message
    }

    /// Awaits the response's initial metadata. Resolves `None` if the call
    /// ends without producing any.
    pub async fn initial_metadata(&self) -> Option<Metadata> {
        let mut metadata_rx = self.initial_metadata_rx.clone();
        let metadata_rx_fallback = metadata_rx.clone();
        let mut status_rx = self.status_rx.clone();
        tokio::select! {
            result = metadata_rx.wait_for(|metadata| metadata.is_some()) => {
                result.ok().and_then(|metadata| metadata.clone())
            }
            _ = status_rx.wait_for(|status| status.is_some()) => {
                metadata_rx_fallback.borrow().clone()
            }
        }
    }

    /// Awaits the final status. Fires exactly once per started call.
    pub async fn status(&self) -> Status {
        let mut status_rx = self.status_rx.clone();
        let result = status_rx.wait_for(|status| status.is_some()).await;
        match result {
            Ok(status) => status.clone().unwrap_or_else(Status::ok),
            Err(_) => Status::internal("call abandoned without a status"),
        }
    }

    /// Runs the outgoing-metadata filters over `metadata`.
    pub(crate) async fn outgoing_metadata(&self, metadata: Metadata) -> Result<Metadata, Status> {
        self.shared.filters.send_metadata(metadata).await
    }

    /// Cancels the call locally. A no-op once the call has ended.
    pub fn cancel_with_status(&self, code: Code, details: &str) {
        self.shared.cancel_with_status(Status::new(code, details));
    }

    /// Ends the call without resetting the stream; used for pick failures
    /// before any stream exists.
    pub(crate) fn fail(&self, status: Status) {
        self.shared.end_call(status);
    }

    /// Wires the call onto an open HTTP/2 stream and starts its driver
    /// tasks.
    pub(crate) fn attach(
        &self,
        subchannel: Arc<Subchannel>,
        send: Box<dyn Http2StreamSend>,
        recv: Box<dyn Http2StreamRecv>,
    ) {
        subchannel.call_ref();
        // A dying connection must fail the call even if no frame ever
        // surfaces the error.
        let shared_for_listener = self.shared.clone();
        let listener_id = subchannel.add_connectivity_state_listener(Arc::new(
            move |previous, _current| {
                if previous == ConnectivityState::Ready {
                    shared_for_listener.disconnect();
                }
            },
        ));
        *self.shared.attachment.lock().unwrap() = Some((subchannel, listener_id));

        // If the call already ended (deadline, cancel) release immediately.
        if self.shared.final_status.lock().unwrap().is_some() {
            self.shared.release_attachment();
            return;
        }

        let write_rx = self
            .write_rx
            .lock()
            .unwrap()
            .take()
            .expect("call attached twice");
        let message_tx = self
            .shared
            .message_tx
            .lock()
            .unwrap()
            .clone()
            .expect("message sender dropped before attach");
        tokio::spawn(run_writer(self.shared.clone(), send, write_rx));
        tokio::spawn(run_reader(self.shared.clone(), recv, message_tx));
    }
}

impl CallShared {
    /// Makes `status` the call's final status. The first caller wins; every
    /// later call is a no-op.
    pub(crate) fn end_call(&self, status: Status) {
        {
            let mut final_status = self.final_status.lock().unwrap();
            if final_status.is_some() {
                return;
            }
            trace!(method = %self.method, %status, "call finished");
            *final_status = Some(status.clone());
        }
        self.release_attachment();
        self.message_tx.lock().unwrap().take();
        let _ = self.status_tx.send(Some(status));
    }

    fn release_attachment(&self) {
        if let Some((subchannel, listener_id)) = self.attachment.lock().unwrap().take() {
            subchannel.remove_connectivity_state_listener(listener_id);
            subchannel.call_unref();
        }
    }

    pub(crate) fn cancel_with_status(&self, status: Status) {
        // Order matters: the writer observes the reset flag before the
        // status wakes it, so the RST goes out.
        let _ = self.reset_tx.send(true);
        self.end_call(status);
    }

    fn disconnect(&self) {
        let _ = self.reset_tx.send(true);
        self.end_call(Status::unavailable("Connection dropped"));
    }

    fn is_ended(&self) -> bool {
        self.final_status.lock().unwrap().is_some()
    }
}

/// Waits for `rx` to observe `true` without holding a non-`Send` watch
/// borrow across an await point.
async fn wait_for_reset(rx: &mut watch::Receiver<bool>) -> Result<(), watch::error::RecvError> {
    loop {
        if *rx.borrow() {
            return Ok(());
        }
        rx.changed().await?;
    }
}

/// Waits for `rx` to observe a status without holding a non-`Send` watch
/// borrow across an await point.
async fn wait_for_status(
    rx: &mut watch::Receiver<Option<Status>>,
) -> Result<(), watch::error::RecvError> {
    loop {
        if rx.borrow().is_some() {
            return Ok(());
        }
        rx.changed().await?;
    }
}

async fn run_writer(
    shared: Arc<CallShared>,
    mut send: Box<dyn Http2StreamSend>,
    mut queue: mpsc::UnboundedReceiver<WriteOp>,
) {
    let mut reset_rx = shared.reset_tx.subscribe();
    let mut status_rx = shared.status_tx.subscribe();
    loop {
        tokio::select! {
            biased;
            _ = wait_for_reset(&mut reset_rx) => {
                send.cancel();
                return;
            }
            _ = wait_for_status(&mut status_rx) => {
                // The call ended without needing a reset.
                return;
            }
            op = queue.recv() => match op {
                Some(WriteOp::Message(message)) => {
                    let message = match shared.filters.send_message(message).await {
                        Ok(message) => message,
                        Err(status) => {
                            send.cancel();
                            shared.end_call(status);
                            return;
                        }
                    };
                    let frame = encode_frame(&message.payload, message.compressed);
                    if let Err(status) = send.send_data(frame, false).await {
                        // Let the close event or trailers decide the final
                        // status; a bare send error only stops the writer.
                        trace!(%status, "write failed, awaiting stream outcome");
                        return;
                    }
                }
                Some(WriteOp::HalfClose) => {
                    if send.send_data(Bytes::new(), true).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
        }
    }
}

async fn run_reader(
    shared: Arc<CallShared>,
    recv: Box<dyn Http2StreamRecv>,
    message_tx: mpsc::Sender<Bytes>,
) {
    let mut status_rx = shared.status_tx.subscribe();
    tokio::select! {
        _ = status_rx.wait_for(|status| status.is_some()) => {
            // Cancelled or disconnected; dropping the receive half resets
            // whatever is left of the stream.
        }
        _ = read_stream(shared.clone(), recv, message_tx) => {}
    }
}

async fn read_stream(
    shared: Arc<CallShared>,
    mut recv: Box<dyn Http2StreamRecv>,
    message_tx: mpsc::Sender<Bytes>,
) {
    let head = match recv.recv_headers().await {
        Ok(head) => head,
        Err(status) => {
            shared.end_call(status);
            return;
        }
    };

    // A HEADERS block already carrying grpc-status is a trailers-only
    // response: the filters turn it straight into a final status.
    if head.headers.contains_key(GRPC_STATUS_HEADER) {
        let status = shared
            .filters
            .receive_trailers(&head.headers)
            .unwrap_or_else(|| Status::from_http_status(head.status.as_u16()));
        shared.end_call(status);
        return;
    }

    let metadata = Metadata::from_header_map(&head.headers);
    match shared.filters.receive_metadata(metadata).await {
        Ok(metadata) => {
            let _ = shared.initial_metadata_tx.send(Some(metadata));
        }
        Err(status) => {
            shared.cancel_with_status(status);
            return;
        }
    }

    // Data frames are decoded and filtered strictly one at a time, so
    // message order survives the asynchronous filter hooks.
    let mut decoder = FrameDecoder::default();
    let mut transport_error: Option<Status> = None;
    loop {
        match recv.recv_data().await {
            Ok(Some(chunk)) => {
                decoder.push(&chunk);
                loop {
                    let frame = match decoder.next_frame() {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(status) => {
                            shared.cancel_with_status(status);
                            return;
                        }
                    };
                    let message = WireMessage {
                        payload: frame.payload,
                        compressed: frame.compressed,
                    };
                    match shared.filters.receive_message(message).await {
                        Ok(message) => {
                            if message_tx.send(message.payload).await.is_err() {
                                // The application dropped its receive side.
                                shared.cancel_with_status(Status::cancelled(
                                    "receiver dropped",
                                ));
                                return;
                            }
                        }
                        Err(status) => {
                            shared.cancel_with_status(status);
                            return;
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(status) => {
                transport_error = Some(status);
                break;
            }
        }
    }

    // The trailers decide the status; transport errors only stand when no
    // trailer-derived status exists.
    let trailer_status = match recv.recv_trailers().await {
        Ok(Some(trailers)) => shared.filters.receive_trailers(&trailers),
        Ok(None) => None,
        Err(status) => {
            transport_error.get_or_insert(status);
            None
        }
    };

    let status = trailer_status.or(transport_error).unwrap_or_else(|| {
        if decoder.has_partial_frame() {
            Status::internal("stream ended mid-message")
        } else {
            Status::from_http_status(head.status.as_u16())
        }
    });
    shared.end_call(status);
}
