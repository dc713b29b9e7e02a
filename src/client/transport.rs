//! The connection-level collaborator contract consumed by subchannels, and
//! its plaintext HTTP/2 implementation over the `h2` crate.
//!
//! The core does not implement HTTP/2 framing or transport security. Secure
//! connectors are supplied externally through the same [`Connector`] seam;
//! the built-in connector handles plaintext TCP only.

use std::future::poll_fn;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::client::name_resolution::Address;
use crate::status::Status;

/// Options a subchannel passes when establishing a connection.
#[derive(Clone, Debug, Default)]
pub struct TransportOptions {
    /// Whether the credential requires a secure context.
    pub secure: bool,
    /// The TLS server name: the `ssl_target_name_override` when set,
    /// otherwise the channel target's default authority.
    pub server_name: Option<String>,
    /// Deadline for the whole connection attempt.
    pub connect_timeout: Option<Duration>,
}

/// Connection-level events delivered to the owning subchannel.
#[derive(Debug)]
pub enum TransportEvent {
    /// The remote sent GOAWAY. Debug data is best effort; `h2` does not
    /// expose the opaque payload directly, so the rendered error text is
    /// carried instead.
    GoAway { reason: h2::Reason, debug_data: Bytes },
    /// The connection terminated.
    Closed,
}

/// The response HEADERS block of one stream.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: http::StatusCode,
    pub headers: HeaderMap,
}

/// The write half of one open HTTP/2 request stream.
#[async_trait]
pub trait Http2StreamSend: Send {
    /// Sends a DATA frame, waiting for flow-control capacity.
    async fn send_data(&mut self, data: Bytes, end_stream: bool) -> Result<(), Status>;

    /// Resets the stream with CANCEL.
    fn cancel(&mut self);
}

/// The read half of one open HTTP/2 request stream.
#[async_trait]
pub trait Http2StreamRecv: Send {
    /// Awaits the response HEADERS block.
    async fn recv_headers(&mut self) -> Result<ResponseHead, Status>;

    /// Receives the next DATA chunk. `None` once the stream's data is done.
    async fn recv_data(&mut self) -> Result<Option<Bytes>, Status>;

    /// Awaits the trailers block, after data is exhausted.
    async fn recv_trailers(&mut self) -> Result<Option<HeaderMap>, Status>;
}

/// Both halves of an open call stream.
pub type StreamPair = (Box<dyn Http2StreamSend>, Box<dyn Http2StreamRecv>);

/// An established connection to one backend.
#[async_trait]
pub trait ConnectedTransport: Send + Sync {
    /// Opens a stream carrying the composed request headers.
    async fn open_stream(&self, request: http::Request<()>) -> Result<StreamPair, Status>;

    /// Sends a keepalive PING, resolving when the acknowledgement arrives.
    async fn ping(&self) -> Result<(), Status>;

    /// Takes the event stream. The owning subchannel is the sole consumer;
    /// subsequent calls return `None`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Tears the connection down. Pending events stop flowing.
    fn close(&self);
}

/// Establishes connections; the seam between subchannels and the wire.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        address: &Address,
        options: &TransportOptions,
    ) -> Result<std::sync::Arc<dyn ConnectedTransport>, String>;
}

/// The built-in plaintext connector.
#[derive(Default)]
pub struct H2Connector;

#[async_trait]
impl Connector for H2Connector {
    async fn connect(
        &self,
        address: &Address,
        options: &TransportOptions,
    ) -> Result<std::sync::Arc<dyn ConnectedTransport>, String> {
        if options.secure {
            // Secure contexts require an externally supplied connector.
            return Err("secure transport requested but no TLS connector is installed".to_owned());
        }
        let tcp = TcpStream::connect(address.as_str())
            .await
            .map_err(|err| format!("failed to connect to {address}: {err}"))?;
        tcp.set_nodelay(true).map_err(|err| err.to_string())?;

        let (send_request, mut connection) = h2::client::handshake(tcp)
            .await
            .map_err(|err| format!("HTTP/2 handshake with {address} failed: {err}"))?;

        let ping_pong = connection.ping_pong();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let address = address.clone();
        let driver = tokio::spawn(async move {
            match connection.await {
                Ok(()) => trace!(%address, "connection closed cleanly"),
                Err(err) => {
                    debug!(%address, %err, "connection terminated");
                    if err.is_go_away() {
                        if let Some(reason) = err.reason() {
                            let _ = events_tx.send(TransportEvent::GoAway {
                                reason,
                                debug_data: Bytes::from(err.to_string()),
                            });
                        }
                    }
                }
            }
            let _ = events_tx.send(TransportEvent::Closed);
        });

        Ok(std::sync::Arc::new(H2Transport {
            send_request: Mutex::new(send_request),
            ping_pong: tokio::sync::Mutex::new(ping_pong),
            events: Mutex::new(Some(events_rx)),
            driver: Mutex::new(Some(driver)),
        }))
    }
}

struct H2Transport {
    send_request: Mutex<h2::client::SendRequest<Bytes>>,
    ping_pong: tokio::sync::Mutex<Option<h2::PingPong>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl ConnectedTransport for H2Transport {
    async fn open_stream(&self, request: http::Request<()>) -> Result<StreamPair, Status> {
        let send_request = self.send_request.lock().unwrap().clone();
        let mut ready = send_request
            .ready()
            .await
            .map_err(|err| Status::from_h2_error(&err))?;
        let (response, send) = ready
            .send_request(request, false)
            .map_err(|err| Status::from_h2_error(&err))?;
        Ok((
            Box::new(H2SendHalf { send }),
            Box::new(H2RecvHalf {
                response: Some(response),
                recv: None,
            }),
        ))
    }

    async fn ping(&self) -> Result<(), Status> {
        let mut guard = self.ping_pong.lock().await;
        let Some(ping_pong) = guard.as_mut() else {
            return Err(Status::internal("connection does not support pings"));
        };
        ping_pong
            .ping(h2::Ping::opaque())
            .await
            .map(|_pong| ())
            .map_err(|err| Status::from_h2_error(&err))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.lock().unwrap().take()
    }

    fn close(&self) {
        if let Some(driver) = self.driver.lock().unwrap().take() {
            driver.abort();
        }
    }
}

impl Drop for H2Transport {
    fn drop(&mut self) {
        self.close();
    }
}

struct H2SendHalf {
    send: h2::SendStream<Bytes>,
}

struct H2RecvHalf {
    response: Option<h2::client::ResponseFuture>,
    recv: Option<h2::RecvStream>,
}

#[async_trait]
impl Http2StreamSend for H2SendHalf {
    async fn send_data(&mut self, mut data: Bytes, end_stream: bool) -> Result<(), Status> {
        if data.is_empty() {
            return self
                .send
                .send_data(data, end_stream)
                .map_err(|err| Status::from_h2_error(&err));
        }
        while !data.is_empty() {
            self.send.reserve_capacity(data.len());
            let available = poll_fn(|cx| self.send.poll_capacity(cx))
                .await
                .ok_or_else(|| Status::unavailable("stream closed while sending"))?
                .map_err(|err| Status::from_h2_error(&err))?;
            let chunk = data.split_to(available.min(data.len()));
            let eos = end_stream && data.is_empty();
            self.send
                .send_data(chunk, eos)
                .map_err(|err| Status::from_h2_error(&err))?;
        }
        // Release any capacity reserved beyond what was written.
        self.send.reserve_capacity(0);
        Ok(())
    }

    fn cancel(&mut self) {
        self.send.send_reset(h2::Reason::CANCEL);
    }
}

#[async_trait]
impl Http2StreamRecv for H2RecvHalf {
    async fn recv_headers(&mut self) -> Result<ResponseHead, Status> {
        let Some(response) = self.response.take() else {
            return Err(Status::internal("response headers already received"));
        };
        let response = response.await.map_err(|err| Status::from_h2_error(&err))?;
        let (parts, body) = response.into_parts();
        self.recv = Some(body);
        Ok(ResponseHead {
            status: parts.status,
            headers: parts.headers,
        })
    }

    async fn recv_data(&mut self) -> Result<Option<Bytes>, Status> {
        let Some(recv) = self.recv.as_mut() else {
            return Err(Status::internal("receiving data before headers"));
        };
        match poll_fn(|cx| recv.poll_data(cx)).await {
            Some(Ok(data)) => {
                // Return the consumed window to the peer.
                let _ = recv.flow_control().release_capacity(data.len());
                Ok(Some(data))
            }
            Some(Err(err)) => Err(Status::from_h2_error(&err)),
            None => Ok(None),
        }
    }

    async fn recv_trailers(&mut self) -> Result<Option<HeaderMap>, Status> {
        let Some(recv) = self.recv.as_mut() else {
            return Err(Status::internal("receiving trailers before headers"));
        };
        poll_fn(|cx| recv.poll_trailers(cx))
            .await
            .map_err(|err| Status::from_h2_error(&err))
    }
}

/// Encodes a gRPC length-prefixed message frame: one flag byte (compressed or
/// not) and a 4-byte big-endian length, then the payload.
pub(crate) fn encode_frame(payload: &[u8], compressed: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.extend_from_slice(&[u8::from(compressed)]);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// A decoded inbound message frame.
#[derive(Debug, PartialEq)]
pub(crate) struct Frame {
    pub compressed: bool,
    pub payload: Bytes,
}

/// Accumulates wire bytes and yields complete message frames.
#[derive(Default)]
pub(crate) struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub(crate) fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>, Status> {
        if self.buffer.len() < 5 {
            return Ok(None);
        }
        let compressed = match self.buffer[0] {
            0 => false,
            1 => true,
            flag => {
                return Err(Status::internal(format!(
                    "invalid message frame flag {flag}"
                )))
            }
        };
        let len = u32::from_be_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]) as usize;
        if self.buffer.len() < 5 + len {
            return Ok(None);
        }
        let _ = self.buffer.split_to(5);
        let payload = self.buffer.split_to(len).freeze();
        Ok(Some(Frame { compressed, payload }))
    }

    /// True when a partial frame remains buffered.
    pub(crate) fn has_partial_frame(&self) -> bool {
        !self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = encode_frame(b"hello", false);
        assert_eq!(&frame[..5], &[0, 0, 0, 0, 5]);

        let mut decoder = FrameDecoder::default();
        decoder.push(&frame);
        let decoded = decoder.next_frame().unwrap().unwrap();
        assert!(!decoded.compressed);
        assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
        assert!(!decoder.has_partial_frame());
    }

    #[test]
    fn decoder_handles_split_and_batched_frames() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_frame(b"one", false));
        wire.extend_from_slice(&encode_frame(b"two", true));

        let mut decoder = FrameDecoder::default();
        // Feed a prefix smaller than one header.
        decoder.push(&wire[..3]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.push(&wire[3..]);

        let first = decoder.next_frame().unwrap().unwrap();
        assert_eq!(first.payload, Bytes::from_static(b"one"));
        assert!(!first.compressed);

        let second = decoder.next_frame().unwrap().unwrap();
        assert_eq!(second.payload, Bytes::from_static(b"two"));
        assert!(second.compressed);

        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn decoder_rejects_bad_flag() {
        let mut decoder = FrameDecoder::default();
        decoder.push(&[7, 0, 0, 0, 0]);
        assert!(decoder.next_frame().is_err());
    }

    #[tokio::test]
    async fn plaintext_connector_refuses_secure_contexts() {
        let connector = H2Connector;
        let options = TransportOptions {
            secure: true,
            server_name: Some("example.com".into()),
            connect_timeout: None,
        };
        let err = match connector.connect(&Address::new("127.0.0.1:1"), &options).await {
            Err(err) => err,
            Ok(_) => panic!("expected connect to refuse a secure context"),
        };
        assert!(err.contains("TLS"), "{err}");
    }
}
