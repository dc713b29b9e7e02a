//! The client-side channel runtime of a gRPC-style RPC stack.
//!
//! A [`Channel`] resolves a logical target (a DNS name or literal address)
//! to a changing set of backend addresses, maintains pooled HTTP/2
//! connections to those backends with per-backend connectivity state
//! machines and exponential-backoff reconnection, selects a backend per call
//! according to a pluggable load balancing policy, and multiplexes call
//! streams over the selected connection with deadline, credential, and
//! compression filters.
//!
//! ```no_run
//! use grpc_x::client::call::CallOptions;
//! use grpc_x::client::ChannelOptions;
//! use grpc_x::credentials::InsecureChannelCredentials;
//! use grpc_x::Channel;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let channel = Channel::new(
//!     "dns:example.com:50051",
//!     InsecureChannelCredentials::new(),
//!     ChannelOptions::default(),
//! )?;
//! let call = channel.create_call("/echo.Echo/UnaryEcho", CallOptions::default())?;
//! call.send_message(bytes::Bytes::from_static(b"\x08\x01"))?;
//! call.half_close();
//! while let Some(message) = call.next_message().await {
//!     println!("received {} bytes", message.len());
//! }
//! println!("finished: {}", call.status().await);
//! # Ok(())
//! # }
//! ```
//!
//! This crate is the channel runtime only: message payloads are opaque byte
//! sequences, and code generation, servers, and transport security live
//! elsewhere.

pub mod client;
pub mod credentials;
pub mod metadata;
pub mod status;

pub use client::channel::{Channel, ChannelError};
pub use client::ConnectivityState;
pub use metadata::Metadata;
pub use status::{Code, Status};
