//! The compression filter: negotiates a per-message encoding over the
//! `grpc-encoding`/`grpc-accept-encoding` headers and applies it.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::client::filter::{CallInfo, Filter, FilterFactory, WireMessage};
use crate::metadata::Metadata;
use crate::status::Status;

pub(crate) const ENCODING_HEADER: &str = "grpc-encoding";
pub(crate) const ACCEPT_ENCODING_HEADER: &str = "grpc-accept-encoding";

/// The message encodings this runtime understands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    #[default]
    Identity,
    Gzip,
}

impl CompressionAlgorithm {
    fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Identity => "identity",
            CompressionAlgorithm::Gzip => "gzip",
        }
    }

    fn from_name(name: &str) -> Option<CompressionAlgorithm> {
        match name {
            "identity" => Some(CompressionAlgorithm::Identity),
            "gzip" => Some(CompressionAlgorithm::Gzip),
            _ => None,
        }
    }
}

/// Parses a `grpc-accept-encoding` value into the recognized algorithms,
/// skipping names this runtime does not know.
fn parse_accept_encoding(value: &str) -> HashSet<CompressionAlgorithm> {
    value
        .split(',')
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .filter_map(CompressionAlgorithm::from_name)
        .collect()
}

fn gzip_compress(payload: &[u8]) -> std::io::Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::new(6));
    encoder.write_all(payload)?;
    Ok(encoder.finish()?.into())
}

fn gzip_decompress(payload: &[u8]) -> std::io::Result<Bytes> {
    let mut decoder = GzDecoder::new(payload);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out.into())
}

/// Builds compression filters. `send_algorithm` is what outgoing messages
/// are compressed with, provided the peer has advertised support for it;
/// receiving always honors whatever the peer declares.
pub struct CompressionFilterFactory {
    send_algorithm: CompressionAlgorithm,
}

impl CompressionFilterFactory {
    pub fn new(send_algorithm: CompressionAlgorithm) -> CompressionFilterFactory {
        CompressionFilterFactory { send_algorithm }
    }
}

impl Default for CompressionFilterFactory {
    fn default() -> Self {
        CompressionFilterFactory::new(CompressionAlgorithm::Identity)
    }
}

impl FilterFactory for CompressionFilterFactory {
    fn create(&self, _call: &CallInfo) -> Arc<dyn Filter> {
        Arc::new(CompressionFilter {
            send_algorithm: self.send_algorithm,
            receive_algorithm: Mutex::new(CompressionAlgorithm::Identity),
            accepted_by_peer: Mutex::new(None),
        })
    }
}

struct CompressionFilter {
    send_algorithm: CompressionAlgorithm,
    /// Learned from the response's `grpc-encoding` header.
    receive_algorithm: Mutex<CompressionAlgorithm>,
    /// Learned from the response's `grpc-accept-encoding` header. `None`
    /// until the peer has declared anything; sends stay uncompressed until
    /// then.
    accepted_by_peer: Mutex<Option<HashSet<CompressionAlgorithm>>>,
}

impl CompressionFilter {
    fn peer_accepts(&self, algorithm: CompressionAlgorithm) -> bool {
        self.accepted_by_peer
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|accepted| accepted.contains(&algorithm))
    }
}

#[async_trait]
impl Filter for CompressionFilter {
    async fn send_metadata(&self, mut metadata: Metadata) -> Result<Metadata, Status> {
        metadata
            .insert(ACCEPT_ENCODING_HEADER, "identity,gzip")
            .map_err(|e| Status::internal(e.to_string()))?;
        if self.send_algorithm != CompressionAlgorithm::Identity {
            metadata
                .insert(ENCODING_HEADER, self.send_algorithm.name())
                .map_err(|e| Status::internal(e.to_string()))?;
        }
        Ok(metadata)
    }

    async fn receive_metadata(&self, metadata: Metadata) -> Result<Metadata, Status> {
        if let Some(value) = metadata.get(ACCEPT_ENCODING_HEADER).and_then(|v| v.as_str()) {
            *self.accepted_by_peer.lock().unwrap() = Some(parse_accept_encoding(value));
        }
        if let Some(value) = metadata.get(ENCODING_HEADER).and_then(|v| v.as_str()) {
            match CompressionAlgorithm::from_name(value) {
                Some(algorithm) => *self.receive_algorithm.lock().unwrap() = algorithm,
                None => {
                    return Err(Status::internal(format!(
                        "server used unsupported message encoding {value:?}"
                    )));
                }
            }
        }
        Ok(metadata)
    }

    async fn send_message(&self, message: WireMessage) -> Result<WireMessage, Status> {
        // Compress only once the peer has advertised support for the chosen
        // codec; until then messages go out as identity.
        match self.send_algorithm {
            CompressionAlgorithm::Identity => Ok(message),
            CompressionAlgorithm::Gzip if !self.peer_accepts(CompressionAlgorithm::Gzip) => {
                Ok(message)
            }
            CompressionAlgorithm::Gzip => {
                let payload = gzip_compress(&message.payload)
                    .map_err(|e| Status::internal(format!("gzip compression failed: {e}")))?;
                Ok(WireMessage {
                    payload,
                    compressed: true,
                })
            }
        }
    }

    async fn receive_message(&self, message: WireMessage) -> Result<WireMessage, Status> {
        if !message.compressed {
            return Ok(message);
        }
        let algorithm = *self.receive_algorithm.lock().unwrap();
        match algorithm {
            CompressionAlgorithm::Identity => Err(Status::internal(
                "received a compressed message without a grpc-encoding header",
            )),
            CompressionAlgorithm::Gzip => {
                let payload = gzip_decompress(&message.payload)
                    .map_err(|e| Status::internal(format!("gzip decompression failed: {e}")))?;
                Ok(WireMessage {
                    payload,
                    compressed: false,
                })
            }
        }
    }
}
