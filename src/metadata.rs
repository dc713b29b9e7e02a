//! Custom metadata attached to calls, carried on the wire as HTTP/2 headers.
//!
//! Metadata is an ordered mapping from header names to ASCII or binary
//! values. Binary values use keys with the `-bin` suffix and are base64
//! encoded on the wire.

use std::{error::Error, fmt};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use http::{header::HeaderName, HeaderMap, HeaderValue};
use tracing::warn;

const BINARY_SUFFIX: &str = "-bin";

/// Header names owned by the transport; never surfaced as call metadata.
const TRANSPORT_OWNED: &[&str] = &["content-type", "te"];

/// A single metadata value: printable ASCII, or opaque bytes for `-bin` keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataValue {
    Ascii(String),
    Binary(Bytes),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(s) => Some(s),
            MetadataValue::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MetadataValue::Ascii(s) => s.as_bytes(),
            MetadataValue::Binary(b) => b,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Ascii(value.to_owned())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Ascii(value)
    }
}

impl From<Bytes> for MetadataValue {
    fn from(value: Bytes) -> Self {
        MetadataValue::Binary(value)
    }
}

/// The error returned when a metadata key or value is not legal.
#[derive(Debug, PartialEq, Eq)]
pub struct InvalidMetadata {
    message: String,
}

impl InvalidMetadata {
    fn new(message: impl Into<String>) -> Self {
        InvalidMetadata {
            message: message.into(),
        }
    }
}

impl fmt::Display for InvalidMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid metadata: {}", self.message)
    }
}

impl Error for InvalidMetadata {}

/// An ordered multimap of call metadata.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

impl Metadata {
    pub fn new() -> Metadata {
        Metadata::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a value for `key`, keeping any values already present.
    pub fn append(
        &mut self,
        key: &str,
        value: impl Into<MetadataValue>,
    ) -> Result<(), InvalidMetadata> {
        let key = validate_key(key)?;
        let value = validate_value(&key, value.into())?;
        self.entries.push((key, value));
        Ok(())
    }

    /// Sets `key` to a single value, removing any values already present.
    pub fn insert(
        &mut self,
        key: &str,
        value: impl Into<MetadataValue>,
    ) -> Result<(), InvalidMetadata> {
        let normalized = validate_key(key)?;
        let value = validate_value(&normalized, value.into())?;
        self.entries.retain(|(k, _)| *k != normalized);
        self.entries.push((normalized, value));
        Ok(())
    }

    /// Returns the first value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        let key = key.to_ascii_lowercase();
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Returns every value for `key` in insertion order.
    pub fn get_all<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a MetadataValue> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(move |(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &str) {
        let key = key.to_ascii_lowercase();
        self.entries.retain(|(k, _)| *k != key);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Merges every entry of `other` into `self`, appending to existing keys.
    pub fn merge(&mut self, other: Metadata) {
        self.entries.extend(other.entries);
    }

    /// Serializes into wire headers. Binary values are base64 encoded.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(self.entries.len());
        for (key, value) in &self.entries {
            // Keys were validated on insertion.
            let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
                continue;
            };
            let encoded = match value {
                MetadataValue::Ascii(s) => HeaderValue::from_str(s),
                MetadataValue::Binary(b) => HeaderValue::from_str(&STANDARD.encode(b)),
            };
            match encoded {
                Ok(v) => {
                    headers.append(name, v);
                }
                Err(_) => warn!(key = %key, "dropping metadata entry with unencodable value"),
            }
        }
        headers
    }

    /// Deserializes from wire headers, dropping transport-owned entries and
    /// `-bin` entries that do not decode as base64.
    pub fn from_header_map(headers: &HeaderMap) -> Metadata {
        let mut metadata = Metadata::new();
        for (name, value) in headers.iter() {
            let key = name.as_str();
            if TRANSPORT_OWNED.contains(&key) {
                continue;
            }
            if key.ends_with(BINARY_SUFFIX) {
                match STANDARD.decode(value.as_bytes()) {
                    Ok(decoded) => metadata
                        .entries
                        .push((key.to_owned(), MetadataValue::Binary(decoded.into()))),
                    Err(_) => warn!(key = %key, "dropping binary metadata entry with invalid base64"),
                }
            } else {
                match value.to_str() {
                    Ok(s) => metadata
                        .entries
                        .push((key.to_owned(), MetadataValue::Ascii(s.to_owned()))),
                    Err(_) => warn!(key = %key, "dropping metadata entry with non-ASCII value"),
                }
            }
        }
        metadata
    }
}

fn validate_key(key: &str) -> Result<String, InvalidMetadata> {
    if key.is_empty() {
        return Err(InvalidMetadata::new("empty key"));
    }
    let normalized = key.to_ascii_lowercase();
    HeaderName::from_bytes(normalized.as_bytes())
        .map_err(|_| InvalidMetadata::new(format!("illegal header name {key:?}")))?;
    Ok(normalized)
}

fn validate_value(key: &str, value: MetadataValue) -> Result<MetadataValue, InvalidMetadata> {
    match (&value, key.ends_with(BINARY_SUFFIX)) {
        (MetadataValue::Binary(_), false) => Err(InvalidMetadata::new(format!(
            "binary value for non-binary key {key:?}"
        ))),
        (MetadataValue::Ascii(s), _) => {
            if HeaderValue::from_str(s).is_err() {
                return Err(InvalidMetadata::new(format!("illegal value for {key:?}")));
            }
            Ok(value)
        }
        _ => Ok(value),
    }
}
