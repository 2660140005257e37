//! Wire envelope encoding and decoding for collar messages
//!
//! Messages are flat JSON objects keyed by fixed four-character field tags,
//! one UTF-8 object per message with no length prefix (the transport layer
//! delimits messages). The short tags keep payloads small on the constrained
//! link and must be reproduced exactly for compatibility with deployed
//! collar firmware.
//!
//! Decoding is permissive about unknown extra fields and strict about
//! required ones: a message missing a required tag, or carrying it with the
//! wrong type, fails to decode as a whole rather than producing a partially
//! populated value.

use crate::types::{CollarError, CommandKind, Result};
use serde_json::{Map, Value};

// Envelope field tags
const TAG_SEQUENCE: &str = "SEQU";
const TAG_CORRELATION: &str = "COID";
const TAG_REQUEST: &str = "REQU";
const TAG_RESPONSE: &str = "RESP";
const TAG_RESULT: &str = "RSLT";
const TAG_ACCESS_POINT: &str = "ACPO";

// Access point field tags
const TAG_SSID: &str = "SSID";
const TAG_RCPI: &str = "RCPI";
const TAG_INDEX: &str = "INDE";
const TAG_COUNT: &str = "COUN";
const TAG_CHANNEL: &str = "CHAN";
const TAG_PASSWORD: &str = "PASS";

/// One discovered wireless network, as reported by the collar
///
/// Always cloned when handed across a request boundary, so attaching a
/// password to one copy cannot affect any other in-flight or historical
/// message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: String,
    /// Received signal strength indication, typically negative dBm
    pub rcpi: i64,
    /// Ordinal position of this network within its scan batch
    pub index: u32,
    /// Total number of networks in this scan batch
    pub count: u32,
    pub channel: u32,
    pub password: Option<String>,
}

impl AccessPoint {
    pub fn new(ssid: impl Into<String>, rcpi: i64, index: u32, count: u32, channel: u32) -> Self {
        Self {
            ssid: ssid.into(),
            rcpi,
            index,
            count,
            channel,
            password: None,
        }
    }

    /// Encode into the nested `ACPO` map
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(TAG_SSID.to_string(), Value::from(self.ssid.clone()));
        map.insert(TAG_RCPI.to_string(), Value::from(self.rcpi));
        map.insert(TAG_INDEX.to_string(), Value::from(self.index));
        map.insert(TAG_COUNT.to_string(), Value::from(self.count));
        map.insert(TAG_CHANNEL.to_string(), Value::from(self.channel));
        if let Some(password) = &self.password {
            map.insert(TAG_PASSWORD.to_string(), Value::from(password.clone()));
        }
        map
    }

    /// Decode from a nested `ACPO` map
    ///
    /// All fields except `PASS` are required and must carry the right type.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        Ok(Self {
            ssid: require_str(map, TAG_SSID)?.to_string(),
            rcpi: require_i64(map, TAG_RCPI)?,
            index: require_u32(map, TAG_INDEX)?,
            count: require_u32(map, TAG_COUNT)?,
            channel: require_u32(map, TAG_CHANNEL)?,
            password: map
                .get(TAG_PASSWORD)
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// One outbound command to the collar
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Monotonically increasing per engine session, never reused. Purely
    /// diagnostic: responses are matched positionally, not by sequence.
    pub sequence: u32,
    pub kind: CommandKind,
    pub payload: Option<AccessPoint>,
    /// Opaque identifier the peripheral may echo back, passed through
    /// unchanged
    pub correlation_tag: Option<String>,
}

impl Request {
    pub fn new(sequence: u32, kind: CommandKind, payload: Option<AccessPoint>) -> Self {
        Self {
            sequence,
            kind,
            payload,
            correlation_tag: None,
        }
    }

    /// Serialize to the wire form
    ///
    /// Absent optional fields are omitted from the map entirely, never
    /// encoded as JSON null.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut map = Map::new();
        map.insert(TAG_SEQUENCE.to_string(), Value::from(self.sequence));
        if let Some(tag) = &self.correlation_tag {
            map.insert(TAG_CORRELATION.to_string(), Value::from(tag.clone()));
        }
        map.insert(TAG_REQUEST.to_string(), Value::from(self.kind.as_str()));
        if let Some(access_point) = &self.payload {
            map.insert(
                TAG_ACCESS_POINT.to_string(),
                Value::Object(access_point.to_map()),
            );
        }
        serde_json::to_vec(&Value::Object(map))
            .map_err(|e| CollarError::EncodingError(e.to_string()))
    }

    /// Decode a request from wire bytes
    ///
    /// Requires `SEQU` and a valid `REQU` command string.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let map = parse_object(bytes)?;
        Ok(Self {
            sequence: require_u32(&map, TAG_SEQUENCE)?,
            kind: CommandKind::from_wire(require_str(&map, TAG_REQUEST)?)?,
            payload: optional_access_point(&map),
            correlation_tag: optional_str(&map, TAG_CORRELATION),
        })
    }
}

/// One decoded inbound message from the collar
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Sequence number echoed by the peripheral
    pub sequence: u32,
    /// Peripheral-reported outcome, zero for success
    pub result_code: i64,
    /// Echoes the command kind this message answers
    pub kind: CommandKind,
    pub payload: Option<AccessPoint>,
    pub correlation_tag: Option<String>,
}

impl Response {
    pub fn new(sequence: u32, result_code: i64, kind: CommandKind) -> Self {
        Self {
            sequence,
            result_code,
            kind,
            payload: None,
            correlation_tag: None,
        }
    }

    /// Decode a response from wire bytes
    ///
    /// `SEQU`, `RESP` (naming a known command) and `RSLT` are required; a
    /// present-but-malformed `ACPO` map yields an absent payload rather than
    /// failing the whole message.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let map = parse_object(bytes)?;
        Ok(Self {
            sequence: require_u32(&map, TAG_SEQUENCE)?,
            result_code: require_i64(&map, TAG_RESULT)?,
            kind: CommandKind::from_wire(require_str(&map, TAG_RESPONSE)?)?,
            payload: optional_access_point(&map),
            correlation_tag: optional_str(&map, TAG_CORRELATION),
        })
    }

    /// Serialize to the wire form, mirroring what collar firmware emits
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut map = Map::new();
        map.insert(TAG_SEQUENCE.to_string(), Value::from(self.sequence));
        if let Some(tag) = &self.correlation_tag {
            map.insert(TAG_CORRELATION.to_string(), Value::from(tag.clone()));
        }
        map.insert(TAG_RESULT.to_string(), Value::from(self.result_code));
        map.insert(TAG_RESPONSE.to_string(), Value::from(self.kind.as_str()));
        if let Some(access_point) = &self.payload {
            map.insert(
                TAG_ACCESS_POINT.to_string(),
                Value::Object(access_point.to_map()),
            );
        }
        serde_json::to_vec(&Value::Object(map))
            .map_err(|e| CollarError::EncodingError(e.to_string()))
    }
}

fn parse_object(bytes: &[u8]) -> Result<Map<String, Value>> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| CollarError::DecodingError(e.to_string()))?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(CollarError::DecodingError(format!(
            "expected a JSON object, got {}",
            json_type_name(&other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn require_str<'a>(map: &'a Map<String, Value>, tag: &'static str) -> Result<&'a str> {
    match map.get(tag) {
        None => Err(CollarError::MissingField(tag)),
        Some(value) => value.as_str().ok_or(CollarError::MistypedField(tag)),
    }
}

fn require_i64(map: &Map<String, Value>, tag: &'static str) -> Result<i64> {
    match map.get(tag) {
        None => Err(CollarError::MissingField(tag)),
        Some(value) => value.as_i64().ok_or(CollarError::MistypedField(tag)),
    }
}

fn require_u32(map: &Map<String, Value>, tag: &'static str) -> Result<u32> {
    let value = require_i64(map, tag)?;
    u32::try_from(value).map_err(|_| CollarError::MistypedField(tag))
}

fn optional_str(map: &Map<String, Value>, tag: &str) -> Option<String> {
    map.get(tag).and_then(Value::as_str).map(str::to_string)
}

/// A missing, non-object or malformed `ACPO` all decode to absence
fn optional_access_point(map: &Map<String, Value>) -> Option<AccessPoint> {
    map.get(TAG_ACCESS_POINT)
        .and_then(Value::as_object)
        .and_then(|nested| AccessPoint::from_map(nested).ok())
}
