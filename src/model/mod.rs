use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// EUI of the boxed gateway itself, used as the recipient hint when decoding
/// GBCS payloads delivered through the DUIS response channel.
pub const BOXED_SELF_EUI: &str = "90-B3-D5-1F-30-00-00-02";

/// 8-byte actor/device identifier. Accepts plain, hyphenated or spaced hex on
/// input and always renders as upper-case hyphenated hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Eui([u8; 8]);

impl Eui {
    pub fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl FromStr for Eui {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s
            .chars()
            .filter(|c| !matches!(c, '-' | ':' | ' '))
            .collect();
        let raw = hex::decode(&cleaned).map_err(|_| ModelError::BadEui(s.to_string()))?;
        let bytes: [u8; 8] = raw
            .try_into()
            .map_err(|_| ModelError::BadEui(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Eui {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{:02X}", b)).collect();
        write!(f, "{}", parts.join("-"))
    }
}

impl fmt::Debug for Eui {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Eui({})", self)
    }
}

impl Serialize for Eui {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Eui {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Correlation key for an in-flight request. The counter is a 64-bit value;
/// when this crate assigns a fresh counter the low 32 bits must be zero (the
/// gateway reserves them for its own sequencing). Non-zero low bits are only
/// legal when a caller deliberately preserves the counter of an earlier phase
/// of the same exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestId {
    pub originator_id: Eui,
    pub target_id: Eui,
    pub counter: u64,
}

impl RequestId {
    pub fn new(originator_id: Eui, target_id: Eui, counter: u64) -> Self {
        Self {
            originator_id,
            target_id,
            counter,
        }
    }

    /// Flat `originator:target:counter` key used by the pending-response store.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.originator_id, self.target_id, self.counter)
    }

    pub fn has_fresh_counter(&self) -> bool {
        self.counter & 0xffff_ffff == 0
    }
}

/// Which of the three gateway web services a command is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEndpoint {
    NonDevice,
    SendCommand,
    Transform,
}

impl ServiceEndpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Self::NonDevice => "/api/v1/serviceD",
            Self::SendCommand => "/api/v1/serviceS",
            Self::Transform => "/api/v1/serviceT",
        }
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NonDevice => "Non-Device Service",
            Self::SendCommand => "Send Command Service",
            Self::Transform => "Transform Service",
        };
        write!(f, "{}", name)
    }
}

/// Numeric DUIS command variant. Classification decides the target web
/// service; variants 3 and 7 hand the signed command back to the requesting
/// user for local delivery, which the boxed gateway cannot do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct CommandVariant(u8);

/// Variant used when re-submitting a GBCS-signed pre-command to the Send
/// Command Service during the second phase of a critical exchange.
pub const CV_SIGNED_PRECOMMAND: CommandVariant = CommandVariant(5);

impl CommandVariant {
    pub fn new(number: u8) -> Result<Self, ModelError> {
        if (1..=8).contains(&number) {
            Ok(Self(number))
        } else {
            Err(ModelError::BadCommandVariant(number))
        }
    }

    pub fn number(&self) -> u8 {
        self.0
    }

    pub fn endpoint(&self) -> ServiceEndpoint {
        match self.0 {
            2 | 4 => ServiceEndpoint::Transform,
            8 => ServiceEndpoint::NonDevice,
            _ => ServiceEndpoint::SendCommand,
        }
    }

    /// Variants the boxed gateway refuses outright (local-delivery flavours).
    pub fn supported(&self) -> bool {
        !matches!(self.0, 3 | 7)
    }
}

impl TryFrom<u8> for CommandVariant {
    type Error = ModelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CommandVariant> for u8 {
    fn from(value: CommandVariant) -> Self {
        value.0
    }
}

impl fmt::Display for CommandVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CV{}", self.0)
    }
}

/// Simplified DUIS request. The body keeps the JSON shape produced by the
/// external codec; this crate never interprets it beyond pass-through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub header: CommandHeader,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandHeader {
    pub request_id: RequestId,
    pub command_variant: CommandVariant,
    pub service_reference: String,
    pub service_reference_variant: String,
}

/// Simplified DUIS response as classified once by the codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub header: ResponseHeader,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub response_code: String,
    #[serde(default)]
    pub request_id: Option<RequestId>,
}

impl ResponseHeader {
    /// Immediate final success. Exact match only, deliberately not a prefix
    /// test.
    pub fn is_success(&self) -> bool {
        self.response_code == "I0"
    }

    /// Accepted, asynchronous result to follow on the response channel.
    pub fn is_acknowledgement(&self) -> bool {
        self.response_code == "I99"
    }

    pub fn is_informational(&self) -> bool {
        self.response_code.starts_with('I')
    }
}

/// Response body shapes, tagged at parse time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseBody {
    ResponseMessage(ResponseMessage),
    DeviceAlert(DeviceAlert),
    DccAlert(DccAlert),
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub service_reference_variant: String,
    /// Base64 GBCS payload carried by device responses.
    #[serde(default)]
    pub gbcs_payload: Option<String>,
    /// Unsigned pre-command returned by the Transform Service.
    #[serde(default)]
    pub pre_command: Option<PreCommand>,
    /// Future-dated alert variant; carries its own secured payload.
    #[serde(default)]
    pub future_dated_device_alert: Option<FutureDatedDeviceAlert>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreCommand {
    pub gbcs_payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FutureDatedDeviceAlert {
    pub gbcs_payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAlert {
    pub alert_code: String,
    #[serde(default)]
    pub gbcs_payload: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DccAlert {
    pub dcc_alert_code: String,
}

/// Opaque caller context carried through the correlator and re-attached to
/// the asynchronous response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContext {
    #[serde(default)]
    pub correlation_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub request: Option<Command>,
    #[serde(default)]
    pub attrs: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug)]
pub enum ModelError {
    BadEui(String),
    BadCommandVariant(u8),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadEui(raw) => write!(f, "not a valid EUI: {raw}"),
            Self::BadCommandVariant(n) => write!(f, "command variant out of range: {n}"),
        }
    }
}

impl std::error::Error for ModelError {}
