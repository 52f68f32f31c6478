use crate::keystore::KeyProvider;
use crate::model::Eui;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// GBCS envelope collaborator. Payload parsing/minimization and grouping
/// header signatures are an external capability; this crate only routes
/// base64 payload text and key material in and decoded JSON structure out.
#[async_trait]
pub trait GbcsService: Send + Sync {
    /// Decode a secured payload delivered inside a DUIS response. `self_eui`
    /// identifies the boxed gateway as a candidate recipient when resolving
    /// key-agreement keys.
    async fn decode(
        &self,
        payload: &str,
        keys: Arc<dyn KeyProvider>,
        self_eui: Eui,
    ) -> Result<serde_json::Value, GbcsError>;

    /// Sign the grouping header of a pre-command with the originator's
    /// digital-signature key, yielding the signed payload for re-submission.
    async fn sign_precommand(
        &self,
        originator: Eui,
        payload: &str,
        keys: Arc<dyn KeyProvider>,
    ) -> Result<String, GbcsError>;
}

#[derive(Debug)]
pub enum GbcsError {
    Decode(String),
    Sign(String),
    Key(String),
}

impl fmt::Display for GbcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(msg) => write!(f, "gbcs decode failed: {msg}"),
            Self::Sign(msg) => write!(f, "gbcs signing failed: {msg}"),
            Self::Key(msg) => write!(f, "gbcs key lookup failed: {msg}"),
        }
    }
}

impl std::error::Error for GbcsError {}

/// Identity stand-in for deployments without a GBCS collaborator, matching
/// the identity DUIS signer: payloads pass through unsigned and decode to a
/// wrapper object carrying the raw text.
pub struct PassthroughGbcs;

#[async_trait]
impl GbcsService for PassthroughGbcs {
    async fn decode(
        &self,
        payload: &str,
        _keys: Arc<dyn KeyProvider>,
        _self_eui: Eui,
    ) -> Result<serde_json::Value, GbcsError> {
        Ok(serde_json::json!({ "GBCSPayload": payload }))
    }

    async fn sign_precommand(
        &self,
        _originator: Eui,
        payload: &str,
        _keys: Arc<dyn KeyProvider>,
    ) -> Result<String, GbcsError> {
        Ok(payload.to_string())
    }
}

/// Human-readable names for the device alert codes most commonly seen on a
/// boxed gateway, used for the optional UI notification on inbound device
/// alerts. Codes are upper-case hex as carried in the DUIS body.
pub fn alert_code_name(code: &str) -> Option<&'static str> {
    match code.to_ascii_uppercase().as_str() {
        "8F01" => Some("Billing Data Log Updated"),
        "8F0A" => Some("Duplicated Unique Transaction Reference Number Entered"),
        "8F12" => Some("Credit Below Disablement Threshold"),
        "8F1E" => Some("Emergency Credit Activated"),
        "8F20" => Some("Emergency Credit Exhausted"),
        "8F32" => Some("Low Credit"),
        "8F3E" => Some("Supply Armed"),
        "8F4B" => Some("UTRN Entered"),
        "8F66" => Some("Unauthorised Physical Access - Tamper Detect"),
        "8171" => Some("Future Dated Execution Outcome"),
        _ => None,
    }
}
