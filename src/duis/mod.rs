use crate::model::{Command, Response};
use async_trait::async_trait;
use std::fmt;

/// Builds and classifies DUIS bodies. The real XML construction and parsing
/// is an external capability; integrators supply an implementation backed by
/// their XML toolchain, while the shipped binary and the test rigs use the
/// simplified JSON rendition below.
#[async_trait]
pub trait DuisCodec: Send + Sync {
    async fn construct(&self, command: &Command) -> Result<String, DuisError>;
    async fn parse(&self, body: &str) -> Result<Response, DuisError>;
}

/// XML digital-signature collaborator. `sign` takes the serialized request
/// body and is responsible for counter assignment unless `preserve_counter`
/// is set (second phase of a critical exchange re-uses the counter of the
/// first).
#[async_trait]
pub trait DuisSigner: Send + Sync {
    async fn sign(&self, body: &str, preserve_counter: bool) -> Result<String, DuisError>;
    async fn validate(&self, body: &str) -> Result<String, DuisError>;
}

#[derive(Debug)]
pub enum DuisError {
    Construct(String),
    Parse(String),
    Sign(String),
    Validate(String),
}

impl fmt::Display for DuisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Construct(msg) => write!(f, "duis construct failed: {msg}"),
            Self::Parse(msg) => write!(f, "duis parse failed: {msg}"),
            Self::Sign(msg) => write!(f, "duis signing failed: {msg}"),
            Self::Validate(msg) => write!(f, "duis validation failed: {msg}"),
        }
    }
}

impl std::error::Error for DuisError {}

/// Serializes the simplified model as JSON. Useful for test gateways and as
/// the wire form between this bridge and a signing sidecar.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

#[async_trait]
impl DuisCodec for JsonCodec {
    async fn construct(&self, command: &Command) -> Result<String, DuisError> {
        serde_json::to_string(command).map_err(|e| DuisError::Construct(e.to_string()))
    }

    async fn parse(&self, body: &str) -> Result<Response, DuisError> {
        serde_json::from_str(body).map_err(|e| DuisError::Parse(e.to_string()))
    }
}

/// Identity signer/validator for deployments where signing happens in a
/// fronting sidecar, and for tests.
#[derive(Debug, Default, Clone)]
pub struct PassthroughSigner;

#[async_trait]
impl DuisSigner for PassthroughSigner {
    async fn sign(&self, body: &str, _preserve_counter: bool) -> Result<String, DuisError> {
        Ok(body.to_string())
    }

    async fn validate(&self, body: &str) -> Result<String, DuisError> {
        Ok(body.to_string())
    }
}
