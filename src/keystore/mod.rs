use crate::model::Eui;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

/// SMKI organisation role excluded from key resolution; certificates issued
/// to this role are never usable by the boxed gateway.
const EXCLUDED_ROLE: u16 = 135;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    DigitalSignature,
    KeyAgreement,
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DigitalSignature => write!(f, "DS"),
            Self::KeyAgreement => write!(f, "KA"),
        }
    }
}

/// Selector passed to `KeyStore::resolve`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyRequest {
    pub private: bool,
    pub prepayment: bool,
}

/// Opaque key material; this crate never interprets the DER bytes, it only
/// routes them to the GBCS collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub eui: Eui,
    pub private: bool,
    pub der: Vec<u8>,
}

/// Locally configured key entry, checked before any remote lookup.
#[derive(Debug, Clone)]
pub struct LocalKey {
    pub eui: Eui,
    pub usage: KeyUsage,
    pub private: bool,
    pub prepayment: bool,
    pub der: Vec<u8>,
}

/// Candidate returned by the remote key service. `role` and `name` drive the
/// post-query filtering; the remote store itself has no notion of the
/// prepayment/standard split.
#[derive(Debug, Clone)]
pub struct RemoteKeyEntry {
    pub eui: Eui,
    pub role: Option<u16>,
    pub name: Option<String>,
    pub der: Vec<u8>,
}

/// Remote key service collaborator (certificate/private-key query by EUI and
/// usage).
#[async_trait]
pub trait RemoteKeyStore: Send + Sync {
    async fn query(
        &self,
        eui: Eui,
        usage: KeyUsage,
        private: bool,
    ) -> Result<Vec<RemoteKeyEntry>, KeyStoreError>;
}

/// Trait exposed to the GBCS collaborator for key lookup during payload
/// decode and pre-command signing.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn resolve(
        &self,
        eui: Eui,
        usage: KeyUsage,
        request: KeyRequest,
    ) -> Result<KeyMaterial, KeyStoreError>;
}

pub struct KeyStore {
    local: Vec<LocalKey>,
    remote: Option<Box<dyn RemoteKeyStore>>,
}

impl KeyStore {
    pub fn new(local: Vec<LocalKey>, remote: Option<Box<dyn RemoteKeyStore>>) -> Self {
        Self { local, remote }
    }
}

#[async_trait]
impl KeyProvider for KeyStore {
    /// Locally configured keys win; only on a local miss is the remote store
    /// queried, with its candidates narrowed by role and naming convention.
    /// Anything other than exactly one surviving candidate is a failure.
    async fn resolve(
        &self,
        eui: Eui,
        usage: KeyUsage,
        request: KeyRequest,
    ) -> Result<KeyMaterial, KeyStoreError> {
        if let Some(local) = self.local.iter().find(|k| {
            k.eui == eui
                && k.usage == usage
                && k.private == request.private
                && k.prepayment == request.prepayment
        }) {
            return Ok(KeyMaterial {
                eui,
                private: local.private,
                der: local.der.clone(),
            });
        }

        let remote = self
            .remote
            .as_ref()
            .ok_or(KeyStoreError::NotFound { eui, usage, request })?;
        let mut candidates: Vec<RemoteKeyEntry> = remote
            .query(eui, usage, request.private)
            .await?
            .into_iter()
            .filter(|entry| keep_candidate(entry, request.prepayment))
            .collect();

        if candidates.len() != 1 {
            tracing::warn!(
                eui = %eui,
                usage = %usage,
                private = request.private,
                prepayment = request.prepayment,
                candidates = candidates.len(),
                "key lookup did not resolve to a single candidate"
            );
            return Err(KeyStoreError::NotFound { eui, usage, request });
        }
        let entry = candidates.swap_remove(0);
        Ok(KeyMaterial {
            eui,
            private: request.private,
            der: entry.der,
        })
    }
}

/// Remote key client against the boxed SMKI interface. Candidates come back
/// as JSON entries with the key material base64-encoded.
pub struct HttpRemoteKeyStore {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRemoteKeyStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, KeyStoreError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KeyStoreError::Remote(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireKeyEntry {
    eui: String,
    #[serde(default)]
    role: Option<u16>,
    #[serde(default)]
    name: Option<String>,
    key: String,
}

fn entry_from_wire(wire: WireKeyEntry) -> Result<RemoteKeyEntry, KeyStoreError> {
    let eui = wire
        .eui
        .parse()
        .map_err(|e| KeyStoreError::Remote(format!("{e}")))?;
    let der = general_purpose::STANDARD
        .decode(wire.key.trim())
        .map_err(|e| KeyStoreError::Remote(format!("key for {}: {e}", wire.eui)))?;
    Ok(RemoteKeyEntry {
        eui,
        role: wire.role,
        name: wire.name,
        der,
    })
}

#[async_trait]
impl RemoteKeyStore for HttpRemoteKeyStore {
    async fn query(
        &self,
        eui: Eui,
        usage: KeyUsage,
        private: bool,
    ) -> Result<Vec<RemoteKeyEntry>, KeyStoreError> {
        let url = format!("{}/keys", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("eui", eui.to_string()),
                ("usage", usage.to_string()),
                ("private", private.to_string()),
            ])
            .send()
            .await
            .map_err(|e| KeyStoreError::Remote(e.to_string()))?;
        if !response.status().is_success() {
            return Err(KeyStoreError::Remote(format!(
                "http status {}",
                response.status().as_u16()
            )));
        }
        let entries: Vec<WireKeyEntry> = response
            .json()
            .await
            .map_err(|e| KeyStoreError::Remote(e.to_string()))?;
        entries.into_iter().map(entry_from_wire).collect()
    }
}

/// Remote candidates with the administratively excluded role are dropped.
/// Named entries follow the boxed naming convention: `Z1-...PP-` marks the
/// prepayment variant of a key, any other `Z1-` name (or an `otherUser-`
/// prefix) marks the standard variant. Names outside the convention are kept
/// either way.
fn keep_candidate(entry: &RemoteKeyEntry, prepayment: bool) -> bool {
    if entry.role == Some(EXCLUDED_ROLE) {
        return false;
    }
    let name = match entry.name.as_deref() {
        Some(name) => name,
        None => return true,
    };
    match classify_name(name) {
        NameClass::Prepayment => prepayment,
        NameClass::Standard => !prepayment,
        NameClass::Unrecognised => true,
    }
}

enum NameClass {
    Prepayment,
    Standard,
    Unrecognised,
}

fn classify_name(name: &str) -> NameClass {
    static BOXED_NAME: OnceLock<Regex> = OnceLock::new();
    let re = BOXED_NAME.get_or_init(|| Regex::new(r"^Z1-([a-zA-Z0-9]+)-").expect("static regex"));
    if name.starts_with("otherUser-") {
        return NameClass::Standard;
    }
    match re.captures(name) {
        Some(caps) if caps[1].ends_with("PP") => NameClass::Prepayment,
        Some(_) => NameClass::Standard,
        None => NameClass::Unrecognised,
    }
}

#[derive(Debug)]
pub enum KeyStoreError {
    NotFound {
        eui: Eui,
        usage: KeyUsage,
        request: KeyRequest,
    },
    Remote(String),
}

impl fmt::Display for KeyStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { eui, usage, request } => write!(
                f,
                "{} key {}not found for {} for {}",
                if request.private { "private" } else { "public" },
                if request.prepayment { "(prepayment) " } else { "" },
                eui,
                usage
            ),
            Self::Remote(msg) => write!(f, "remote key store failed: {msg}"),
        }
    }
}

impl std::error::Error for KeyStoreError {}
