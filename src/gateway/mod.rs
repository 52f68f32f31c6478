use crate::correlator::PendingStore;
use crate::duis::{DuisCodec, DuisError, DuisSigner};
use crate::gbcs::{GbcsError, GbcsService};
use crate::keystore::KeyProvider;
use crate::model::{
    Command, CommandHeader, CommandVariant, MessageContext, Response, ServiceEndpoint,
    CV_SIGNED_PRECOMMAND,
};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
pub const XML_CONTENT_TYPE: &str = "application/xml";

/// A configured request header. `Static` values are fixed at configuration
/// time, `Env` values are pulled from the process environment at send time
/// so credentials rotated out-of-band take effect without a restart.
#[derive(Debug, Clone)]
pub enum HeaderSource {
    Static(String),
    Env(String),
}

#[derive(Debug, Clone)]
pub struct HeaderDef {
    pub name: String,
    pub source: HeaderSource,
}

impl HeaderDef {
    fn resolve(&self) -> Option<(String, String)> {
        match &self.source {
            HeaderSource::Static(value) => Some((self.name.clone(), value.clone())),
            HeaderSource::Env(var) => match std::env::var(var) {
                Ok(value) => Some((self.name.clone(), value)),
                Err(_) => {
                    tracing::debug!(header = %self.name, var = %var, "header env var unset, skipping");
                    None
                }
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

/// Thin seam over HTTP POST so the pipeline is testable without a network.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: String,
        timeout: Duration,
    ) -> Result<TransportResponse, String>;
}

pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, SendError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| SendError::Transport(e.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: String,
        timeout: Duration,
    ) -> Result<TransportResponse, String> {
        let mut request = self.http.post(url).timeout(timeout).body(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(|e| e.to_string())?;
        Ok(TransportResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Two-phase exchange progress. Only a Transform Service success carrying a
/// pre-command moves past `Sent`; the guard on `Resent` is what makes the
/// counter-preservation rule explicit rather than a call-site flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendPhase {
    Sent,
    AwaitingPreCommandSign,
    Resent,
}

pub struct GatewayClient {
    transport: Arc<dyn Transport>,
    signer: Arc<dyn DuisSigner>,
    codec: Arc<dyn DuisCodec>,
    gbcs: Option<Arc<dyn GbcsService>>,
    keys: Option<Arc<dyn KeyProvider>>,
    correlator: Option<Arc<PendingStore<MessageContext>>>,
    base_url: String,
    headers: Vec<HeaderDef>,
    timeout: Duration,
}

pub struct GatewayClientBuilder {
    transport: Arc<dyn Transport>,
    signer: Arc<dyn DuisSigner>,
    codec: Arc<dyn DuisCodec>,
    gbcs: Option<Arc<dyn GbcsService>>,
    keys: Option<Arc<dyn KeyProvider>>,
    correlator: Option<Arc<PendingStore<MessageContext>>>,
    base_url: String,
    headers: Vec<HeaderDef>,
    timeout: Duration,
}

impl GatewayClientBuilder {
    pub fn new(
        base_url: impl Into<String>,
        transport: Arc<dyn Transport>,
        signer: Arc<dyn DuisSigner>,
        codec: Arc<dyn DuisCodec>,
    ) -> Self {
        Self {
            transport,
            signer,
            codec,
            gbcs: None,
            keys: None,
            correlator: None,
            base_url: base_url.into(),
            headers: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn gbcs(mut self, gbcs: Arc<dyn GbcsService>, keys: Arc<dyn KeyProvider>) -> Self {
        self.gbcs = Some(gbcs);
        self.keys = Some(keys);
        self
    }

    /// Pending-response store shared with the inbound endpoint. When set, an
    /// acknowledged send parks the caller's context under the echoed request
    /// id for the eventual asynchronous response.
    pub fn correlator(mut self, correlator: Arc<PendingStore<MessageContext>>) -> Self {
        self.correlator = Some(correlator);
        self
    }

    pub fn headers(mut self, headers: Vec<HeaderDef>) -> Self {
        self.headers = headers;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> GatewayClient {
        GatewayClient {
            transport: self.transport,
            signer: self.signer,
            codec: self.codec,
            gbcs: self.gbcs,
            keys: self.keys,
            correlator: self.correlator,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            headers: self.headers,
            timeout: self.timeout,
        }
    }
}

impl GatewayClient {
    pub fn builder(
        base_url: impl Into<String>,
        transport: Arc<dyn Transport>,
        signer: Arc<dyn DuisSigner>,
        codec: Arc<dyn DuisCodec>,
    ) -> GatewayClientBuilder {
        GatewayClientBuilder::new(base_url, transport, signer, codec)
    }

    /// Sign and transmit a command to the web service implied by its variant,
    /// then validate and classify the reply. A Transform Service success
    /// carrying a pre-command triggers the second phase: the pre-command is
    /// GBCS-signed under the originator's key and re-submitted to the Send
    /// Command Service with the counter preserved. An `I99` acknowledgement
    /// parks `context` in the configured pending store, keyed by the request
    /// id echoed in the reply, for the asynchronous response to pick up.
    /// `status` is invoked with a short phase label ahead of each externally
    /// visible step.
    pub async fn send(
        &self,
        command: Command,
        preserve_counter: bool,
        context: Option<&MessageContext>,
        status: &(dyn Fn(&str) + Sync),
    ) -> Result<Response, SendError> {
        let mut command = command;
        let mut preserve = preserve_counter;
        let mut phase = SendPhase::Sent;

        loop {
            let cv = command.header.command_variant;
            if !cv.supported() {
                return Err(SendError::Unsupported(cv));
            }
            let endpoint = cv.endpoint();
            let response = self.round_trip(&command, preserve, endpoint, status).await?;

            if phase == SendPhase::Sent
                && endpoint == ServiceEndpoint::Transform
                && response.header.is_success()
            {
                let pre_command = match &response.body {
                    crate::model::ResponseBody::ResponseMessage(message) => {
                        message.pre_command.clone()
                    }
                    _ => None,
                };
                let Some(pre_command) = pre_command else {
                    return Err(SendError::UnexpectedProtocolState {
                        endpoint: endpoint.to_string(),
                    });
                };

                phase = SendPhase::AwaitingPreCommandSign;
                tracing::debug!(?phase, request_id = %command.header.request_id.key(), "pre-command received");
                status(&format!("{endpoint}: signing pre-command"));
                let (gbcs, keys) = match (&self.gbcs, &self.keys) {
                    (Some(gbcs), Some(keys)) => (gbcs, keys),
                    _ => return Err(SendError::MissingGbcs),
                };
                let originator = command.header.request_id.originator_id;
                let signed = gbcs
                    .sign_precommand(originator, &pre_command.gbcs_payload, keys.clone())
                    .await
                    .map_err(SendError::Gbcs)?;

                command = Command {
                    header: CommandHeader {
                        request_id: command.header.request_id,
                        command_variant: CV_SIGNED_PRECOMMAND,
                        service_reference: command.header.service_reference.clone(),
                        service_reference_variant: command
                            .header
                            .service_reference_variant
                            .clone(),
                    },
                    body: serde_json::json!({
                        "SignedPreCommand": { "GBCSPayload": signed }
                    }),
                };
                // The continuation re-uses the first phase's counter.
                preserve = true;
                phase = SendPhase::Resent;
                continue;
            }

            if response.header.is_acknowledgement() {
                if let (Some(correlator), Some(context)) = (&self.correlator, context) {
                    correlator.store(response.header.request_id.as_ref(), context);
                }
            }
            return Ok(response);
        }
    }

    async fn round_trip(
        &self,
        command: &Command,
        preserve_counter: bool,
        endpoint: ServiceEndpoint,
        status: &(dyn Fn(&str) + Sync),
    ) -> Result<Response, SendError> {
        status(&format!("{endpoint}: signing"));
        let wire = self
            .codec
            .construct(command)
            .await
            .map_err(SendError::Signing)?;
        let signed = self
            .signer
            .sign(&wire, preserve_counter)
            .await
            .map_err(SendError::Signing)?;

        status(&format!("{endpoint}: requesting"));
        let mut headers: Vec<(String, String)> =
            self.headers.iter().filter_map(HeaderDef::resolve).collect();
        headers.push(("Content-Type".to_string(), XML_CONTENT_TYPE.to_string()));
        let url = format!("{}{}", self.base_url, endpoint.path());
        let reply = self
            .transport
            .post(&url, &headers, signed, self.timeout)
            .await
            .map_err(|detail| SendError::Transmit {
                endpoint: endpoint.to_string(),
                detail,
            })?;
        if !(200..300).contains(&reply.status) {
            return Err(SendError::Transmit {
                endpoint: endpoint.to_string(),
                detail: format!("http status {}", reply.status),
            });
        }
        if media_type(reply.content_type.as_deref()).as_deref() != Some(XML_CONTENT_TYPE) {
            return Err(SendError::ContentType {
                endpoint: endpoint.to_string(),
                found: reply.content_type,
            });
        }

        status(&format!("{endpoint}: validating"));
        let validated = self
            .signer
            .validate(&reply.body)
            .await
            .map_err(|e| SendError::Validation {
                endpoint: endpoint.to_string(),
                detail: e.to_string(),
            })?;
        self.codec
            .parse(&validated)
            .await
            .map_err(|e| SendError::Validation {
                endpoint: endpoint.to_string(),
                detail: e.to_string(),
            })
    }
}

/// Media type without parameters, lower-cased for comparison (media types are
/// case-insensitive); `Application/XML; charset=utf-8` still counts as XML
/// but `text/html` never does.
fn media_type(header: Option<&str>) -> Option<String> {
    header.map(|h| h.split(';').next().unwrap_or(h).trim().to_ascii_lowercase())
}

#[derive(Debug)]
pub enum SendError {
    Unsupported(CommandVariant),
    Signing(DuisError),
    Transport(String),
    Transmit { endpoint: String, detail: String },
    ContentType { endpoint: String, found: Option<String> },
    Validation { endpoint: String, detail: String },
    UnexpectedProtocolState { endpoint: String },
    Gbcs(GbcsError),
    MissingGbcs,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported(cv) => {
                write!(f, "tried to send a {cv} which the gateway does not support")
            }
            Self::Signing(err) => write!(f, "signing: {err}"),
            Self::Transport(detail) => write!(f, "transport setup: {detail}"),
            Self::Transmit { endpoint, detail } => write!(f, "{endpoint}: requesting: {detail}"),
            Self::ContentType { endpoint, found } => write!(
                f,
                "{endpoint}: unexpected response content type {}",
                found.as_deref().unwrap_or("(none)")
            ),
            Self::Validation { endpoint, detail } => write!(f, "{endpoint}: validating: {detail}"),
            Self::UnexpectedProtocolState { endpoint } => {
                write!(f, "{endpoint}: success response without expected pre-command")
            }
            Self::Gbcs(err) => write!(f, "pre-command signing: {err}"),
            Self::MissingGbcs => write!(f, "no gbcs signer configured for pre-command exchange"),
        }
    }
}

impl std::error::Error for SendError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duis::{JsonCodec, PassthroughSigner};
    use crate::keystore::{KeyMaterial, KeyRequest, KeyStoreError, KeyUsage};
    use crate::model::{
        Eui, PreCommand, RequestId, ResponseBody, ResponseHeader, ResponseMessage,
    };
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct RecordedCall {
        url: String,
        headers: Vec<(String, String)>,
        body: String,
    }

    struct MockTransport {
        calls: Mutex<Vec<RecordedCall>>,
        replies: Mutex<Vec<Result<TransportResponse, String>>>,
    }

    impl MockTransport {
        fn new(replies: Vec<Result<TransportResponse, String>>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                replies: Mutex::new(replies),
            })
        }

        fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn post(
            &self,
            url: &str,
            headers: &[(String, String)],
            body: String,
            _timeout: Duration,
        ) -> Result<TransportResponse, String> {
            self.calls.lock().unwrap().push(RecordedCall {
                url: url.to_string(),
                headers: headers.to_vec(),
                body,
            });
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                Err("no reply scripted".to_string())
            } else {
                replies.remove(0)
            }
        }
    }

    struct RecordingSigner {
        preserve_flags: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl crate::duis::DuisSigner for RecordingSigner {
        async fn sign(&self, body: &str, preserve_counter: bool) -> Result<String, DuisError> {
            self.preserve_flags.lock().unwrap().push(preserve_counter);
            Ok(body.to_string())
        }

        async fn validate(&self, body: &str) -> Result<String, DuisError> {
            Ok(body.to_string())
        }
    }

    struct MockGbcs;

    #[async_trait]
    impl GbcsService for MockGbcs {
        async fn decode(
            &self,
            _payload: &str,
            _keys: Arc<dyn KeyProvider>,
            _self_eui: Eui,
        ) -> Result<serde_json::Value, GbcsError> {
            Ok(serde_json::json!({}))
        }

        async fn sign_precommand(
            &self,
            _originator: Eui,
            payload: &str,
            _keys: Arc<dyn KeyProvider>,
        ) -> Result<String, GbcsError> {
            Ok(format!("signed:{payload}"))
        }
    }

    struct NoKeys;

    #[async_trait]
    impl KeyProvider for NoKeys {
        async fn resolve(
            &self,
            eui: Eui,
            usage: KeyUsage,
            request: KeyRequest,
        ) -> Result<KeyMaterial, KeyStoreError> {
            Err(KeyStoreError::NotFound { eui, usage, request })
        }
    }

    fn command(cv: u8) -> Command {
        Command {
            header: CommandHeader {
                request_id: RequestId::new(
                    "00-00-00-00-00-00-00-01".parse().unwrap(),
                    "00-00-00-00-00-00-00-02".parse().unwrap(),
                    7 << 32,
                ),
                command_variant: CommandVariant::new(cv).unwrap(),
                service_reference: "6.15".to_string(),
                service_reference_variant: "6.15.1".to_string(),
            },
            body: serde_json::json!({ "ReadDeviceConfiguration": {} }),
        }
    }

    fn xml_reply(response: &Response) -> Result<TransportResponse, String> {
        Ok(TransportResponse {
            status: 200,
            content_type: Some(XML_CONTENT_TYPE.to_string()),
            body: serde_json::to_string(response).unwrap(),
        })
    }

    fn response(code: &str, body: ResponseBody, echo: Option<RequestId>) -> Response {
        Response {
            header: ResponseHeader {
                response_code: code.to_string(),
                request_id: echo,
            },
            body,
        }
    }

    fn client(transport: Arc<MockTransport>) -> GatewayClient {
        GatewayClient::builder(
            "http://localhost:8079",
            transport,
            Arc::new(PassthroughSigner),
            Arc::new(JsonCodec),
        )
        .gbcs(Arc::new(MockGbcs), Arc::new(NoKeys))
        .build()
    }

    #[tokio::test]
    async fn unsupported_variants_are_rejected_before_any_network_call() {
        for cv in [3u8, 7] {
            let transport = MockTransport::new(Vec::new());
            let client = client(transport.clone());
            let err = client.send(command(cv), false, None, &|_| {}).await.unwrap_err();
            assert!(matches!(err, SendError::Unsupported(_)), "CV{cv}");
            assert!(transport.calls().is_empty(), "CV{cv} must not reach the wire");
        }
    }

    #[tokio::test]
    async fn endpoint_path_follows_variant_classification() {
        for (cv, path) in [(8u8, "/api/v1/serviceD"), (1, "/api/v1/serviceS")] {
            let transport = MockTransport::new(vec![xml_reply(&response(
                "I0",
                ResponseBody::Empty,
                None,
            ))]);
            let client = client(transport.clone());
            client.send(command(cv), false, None, &|_| {}).await.unwrap();
            let calls = transport.calls();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].url, format!("http://localhost:8079{path}"));
        }
    }

    #[tokio::test]
    async fn request_carries_xml_content_type_and_configured_headers() {
        let transport =
            MockTransport::new(vec![xml_reply(&response("I0", ResponseBody::Empty, None))]);
        let client = GatewayClient::builder(
            "http://localhost:8079",
            transport.clone(),
            Arc::new(PassthroughSigner),
            Arc::new(JsonCodec),
        )
        .headers(vec![HeaderDef {
            name: "X-Trace".to_string(),
            source: HeaderSource::Static("abc".to_string()),
        }])
        .build();
        client.send(command(1), false, None, &|_| {}).await.unwrap();
        let call = transport.calls().remove(0);
        assert!(call
            .headers
            .contains(&("Content-Type".to_string(), XML_CONTENT_TYPE.to_string())));
        assert!(call
            .headers
            .contains(&("X-Trace".to_string(), "abc".to_string())));
    }

    #[tokio::test]
    async fn wrong_content_type_is_terminal() {
        let transport = MockTransport::new(vec![Ok(TransportResponse {
            status: 200,
            content_type: Some("text/html".to_string()),
            body: "<html></html>".to_string(),
        })]);
        let client = client(transport);
        let err = client.send(command(1), false, None, &|_| {}).await.unwrap_err();
        assert!(matches!(err, SendError::ContentType { .. }));
    }

    #[tokio::test]
    async fn content_type_comparison_ignores_case() {
        let ok = response("I0", ResponseBody::Empty, None);
        let transport = MockTransport::new(vec![Ok(TransportResponse {
            status: 200,
            content_type: Some("Application/XML; charset=UTF-8".to_string()),
            body: serde_json::to_string(&ok).unwrap(),
        })]);
        let client = client(transport);
        assert!(client.send(command(1), false, None, &|_| {}).await.is_ok());
    }

    #[tokio::test]
    async fn content_type_parameters_are_tolerated() {
        let ok = response("I0", ResponseBody::Empty, None);
        let transport = MockTransport::new(vec![Ok(TransportResponse {
            status: 200,
            content_type: Some("application/xml; charset=utf-8".to_string()),
            body: serde_json::to_string(&ok).unwrap(),
        })]);
        let client = client(transport);
        assert!(client.send(command(1), false, None, &|_| {}).await.is_ok());
    }

    #[tokio::test]
    async fn non_2xx_status_is_a_transmit_error_with_phase_context() {
        let transport = MockTransport::new(vec![Ok(TransportResponse {
            status: 503,
            content_type: Some(XML_CONTENT_TYPE.to_string()),
            body: String::new(),
        })]);
        let client = client(transport);
        let err = client.send(command(1), false, None, &|_| {}).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("Send Command Service: requesting"), "{text}");
    }

    #[tokio::test]
    async fn transform_success_with_precommand_triggers_one_signed_resend() {
        let precommand = ResponseBody::ResponseMessage(ResponseMessage {
            service_reference_variant: "6.15.1".to_string(),
            gbcs_payload: None,
            pre_command: Some(PreCommand {
                gbcs_payload: "3QAA".to_string(),
            }),
            future_dated_device_alert: None,
        });
        let id = command(2).header.request_id;
        let transport = MockTransport::new(vec![
            xml_reply(&response("I0", precommand, Some(id))),
            xml_reply(&response("I99", ResponseBody::Empty, Some(id))),
        ]);
        let signer = Arc::new(RecordingSigner {
            preserve_flags: Mutex::new(Vec::new()),
        });
        let client = GatewayClient::builder(
            "http://localhost:8079",
            transport.clone(),
            signer.clone(),
            Arc::new(JsonCodec),
        )
        .gbcs(Arc::new(MockGbcs), Arc::new(NoKeys))
        .build();

        let labels = Mutex::new(Vec::new());
        let out = client
            .send(command(2), false, None, &|s| labels.lock().unwrap().push(s.to_string()))
            .await
            .unwrap();
        assert!(out.header.is_acknowledgement());

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].url, "http://localhost:8079/api/v1/serviceT");
        assert_eq!(calls[1].url, "http://localhost:8079/api/v1/serviceS");

        let resent: Command = serde_json::from_str(&calls[1].body).unwrap();
        assert_eq!(resent.header.command_variant, CV_SIGNED_PRECOMMAND);
        assert_eq!(resent.header.request_id, id);
        assert_eq!(
            resent.body["SignedPreCommand"]["GBCSPayload"],
            serde_json::json!("signed:3QAA")
        );
        assert_eq!(*signer.preserve_flags.lock().unwrap(), vec![false, true]);

        let labels = labels.lock().unwrap();
        assert!(labels.iter().any(|l| l == "Transform Service: signing"));
        assert!(labels.iter().any(|l| l == "Transform Service: requesting"));
        assert!(labels.iter().any(|l| l == "Transform Service: validating"));
        assert!(labels.iter().any(|l| l == "Send Command Service: requesting"));
    }

    #[tokio::test]
    async fn transform_success_without_precommand_fails_and_does_not_resend() {
        let body = ResponseBody::ResponseMessage(ResponseMessage {
            service_reference_variant: "6.15.1".to_string(),
            gbcs_payload: None,
            pre_command: None,
            future_dated_device_alert: None,
        });
        let transport = MockTransport::new(vec![xml_reply(&response("I0", body, None))]);
        let client = client(transport.clone());
        let err = client.send(command(2), false, None, &|_| {}).await.unwrap_err();
        assert!(matches!(err, SendError::UnexpectedProtocolState { .. }));
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn transform_non_success_is_returned_directly() {
        let transport =
            MockTransport::new(vec![xml_reply(&response("E20", ResponseBody::Empty, None))]);
        let client = client(transport.clone());
        let out = client.send(command(4), false, None, &|_| {}).await.unwrap();
        assert_eq!(out.header.response_code, "E20");
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn env_sourced_headers_resolve_at_send_time() {
        std::env::set_var("DUIS_BRIDGE_TEST_TOKEN", "sekrit");
        let transport =
            MockTransport::new(vec![xml_reply(&response("I0", ResponseBody::Empty, None))]);
        let client = GatewayClient::builder(
            "http://localhost:8079",
            transport.clone(),
            Arc::new(PassthroughSigner),
            Arc::new(JsonCodec),
        )
        .headers(vec![
            HeaderDef {
                name: "Authorization".to_string(),
                source: HeaderSource::Env("DUIS_BRIDGE_TEST_TOKEN".to_string()),
            },
            HeaderDef {
                name: "X-Missing".to_string(),
                source: HeaderSource::Env("DUIS_BRIDGE_UNSET_VAR".to_string()),
            },
        ])
        .build();
        client.send(command(1), false, None, &|_| {}).await.unwrap();
        let call = transport.calls().remove(0);
        assert!(call
            .headers
            .contains(&("Authorization".to_string(), "sekrit".to_string())));
        assert!(!call.headers.iter().any(|(n, _)| n == "X-Missing"));
    }

    fn context() -> MessageContext {
        MessageContext {
            correlation_id: Some(uuid::Uuid::new_v4()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn acknowledgement_parks_the_context_under_the_echoed_id() {
        let id = command(1).header.request_id;
        let transport =
            MockTransport::new(vec![xml_reply(&response("I99", ResponseBody::Empty, Some(id)))]);
        let correlator = Arc::new(PendingStore::new(None));
        let client = GatewayClient::builder(
            "http://localhost:8079",
            transport,
            Arc::new(PassthroughSigner),
            Arc::new(JsonCodec),
        )
        .correlator(correlator.clone())
        .build();

        let ctx = context();
        let out = client
            .send(command(1), false, Some(&ctx), &|_| {})
            .await
            .unwrap();
        assert!(out.header.is_acknowledgement());
        assert_eq!(correlator.len(), 1);
        assert_eq!(correlator.retrieve(Some(&id)), Some(ctx));
    }

    #[tokio::test]
    async fn immediate_success_stores_nothing() {
        let id = command(1).header.request_id;
        let transport =
            MockTransport::new(vec![xml_reply(&response("I0", ResponseBody::Empty, Some(id)))]);
        let correlator = Arc::new(PendingStore::new(None));
        let client = GatewayClient::builder(
            "http://localhost:8079",
            transport,
            Arc::new(PassthroughSigner),
            Arc::new(JsonCodec),
        )
        .correlator(correlator.clone())
        .build();

        client
            .send(command(1), false, Some(&context()), &|_| {})
            .await
            .unwrap();
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn acknowledged_context_is_reunited_with_the_asynchronous_response() {
        use crate::server::{handle_inbound, InboundEvent, ResponseBroker, ServerState};

        let id = command(1).header.request_id;
        let transport =
            MockTransport::new(vec![xml_reply(&response("I99", ResponseBody::Empty, Some(id)))]);
        let correlator = Arc::new(PendingStore::new(None));
        let client = GatewayClient::builder(
            "http://localhost:8079",
            transport,
            Arc::new(PassthroughSigner),
            Arc::new(JsonCodec),
        )
        .correlator(correlator.clone())
        .build();

        let ctx = context();
        client
            .send(command(1), false, Some(&ctx), &|_| {})
            .await
            .unwrap();
        assert_eq!(correlator.len(), 1);

        let broker = Arc::new(ResponseBroker::new());
        let (_sub, mut rx) = broker.subscribe();
        let state = ServerState {
            signer: Arc::new(PassthroughSigner),
            codec: Arc::new(JsonCodec),
            correlator: correlator.clone(),
            broker,
        };
        let delivery = serde_json::to_string(&response(
            "I0",
            ResponseBody::ResponseMessage(ResponseMessage {
                service_reference_variant: "6.15.1".to_string(),
                gbcs_payload: None,
                pre_command: None,
                future_dated_device_alert: None,
            }),
            Some(id),
        ))
        .unwrap();
        let status = handle_inbound(&state, Some("application/xml"), &delivery).await;
        assert_eq!(status, axum::http::StatusCode::NO_CONTENT);
        assert!(correlator.is_empty());
        match rx.recv().await.unwrap() {
            InboundEvent::Duis { context, .. } => assert_eq!(context, Some(ctx)),
            other => panic!("expected duis event, got {other:?}"),
        }
    }
}
