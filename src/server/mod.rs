use crate::correlator::PendingStore;
use crate::duis::{DuisCodec, DuisSigner};
use crate::model::{MessageContext, Response};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Tracks response-endpoint paths claimed by active configurations. Owned by
/// the hosting application and injected where needed; duplicate registration
/// is a setup-time error, never discovered at request time.
#[derive(Default)]
pub struct EndpointRegistry {
    used: Mutex<HashSet<String>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: &str) -> Result<(), RegistryError> {
        let mut used = self.used.lock().unwrap();
        if !used.insert(path.to_string()) {
            return Err(RegistryError::Duplicate(path.to_string()));
        }
        Ok(())
    }

    pub fn release(&self, path: &str) {
        self.used.lock().unwrap().remove(path);
    }
}

#[derive(Debug)]
pub enum RegistryError {
    Duplicate(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate(path) => {
                write!(f, "response endpoint {path} is already registered")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Event fanned out to subscribers when the response channel delivers
/// something.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Duis {
        response: Response,
        context: Option<MessageContext>,
    },
    Error {
        message: String,
    },
}

/// Explicit publish/subscribe fan-out for inbound responses. Subscriptions
/// are keyed so one subscriber can be revoked without disturbing the rest.
#[derive(Default)]
pub struct ResponseBroker {
    subscribers: Mutex<HashMap<Uuid, mpsc::UnboundedSender<InboundEvent>>>,
}

impl ResponseBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> (Uuid, mpsc::UnboundedReceiver<InboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.subscribers.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: &Uuid) {
        self.subscribers.lock().unwrap().remove(id);
    }

    pub fn publish(&self, event: InboundEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

pub struct ServerState {
    pub signer: Arc<dyn DuisSigner>,
    pub codec: Arc<dyn DuisCodec>,
    pub correlator: Arc<PendingStore<MessageContext>>,
    pub broker: Arc<ResponseBroker>,
}

/// Serve the configured inbound response endpoint until the shutdown signal
/// flips.
pub async fn start(
    addr: SocketAddr,
    response_endpoint: &str,
    state: Arc<ServerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = Router::new()
        .route(response_endpoint, post(inbound))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, endpoint = %response_endpoint, "inbound response endpoint listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    Ok(())
}

async fn inbound(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    handle_inbound(&state, content_type, &body).await
}

/// Validate, parse and dispatch one delivery from the response channel.
/// Well-formed responses are acknowledged with 204 and fanned out with the
/// correlated caller context consumed from the pending store; anything else
/// is a 400 published on the error event.
pub async fn handle_inbound(
    state: &ServerState,
    content_type: Option<&str>,
    body: &str,
) -> StatusCode {
    // Media types compare case-insensitively.
    let media = content_type.map(|h| h.split(';').next().unwrap_or(h).trim().to_ascii_lowercase());
    if media.as_deref() != Some("application/xml") {
        tracing::debug!(content_type = ?content_type, "inbound delivery with unexpected content type");
        state.broker.publish(InboundEvent::Error {
            message: format!("unexpected content type: {content_type:?}"),
        });
        return StatusCode::BAD_REQUEST;
    }

    let validated = match state.signer.validate(body).await {
        Ok(validated) => validated,
        Err(err) => {
            tracing::debug!(error = %err, "inbound delivery failed duis validation");
            state.broker.publish(InboundEvent::Error {
                message: err.to_string(),
            });
            return StatusCode::BAD_REQUEST;
        }
    };
    let response = match state.codec.parse(&validated).await {
        Ok(response) => response,
        Err(err) => {
            tracing::debug!(error = %err, "inbound delivery failed duis parse");
            state.broker.publish(InboundEvent::Error {
                message: err.to_string(),
            });
            return StatusCode::BAD_REQUEST;
        }
    };

    let context = state
        .correlator
        .retrieve(response.header.request_id.as_ref());
    state
        .broker
        .publish(InboundEvent::Duis { response, context });
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duis::{JsonCodec, PassthroughSigner};
    use crate::model::{RequestId, ResponseBody, ResponseHeader};

    fn state() -> (Arc<ServerState>, Arc<ResponseBroker>, Arc<PendingStore<MessageContext>>) {
        let broker = Arc::new(ResponseBroker::new());
        let correlator = Arc::new(PendingStore::new(None));
        let state = Arc::new(ServerState {
            signer: Arc::new(PassthroughSigner),
            codec: Arc::new(JsonCodec),
            correlator: correlator.clone(),
            broker: broker.clone(),
        });
        (state, broker, correlator)
    }

    fn request_id(counter: u64) -> RequestId {
        RequestId::new(
            "00-00-00-00-00-00-00-01".parse().unwrap(),
            "00-00-00-00-00-00-00-02".parse().unwrap(),
            counter,
        )
    }

    fn wire_response(code: &str, echo: Option<RequestId>) -> String {
        serde_json::to_string(&Response {
            header: ResponseHeader {
                response_code: code.to_string(),
                request_id: echo,
            },
            body: ResponseBody::Empty,
        })
        .unwrap()
    }

    #[test]
    fn registry_rejects_duplicate_paths() {
        let registry = EndpointRegistry::new();
        registry.register("/dccboxed/response").unwrap();
        assert!(registry.register("/dccboxed/response").is_err());
        registry.register("/other/response").unwrap();
    }

    #[test]
    fn released_path_can_be_registered_again() {
        let registry = EndpointRegistry::new();
        registry.register("/dccboxed/response").unwrap();
        registry.release("/dccboxed/response");
        registry.register("/dccboxed/response").unwrap();
    }

    #[tokio::test]
    async fn broker_fans_out_to_all_subscribers_and_revokes_cleanly() {
        let broker = ResponseBroker::new();
        let (id_a, mut rx_a) = broker.subscribe();
        let (_id_b, mut rx_b) = broker.subscribe();
        broker.publish(InboundEvent::Error {
            message: "one".to_string(),
        });
        assert!(matches!(rx_a.recv().await, Some(InboundEvent::Error { .. })));
        assert!(matches!(rx_b.recv().await, Some(InboundEvent::Error { .. })));

        broker.unsubscribe(&id_a);
        broker.publish(InboundEvent::Error {
            message: "two".to_string(),
        });
        assert!(matches!(rx_b.recv().await, Some(InboundEvent::Error { .. })));
        assert_eq!(broker.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned_on_publish() {
        let broker = ResponseBroker::new();
        let (_id, rx) = broker.subscribe();
        drop(rx);
        broker.publish(InboundEvent::Error {
            message: "gone".to_string(),
        });
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn valid_delivery_yields_204_and_duis_event_with_context() {
        let (state, broker, correlator) = state();
        let (_id, mut rx) = broker.subscribe();
        let id = request_id(4);
        let ctx = MessageContext {
            correlation_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        correlator.store(Some(&id), &ctx);

        let status = handle_inbound(
            &state,
            Some("application/xml"),
            &wire_response("I0", Some(id)),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        match rx.recv().await.unwrap() {
            InboundEvent::Duis { context, .. } => assert_eq!(context, Some(ctx)),
            other => panic!("expected duis event, got {other:?}"),
        }
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn delivery_without_request_id_dispatches_with_no_context() {
        let (state, broker, _correlator) = state();
        let (_id, mut rx) = broker.subscribe();
        let status =
            handle_inbound(&state, Some("application/xml"), &wire_response("I0", None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        match rx.recv().await.unwrap() {
            InboundEvent::Duis { context, .. } => assert!(context.is_none()),
            other => panic!("expected duis event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn acknowledged_request_context_reaches_the_dispatcher() {
        use crate::dispatch::{DispatchFilters, Dispatcher, Routed};
        use crate::model::ResponseMessage;
        use crate::status::StatusReporter;

        let (state, broker, correlator) = state();
        let (_sub, mut rx) = broker.subscribe();

        // The sender holds one pending entry after an I99 acknowledgement.
        let id = request_id(2 << 32);
        let ctx = MessageContext {
            correlation_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        correlator.store(Some(&id), &ctx);
        assert_eq!(correlator.len(), 1);

        let delivery = serde_json::to_string(&Response {
            header: ResponseHeader {
                response_code: "I0".to_string(),
                request_id: Some(id),
            },
            body: ResponseBody::ResponseMessage(ResponseMessage {
                service_reference_variant: "4.1.1".to_string(),
                gbcs_payload: None,
                pre_command: None,
                future_dated_device_alert: None,
            }),
        })
        .unwrap();
        let status = handle_inbound(&state, Some("application/xml"), &delivery).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(correlator.is_empty());

        let (response, context) = match rx.recv().await.unwrap() {
            InboundEvent::Duis { response, context } => (response, context),
            other => panic!("expected duis event, got {other:?}"),
        };
        let dispatcher = Dispatcher::new(DispatchFilters::all(), StatusReporter::new());
        match dispatcher.dispatch(response, context).await.routed {
            Routed::Response(msg) => assert_eq!(msg.context, ctx),
            other => panic!("expected response output, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_body_yields_400_and_error_event() {
        let (state, broker, _correlator) = state();
        let (_id, mut rx) = broker.subscribe();
        let status = handle_inbound(&state, Some("application/xml"), "<not a response>").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(matches!(rx.recv().await, Some(InboundEvent::Error { .. })));
    }

    #[tokio::test]
    async fn content_type_case_is_ignored() {
        let (state, _broker, _correlator) = state();
        let status = handle_inbound(
            &state,
            Some("Application/XML; charset=UTF-8"),
            &wire_response("I0", None),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn wrong_content_type_yields_400() {
        let (state, _broker, _correlator) = state();
        let status =
            handle_inbound(&state, Some("application/json"), &wire_response("I0", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
