use crate::config::Config;
use crate::correlator::PendingStore;
use crate::dispatch::{DispatchFilters, Dispatcher, ResponseFilter, Routed};
use crate::duis::{JsonCodec, PassthroughSigner};
use crate::gateway::{GatewayClient, HttpTransport};
use crate::gbcs::PassthroughGbcs;
use crate::keystore::{HttpRemoteKeyStore, KeyStore, RemoteKeyStore};
use crate::model::{Command, MessageContext};
use crate::server::{EndpointRegistry, InboundEvent, ResponseBroker, ServerState};
use crate::status::StatusReporter;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
        if command == "send" {
            return handle_send(&config).await;
        }
    }

    let registry = EndpointRegistry::new();
    registry.register(&config.server.response_endpoint)?;

    let signer = Arc::new(PassthroughSigner);
    let codec = Arc::new(JsonCodec);
    let gbcs = Arc::new(PassthroughGbcs);
    let keys = build_key_store(&config)?;
    let correlator = Arc::new(PendingStore::<MessageContext>::new(
        config.correlator.max_pending,
    ));
    let broker = Arc::new(ResponseBroker::new());
    let status = StatusReporter::new();

    let filters = DispatchFilters {
        responses: ResponseFilter::compile(&config.receive.responses.to_mode()?)?,
        device_alerts: ResponseFilter::compile(&config.receive.device_alerts.to_mode()?)?,
        dcc_alerts: ResponseFilter::compile(&config.receive.dcc_alerts.to_mode()?)?,
    };
    let mut dispatcher = Dispatcher::new(filters, status.clone())
        .notify_device_alerts(config.receive.notify_device_alerts);
    if config.receive.decode_gbcs {
        dispatcher = dispatcher.decode_gbcs(gbcs.clone(), keys.clone());
    }

    let (_subscription, mut events) = broker.subscribe();
    let dispatch_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                InboundEvent::Duis { response, context } => {
                    let outcome = dispatcher.dispatch(response, context).await;
                    if let Some(notification) = outcome.notification {
                        tracing::info!(%notification, "device alert");
                    }
                    match outcome.routed {
                        Routed::Response(msg) => {
                            tracing::info!(
                                code = %msg.response.header.response_code,
                                decoded = msg.gbcs.is_some(),
                                "service response"
                            );
                        }
                        Routed::DeviceAlert(msg) => {
                            tracing::info!(
                                code = %msg.response.header.response_code,
                                "device alert routed"
                            );
                        }
                        Routed::DccAlert(msg) => {
                            tracing::info!(
                                code = %msg.response.header.response_code,
                                "dcc alert routed"
                            );
                        }
                        Routed::Error(msg) => {
                            tracing::warn!(
                                code = %msg.response.header.response_code,
                                "error response"
                            );
                        }
                        Routed::Suppressed => {}
                    }
                }
                InboundEvent::Error { message } => {
                    tracing::warn!(%message, "inbound delivery rejected");
                }
            }
        }
    });

    let state = Arc::new(ServerState {
        signer,
        codec,
        correlator,
        broker,
    });

    let addr: SocketAddr = format!("0.0.0.0:{}", config.server.port).parse()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let result = tokio::select! {
        res = crate::server::start(addr, &config.server.response_endpoint, state, shutdown_rx) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown: ctrl-c");
            let _ = shutdown_tx.send(true);
            Ok(())
        }
    };

    dispatch_task.abort();
    registry.release(&config.server.response_endpoint);
    result
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

/// Locally configured keys backed by the gateway's SMKI interface unless the
/// remote lookup is switched off.
fn build_key_store(config: &Config) -> Result<Arc<KeyStore>, Box<dyn std::error::Error>> {
    let remote: Option<Box<dyn RemoteKeyStore>> = if config.keys.remote {
        Some(Box::new(HttpRemoteKeyStore::new(
            config.gateway.smki_base_url(),
            config.gateway.timeout(),
        )?))
    } else {
        None
    };
    Ok(Arc::new(KeyStore::new(config.local_keys()?, remote)))
}

/// One-shot send: read a service request from a JSON file, run it through the
/// full pipeline against the configured gateway and print the synchronous
/// response. Asynchronous follow-ups arrive on the response endpoint of a
/// running service instance.
async fn handle_send(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args()
        .nth(2)
        .ok_or("missing request file (usage: send <request.json>)")?;
    let command: Command = serde_json::from_str(&std::fs::read_to_string(&path)?)?;

    let keys = build_key_store(config)?;
    let correlator = Arc::new(PendingStore::<MessageContext>::new(
        config.correlator.max_pending,
    ));
    let client = GatewayClient::builder(
        config.gateway.duis_base_url(),
        Arc::new(HttpTransport::new()?),
        Arc::new(PassthroughSigner),
        Arc::new(JsonCodec),
    )
    .gbcs(Arc::new(PassthroughGbcs), keys)
    .correlator(correlator)
    .headers(config.gateway.header_defs())
    .timeout(config.gateway.timeout())
    .build();

    let context = MessageContext {
        correlation_id: Some(uuid::Uuid::new_v4()),
        request: Some(command.clone()),
        ..Default::default()
    };
    let response = client
        .send(command, false, Some(&context), &|label| {
            tracing::info!(%label)
        })
        .await?;
    if response.header.is_acknowledgement() {
        tracing::info!("request acknowledged; the final result is delivered to the response endpoint of a running service instance");
    }
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
