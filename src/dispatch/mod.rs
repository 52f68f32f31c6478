use crate::gbcs::{alert_code_name, GbcsService};
use crate::keystore::KeyProvider;
use crate::model::{MessageContext, Response, ResponseBody, BOXED_SELF_EUI};
use crate::status::{StatusLevel, StatusReporter};
use regex::Regex;
use std::fmt;
use std::sync::Arc;

/// Filter configuration for one response kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterMode {
    /// Kind disabled outright; matches nothing.
    None,
    /// Matches everything.
    All,
    /// Comma-separated literal allow-list, each entry matched exactly.
    List(String),
    /// Raw regular expression.
    Regex(String),
}

/// Compiled per-kind filter. `None` keeps the kind disabled rather than
/// carrying a never-matching regex around.
#[derive(Debug, Clone)]
pub struct ResponseFilter {
    re: Option<Regex>,
}

impl ResponseFilter {
    pub fn compile(mode: &FilterMode) -> Result<Self, FilterError> {
        let re = match mode {
            FilterMode::None => None,
            FilterMode::All => Some(Regex::new(".*").expect("static regex")),
            FilterMode::List(items) => {
                let escaped: Vec<String> = items
                    .split(',')
                    .map(|s| regex::escape(s.trim()))
                    .collect();
                let pattern = format!("^({})$", escaped.join("|"));
                Some(Regex::new(&pattern).expect("escaped literals"))
            }
            FilterMode::Regex(raw) => {
                Some(Regex::new(raw).map_err(|e| FilterError(e.to_string()))?)
            }
        };
        Ok(Self { re })
    }

    pub fn enabled(&self) -> bool {
        self.re.is_some()
    }

    pub fn matches(&self, value: &str) -> bool {
        match &self.re {
            Some(re) => re.is_match(value),
            None => false,
        }
    }
}

#[derive(Debug)]
pub struct FilterError(String);

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid response filter: {}", self.0)
    }
}

impl std::error::Error for FilterError {}

#[derive(Debug, Clone)]
pub struct DispatchFilters {
    pub responses: ResponseFilter,
    pub device_alerts: ResponseFilter,
    pub dcc_alerts: ResponseFilter,
}

impl DispatchFilters {
    pub fn all() -> Self {
        let all = ResponseFilter::compile(&FilterMode::All).expect("static filter");
        Self {
            responses: all.clone(),
            device_alerts: all.clone(),
            dcc_alerts: all,
        }
    }
}

/// An inbound response routed to one of the typed outputs, carrying the
/// caller context recovered from the correlator.
#[derive(Debug, Clone)]
pub struct DispatchMessage {
    pub context: MessageContext,
    pub response: Response,
    pub gbcs: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub enum Routed {
    Response(DispatchMessage),
    DeviceAlert(DispatchMessage),
    DccAlert(DispatchMessage),
    Error(DispatchMessage),
    /// Filtered out, dropped after a decode failure, or unrecognized shape.
    Suppressed,
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub routed: Routed,
    /// Human-readable device-alert notification, when enabled and resolvable.
    pub notification: Option<String>,
}

pub struct Dispatcher {
    filters: DispatchFilters,
    decode_gbcs: bool,
    notify_device_alerts: bool,
    gbcs: Option<Arc<dyn GbcsService>>,
    keys: Option<Arc<dyn KeyProvider>>,
    status: StatusReporter,
}

impl Dispatcher {
    pub fn new(filters: DispatchFilters, status: StatusReporter) -> Self {
        Self {
            filters,
            decode_gbcs: false,
            notify_device_alerts: false,
            gbcs: None,
            keys: None,
            status,
        }
    }

    pub fn decode_gbcs(mut self, gbcs: Arc<dyn GbcsService>, keys: Arc<dyn KeyProvider>) -> Self {
        self.decode_gbcs = true;
        self.gbcs = Some(gbcs);
        self.keys = Some(keys);
        self
    }

    pub fn notify_device_alerts(mut self, enabled: bool) -> Self {
        self.notify_device_alerts = enabled;
        self
    }

    /// Route one asynchronously received response. `context` is whatever the
    /// correlator held for the echoed request id; unsolicited responses come
    /// through with `None` and are dispatched against an empty context.
    pub async fn dispatch(
        &self,
        response: Response,
        context: Option<MessageContext>,
    ) -> DispatchOutcome {
        if self.filtered_out(&response) {
            return DispatchOutcome {
                routed: Routed::Suppressed,
                notification: None,
            };
        }

        let level = if response.header.is_informational() {
            StatusLevel::Ok
        } else {
            StatusLevel::Warn
        };
        self.status.set(
            level,
            format!("result code: {}", response.header.response_code),
        );
        let context = context.unwrap_or_default();

        if !response.header.is_success() {
            return DispatchOutcome {
                routed: Routed::Error(DispatchMessage {
                    context,
                    response,
                    gbcs: None,
                }),
                notification: None,
            };
        }

        match response.body.clone() {
            ResponseBody::ResponseMessage(message) => {
                self.status.set(
                    StatusLevel::Ok,
                    format!("device response: {}", message.service_reference_variant),
                );
                let payload = message
                    .gbcs_payload
                    .clone()
                    .or_else(|| message.future_dated_device_alert.clone().map(|a| a.gbcs_payload));
                let gbcs = match payload {
                    Some(payload) => match self.try_decode(&payload).await {
                        DecodeOutcome::Decoded(value) => Some(value),
                        DecodeOutcome::Skipped => None,
                        DecodeOutcome::Failed => {
                            return DispatchOutcome {
                                routed: Routed::Suppressed,
                                notification: None,
                            }
                        }
                    },
                    None => None,
                };
                DispatchOutcome {
                    routed: Routed::Response(DispatchMessage {
                        context,
                        response,
                        gbcs,
                    }),
                    notification: None,
                }
            }
            ResponseBody::DeviceAlert(alert) => {
                self.status.set(
                    StatusLevel::Ok,
                    format!("device alert code: {}", alert.alert_code),
                );
                let gbcs = match &alert.gbcs_payload {
                    Some(payload) => match self.try_decode(payload).await {
                        DecodeOutcome::Decoded(value) => Some(value),
                        DecodeOutcome::Skipped => None,
                        DecodeOutcome::Failed => {
                            return DispatchOutcome {
                                routed: Routed::Suppressed,
                                notification: None,
                            }
                        }
                    },
                    None => None,
                };
                let notification = if self.notify_device_alerts {
                    alert_code_name(&alert.alert_code)
                        .map(|name| format!("Device Alert: {name}"))
                } else {
                    None
                };
                DispatchOutcome {
                    routed: Routed::DeviceAlert(DispatchMessage {
                        context,
                        response,
                        gbcs,
                    }),
                    notification,
                }
            }
            ResponseBody::DccAlert(alert) => {
                self.status.set(
                    StatusLevel::Ok,
                    format!("dcc alert code: {}", alert.dcc_alert_code),
                );
                DispatchOutcome {
                    routed: Routed::DccAlert(DispatchMessage {
                        context,
                        response,
                        gbcs: None,
                    }),
                    notification: None,
                }
            }
            ResponseBody::Empty => {
                tracing::warn!(
                    code = %response.header.response_code,
                    "unrecognized response shape, emitting nothing"
                );
                DispatchOutcome {
                    routed: Routed::Suppressed,
                    notification: None,
                }
            }
        }
    }

    fn filtered_out(&self, response: &Response) -> bool {
        match &response.body {
            ResponseBody::ResponseMessage(m) => {
                !self.filters.responses.matches(&m.service_reference_variant)
            }
            ResponseBody::DeviceAlert(a) => !self.filters.device_alerts.matches(&a.alert_code),
            ResponseBody::DccAlert(a) => !self.filters.dcc_alerts.matches(&a.dcc_alert_code),
            ResponseBody::Empty => false,
        }
    }

    async fn try_decode(&self, payload: &str) -> DecodeOutcome {
        if !self.decode_gbcs {
            return DecodeOutcome::Skipped;
        }
        let (gbcs, keys) = match (&self.gbcs, &self.keys) {
            (Some(gbcs), Some(keys)) => (gbcs, keys),
            _ => return DecodeOutcome::Skipped,
        };
        let self_eui = BOXED_SELF_EUI.parse().expect("well-known eui constant");
        match gbcs.decode(payload, keys.clone(), self_eui).await {
            Ok(value) => DecodeOutcome::Decoded(value),
            Err(err) => {
                // Local failure only; the primary response flow is not
                // surfaced on any output channel for a broken enrichment.
                tracing::error!(error = %err, "gbcs payload decode failed");
                DecodeOutcome::Failed
            }
        }
    }
}

enum DecodeOutcome {
    Decoded(serde_json::Value),
    Skipped,
    Failed,
}
