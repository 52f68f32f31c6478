use crate::model::{Command, CommandHeader, CommandVariant, Eui, RequestId};
use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_TOU_RATES: usize = 48;

/// Minimal import-tariff schedule for the primary element. This is the
/// domain object callers hand over; conversion to the full service-request
/// body happens here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TariffSchedule {
    pub currency: String,
    /// Standing charge in the smallest currency unit per day.
    pub standing_charge: u32,
    pub element: TariffElement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TariffElement {
    TimeOfUse {
        prices: Vec<u32>,
    },
    Block {
        prices: Vec<u32>,
        /// Consumption thresholds between consecutive blocks; one fewer than
        /// prices.
        thresholds: Vec<u32>,
    },
}

/// Build an Update Import Tariff (Primary Element) request. The request id
/// must carry a fresh counter: the gateway assigns the low 32 bits itself.
pub fn build_update_import_tariff(
    tariff: &TariffSchedule,
    request_id: RequestId,
) -> Result<Command, BuildError> {
    if !request_id.has_fresh_counter() {
        return Err(BuildError::StaleCounter(request_id.counter));
    }
    if tariff.currency.len() != 3 {
        return Err(BuildError::BadTariff("currency must be an ISO 4217 code".to_string()));
    }
    let element = match &tariff.element {
        TariffElement::TimeOfUse { prices } => {
            if prices.is_empty() || prices.len() > MAX_TOU_RATES {
                return Err(BuildError::BadTariff(format!(
                    "time-of-use tariff needs 1..={MAX_TOU_RATES} prices, got {}",
                    prices.len()
                )));
            }
            serde_json::json!({ "TOUPrices": prices })
        }
        TariffElement::Block { prices, thresholds } => {
            if prices.is_empty() || thresholds.len() + 1 != prices.len() {
                return Err(BuildError::BadTariff(format!(
                    "block tariff needs thresholds between consecutive prices, got {} prices / {} thresholds",
                    prices.len(),
                    thresholds.len()
                )));
            }
            serde_json::json!({ "BlockPrices": prices, "BlockThresholds": thresholds })
        }
    };

    Ok(Command {
        header: CommandHeader {
            request_id,
            command_variant: CommandVariant::new(2).map_err(|e| BuildError::BadTariff(e.to_string()))?,
            service_reference: "1.1".to_string(),
            service_reference_variant: "1.1.1".to_string(),
        },
        body: serde_json::json!({
            "UpdateImportTariff": {
                "Currency": tariff.currency,
                "StandingCharge": tariff.standing_charge,
                "PrimaryElement": element,
            }
        }),
    })
}

/// A reusable command skeleton: everything but the addressing. Instantiation
/// stamps the originator/target pair and a fresh zero counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub command_variant: CommandVariant,
    pub service_reference: String,
    pub service_reference_variant: String,
    pub body: serde_json::Value,
}

impl CommandTemplate {
    pub fn instantiate(&self, originator_id: Eui, target_id: Eui) -> Command {
        Command {
            header: CommandHeader {
                request_id: RequestId::new(originator_id, target_id, 0),
                command_variant: self.command_variant,
                service_reference: self.service_reference.clone(),
                service_reference_variant: self.service_reference_variant.clone(),
            },
            body: self.body.clone(),
        }
    }

    /// Read Instantaneous Import Registers, the usual smoke-test request
    /// against a freshly commissioned meter.
    pub fn read_instantaneous_import_registers() -> Self {
        Self {
            command_variant: CommandVariant::new(1).expect("static variant"),
            service_reference: "4.1".to_string(),
            service_reference_variant: "4.1.1".to_string(),
            body: serde_json::json!({ "ReadInstantaneousImportRegisters": {} }),
        }
    }
}

#[derive(Debug)]
pub enum BuildError {
    StaleCounter(u64),
    BadTariff(String),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaleCounter(counter) => {
                write!(f, "counter {counter} has non-zero low word; builders only assign fresh counters")
            }
            Self::BadTariff(msg) => write!(f, "invalid tariff: {msg}"),
        }
    }
}

impl std::error::Error for BuildError {}
