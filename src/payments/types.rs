use crate::payments::error::GatewayError;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Status of a PIX charge as reported by the payments backend.
///
/// Parsing is lenient: any value outside the known set becomes
/// [`ChargeStatus::Unknown`] and is treated as non-terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(from = "String", into = "String")]
pub enum ChargeStatus {
    Pending,
    Processing,
    Paid,
    Confirmed,
    Failed,
    Cancelled,
    Expired,
    Unknown(String),
}

impl ChargeStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ChargeStatus::Pending => "pending",
            ChargeStatus::Processing => "processing",
            ChargeStatus::Paid => "paid",
            ChargeStatus::Confirmed => "confirmed",
            ChargeStatus::Failed => "failed",
            ChargeStatus::Cancelled => "cancelled",
            ChargeStatus::Expired => "expired",
            ChargeStatus::Unknown(raw) => raw.as_str(),
        }
    }

    /// `paid` and `confirmed` both mean the money has settled.
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, ChargeStatus::Paid | ChargeStatus::Confirmed)
    }

    /// Terminal, but the payment did not go through.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            ChargeStatus::Failed | ChargeStatus::Cancelled | ChargeStatus::Expired
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.is_terminal_success() || self.is_terminal_failure()
    }
}

impl std::fmt::Display for ChargeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChargeStatus {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let status = match value.trim().to_lowercase().as_str() {
            "pending" => ChargeStatus::Pending,
            "processing" => ChargeStatus::Processing,
            "paid" => ChargeStatus::Paid,
            "confirmed" => ChargeStatus::Confirmed,
            "failed" => ChargeStatus::Failed,
            "cancelled" | "canceled" => ChargeStatus::Cancelled,
            "expired" => ChargeStatus::Expired,
            other => ChargeStatus::Unknown(other.to_string()),
        };
        Ok(status)
    }
}

impl From<String> for ChargeStatus {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(status) => status,
            Err(never) => match never {},
        }
    }
}

impl From<ChargeStatus> for String {
    fn from(value: ChargeStatus) -> Self {
        value.as_str().to_string()
    }
}

/// Which lookup the backend should use for a charge.
///
/// Internal ids are the backend's own payment record ids; external ids are
/// issued by the PIX gateway. The two namespaces never mix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ChargeRef {
    Internal(String),
    External(String),
}

impl ChargeRef {
    pub fn internal(id: impl Into<String>) -> Result<Self, GatewayError> {
        let id = id.into();
        validate_id(&id, "internal_id")?;
        Ok(ChargeRef::Internal(id))
    }

    pub fn external(id: impl Into<String>) -> Result<Self, GatewayError> {
        let id = id.into();
        validate_id(&id, "external_id")?;
        Ok(ChargeRef::External(id))
    }

    /// Builds a reference from a record that may carry both identifiers.
    ///
    /// The gateway-issued external id wins when both are present.
    pub fn from_identifiers(
        internal_id: Option<&str>,
        external_id: Option<&str>,
    ) -> Result<Self, GatewayError> {
        fn non_empty(v: Option<&str>) -> Option<&str> {
            v.map(str::trim).filter(|v| !v.is_empty())
        }

        match (non_empty(internal_id), non_empty(external_id)) {
            (_, Some(external)) => Ok(ChargeRef::External(external.to_string())),
            (Some(internal), None) => Ok(ChargeRef::Internal(internal.to_string())),
            (None, None) => Err(GatewayError::ValidationError {
                message: "internal_id or external_id is required".to_string(),
                field: Some("charge_ref".to_string()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ChargeRef::Internal(id) | ChargeRef::External(id) => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChargeRef::Internal(_) => "internal",
            ChargeRef::External(_) => "external",
        }
    }
}

impl std::fmt::Display for ChargeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

fn validate_id(id: &str, field: &str) -> Result<(), GatewayError> {
    if id.trim().is_empty() {
        return Err(GatewayError::ValidationError {
            message: format!("{} cannot be empty", field),
            field: Some(field.to_string()),
        });
    }
    Ok(())
}

/// Body returned by both status lookups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusResult {
    #[serde(alias = "charge_id", alias = "id")]
    pub charge_id: String,
    pub status: ChargeStatus,
    pub amount: BigDecimal,
    #[serde(default, alias = "base_amount", skip_serializing_if = "Option::is_none")]
    pub base_amount: Option<BigDecimal>,
    #[serde(default, alias = "due_date", skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A PIX charge as the payment view sees it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PixCharge {
    pub charge_ref: ChargeRef,
    pub amount: BigDecimal,
    pub base_amount: BigDecimal,
    pub status: ChargeStatus,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PixCharge {
    /// Late fee included in `amount`; never negative.
    pub fn late_fee(&self) -> BigDecimal {
        let fee = &self.amount - &self.base_amount;
        if fee < BigDecimal::from(0) {
            BigDecimal::from(0)
        } else {
            fee
        }
    }

    /// Expiry used for the countdown. Falls back to `now + default_expiry`
    /// when the backend sent none.
    pub fn effective_expires_at(
        &self,
        now: DateTime<Utc>,
        default_expiry: Duration,
    ) -> DateTime<Utc> {
        self.expires_at.unwrap_or_else(|| {
            now + ChronoDuration::from_std(default_expiry).unwrap_or(ChronoDuration::minutes(30))
        })
    }

    pub fn remaining(&self, now: DateTime<Utc>, default_expiry: Duration) -> Duration {
        self.effective_expires_at(now, default_expiry)
            .signed_duration_since(now)
            .to_std()
            .unwrap_or_default()
    }

    /// Only an explicit expiry can expire a charge.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// What the local record store keeps per charge, keyed by the id the
/// consumer polled with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRecord {
    pub charge_id: String,
    pub charge_ref: ChargeRef,
    /// Id echoed by the backend, when it sent a non-empty one.
    pub gateway_charge_id: Option<String>,
    pub status: ChargeStatus,
    pub amount: BigDecimal,
    pub base_amount: Option<BigDecimal>,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRecord {
    pub fn from_status(
        charge_ref: &ChargeRef,
        result: &StatusResult,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let echoed = result.charge_id.trim();
        Self {
            charge_id: charge_ref.id().to_string(),
            charge_ref: charge_ref.clone(),
            gateway_charge_id: (!echoed.is_empty()).then(|| echoed.to_string()),
            status: result.status.clone(),
            amount: result.amount.clone(),
            base_amount: result.base_amount.clone(),
            expires_at,
            updated_at: Utc::now(),
        }
    }
}
