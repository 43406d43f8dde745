//! # External Ports
//!
//! Traits for the collaborators the engine calls but does not own.
//!
//! ## Collaborators
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  PaymentRouter                                                          │
//! │       │                                                                 │
//! │       ├──► PaymentGateway    create_payment_intent(amount, metadata)    │
//! │       │                        → { id, client_secret }                  │
//! │       │                                                                 │
//! │       ├──► TerminalService   list_readers()                             │
//! │       │                      connect_by_id(reader_id)                   │
//! │       │                      process_payment(reader, amount, desc)      │
//! │       │                        → { status, payment_intent_id, card }    │
//! │       │                                                                 │
//! │       └──► CompletionSink    on_settled(outcome)                        │
//! │                                (register clears its cart here)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every remote call goes through [`with_timeout`], so a hung gateway
//! surfaces as [`GatewayError::Timeout`] instead of a stuck checkout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use meridian_core::Money;

use crate::outcome::SettlementOutcome;

// =============================================================================
// Gateway Errors
// =============================================================================

/// Failure reported by the payment gateway or terminal service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// The card was declined.
    #[error("Payment declined: {reason}")]
    Declined { reason: String },

    /// The service could not be reached.
    #[error("Payment service unavailable: {0}")]
    Unavailable(String),

    #[error("Payment service did not answer within {secs} seconds")]
    Timeout { secs: u64 },

    /// The request was rejected as malformed.
    #[error("Payment request rejected: {0}")]
    Rejected(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Unavailable(_) | GatewayError::Timeout { .. } | GatewayError::Declined { .. }
        )
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Runs a remote call with a deadline.
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> GatewayResult<T>
where
    F: Future<Output = GatewayResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout {
            secs: timeout.as_secs(),
        }),
    }
}

// =============================================================================
// Payment Gateway (hosted card)
// =============================================================================

/// Metadata attached to a payment intent so the gateway dashboard can be
/// matched back to the checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentMetadata {
    pub pending_id: String,
    pub idempotency_key: String,
    pub customer_id: Option<String>,
    pub shift_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntent {
    pub id: String,
    /// Handed to the hosted payment form.
    pub client_secret: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_intent(
        &self,
        amount: Money,
        metadata: &IntentMetadata,
    ) -> GatewayResult<PaymentIntent>;
}

// =============================================================================
// Terminal Service (card reader)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reader {
    pub id: String,
    pub label: String,
    pub location_id: Option<String>,
    pub status: ReaderStatus,
}

impl Reader {
    pub fn is_online(&self) -> bool {
        self.status == ReaderStatus::Online
    }
}

/// Terminal payment status. Only `Succeeded` settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalPaymentStatus {
    Succeeded,
    RequiresPaymentMethod,
    Canceled,
    Failed,
}

impl std::fmt::Display for TerminalPaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalPaymentStatus::Succeeded => write!(f, "succeeded"),
            TerminalPaymentStatus::RequiresPaymentMethod => write!(f, "requires_payment_method"),
            TerminalPaymentStatus::Canceled => write!(f, "canceled"),
            TerminalPaymentStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardDetails {
    pub last4: String,
    pub brand: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalPayment {
    pub status: TerminalPaymentStatus,
    pub payment_intent_id: String,
    pub card: Option<CardDetails>,
}

#[async_trait]
pub trait TerminalService: Send + Sync {
    async fn list_readers(&self) -> GatewayResult<Vec<Reader>>;

    async fn connect_by_id(&self, reader_id: &str) -> GatewayResult<Reader>;

    async fn process_payment(
        &self,
        reader_id: &str,
        amount: Money,
        description: &str,
    ) -> GatewayResult<TerminalPayment>;
}

// =============================================================================
// Completion Sink
// =============================================================================

/// Receives every settled checkout.
///
/// Called after the write sequence, warnings included. The register
/// clears its cart and shows the transaction id here.
#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn on_settled(&self, outcome: &SettlementOutcome);
}

/// Sink that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpCompletion;

#[async_trait]
impl CompletionSink for NoOpCompletion {
    async fn on_settled(&self, _outcome: &SettlementOutcome) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: GatewayResult<()> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert_eq!(result, Err(GatewayError::Timeout { secs: 0 }));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let result = with_timeout(Duration::from_secs(1), async {
            Err::<(), _>(GatewayError::Declined {
                reason: "do_not_honor".into(),
            })
        })
        .await;

        assert!(matches!(result, Err(GatewayError::Declined { .. })));
    }
}
