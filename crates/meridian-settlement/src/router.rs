//! # Payment Router
//!
//! Entry point for the register: quotes a checkout, takes the fast path when
//! discounts cover it, and otherwise dispatches to the tender's handler.
//!
//! ## Dispatch
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  CheckoutRequest ──► quote()                                            │
//! │                        │                                                │
//! │         final_total ≤ 0 ? ──yes──► loyalty_only ──┐                     │
//! │                        │ no                        │                    │
//! │      ┌────────────┬────┴───────┬─────────────┐     │                    │
//! │      ▼            ▼            ▼             ▼     │                    │
//! │    cash       gift_card    card (hosted)   reader  │                    │
//! │      │            │        begin ─► pending map    │                    │
//! │      │            │        finalize ◄─ confirm     │                    │
//! │      └────────────┴────────────┴─────────────┴─────┤                    │
//! │                                                    ▼                    │
//! │                                     CompletionSink::on_settled()        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Pending hosted checkouts older than `gateway.pending_ttl_secs` are swept
//! by [`PaymentRouter::expire_pending`], which also runs whenever a new card
//! checkout begins.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use meridian_core::Money;

use crate::checkout::{prepare, quote, Checkout, CheckoutRequest, Quote};
use crate::context::SettlementContext;
use crate::error::{SettlementError, SettlementResult};
use crate::handlers::card::PendingCheckout;
use crate::handlers::{card, cash, gift_card, loyalty_only, reader};
use crate::outcome::SettlementOutcome;
use crate::ports::{CardDetails, CompletionSink, NoOpCompletion, PaymentGateway, TerminalService};

/// Result of starting a hosted card checkout.
#[derive(Debug)]
pub enum CardCheckout {
    /// Nothing to charge; already written.
    Settled(SettlementOutcome),
    /// Hand `client_secret` to the hosted form, then call
    /// [`PaymentRouter::finalize_card_payment`] with `pending_id`.
    AwaitingConfirmation {
        pending_id: String,
        client_secret: String,
        amount_to_charge: Money,
    },
}

pub struct PaymentRouter {
    ctx: SettlementContext,
    gateway: Arc<dyn PaymentGateway>,
    terminal: Arc<dyn TerminalService>,
    completion: Arc<dyn CompletionSink>,
    pending: Mutex<HashMap<String, PendingCheckout>>,
}

impl PaymentRouter {
    pub fn new(
        ctx: SettlementContext,
        gateway: Arc<dyn PaymentGateway>,
        terminal: Arc<dyn TerminalService>,
    ) -> Self {
        PaymentRouter {
            ctx,
            gateway,
            terminal,
            completion: Arc::new(NoOpCompletion),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_completion(mut self, completion: Arc<dyn CompletionSink>) -> Self {
        self.completion = completion;
        self
    }

    pub fn context(&self) -> &SettlementContext {
        &self.ctx
    }

    /// Totals and loyalty figures for the current cart. Writes nothing.
    pub async fn preview(&self, request: &CheckoutRequest) -> SettlementResult<Quote> {
        quote(&self.ctx, request).await
    }

    // =========================================================================
    // Tenders
    // =========================================================================

    pub async fn settle_cash(
        &self,
        request: CheckoutRequest,
        cash_tendered: Option<Money>,
    ) -> SettlementResult<SettlementOutcome> {
        let checkout = prepare(&self.ctx, request).await?;
        if let Some(outcome) = self.fast_path(&checkout).await? {
            return Ok(outcome);
        }
        let outcome = cash::settle(&self.ctx, &checkout, cash_tendered).await?;
        self.complete(outcome).await
    }

    pub async fn settle_gift_card(
        &self,
        request: CheckoutRequest,
        card_id: &str,
    ) -> SettlementResult<SettlementOutcome> {
        let checkout = prepare(&self.ctx, request).await?;
        if let Some(outcome) = self.fast_path(&checkout).await? {
            return Ok(outcome);
        }
        let outcome = gift_card::settle(&self.ctx, &checkout, card_id).await?;
        self.complete(outcome).await
    }

    /// Starts a hosted card checkout.
    pub async fn begin_card_payment(&self, request: CheckoutRequest) -> SettlementResult<CardCheckout> {
        self.expire_pending().await;

        let checkout = prepare(&self.ctx, request).await?;
        if let Some(outcome) = self.fast_path(&checkout).await? {
            return Ok(CardCheckout::Settled(outcome));
        }

        let pending = card::begin(&self.ctx, self.gateway.as_ref(), checkout).await?;
        if pending.is_free() {
            let outcome = card::finalize(&self.ctx, &pending, None, None).await?;
            return Ok(CardCheckout::Settled(self.complete(outcome).await?));
        }

        let client_secret = pending
            .client_secret
            .clone()
            .ok_or_else(|| SettlementError::Internal("payment intent without a client secret".into()))?;
        let pending_id = pending.id().to_string();
        let amount_to_charge = pending.amount_to_charge();

        self.pending.lock().await.insert(pending_id.clone(), pending);
        debug!(pending_id = %pending_id, "Card checkout awaiting confirmation");

        Ok(CardCheckout::AwaitingConfirmation {
            pending_id,
            client_secret,
            amount_to_charge,
        })
    }

    /// Settles a hosted card checkout after the gateway confirmed payment.
    ///
    /// A retryable failure puts the checkout back under the same id so the
    /// call can be repeated against the same payment. Any other failure
    /// drops it and queues the payment as unsettled for an operator.
    pub async fn finalize_card_payment(
        &self,
        pending_id: &str,
        gateway_payment_id: Option<&str>,
    ) -> SettlementResult<SettlementOutcome> {
        // out of the map while writing, so a second confirmation cannot race it
        let mut pending = self
            .pending
            .lock()
            .await
            .remove(pending_id)
            .ok_or_else(|| SettlementError::not_found("PendingTransaction", pending_id))?;

        let payment_id = pending.payment_id_for(gateway_payment_id);
        let finalized = card::finalize(&self.ctx, &pending, payment_id.clone(), None::<CardDetails>).await;

        match finalized {
            Ok(outcome) => self.complete(outcome).await,
            Err(e) if e.is_retryable() => {
                warn!(
                    pending_id = %pending_id,
                    code = ?e.code(),
                    error = %e,
                    "Card checkout not settled; kept for retry"
                );
                if payment_id.is_some() {
                    pending.confirmed_payment_id = payment_id;
                }
                self.pending.lock().await.insert(pending_id.to_string(), pending);
                Err(e)
            }
            Err(e) => {
                if let Some(payment_id) = payment_id.filter(|_| !pending.is_free()) {
                    card::record_unsettled(&self.ctx, &pending, &payment_id, &e).await;
                }
                Err(e)
            }
        }
    }

    /// Charges through a card reader at the shift's location.
    pub async fn charge_card_present(&self, request: CheckoutRequest) -> SettlementResult<SettlementOutcome> {
        let checkout = prepare(&self.ctx, request).await?;
        if let Some(outcome) = self.fast_path(&checkout).await? {
            return Ok(outcome);
        }
        let outcome = reader::charge(&self.ctx, self.terminal.as_ref(), checkout).await?;
        self.complete(outcome).await
    }

    /// Drops a pending card checkout. Returns false when it was unknown.
    pub async fn abandon(&self, pending_id: &str) -> SettlementResult<bool> {
        match self.pending.lock().await.remove(pending_id) {
            Some(pending) => {
                pending.abandon()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Drops pending card checkouts older than `gateway.pending_ttl_secs`
    /// and returns how many went. One whose confirmation failed to settle
    /// is queued as an unsettled payment first.
    pub async fn expire_pending(&self) -> usize {
        let ttl = self.ctx.config().gateway.pending_ttl();
        let now = Utc::now();

        let expired: Vec<PendingCheckout> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| (now - p.pending.created_at).to_std().is_ok_and(|age| age >= ttl))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let count = expired.len();
        for pending in expired {
            if let Some(payment_id) = pending.confirmed_payment_id.clone() {
                let cause = SettlementError::Internal("card checkout expired before it settled".into());
                card::record_unsettled(&self.ctx, &pending, &payment_id, &cause).await;
            }
            let pending_id = pending.id().to_string();
            if let Err(e) = pending.abandon() {
                warn!(pending_id = %pending_id, error = %e, "Expired card checkout could not be abandoned");
            }
        }

        if count > 0 {
            info!(expired = count, "Expired pending card checkouts");
        }
        count
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn fast_path(&self, checkout: &Checkout) -> SettlementResult<Option<SettlementOutcome>> {
        if !checkout.quote.is_zero_dollar() {
            return Ok(None);
        }
        info!(key = %checkout.idempotency_key(), "Discounts cover the purchase; taking the fast path");
        let outcome = loyalty_only::settle(&self.ctx, checkout).await?;
        self.complete(outcome).await.map(Some)
    }

    async fn complete(&self, outcome: SettlementOutcome) -> SettlementResult<SettlementOutcome> {
        self.completion.on_settled(&outcome).await;
        Ok(outcome)
    }
}
