//! In-person card payment through a terminal reader.
//!
//! No payment intent: the terminal captures the charge and the checkout is
//! finalized through the hosted-card write path. A capture that cannot be
//! written is queued as an unsettled payment.

use tracing::{debug, info, warn};

use meridian_core::PaymentMethod;

use super::card::{finalize, prepare, record_unsettled};
use super::fail_on_error;
use crate::checkout::Checkout;
use crate::context::SettlementContext;
use crate::error::{SettlementError, SettlementResult};
use crate::outcome::SettlementOutcome;
use crate::ports::{with_timeout, Reader, TerminalPaymentStatus, TerminalService};

pub(crate) async fn charge(
    ctx: &SettlementContext,
    terminal: &dyn TerminalService,
    checkout: Checkout,
) -> SettlementResult<SettlementOutcome> {
    let location_id = checkout
        .request
        .shift
        .as_ref()
        .map(|s| s.location_id.clone())
        .unwrap_or_else(|| ctx.config().register.location_id.clone());

    let mut pending = prepare(ctx, checkout, PaymentMethod::CardPresent).await?;
    if pending.is_free() {
        return finalize(ctx, &pending, None, None).await;
    }

    let timeout = ctx.config().gateway.request_timeout();
    let amount = pending.amount_to_charge();
    let description = format!("Checkout {}", pending.pending.idempotency_key);

    let captured = async {
        let reader = select_reader(ctx, terminal, &location_id).await?;
        let reader = with_timeout(timeout, terminal.connect_by_id(&reader.id)).await?;
        debug!(reader_id = %reader.id, amount = %amount, "Reader connected");

        let payment = with_timeout(timeout, terminal.process_payment(&reader.id, amount, &description)).await?;
        if payment.status != TerminalPaymentStatus::Succeeded {
            return Err(SettlementError::PaymentNotCompleted {
                status: payment.status.to_string(),
            });
        }

        info!(
            reader_id = %reader.id,
            payment_intent_id = %payment.payment_intent_id,
            amount = %amount,
            "Terminal payment captured"
        );
        Ok::<_, SettlementError>(payment)
    }
    .await;

    let payment = fail_on_error(&mut pending.flow, captured)?;
    let payment_id = payment.payment_intent_id;
    match finalize(ctx, &pending, Some(payment_id.clone()), payment.card).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            record_unsettled(ctx, &pending, &payment_id, &e).await;
            Err(e)
        }
    }
}

/// The location's configured reader when online, else any online reader
/// when fallback is allowed.
pub(crate) async fn select_reader(
    ctx: &SettlementContext,
    terminal: &dyn TerminalService,
    location_id: &str,
) -> SettlementResult<Reader> {
    let config = &ctx.config().terminal;
    let readers = with_timeout(ctx.config().gateway.request_timeout(), terminal.list_readers()).await?;

    if let Some(default_id) = config.default_reader_for(location_id) {
        match readers.iter().find(|r| r.id == default_id) {
            Some(reader) if reader.is_online() => return Ok(reader.clone()),
            Some(_) => warn!(reader_id = %default_id, "Default reader offline"),
            None => warn!(reader_id = %default_id, "Default reader not registered"),
        }
    }

    if config.allow_reader_fallback {
        if let Some(reader) = readers.into_iter().find(Reader::is_online) {
            debug!(reader_id = %reader.id, location_id = %location_id, "Falling back to online reader");
            return Ok(reader);
        }
    }

    Err(SettlementError::NoReaderAvailable {
        location_id: location_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::{prepare as prepare_checkout, CheckoutRequest};
    use crate::config::SettlementConfig;
    use crate::test_support::{seeded_context_with, shift, MockTerminal};
    use meridian_core::{CartItem, Money, OutboxKind};

    fn config_with_default(reader: &str) -> SettlementConfig {
        let mut config = SettlementConfig::default();
        config
            .terminal
            .default_readers
            .insert(shift().location_id, reader.to_string());
        config
    }

    async fn checkout(ctx: &SettlementContext, key: &str) -> Checkout {
        prepare_checkout(
            ctx,
            CheckoutRequest::new(key, vec![CartItem::service("svc-cut", Money::from_cents(4000), 1)])
                .with_shift(shift()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_uses_configured_reader() {
        let ctx = seeded_context_with(config_with_default("rdr-front")).await;
        let terminal = MockTerminal::new(vec![
            MockTerminal::reader("rdr-back", true),
            MockTerminal::reader("rdr-front", true),
        ]);

        let chk = checkout(&ctx, "chk-rdr").await;
        let outcome = charge(&ctx, &terminal, chk).await.unwrap();

        assert_eq!(terminal.charged_readers().await, vec!["rdr-front".to_string()]);
        assert_eq!(outcome.transaction.payment_method, PaymentMethod::CardPresent);
        assert_eq!(outcome.transaction.card_last4.as_deref(), Some("4242"));
        assert!(outcome.transaction.gateway_payment_id.is_some());
    }

    #[tokio::test]
    async fn test_falls_back_when_default_offline() {
        let ctx = seeded_context_with(config_with_default("rdr-front")).await;
        let terminal = MockTerminal::new(vec![
            MockTerminal::reader("rdr-front", false),
            MockTerminal::reader("rdr-back", true),
        ]);

        let reader = select_reader(&ctx, &terminal, &shift().location_id).await.unwrap();
        assert_eq!(reader.id, "rdr-back");
    }

    #[tokio::test]
    async fn test_no_fallback_configured() {
        let mut config = config_with_default("rdr-front");
        config.terminal.allow_reader_fallback = false;
        let ctx = seeded_context_with(config).await;
        let terminal = MockTerminal::new(vec![
            MockTerminal::reader("rdr-front", false),
            MockTerminal::reader("rdr-back", true),
        ]);

        let err = select_reader(&ctx, &terminal, &shift().location_id).await.unwrap_err();
        assert!(matches!(err, SettlementError::NoReaderAvailable { .. }));
    }

    #[tokio::test]
    async fn test_no_online_reader() {
        let ctx = seeded_context_with(SettlementConfig::default()).await;
        let terminal = MockTerminal::new(vec![MockTerminal::reader("rdr-front", false)]);

        let chk = checkout(&ctx, "chk-offline").await;
        let err = charge(&ctx, &terminal, chk).await.unwrap_err();

        assert!(matches!(err, SettlementError::NoReaderAvailable { .. }));
        assert_eq!(ctx.db().transactions().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_declined_payment_writes_nothing() {
        let ctx = seeded_context_with(SettlementConfig::default()).await;
        let terminal = MockTerminal::new(vec![MockTerminal::reader("rdr-front", true)])
            .with_status(TerminalPaymentStatus::RequiresPaymentMethod);

        let chk = checkout(&ctx, "chk-declined").await;
        let err = charge(&ctx, &terminal, chk).await.unwrap_err();

        assert!(matches!(err, SettlementError::PaymentNotCompleted { .. }));
        assert!(err.is_retryable());
        assert_eq!(ctx.db().transactions().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_capture_without_write_is_queued_unsettled() {
        let ctx = seeded_context_with(SettlementConfig::default()).await;
        sqlx::query(
            "CREATE TRIGGER refuse_sales BEFORE INSERT ON transactions BEGIN SELECT RAISE(ABORT, 'store read-only'); END",
        )
        .execute(ctx.db().pool())
        .await
        .unwrap();
        let terminal = MockTerminal::new(vec![MockTerminal::reader("rdr-front", true)]);

        let chk = checkout(&ctx, "chk-captured").await;
        assert!(charge(&ctx, &terminal, chk).await.is_err());
        assert_eq!(terminal.charged_readers().await.len(), 1);

        let waiting = ctx.db().outbox().awaiting_operator(10).await.unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].kind, OutboxKind::UnsettledPayment);
        assert!(waiting[0].payload.contains("pi_term_1"));
    }
}
