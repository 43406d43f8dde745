//! Fixtures shared by the unit tests: a seeded in-memory store and
//! scripted gateway, terminal and completion doubles.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use meridian_core::{LoyaltyProgram, Money, PaymentMethod, Shift, Transaction, TransactionStatus};
use meridian_db::{Database, DbConfig};

use crate::config::SettlementConfig;
use crate::context::SettlementContext;
use crate::outcome::SettlementOutcome;
use crate::ports::{
    CardDetails, CompletionSink, GatewayError, GatewayResult, IntentMetadata, PaymentGateway, PaymentIntent,
    Reader, ReaderStatus, TerminalPayment, TerminalPaymentStatus, TerminalService,
};
use crate::router::PaymentRouter;

/// Customer with 500 points.
pub const CUSTOMER: &str = "cust-avery";
/// Stock-tracked item, 2 on hand at $15.75.
pub const SPRAY: &str = "inv-spray";
pub const GIFT_CARD_NUMBER: &str = "6000-0000-0001";

pub async fn seeded_context() -> SettlementContext {
    seeded_context_with(SettlementConfig::default()).await
}

/// Store with one program (1 point per dollar, 100 minimum, 1¢ a point),
/// [`CUSTOMER`], [`SPRAY`] and a $75 gift card.
pub async fn seeded_context_with(config: SettlementConfig) -> SettlementContext {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();

    db.loyalty()
        .insert_program(&LoyaltyProgram {
            id: "prog-default".into(),
            points_per_dollar: Decimal::ONE,
            minimum_points_redeem: 100,
            points_value_cents: 1,
            is_active: true,
        })
        .await
        .unwrap();
    db.loyalty().insert_customer(CUSTOMER, "Avery Quinn").await.unwrap();
    db.loyalty().append_earn(CUSTOMER, None, 500).await.unwrap();
    db.loyalty().refresh_cached_points(CUSTOMER).await.unwrap();

    db.inventory()
        .insert_item(SPRAY, "Texture Spray", Some("5900000000059"), 1575, 2)
        .await
        .unwrap();

    db.gift_cards()
        .issue(GIFT_CARD_NUMBER, Money::from_cents(7500))
        .await
        .unwrap();

    SettlementContext::new(db, config)
}

pub async fn gift_card_id(ctx: &SettlementContext) -> String {
    ctx.db()
        .gift_cards()
        .get_by_number(GIFT_CARD_NUMBER)
        .await
        .unwrap()
        .unwrap()
        .id
}

pub fn shift() -> Shift {
    Shift {
        id: "shift-am".into(),
        location_id: "loc-main".into(),
    }
}

/// Bare transaction row for ledger entries that need something to point at.
pub async fn insert_transaction(db: &Database, id: &str) {
    let tx = Transaction {
        id: id.to_string(),
        idempotency_key: format!("key-{id}"),
        payment_method: PaymentMethod::Cash,
        status: TransactionStatus::Completed,
        total_cents: 1000,
        subtotal_cents: 1000,
        tax_cents: 0,
        discount_cents: 0,
        loyalty_discount_cents: 0,
        is_split_payment: false,
        shift_id: None,
        customer_id: None,
        gift_card_id: None,
        gateway_payment_id: None,
        card_last4: None,
        card_brand: None,
        refunded_cents: 0,
        created_at: Utc::now(),
    };
    db.transactions().insert(&tx).await.unwrap();
}

pub async fn router(ctx: SettlementContext, gateway: MockGateway) -> (PaymentRouter, Arc<RecordingCompletion>) {
    let completion = Arc::new(RecordingCompletion::default());
    let terminal = MockTerminal::new(vec![MockTerminal::reader("rdr-front", true)]);
    let router = PaymentRouter::new(ctx, Arc::new(gateway), Arc::new(terminal)).with_completion(completion.clone());
    (router, completion)
}

// =============================================================================
// Gateway
// =============================================================================

/// Records every intent amount. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct MockGateway {
    intents: Arc<Mutex<Vec<Money>>>,
    fail: bool,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        MockGateway {
            fail: true,
            ..Self::default()
        }
    }

    pub async fn intents(&self) -> Vec<Money> {
        self.intents.lock().await.clone()
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_payment_intent(
        &self,
        amount: Money,
        metadata: &IntentMetadata,
    ) -> GatewayResult<PaymentIntent> {
        if self.fail {
            return Err(GatewayError::Unavailable("connection refused".into()));
        }

        let mut intents = self.intents.lock().await;
        intents.push(amount);
        Ok(PaymentIntent {
            id: format!("pi_{}", intents.len()),
            client_secret: format!("pi_{}_secret_{}", intents.len(), metadata.pending_id),
        })
    }
}

// =============================================================================
// Terminal
// =============================================================================

/// Reader fleet with a fixed payment status and a visa ending 4242.
#[derive(Debug)]
pub struct MockTerminal {
    readers: Vec<Reader>,
    status: TerminalPaymentStatus,
    charged: Mutex<Vec<String>>,
}

impl MockTerminal {
    pub fn new(readers: Vec<Reader>) -> Self {
        MockTerminal {
            readers,
            status: TerminalPaymentStatus::Succeeded,
            charged: Mutex::new(Vec::new()),
        }
    }

    pub fn reader(id: &str, online: bool) -> Reader {
        Reader {
            id: id.to_string(),
            label: id.to_string(),
            location_id: Some(shift().location_id),
            status: if online { ReaderStatus::Online } else { ReaderStatus::Offline },
        }
    }

    pub fn with_status(mut self, status: TerminalPaymentStatus) -> Self {
        self.status = status;
        self
    }

    pub async fn charged_readers(&self) -> Vec<String> {
        self.charged.lock().await.clone()
    }
}

#[async_trait]
impl TerminalService for MockTerminal {
    async fn list_readers(&self) -> GatewayResult<Vec<Reader>> {
        Ok(self.readers.clone())
    }

    async fn connect_by_id(&self, reader_id: &str) -> GatewayResult<Reader> {
        self.readers
            .iter()
            .find(|r| r.id == reader_id && r.is_online())
            .cloned()
            .ok_or_else(|| GatewayError::Unavailable(format!("reader {reader_id} unreachable")))
    }

    async fn process_payment(
        &self,
        reader_id: &str,
        _amount: Money,
        _description: &str,
    ) -> GatewayResult<TerminalPayment> {
        let mut charged = self.charged.lock().await;
        charged.push(reader_id.to_string());
        Ok(TerminalPayment {
            status: self.status,
            payment_intent_id: format!("pi_term_{}", charged.len()),
            card: Some(CardDetails {
                last4: "4242".into(),
                brand: "visa".into(),
            }),
        })
    }
}

// =============================================================================
// Completion
// =============================================================================

#[derive(Debug, Default)]
pub struct RecordingCompletion {
    settled: Mutex<Vec<String>>,
}

impl RecordingCompletion {
    pub async fn settled(&self) -> Vec<String> {
        self.settled.lock().await.clone()
    }
}

#[async_trait]
impl CompletionSink for RecordingCompletion {
    async fn on_settled(&self, outcome: &SettlementOutcome) {
        self.settled.lock().await.push(outcome.transaction.id.clone());
    }
}
