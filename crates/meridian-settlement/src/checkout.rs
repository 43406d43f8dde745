//! # Checkout Request and Quote
//!
//! The cart snapshot a register submits, and the totals the engine derives
//! from it.
//!
//! ## Quoting
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  cart, discount, tax rate                                               │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  totals without points ──► coverable = subtotal − manual discount       │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  loyalty preview (ledger balance, active program, min(value, coverable))│
//! │        │                                                                │
//! │        ▼                                                                │
//! │  totals with loyalty discount ──► final_total ≤ 0 ? fast path           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Capping the loyalty discount at the coverable amount keeps a redemption
//! from paying for more than what is left after the manual discount.

use serde::Serialize;

use meridian_core::loyalty::{plan_redemption, Redemption};
use meridian_core::validation::{validate_cart, validate_idempotency_key, validate_tax_rate_bps};
use meridian_core::{
    calculate_totals, CartItem, CoreError, Discount, LoyaltyProgram, Money, Shift, SplitPayment,
    TaxRate, TotalsBreakdown,
};

use crate::context::SettlementContext;
use crate::error::SettlementResult;
use crate::loyalty::LoyaltyPreview;

/// Everything the register hands over for one checkout.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutRequest {
    /// Caller-generated key; one settled transaction per key.
    pub idempotency_key: String,
    pub items: Vec<CartItem>,
    pub discount: Option<Discount>,
    /// None uses the configured default rate.
    pub tax_rate: Option<TaxRate>,
    pub customer_id: Option<String>,
    pub use_points: bool,
    pub shift: Option<Shift>,
    pub split_payments: Vec<SplitPayment>,
}

impl CheckoutRequest {
    pub fn new(idempotency_key: impl Into<String>, items: Vec<CartItem>) -> Self {
        CheckoutRequest {
            idempotency_key: idempotency_key.into(),
            items,
            discount: None,
            tax_rate: None,
            customer_id: None,
            use_points: false,
            shift: None,
            split_payments: Vec::new(),
        }
    }

    pub fn with_discount(mut self, discount: Discount) -> Self {
        self.discount = Some(discount);
        self
    }

    pub fn with_tax_rate(mut self, rate: TaxRate) -> Self {
        self.tax_rate = Some(rate);
        self
    }

    pub fn with_customer(mut self, customer_id: impl Into<String>, use_points: bool) -> Self {
        self.customer_id = Some(customer_id.into());
        self.use_points = use_points;
        self
    }

    pub fn with_shift(mut self, shift: Shift) -> Self {
        self.shift = Some(shift);
        self
    }

    pub fn with_splits(mut self, splits: Vec<SplitPayment>) -> Self {
        self.split_payments = splits;
        self
    }
}

/// Derived figures for a checkout.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub totals: TotalsBreakdown,
    pub tax_rate: TaxRate,
    pub loyalty: LoyaltyPreview,
    /// Planned redemption, when points pay for part of the checkout.
    pub redemption: Option<Redemption>,
}

impl Quote {
    /// What the tenders must cover, in cents.
    pub fn charge_amount(&self) -> Money {
        self.totals.charge_amount()
    }

    pub fn loyalty_discount(&self) -> Money {
        self.loyalty.discount
    }

    /// Discounts cover the whole purchase.
    pub fn is_zero_dollar(&self) -> bool {
        self.totals.is_zero_dollar()
    }

    pub fn program(&self) -> Option<&LoyaltyProgram> {
        self.loyalty.program.as_ref()
    }

    /// True when the checkout posts a loyalty redeem rather than an earn.
    pub fn is_redeeming(&self) -> bool {
        self.redemption.map_or(false, |r| !r.is_noop())
    }
}

/// A request together with its quote.
#[derive(Debug, Clone)]
pub struct Checkout {
    pub request: CheckoutRequest,
    pub quote: Quote,
}

impl Checkout {
    pub fn idempotency_key(&self) -> &str {
        &self.request.idempotency_key
    }

    pub fn customer_id(&self) -> Option<&str> {
        self.request.customer_id.as_deref()
    }
}

/// Validates the request and computes its quote. Reads only.
pub async fn quote(ctx: &SettlementContext, request: &CheckoutRequest) -> SettlementResult<Quote> {
    validate_idempotency_key(&request.idempotency_key).map_err(CoreError::from)?;
    validate_cart(&request.items).map_err(CoreError::from)?;

    let tax_rate = request
        .tax_rate
        .unwrap_or_else(|| ctx.config().tax.default_rate());
    validate_tax_rate_bps(tax_rate.bps()).map_err(CoreError::from)?;

    let base = calculate_totals(&request.items, request.discount.as_ref(), tax_rate, Money::zero());
    let coverable = Money::from_decimal_rounded(base.subtotal - base.discount_amount).clamp_non_negative();

    let loyalty = ctx
        .loyalty()
        .preview_discount(request.customer_id.as_deref(), request.use_points, coverable)
        .await?;

    let totals = calculate_totals(
        &request.items,
        request.discount.as_ref(),
        tax_rate,
        loyalty.discount,
    );

    let redemption = match &loyalty.program {
        Some(program) if loyalty.discount.is_positive() => Some(plan_redemption(
            loyalty.balance,
            loyalty.discount,
            program.points_value_cents,
        )),
        _ => None,
    };

    Ok(Quote {
        totals,
        tax_rate,
        loyalty,
        redemption,
    })
}

/// Quotes a request and pairs the two.
pub async fn prepare(ctx: &SettlementContext, request: CheckoutRequest) -> SettlementResult<Checkout> {
    let quote = quote(ctx, &request).await?;
    Ok(Checkout { request, quote })
}
