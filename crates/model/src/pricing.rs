//! Checkout pricing: shipping, gateway surcharge and voucher discounts.
//!
//! All amounts are whole VND held in `i64`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{DiscountKind, PaymentMethod, Voucher};

/// Shop-wide pricing knobs. Defaults match the storefront checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingRules {
    /// Subtotal from which shipping is free.
    pub free_shipping_threshold: i64,
    /// Flat shipping fee below the threshold.
    pub shipping_fee: i64,
    /// Surcharge in percent added to MoMo payments.
    pub momo_fee_percent: u32,
    /// Surcharge in percent added to VNPay payments.
    pub vnpay_fee_percent: u32,
}

impl Default for PricingRules {
    fn default() -> Self {
        Self {
            free_shipping_threshold: 1_500_000,
            shipping_fee: 15_000,
            momo_fee_percent: 5,
            vnpay_fee_percent: 0,
        }
    }
}

impl PricingRules {
    pub fn shipping_fee(&self, subtotal: i64) -> i64 {
        if subtotal >= self.free_shipping_threshold {
            0
        } else {
            self.shipping_fee
        }
    }

    pub fn fee_percent(&self, method: PaymentMethod) -> u32 {
        match method {
            PaymentMethod::Cod => 0,
            PaymentMethod::Momo => self.momo_fee_percent,
            PaymentMethod::Vnpay => self.vnpay_fee_percent,
        }
    }
}

/// `round(amount * percent / 100)`, halves rounded up.
pub fn gateway_fee(amount: i64, percent: u32) -> i64 {
    if amount <= 0 || percent == 0 {
        return 0;
    }
    (amount * i64::from(percent) + 50) / 100
}

/// Why a voucher cannot be used for a given cart.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VoucherRejection {
    #[error("voucher does not exist")]
    Unknown,
    #[error("voucher is disabled")]
    Inactive,
    #[error("voucher is not valid yet")]
    NotStarted,
    #[error("voucher has expired")]
    Expired,
    #[error("order value {subtotal} is below the voucher minimum {minimum}")]
    BelowMinimum { subtotal: i64, minimum: i64 },
    #[error("voucher usage limit reached")]
    Exhausted,
}

impl Voucher {
    /// Checks every precondition except the atomic usage counter, which the
    /// database re-checks when the voucher is redeemed.
    pub fn check_applicable(&self, subtotal: i64, now: DateTime<Utc>) -> Result<(), VoucherRejection> {
        if !self.active {
            return Err(VoucherRejection::Inactive);
        }
        if now < self.starts_at {
            return Err(VoucherRejection::NotStarted);
        }
        if now > self.ends_at {
            return Err(VoucherRejection::Expired);
        }
        if subtotal < self.min_order_value {
            return Err(VoucherRejection::BelowMinimum {
                subtotal,
                minimum: self.min_order_value,
            });
        }
        if self.used_count >= self.usage_limit {
            return Err(VoucherRejection::Exhausted);
        }
        Ok(())
    }

    /// Discount for `subtotal`, never larger than the subtotal itself.
    pub fn discount_for(&self, subtotal: i64) -> i64 {
        let raw = match self.kind {
            DiscountKind::Percent => {
                let pct = self.value.clamp(0, 100);
                let discount = subtotal * pct / 100;
                match self.max_discount {
                    Some(cap) => discount.min(cap),
                    None => discount,
                }
            }
            DiscountKind::Fixed => self.value.max(0),
        };
        raw.clamp(0, subtotal.max(0))
    }
}

/// Largest subtotal accepted at checkout. Leaves room for shipping, the
/// gateway fee and VNPay's x100 amount scaling without overflow.
pub const MAX_SUBTOTAL: i64 = i64::MAX / 1_000;

/// Price breakdown persisted on the order row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub subtotal: i64,
    pub shipping_fee: i64,
    pub discount: i64,
    pub payment_fee: i64,
    pub total_amount: i64,
}

impl OrderTotals {
    /// `total = max(subtotal + shipping - discount, 0) + fee`, with the gateway fee
    /// charged on the discounted amount.
    pub fn compute(
        subtotal: i64,
        voucher: Option<&Voucher>,
        method: PaymentMethod,
        rules: &PricingRules,
    ) -> Self {
        let shipping_fee = rules.shipping_fee(subtotal);
        let discount = voucher.map(|v| v.discount_for(subtotal)).unwrap_or(0);
        let base = (subtotal + shipping_fee - discount).max(0);
        let payment_fee = gateway_fee(base, rules.fee_percent(method));
        Self {
            subtotal,
            shipping_fee,
            discount,
            payment_fee,
            total_amount: base + payment_fee,
        }
    }
}
