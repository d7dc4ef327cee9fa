//! Domain types for the checkout backend: orders, line items, payments,
//! variants and vouchers, plus the pricing and status rules shared by every layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod pricing;
pub mod status;

pub use pricing::{MAX_SUBTOTAL, OrderTotals, PricingRules, VoucherRejection, gateway_fee};
pub use status::{LEGACY_PAID_LABEL, OrderStatus, ParseStatusError, PaymentMethod, PaymentStatus};

/// Recipient details, snapshotted when the order is placed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipient {
    pub name: String,
    pub phone: String,
    pub address: String,
    #[serde(default)]
    pub note: Option<String>,
}

/// Purchasable size/color combination of a product.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Variant {
    pub id: i64,
    pub product_id: i64,
    pub product_name: String,
    pub size: String,
    pub color: String,
    pub price: i64,
    pub stock: i32,
}

/// Order line with the price captured when the order was placed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderProduct {
    pub variant_id: i64,
    pub product_name: String,
    pub size: String,
    pub color: String,
    pub quantity: i32,
    pub unit_price: i64,
    pub line_total: i64,
}

impl OrderProduct {
    /// Snapshots `variant` so later price edits never touch this line.
    /// `None` if the line total does not fit in an `i64`.
    pub fn capture(variant: &Variant, quantity: i32) -> Option<Self> {
        let line_total = variant.price.checked_mul(i64::from(quantity))?;
        Some(Self {
            variant_id: variant.id,
            product_name: variant.product_name.clone(),
            size: variant.size.clone(),
            color: variant.color.clone(),
            quantity,
            unit_price: variant.price,
            line_total,
        })
    }
}

/// Order, the main aggregate of the checkout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Order {
    pub id: Uuid,
    pub user_id: String,
    pub status: OrderStatus,
    pub subtotal: i64,
    pub shipping_fee: i64,
    pub discount: i64,
    pub payment_fee: i64,
    pub total_amount: i64,
    pub voucher_code: Option<String>,
    pub recipient: Recipient,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payment of an order. There is exactly one per order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub amount: i64,
    pub gateway_reference: Option<String>,
    pub pay_url: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    /// Free-form gateway notes (transaction ids, result messages).
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiscountKind {
    Percent,
    Fixed,
}

impl DiscountKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DiscountKind::Percent => "percent",
            DiscountKind::Fixed => "fixed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "percent" => Some(DiscountKind::Percent),
            "fixed" => Some(DiscountKind::Fixed),
            _ => None,
        }
    }
}

/// Discount code with a validity window and a usage counter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Voucher {
    pub code: String,
    pub kind: DiscountKind,
    /// Percent (0..=100) or a fixed VND amount depending on `kind`.
    pub value: i64,
    pub max_discount: Option<i64>,
    pub min_order_value: i64,
    pub usage_limit: i32,
    pub used_count: i32,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub active: bool,
}

/// Full order as returned by `GET /api/order/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderProduct>,
    pub payment: Payment,
}

/// What a polling client needs to decide whether to keep polling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentStatusView {
    pub order_id: Uuid,
    /// Owner of the order, used for access checks on cached snapshots.
    pub user_id: String,
    pub order_status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub method: PaymentMethod,
    pub amount: i64,
    pub paid_at: Option<DateTime<Utc>>,
}

impl PaymentStatusView {
    pub fn from_parts(order: &Order, payment: &Payment) -> Self {
        Self {
            order_id: order.id,
            user_id: order.user_id.clone(),
            order_status: order.status,
            payment_status: payment.status,
            method: payment.method,
            amount: payment.amount,
            paid_at: payment.paid_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.order_status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_deserialize_order_details_from_json() {
        let json = r#"
        {
           "id": "6f1d3a52-9c4e-4d59-9d51-2b4a9a1f3c11",
           "user_id": "42",
           "status": "awaiting_confirmation",
           "subtotal": 1000000,
           "shipping_fee": 15000,
           "discount": 0,
           "payment_fee": 50750,
           "total_amount": 1065750,
           "voucher_code": null,
           "recipient": {
              "name": "Nguyen Van A",
              "phone": "0901234567",
              "address": "12 Le Loi, District 1, HCMC"
           },
           "created_at": "2025-03-01T08:30:00Z",
           "updated_at": "2025-03-01T08:30:00Z",
           "items": [
              {
                 "variant_id": 7,
                 "product_name": "Home Jersey 24/25",
                 "size": "L",
                 "color": "red",
                 "quantity": 2,
                 "unit_price": 500000,
                 "line_total": 1000000
              }
           ],
           "payment": {
              "id": "0b7a4a0e-52f1-4c0e-8a53-5c1f4c2c7e01",
              "order_id": "6f1d3a52-9c4e-4d59-9d51-2b4a9a1f3c11",
              "method": "momo",
              "status": "pending",
              "amount": 1065750,
              "gateway_reference": "MOMO123",
              "pay_url": "https://test-payment.momo.vn/pay/123",
              "paid_at": null,
              "metadata": null,
              "created_at": "2025-03-01T08:30:00Z",
              "updated_at": "2025-03-01T08:30:00Z"
           }
        }
        "#;
        let details: OrderDetails = serde_json::from_str(json).unwrap();
        assert_eq!(details.order.status, OrderStatus::AwaitingConfirmation);
        assert_eq!(details.items.len(), 1);
        assert_eq!(details.items[0].line_total, 1_000_000);
        assert_eq!(details.payment.method, PaymentMethod::Momo);
        assert_eq!(details.order.recipient.note, None);

        let expected = Utc.with_ymd_and_hms(2025, 3, 1, 8, 30, 0).unwrap();
        assert_eq!(details.order.created_at, expected);
    }

    #[test]
    fn test_capture_freezes_price() {
        let mut variant = Variant {
            id: 3,
            product_id: 1,
            product_name: "Training Shorts".into(),
            size: "M".into(),
            color: "black".into(),
            price: 250_000,
            stock: 10,
        };
        let line = OrderProduct::capture(&variant, 3).unwrap();
        variant.price = 300_000;
        assert_eq!(line.unit_price, 250_000);
        assert_eq!(line.line_total, 750_000);

        variant.price = i64::MAX / 2;
        assert!(OrderProduct::capture(&variant, 3).is_none());
    }
}
