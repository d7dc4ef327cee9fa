//! Order lifecycle against a real PostgreSQL database.
//!
//! Set `TEST_DATABASE_URL` to run these; without it every test returns early.

mod common;

use std::time::Duration;

use gateway::OutcomeStatus;
use model::{OrderStatus, PaymentMethod, PaymentStatus};
use service::{CheckoutService, ExpirySweeper, Repositories, ServiceError};

use common::{StubGateway, callback, customer, registry, request};

#[tokio::test]
async fn test_cod_order_reserves_and_cancel_releases() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let variant = db.add_variant(500_000, 10).await;
    db.add_voucher("SPORT10", 5).await;
    let service = common::checkout_service(&db, StubGateway::default());

    let mut checkout = request(variant, 3, PaymentMethod::Cod);
    checkout.voucher_code = Some(" SPORT10 ".into());
    let receipt = service.place_order(&customer(), checkout).await.unwrap();
    assert_eq!(receipt.status, OrderStatus::AwaitingConfirmation);
    assert_eq!(receipt.pay_url, None);
    assert_eq!(db.stock(variant).await, 7);
    assert_eq!(db.voucher_uses("SPORT10").await, 1);

    let details = service.get_order(&customer(), receipt.order_id).await.unwrap();
    assert_eq!(details.payment.status, PaymentStatus::Pending);
    assert_eq!(details.order.discount, 150_000);

    let view = service
        .cancel_order(&customer(), receipt.order_id, None)
        .await
        .unwrap();
    assert_eq!(view.order_status, OrderStatus::Cancelled);
    assert_eq!(view.payment_status, PaymentStatus::Failed);
    assert_eq!(db.stock(variant).await, 10);
    assert_eq!(db.voucher_uses("SPORT10").await, 0);

    db.drop_schema().await;
}

#[tokio::test]
async fn test_out_of_stock_places_nothing() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let variant = db.add_variant(500_000, 2).await;
    let service = common::checkout_service(&db, StubGateway::default());

    let err = service
        .place_order(&customer(), request(variant, 3, PaymentMethod::Cod))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::OutOfStock { variant_id } if variant_id == variant));
    assert_eq!(db.stock(variant).await, 2);

    db.drop_schema().await;
}

#[tokio::test]
async fn test_failed_payment_creation_fails_order_and_restores_stock() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let variant = db.add_variant(500_000, 10).await;
    let gateway = StubGateway {
        create_fails: true,
        ..StubGateway::default()
    };
    let service = common::checkout_service(&db, gateway);

    let err = service
        .place_order(&customer(), request(variant, 2, PaymentMethod::Momo))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Gateway(_)));
    assert_eq!(db.user_order_status().await, "failed");
    assert_eq!(db.stock(variant).await, 10);

    db.drop_schema().await;
}

#[tokio::test]
async fn test_paid_callback_is_applied_once() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let variant = db.add_variant(500_000, 10).await;
    let service = common::checkout_service(&db, StubGateway::default());

    let receipt = service
        .place_order(&customer(), request(variant, 1, PaymentMethod::Momo))
        .await
        .unwrap();
    assert_eq!(receipt.status, OrderStatus::AwaitingConfirmation);
    assert!(receipt.pay_url.is_some());

    let params = callback(receipt.order_id, receipt.total_amount);
    let first = service
        .handle_callback(PaymentMethod::Momo, &params)
        .await
        .unwrap();
    assert!(first.changed);
    assert_eq!(first.view.order_status, OrderStatus::Paid);
    assert!(first.view.paid_at.is_some());

    let repeat = service
        .handle_callback(PaymentMethod::Momo, &params)
        .await
        .unwrap();
    assert!(!repeat.changed);
    assert_eq!(repeat.view.order_status, OrderStatus::Paid);
    assert_eq!(db.stock(variant).await, 9);

    db.drop_schema().await;
}

#[tokio::test]
async fn test_callback_with_wrong_amount_is_rejected() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let variant = db.add_variant(500_000, 10).await;
    let service = common::checkout_service(&db, StubGateway::default());
    let receipt = service
        .place_order(&customer(), request(variant, 1, PaymentMethod::Momo))
        .await
        .unwrap();

    let params = callback(receipt.order_id, receipt.total_amount - 1);
    let err = service
        .handle_callback(PaymentMethod::Momo, &params)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AmountMismatch { .. }));
    assert_eq!(db.user_order_status().await, "awaiting_confirmation");

    db.drop_schema().await;
}

#[tokio::test]
async fn test_payment_after_cancellation_is_recorded() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let variant = db.add_variant(500_000, 10).await;
    let service = common::checkout_service(&db, StubGateway::default());
    let receipt = service
        .place_order(&customer(), request(variant, 1, PaymentMethod::Momo))
        .await
        .unwrap();
    service
        .cancel_order(&customer(), receipt.order_id, None)
        .await
        .unwrap();

    let params = callback(receipt.order_id, receipt.total_amount);
    let err = service
        .handle_callback(PaymentMethod::Momo, &params)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::LatePayment { status: OrderStatus::Cancelled, .. }
    ));
    assert_eq!(db.user_order_status().await, "cancelled");
    let metadata = db.payment_metadata(receipt.order_id).await.unwrap_or_default();
    assert!(metadata.contains("late payment"), "{metadata}");
    assert!(metadata.contains("txn-callback"), "{metadata}");

    db.drop_schema().await;
}

async fn sweep(db: &common::TestDb, answer: Option<OutcomeStatus>) -> (uuid::Uuid, usize, i64) {
    let variant = db.add_variant(500_000, 10).await;
    let service = common::checkout_service(db, StubGateway::default());
    let receipt = service
        .place_order(&customer(), request(variant, 2, PaymentMethod::Momo))
        .await
        .unwrap();
    db.backdate(receipt.order_id, 120).await;

    let sweeper = ExpirySweeper::new(
        Repositories::postgres(&db.pool).orders,
        registry(StubGateway {
            query_answer: answer,
            ..StubGateway::default()
        }),
        service.reconciler().clone(),
        Duration::from_secs(15 * 60),
        Duration::from_secs(60),
    );
    let closed = sweeper.sweep_once().await.unwrap();
    (receipt.order_id, closed, variant)
}

#[tokio::test]
async fn test_sweep_cancels_expired_order() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let (_, closed, variant) = sweep(&db, None).await;
    assert_eq!(closed, 1);
    assert_eq!(db.user_order_status().await, "cancelled");
    assert_eq!(db.stock(variant).await, 10);

    db.drop_schema().await;
}

#[tokio::test]
async fn test_sweep_keeps_payment_found_at_expiry() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let (order_id, closed, variant) = sweep(&db, Some(OutcomeStatus::Paid)).await;
    assert_eq!(closed, 1);
    assert_eq!(db.user_order_status().await, "paid");
    assert_eq!(db.stock(variant).await, 8);
    assert_eq!(db.payment_metadata(order_id).await.as_deref(), Some("queried"));

    db.drop_schema().await;
}

#[tokio::test]
async fn test_sweep_leaves_recent_orders() {
    let Some(db) = common::test_db().await else {
        return;
    };
    let variant = db.add_variant(500_000, 10).await;
    let service = common::checkout_service(&db, StubGateway::default());
    service
        .place_order(&customer(), request(variant, 1, PaymentMethod::Momo))
        .await
        .unwrap();

    let sweeper = ExpirySweeper::new(
        Repositories::postgres(&db.pool).orders,
        registry(StubGateway::default()),
        service.reconciler().clone(),
        Duration::from_secs(15 * 60),
        Duration::from_secs(60),
    );
    assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
    assert_eq!(db.user_order_status().await, "awaiting_confirmation");

    db.drop_schema().await;
}
