mod common;

use common::{Harness, owned};
use inapps::domain::product::{ProductType, ResponseCode};
use inapps::error::BillingError;

#[tokio::test]
async fn test_consume_evicts_only_that_product() {
    let harness = Harness::new();
    harness.service.add_owned(ProductType::Managed, owned("gas", "token-gas"));
    harness.service.add_owned(ProductType::Managed, owned("coins", "token-coins"));

    let consumed = harness.client.consume("gas").await.unwrap();

    assert_eq!(consumed.purchase_token, "token-gas");
    assert_eq!(harness.service.consume_calls(), 1);
    assert_eq!(harness.cached(ProductType::Managed).await, vec!["coins"]);
    assert_eq!(harness.service.owned(ProductType::Managed).len(), 1);
}

#[tokio::test]
async fn test_consume_reloads_for_current_token() {
    let harness = Harness::new();
    harness.service.add_owned(ProductType::Managed, owned("gas", "old-token"));
    harness.client.purchased_products_map().await.unwrap();

    // the store rotated the token after the cache was filled
    harness.service.add_owned(ProductType::Managed, owned("gas", "new-token"));
    let consumed = harness.client.consume("gas").await.unwrap();

    assert_eq!(consumed.purchase_token, "new-token");
    assert_eq!(harness.service.purchase_calls(), 2);
}

#[tokio::test]
async fn test_consume_unknown_product() {
    let harness = Harness::new();
    harness.service.add_owned(ProductType::Managed, owned("coins", "token-coins"));

    let err = harness.client.consume("gas").await.unwrap_err();

    assert!(matches!(err, BillingError::PurchaseNotFound(id) if id == "gas"));
    assert_eq!(harness.service.consume_calls(), 0);
    assert_eq!(harness.cached(ProductType::Managed).await, vec!["coins"]);
}

#[tokio::test]
async fn test_consume_without_token_keeps_entry() {
    let harness = Harness::new();
    harness.service.add_owned(ProductType::Managed, owned("gas", ""));

    let err = harness.client.consume("gas").await.unwrap_err();

    assert!(matches!(err, BillingError::PurchaseNotFound(_)));
    assert_eq!(harness.service.consume_calls(), 0);
    assert_eq!(harness.cached(ProductType::Managed).await, vec!["gas"]);
}

#[tokio::test]
async fn test_refused_consume_keeps_entry() {
    let harness = Harness::new();
    harness.service.add_owned(ProductType::Managed, owned("gas", "token-gas"));
    harness
        .service
        .set_consume_code(Some(ResponseCode::ITEM_NOT_OWNED));

    let err = harness.client.consume("gas").await.unwrap_err();

    match err {
        BillingError::ConsumeFailed { product_id, code } => {
            assert_eq!(product_id, "gas");
            assert_eq!(code, ResponseCode::ITEM_NOT_OWNED);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(harness.cached(ProductType::Managed).await, vec!["gas"]);
}

#[tokio::test]
async fn test_subscriptions_cannot_be_consumed() {
    let harness = Harness::new();
    harness
        .service
        .add_owned(ProductType::Subscription, owned("gold", "token-gold"));

    let err = harness.client.consume("gold").await.unwrap_err();
    assert!(matches!(err, BillingError::PurchaseNotFound(_)));
}

#[tokio::test]
async fn test_consumed_product_can_be_bought_again() {
    let harness = Harness::new();
    harness
        .service
        .add_product(common::sku("gas", ProductType::Managed, 990_000));

    harness.client.purchase_product("gas").await.unwrap();
    harness.client.consume("gas").await.unwrap();
    let again = harness.client.purchase_product("gas").await.unwrap();

    assert!(!again.restored);
    assert_eq!(harness.launcher.launch_count(), 2);
}
