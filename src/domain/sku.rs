use super::product::ProductType;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Catalog entry for a product or subscription.
///
/// Two entries are equal when they describe the same product id in the same
/// partition; pricing and text are not part of identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkuDetails {
    #[serde(rename = "productId")]
    pub product_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub product_type: ProductType,
    #[serde(rename = "price_currency_code", default)]
    pub currency: String,
    #[serde(rename = "price_amount_micros", default)]
    pub price_micros: i64,
    #[serde(rename = "price", default)]
    pub price_text: String,
}

impl SkuDetails {
    pub fn is_subscription(&self) -> bool {
        self.product_type.is_subscription()
    }

    /// Price in currency units.
    pub fn price_value(&self) -> Decimal {
        Decimal::new(self.price_micros, 6).normalize()
    }
}

impl PartialEq for SkuDetails {
    fn eq(&self, other: &Self) -> bool {
        self.product_id == other.product_id && self.is_subscription() == other.is_subscription()
    }
}

impl Eq for SkuDetails {}

impl Hash for SkuDetails {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.product_id.hash(state);
        self.is_subscription().hash(state);
    }
}
