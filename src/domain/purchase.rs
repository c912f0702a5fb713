use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Purchases of one product type keyed by product id.
pub type PurchaseMap = BTreeMap<String, Purchase>;

/// A purchase record as reported by the billing service.
///
/// The wire fields are fixed once parsed. `purchase_signature`, `raw_response`
/// and `restored` are attached afterwards by whoever parsed the record.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Purchase {
    pub product_id: String,
    #[serde(default)]
    pub developer_payload: String,
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub package_name: String,
    #[serde(default)]
    pub purchase_state: i32,
    #[serde(default)]
    pub purchase_token: String,
    #[serde(rename = "purchaseTime", default)]
    pub purchase_time_millis: i64,
    #[serde(default)]
    pub purchase_signature: Option<String>,
    #[serde(default)]
    pub raw_response: Option<String>,
    #[serde(default)]
    pub restored: bool,
}

impl Purchase {
    /// Attaches the receipt data that came alongside the parsed record.
    pub fn with_receipt(mut self, raw_response: &str, signature: Option<String>) -> Self {
        self.raw_response = Some(raw_response.to_string());
        self.purchase_signature = signature;
        self
    }

    pub fn purchase_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.purchase_time_millis).unwrap_or_default()
    }

    pub fn has_token(&self) -> bool {
        !self.purchase_token.trim().is_empty()
    }
}

/// Builds a `PurchaseMap` from a list; later duplicates win.
pub fn to_map(purchases: Vec<Purchase>) -> PurchaseMap {
    purchases
        .into_iter()
        .map(|p| (p.product_id.clone(), p))
        .collect()
}
