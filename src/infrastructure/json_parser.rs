use crate::domain::ports::RecordParser;
use crate::domain::purchase::{Purchase, PurchaseMap};
use crate::domain::sku::SkuDetails;
use crate::error::Result;

/// `RecordParser` for the billing API's JSON records.
///
/// Cached purchase maps are stored as a JSON object keyed by product id, with
/// the attached signature, raw response and restored flag kept alongside the
/// wire fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRecordParser;

impl RecordParser for JsonRecordParser {
    fn parse_purchase(&self, raw: &str) -> Result<Purchase> {
        Ok(serde_json::from_str(raw)?)
    }

    fn parse_sku_details(&self, raw: &str) -> Result<SkuDetails> {
        Ok(serde_json::from_str(raw)?)
    }

    fn serialize_purchases(&self, purchases: &PurchaseMap) -> Result<String> {
        Ok(serde_json::to_string(purchases)?)
    }

    fn parse_purchases(&self, raw: &str) -> Result<PurchaseMap> {
        Ok(serde_json::from_str(raw)?)
    }
}
