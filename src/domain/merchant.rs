//! Merchant-transaction legitimacy check.
//!
//! Order ids issued between the two cutoff dates embed the merchant id as a
//! `<merchantId>.<orderId>` prefix. A purchase generated by a tool that does
//! not know the real merchant id cannot reproduce that prefix. Outside the
//! window the format is not guaranteed, so the check passes.

use super::purchase::Purchase;
use chrono::{DateTime, TimeZone, Utc};

/// 5th December 2012: the `[merchantId].[orderId]` format starts.
pub fn first_cutoff() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2012, 12, 5, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// 21st July 2015: the newest order id format takes over.
pub fn second_cutoff() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2015, 7, 21, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Returns whether `purchase` carries the expected merchant id.
///
/// Passes unconditionally when no merchant id is configured.
pub fn check_merchant_transaction(purchase: &Purchase, merchant_id: Option<&str>) -> bool {
    let Some(merchant_id) = merchant_id else {
        return true;
    };

    let purchased_at = purchase.purchase_time();
    if purchased_at < first_cutoff() || purchased_at > second_cutoff() {
        return true;
    }

    // Whitespace only counts for the blank check; the prefix is taken raw.
    let order_id = purchase.order_id.as_str();
    if order_id.trim().is_empty() {
        return false;
    }
    match order_id.find('.') {
        Some(index) if index > 0 => &order_id[..index] == merchant_id,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn purchase_at(time: DateTime<Utc>, order_id: &str) -> Purchase {
        Purchase {
            product_id: "premium".into(),
            order_id: order_id.into(),
            purchase_time_millis: time.timestamp_millis(),
            ..Default::default()
        }
    }

    fn between() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2014, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_no_merchant_configured_always_passes() {
        let purchase = purchase_at(between(), "garbage");
        assert!(check_merchant_transaction(&purchase, None));
    }

    #[test]
    fn test_before_first_cutoff_passes_any_order_id() {
        let purchase = purchase_at(first_cutoff() - Duration::days(1), "");
        assert!(check_merchant_transaction(&purchase, Some("1234")));
    }

    #[test]
    fn test_after_second_cutoff_passes_any_order_id() {
        let purchase = purchase_at(second_cutoff() + Duration::milliseconds(1), "GPA.1-2-3");
        assert!(check_merchant_transaction(&purchase, Some("1234")));
    }

    #[test]
    fn test_between_cutoffs_requires_matching_prefix() {
        let ok = purchase_at(between(), "1234.5678901234");
        let wrong = purchase_at(between(), "9999.5678901234");
        let missing_dot = purchase_at(between(), "12345678901234");
        let leading_dot = purchase_at(between(), ".1234");
        let blank = purchase_at(between(), "   ");

        assert!(check_merchant_transaction(&ok, Some("1234")));
        assert!(!check_merchant_transaction(&wrong, Some("1234")));
        assert!(!check_merchant_transaction(&missing_dot, Some("1234")));
        assert!(!check_merchant_transaction(&leading_dot, Some("1234")));
        assert!(!check_merchant_transaction(&blank, Some("1234")));
    }

    #[test]
    fn test_padded_order_id_is_not_trimmed() {
        let leading = purchase_at(between(), " 1234.5678");
        let trailing = purchase_at(between(), "1234.5678 ");
        assert!(!check_merchant_transaction(&leading, Some("1234")));
        assert!(check_merchant_transaction(&trailing, Some("1234")));
    }

    #[test]
    fn test_prefix_must_be_exact() {
        let purchase = purchase_at(between(), "12345.678");
        assert!(!check_merchant_transaction(&purchase, Some("1234")));
    }

    #[test]
    fn test_cutoff_instants_are_inside_window() {
        let at_first = purchase_at(first_cutoff(), "nope");
        let at_second = purchase_at(second_cutoff(), "nope");
        assert!(!check_merchant_transaction(&at_first, Some("1234")));
        assert!(!check_merchant_transaction(&at_second, Some("1234")));
    }
}
