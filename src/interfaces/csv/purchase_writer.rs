use crate::domain::product::ProductType;
use crate::domain::purchase::Purchase;
use crate::domain::sku::SkuDetails;
use crate::error::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct PurchaseRow<'a> {
    #[serde(rename = "type")]
    product_type: ProductType,
    product_id: &'a str,
    order_id: &'a str,
    purchase_time: String,
    purchase_token: &'a str,
    restored: bool,
}

#[derive(Serialize)]
struct SkuRow<'a> {
    #[serde(rename = "type")]
    product_type: ProductType,
    product_id: &'a str,
    title: &'a str,
    price: &'a str,
    currency: &'a str,
    price_value: Decimal,
}

/// Writes purchases and catalog entries as CSV.
pub struct PurchaseWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> PurchaseWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    /// One row per purchase, timestamps in RFC 3339.
    pub fn write_purchases<'a, I>(&mut self, product_type: ProductType, purchases: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Purchase>,
    {
        for purchase in purchases {
            self.writer.serialize(PurchaseRow {
                product_type,
                product_id: &purchase.product_id,
                order_id: &purchase.order_id,
                purchase_time: purchase.purchase_time().to_rfc3339(),
                purchase_token: &purchase.purchase_token,
                restored: purchase.restored,
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn write_skus(&mut self, skus: &[SkuDetails]) -> Result<()> {
        for sku in skus {
            self.writer.serialize(SkuRow {
                product_type: sku.product_type,
                product_id: &sku.product_id,
                title: &sku.title,
                price: &sku.price_text,
                currency: &sku.currency,
                price_value: sku.price_value(),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| std::io::Error::other(e.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::product::ProductType;

    #[test]
    fn test_write_purchases() {
        let purchase = Purchase {
            product_id: "premium".into(),
            order_id: "GPA.1".into(),
            purchase_token: "tok".into(),
            purchase_time_millis: 0,
            ..Default::default()
        };
        let mut writer = PurchaseWriter::new(Vec::new());
        writer
            .write_purchases(ProductType::Managed, [&purchase])
            .unwrap();

        let output = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let mut lines = output.lines();
        assert_eq!(
            lines.next(),
            Some("type,product_id,order_id,purchase_time,purchase_token,restored")
        );
        assert_eq!(
            lines.next(),
            Some("inapp,premium,GPA.1,1970-01-01T00:00:00+00:00,tok,false")
        );
    }

    #[test]
    fn test_write_skus() {
        let sku = SkuDetails {
            product_id: "gold".into(),
            title: "Gold".into(),
            description: String::new(),
            product_type: ProductType::Subscription,
            currency: "EUR".into(),
            price_micros: 4_990_000,
            price_text: "4,99 €".into(),
        };
        let mut writer = PurchaseWriter::new(Vec::new());
        writer.write_skus(&[sku]).unwrap();

        let output = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert!(output.starts_with("type,product_id,title,price,currency,price_value\n"));
        assert!(output.contains("subs,gold,Gold,\"4,99 €\",EUR,4.99"));
    }
}
