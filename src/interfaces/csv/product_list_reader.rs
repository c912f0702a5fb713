use crate::error::{BillingError, Result};
use serde::Deserialize;
use std::io::Read;

#[derive(Deserialize)]
struct ProductRow {
    product_id: String,
}

/// Reads product ids from a CSV source with a `product_id` column.
///
/// Whitespace is trimmed and extra columns are ignored, so catalog exports can
/// be fed in directly.
pub struct ProductListReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> ProductListReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily yields the ids, skipping blank ones.
    pub fn product_ids(self) -> impl Iterator<Item = Result<String>> {
        self.reader
            .into_deserialize::<ProductRow>()
            .filter_map(|row| match row {
                Ok(row) if row.product_id.is_empty() => None,
                Ok(row) => Some(Ok(row.product_id)),
                Err(e) => Some(Err(BillingError::from(e))),
            })
    }
}
