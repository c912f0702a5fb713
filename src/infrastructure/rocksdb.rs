use crate::domain::ports::Storage;
use crate::error::{BillingError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, DB, Options};
use std::path::Path;
use std::sync::Arc;

/// Column Family holding the purchase cache entries.
pub const CF_PURCHASES: &str = "purchases";

/// A persistent key-value store backed by RocksDB.
///
/// Keeps the purchase cache across restarts. Values are stored as UTF-8
/// strings in their own Column Family.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDbStorage {
    db: Arc<DB>,
}

impl RocksDbStorage {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// # Arguments
    ///
    /// * `path` - The filesystem path where the database will be stored.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_purchases = ColumnFamilyDescriptor::new(CF_PURCHASES, Options::default());
        let db = DB::open_cf_descriptors(&opts, path, vec![cf_purchases])?;

        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait]
impl Storage for RocksDbStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let cf = self
            .db
            .cf_handle(CF_PURCHASES)
            .ok_or_else(|| BillingError::Storage("purchases column family not found".into()))?;

        match self.db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| BillingError::Storage(format!("non UTF-8 value under {key}: {e}"))),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        let cf = self
            .db
            .cf_handle(CF_PURCHASES)
            .ok_or_else(|| BillingError::Storage("purchases column family not found".into()))?;

        self.db.put_cf(&cf, key.as_bytes(), value.as_bytes())?;
        Ok(())
    }
}
