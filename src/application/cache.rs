//! Time-bounded cache of owned purchases, one partition per product type.
//!
//! Storage layout per partition: `"<type>"` holds the serialized
//! `PurchaseMap`, `"<type>:LAST_LOAD"` the epoch millis of the last full load.

use crate::domain::ports::{ClockArc, RecordParserArc, StorageArc};
use crate::domain::product::ProductType;
use crate::domain::purchase::{Purchase, PurchaseMap, to_map};
use crate::error::{BillingError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

const LAST_LOAD: &str = ":LAST_LOAD";

pub struct PurchaseCache {
    storage: StorageArc,
    parser: RecordParserArc,
    clock: ClockArc,
    lifetime_ms: i64,
    managed: Mutex<()>,
    subscriptions: Mutex<()>,
}

impl PurchaseCache {
    pub fn new(
        storage: StorageArc,
        parser: RecordParserArc,
        clock: ClockArc,
        lifetime: Duration,
    ) -> Self {
        Self {
            storage,
            parser,
            clock,
            lifetime_ms: i64::try_from(lifetime.as_millis()).unwrap_or(i64::MAX),
            managed: Mutex::new(()),
            subscriptions: Mutex::new(()),
        }
    }

    fn partition(&self, product_type: ProductType) -> &Mutex<()> {
        match product_type {
            ProductType::Managed => &self.managed,
            ProductType::Subscription => &self.subscriptions,
        }
    }

    /// Returns the cached map when fresh, otherwise runs `load` and replaces
    /// the partition with its result.
    ///
    /// Concurrent callers on a stale partition are serialized, so only the
    /// first one reloads.
    pub async fn get_or_load<F, Fut>(&self, product_type: ProductType, load: F) -> Result<PurchaseMap>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Purchase>>>,
    {
        let _guard = self.partition(product_type).lock().await;
        if let Some(map) = self.fresh(product_type).await? {
            debug!(%product_type, "Purchase cache hit");
            return Ok(map);
        }
        self.replace(product_type, load().await?).await
    }

    /// Unconditionally reloads the partition.
    pub async fn reload<F, Fut>(&self, product_type: ProductType, load: F) -> Result<PurchaseMap>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Purchase>>>,
    {
        let _guard = self.partition(product_type).lock().await;
        self.replace(product_type, load().await?).await
    }

    /// The stored map regardless of age.
    pub async fn cached(&self, product_type: ProductType) -> Result<Option<PurchaseMap>> {
        match self.storage.get(product_type.as_str()).await? {
            Some(raw) => Ok(Some(self.parser.parse_purchases(&raw)?)),
            None => Ok(None),
        }
    }

    /// Inserts one purchase without marking the partition as freshly loaded.
    pub async fn put(&self, purchase: Purchase, product_type: ProductType) -> Result<()> {
        let _guard = self.partition(product_type).lock().await;
        let mut map = self.cached(product_type).await?.unwrap_or_default();
        map.insert(purchase.product_id.clone(), purchase);
        self.write_map(product_type, &map).await
    }

    /// Removes one purchase without touching the load timestamp.
    pub async fn invalidate(&self, product_id: &str, product_type: ProductType) -> Result<()> {
        let _guard = self.partition(product_type).lock().await;
        let Some(mut map) = self.cached(product_type).await? else {
            return Ok(());
        };
        if map.remove(product_id).is_some() {
            debug!(%product_type, product_id, "Evicted purchase from cache");
            self.write_map(product_type, &map).await?;
        }
        Ok(())
    }

    pub async fn last_load(&self, product_type: ProductType) -> Result<Option<i64>> {
        let key = format!("{}{LAST_LOAD}", product_type.as_str());
        match self.storage.get(&key).await? {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|e| BillingError::Parse(format!("bad {key} value: {e}"))),
            None => Ok(None),
        }
    }

    async fn fresh(&self, product_type: ProductType) -> Result<Option<PurchaseMap>> {
        let Some(last_load) = self.last_load(product_type).await? else {
            return Ok(None);
        };
        let age = self.clock.now_millis().checked_sub(last_load);
        if !age.is_some_and(|age| (0..=self.lifetime_ms).contains(&age)) {
            return Ok(None);
        }
        self.cached(product_type).await
    }

    /// Writes the map, then the stamp. A failed stamp write leaves the
    /// previous stamp in place, which can only understate freshness.
    async fn replace(&self, product_type: ProductType, purchases: Vec<Purchase>) -> Result<PurchaseMap> {
        let map = to_map(purchases);
        self.write_map(product_type, &map).await?;
        let key = format!("{}{LAST_LOAD}", product_type.as_str());
        self.storage
            .put(&key, self.clock.now_millis().to_string())
            .await?;
        debug!(%product_type, entries = map.len(), "Purchase cache reloaded");
        Ok(map)
    }

    async fn write_map(&self, product_type: ProductType, map: &PurchaseMap) -> Result<()> {
        let encoded = self.parser.serialize_purchases(map)?;
        self.storage.put(product_type.as_str(), encoded).await
    }
}
