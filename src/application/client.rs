use super::broker::{ConnectionSettings, ServiceConnectionBroker};
use super::cache::PurchaseCache;
use super::purchase_flow::{PurchaseFlowCoordinator, PurchaseTicket, ReceiptChecks};
use super::settings::BillingSettings;
use crate::domain::ports::{
    ClockArc, FlowLauncherArc, RecordParser, RecordParserArc, RemoteBillingService,
    ServiceBinderBox, SignatureVerifierArc, StorageArc,
};
use crate::domain::product::ProductType;
use crate::domain::purchase::{Purchase, PurchaseMap};
use crate::domain::sku::SkuDetails;
use crate::error::{BillingError, Result};
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::in_memory::InMemoryStorage;
use crate::infrastructure::json_parser::JsonRecordParser;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum number of product ids per `get_sku_details` call.
pub const SKU_DETAILS_BATCH_LIMIT: usize = 20;

/// Loads every owned purchase of `product_type`, following continuation
/// tokens until the service reports no more pages.
pub(crate) async fn fetch_purchases(
    service: &dyn RemoteBillingService,
    parser: &dyn RecordParser,
    api_version: u32,
    package_name: &str,
    product_type: ProductType,
) -> Result<Vec<Purchase>> {
    let mut purchases = Vec::new();
    let mut continuation: Option<String> = None;
    loop {
        let page = service
            .get_purchases(api_version, package_name, product_type, continuation.as_deref())
            .await?;
        if !page.code.is_ok() {
            return Err(BillingError::RemoteCallFailed { code: page.code });
        }

        for (index, raw) in page.records.iter().enumerate() {
            let signature = page.signatures.get(index).cloned();
            purchases.push(parser.parse_purchase(raw)?.with_receipt(raw, signature));
        }

        match page.continuation_token.filter(|token| !token.is_empty()) {
            Some(token) => continuation = Some(token),
            None => break,
        }
    }
    debug!(%product_type, count = purchases.len(), "Loaded purchases from service");
    Ok(purchases)
}

/// Assembles a [`BillingClient`] from settings and collaborators.
///
/// Parser, storage and clock default to JSON, in-memory and the system clock.
pub struct BillingClientBuilder {
    settings: BillingSettings,
    binder: ServiceBinderBox,
    launcher: FlowLauncherArc,
    parser: Option<RecordParserArc>,
    storage: Option<StorageArc>,
    verifier: Option<SignatureVerifierArc>,
    clock: Option<ClockArc>,
}

impl BillingClientBuilder {
    pub fn parser(mut self, parser: RecordParserArc) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn storage(mut self, storage: StorageArc) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn verifier(mut self, verifier: SignatureVerifierArc) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn clock(mut self, clock: ClockArc) -> Self {
        self.clock = Some(clock);
        self
    }

    /// # Errors
    ///
    /// `BillingError::Config` for invalid settings, a license key without a
    /// verifier, or when called outside a Tokio runtime.
    pub fn build(self) -> Result<BillingClient> {
        let settings = self.settings;
        settings.validate()?;
        if settings.license_key().is_some() && self.verifier.is_none() {
            return Err(BillingError::Config(
                "license_key is set but no signature verifier was provided".into(),
            ));
        }

        let parser = self.parser.unwrap_or_else(|| Arc::new(JsonRecordParser));
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(InMemoryStorage::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let broker =
            ServiceConnectionBroker::new(self.binder, ConnectionSettings::from(&settings))?;
        let cache = Arc::new(PurchaseCache::new(
            storage,
            parser.clone(),
            clock,
            settings.cache_lifetime(),
        ));
        let checks = ReceiptChecks::new(
            self.verifier,
            settings.license_key().map(str::to_string),
            settings.merchant_id.clone(),
        );
        let coordinator = PurchaseFlowCoordinator::new(
            &settings,
            self.launcher,
            parser.clone(),
            checks.clone(),
            cache.clone(),
        );

        info!(package = %settings.package_name, "Billing client ready");
        Ok(BillingClient {
            settings,
            broker,
            cache,
            coordinator,
            parser,
            checks,
        })
    }
}

/// Entry point for applications.
///
/// Each operation acquires the shared connection, makes its remote call(s),
/// releases the connection and then updates the purchase cache.
pub struct BillingClient {
    settings: BillingSettings,
    broker: ServiceConnectionBroker,
    cache: Arc<PurchaseCache>,
    coordinator: PurchaseFlowCoordinator,
    parser: RecordParserArc,
    checks: ReceiptChecks,
}

impl BillingClient {
    /// # Arguments
    ///
    /// * `settings` - Package name, keys and timing tunables.
    /// * `binder` - Platform hook that binds the remote service.
    /// * `launcher` - Starts the user-facing purchase flow.
    pub fn builder(
        settings: BillingSettings,
        binder: ServiceBinderBox,
        launcher: FlowLauncherArc,
    ) -> BillingClientBuilder {
        BillingClientBuilder {
            settings,
            binder,
            launcher,
            parser: None,
            storage: None,
            verifier: None,
            clock: None,
        }
    }

    pub fn settings(&self) -> &BillingSettings {
        &self.settings
    }

    pub fn broker(&self) -> &ServiceConnectionBroker {
        &self.broker
    }

    pub fn cache(&self) -> &PurchaseCache {
        &self.cache
    }

    /// Fetches owned purchases straight from the service, bypassing the cache.
    pub async fn load_purchases(&self, product_type: ProductType) -> Result<Vec<Purchase>> {
        let handle = self.broker.acquire().await?;
        let purchases = fetch_purchases(
            &*handle,
            self.parser.as_ref(),
            self.settings.api_version,
            &self.settings.package_name,
            product_type,
        )
        .await;
        handle.release();
        purchases
    }

    /// Owned purchases keyed by product id, served from cache while fresh.
    pub async fn purchases_map(&self, product_type: ProductType) -> Result<PurchaseMap> {
        self.cache
            .get_or_load(product_type, || self.load_purchases(product_type))
            .await
    }

    pub async fn purchased_products_map(&self) -> Result<PurchaseMap> {
        self.purchases_map(ProductType::Managed).await
    }

    pub async fn purchased_subscriptions_map(&self) -> Result<PurchaseMap> {
        self.purchases_map(ProductType::Subscription).await
    }

    pub async fn purchases(&self, product_type: ProductType) -> Result<Vec<Purchase>> {
        Ok(self.purchases_map(product_type).await?.into_values().collect())
    }

    pub async fn purchased_ids(&self, product_type: ProductType) -> Result<Vec<String>> {
        Ok(self.purchases_map(product_type).await?.into_keys().collect())
    }

    pub async fn is_purchased(&self, product_id: &str, product_type: ProductType) -> Result<bool> {
        Ok(self
            .purchases_map(product_type)
            .await?
            .contains_key(product_id))
    }

    pub async fn is_subscribed(&self, product_id: &str) -> Result<bool> {
        self.is_purchased(product_id, ProductType::Subscription).await
    }

    pub async fn purchased(&self, product_id: &str, product_type: ProductType) -> Result<Purchase> {
        self.purchases_map(product_type)
            .await?
            .remove(product_id)
            .ok_or_else(|| BillingError::ProductNotFound(product_id.to_string()))
    }

    /// Claims the purchase slot without contacting the service.
    ///
    /// Split out of [`purchase`](Self::purchase) for callers that need to know
    /// synchronously whether a flow could start.
    pub fn initiate_purchase(
        &self,
        product_id: &str,
        product_type: ProductType,
    ) -> Result<PurchaseTicket> {
        self.coordinator.initiate(product_id, product_type)
    }

    pub async fn complete_purchase(&self, ticket: PurchaseTicket) -> Result<Purchase> {
        let handle = self.broker.acquire().await?;
        self.coordinator.complete(ticket, handle).await
    }

    /// Runs a purchase to completion. Waits for the user for as long as the
    /// external flow stays open.
    pub async fn purchase(&self, product_id: &str, product_type: ProductType) -> Result<Purchase> {
        let ticket = self.initiate_purchase(product_id, product_type)?;
        self.complete_purchase(ticket).await
    }

    pub async fn purchase_product(&self, product_id: &str) -> Result<Purchase> {
        self.purchase(product_id, ProductType::Managed).await
    }

    pub async fn subscribe(&self, product_id: &str) -> Result<Purchase> {
        self.purchase(product_id, ProductType::Subscription).await
    }

    pub fn is_purchase_pending(&self) -> bool {
        self.coordinator.is_pending()
    }

    /// Consumes a managed product so it can be bought again.
    ///
    /// Purchases are reloaded first because the token must be current.
    pub async fn consume(&self, product_id: &str) -> Result<Purchase> {
        let mut owned = self
            .cache
            .reload(ProductType::Managed, || {
                self.load_purchases(ProductType::Managed)
            })
            .await?;
        let purchase = owned
            .remove(product_id)
            .filter(Purchase::has_token)
            .ok_or_else(|| BillingError::PurchaseNotFound(product_id.to_string()))?;

        let handle = self.broker.acquire().await?;
        let code = handle
            .consume_purchase(
                self.settings.api_version,
                &self.settings.package_name,
                &purchase.purchase_token,
            )
            .await;
        handle.release();
        let code = code?;

        if !code.is_ok() {
            warn!(product_id, %code, "Consume refused");
            return Err(BillingError::ConsumeFailed {
                product_id: product_id.to_string(),
                code,
            });
        }
        self.cache
            .invalidate(product_id, ProductType::Managed)
            .await?;
        info!(product_id, "Purchase consumed");
        Ok(purchase)
    }

    /// Catalog details for `product_ids`, in request order.
    ///
    /// Requests are split into batches of [`SKU_DETAILS_BATCH_LIMIT`] ids.
    pub async fn sku_details(
        &self,
        product_ids: &[String],
        product_type: ProductType,
    ) -> Result<Vec<SkuDetails>> {
        if product_ids.is_empty() {
            return Err(BillingError::InvalidArgument(
                "product id list must not be empty".into(),
            ));
        }

        let handle = self.broker.acquire().await?;
        let mut details = Vec::with_capacity(product_ids.len());
        for batch in product_ids.chunks(SKU_DETAILS_BATCH_LIMIT) {
            let response = handle
                .get_sku_details(
                    self.settings.api_version,
                    &self.settings.package_name,
                    product_type,
                    batch,
                )
                .await?;
            if !response.code.is_ok() {
                return Err(BillingError::RemoteCallFailed {
                    code: response.code,
                });
            }
            for raw in &response.records {
                details.push(self.parser.parse_sku_details(raw)?);
            }
        }
        handle.release();

        debug!(%product_type, requested = product_ids.len(), found = details.len(), "Fetched sku details");
        Ok(details)
    }

    pub async fn sku_detail(&self, product_id: &str, product_type: ProductType) -> Result<SkuDetails> {
        self.sku_details(&[product_id.to_string()], product_type)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BillingError::ProductNotFound(product_id.to_string()))
    }

    pub async fn product(&self, product_id: &str) -> Result<SkuDetails> {
        self.sku_detail(product_id, ProductType::Managed).await
    }

    pub async fn subscription(&self, product_id: &str) -> Result<SkuDetails> {
        self.sku_detail(product_id, ProductType::Subscription).await
    }

    /// Signature and merchant checks on an already-parsed purchase.
    pub fn is_valid(&self, purchase: &Purchase) -> bool {
        self.checks.signature_valid(purchase) && self.checks.merchant_valid(purchase)
    }
}
