//! Single-slot purchase flow.
//!
//! At most one external purchase flow is in flight. `initiate` claims the slot
//! and hands out a [`PurchaseTicket`]; `complete` requests the buy intent,
//! launches the flow and waits for the [`FlowReporter`] to deliver the outcome.

use super::cache::PurchaseCache;
use super::client::fetch_purchases;
use super::settings::BillingSettings;
use crate::application::broker::ConnectionHandle;
use crate::domain::merchant::check_merchant_transaction;
use crate::domain::ports::{FlowLauncherArc, FlowOutcome, RecordParserArc, SignatureVerifierArc};
use crate::domain::product::{ProductType, PurchasePayload, ResponseCode};
use crate::domain::purchase::Purchase;
use crate::error::{BillingError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

struct PendingPurchase {
    id: u64,
    outcome: oneshot::Sender<FlowOutcome>,
}

type Slot = Arc<Mutex<Option<PendingPurchase>>>;

/// Receipt checks shared by the purchase flow and [`BillingClient::is_valid`].
///
/// [`BillingClient::is_valid`]: super::client::BillingClient::is_valid
#[derive(Clone, Default)]
pub struct ReceiptChecks {
    verifier: Option<SignatureVerifierArc>,
    license_key: Option<String>,
    merchant_id: Option<String>,
}

impl ReceiptChecks {
    pub fn new(
        verifier: Option<SignatureVerifierArc>,
        license_key: Option<String>,
        merchant_id: Option<String>,
    ) -> Self {
        Self {
            verifier,
            license_key,
            merchant_id,
        }
    }

    /// Passes when no license key is configured.
    pub fn signature_valid(&self, purchase: &Purchase) -> bool {
        let Some(license_key) = self.license_key.as_deref() else {
            return true;
        };
        let Some(verifier) = &self.verifier else {
            return false;
        };
        verifier.verify(
            &purchase.product_id,
            license_key,
            purchase.raw_response.as_deref().unwrap_or_default(),
            purchase.purchase_signature.as_deref().unwrap_or_default(),
        )
    }

    pub fn merchant_valid(&self, purchase: &Purchase) -> bool {
        check_merchant_transaction(purchase, self.merchant_id.as_deref())
    }

    /// Subscription order ids carry renewal suffixes, so only managed
    /// purchases are held to the merchant rule.
    fn merchant_valid_for(&self, purchase: &Purchase, product_type: ProductType) -> bool {
        product_type.is_subscription() || self.merchant_valid(purchase)
    }
}

/// A claimed purchase slot.
///
/// Dropping the ticket before the flow resolves frees the slot, unless a
/// newer flow already owns it.
pub struct PurchaseTicket {
    id: u64,
    product_id: String,
    product_type: ProductType,
    payload: PurchasePayload,
    outcome: oneshot::Receiver<FlowOutcome>,
    slot: Slot,
}

impl PurchaseTicket {
    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn product_type(&self) -> ProductType {
        self.product_type
    }

    pub fn payload(&self) -> &PurchasePayload {
        &self.payload
    }
}

impl Drop for PurchaseTicket {
    fn drop(&mut self) {
        let released = {
            let mut slot = self.slot.lock();
            if slot.as_ref().is_some_and(|pending| pending.id == self.id) {
                slot.take()
            } else {
                None
            }
        };
        if released.is_some() {
            debug!(product_id = %self.product_id, "Purchase slot released without outcome");
        }
    }
}

/// One-shot channel from the external flow back to the waiting purchase.
///
/// Reporting consumes the reporter. A reporter dropped without reporting
/// reports [`FlowOutcome::Cancelled`].
pub struct FlowReporter {
    id: u64,
    slot: Slot,
    reported: bool,
}

impl FlowReporter {
    pub fn report(mut self, outcome: FlowOutcome) {
        self.deliver(outcome);
    }

    fn deliver(&mut self, outcome: FlowOutcome) {
        self.reported = true;
        let pending = {
            let mut slot = self.slot.lock();
            if slot.as_ref().is_some_and(|pending| pending.id == self.id) {
                slot.take()
            } else {
                None
            }
        };
        match pending {
            Some(pending) => {
                if pending.outcome.send(outcome).is_err() {
                    debug!(flow = self.id, "Purchase was abandoned before its outcome arrived");
                }
            }
            None => debug!(flow = self.id, "Ignoring outcome for a flow that is no longer pending"),
        }
    }
}

impl Drop for FlowReporter {
    fn drop(&mut self) {
        if !self.reported {
            self.deliver(FlowOutcome::Cancelled);
        }
    }
}

pub struct PurchaseFlowCoordinator {
    slot: Slot,
    next_id: AtomicU64,
    launcher: FlowLauncherArc,
    parser: RecordParserArc,
    checks: ReceiptChecks,
    cache: Arc<PurchaseCache>,
    api_version: u32,
    package_name: String,
}

impl PurchaseFlowCoordinator {
    pub fn new(
        settings: &BillingSettings,
        launcher: FlowLauncherArc,
        parser: RecordParserArc,
        checks: ReceiptChecks,
        cache: Arc<PurchaseCache>,
    ) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
            launcher,
            parser,
            checks,
            cache,
            api_version: settings.api_version,
            package_name: settings.package_name.clone(),
        }
    }

    /// Claims the purchase slot. An occupied slot is left untouched.
    pub fn initiate(&self, product_id: &str, product_type: ProductType) -> Result<PurchaseTicket> {
        if product_id.trim().is_empty() {
            return Err(BillingError::InvalidArgument(
                "product id must not be empty".into(),
            ));
        }

        let (sender, receiver) = oneshot::channel();
        let id = {
            let mut slot = self.slot.lock();
            if slot.is_some() {
                return Err(BillingError::AlreadyPending);
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            *slot = Some(PendingPurchase {
                id,
                outcome: sender,
            });
            id
        };

        let payload = PurchasePayload::generate(product_type);
        debug!(flow = id, product_id, %payload, "Purchase slot claimed");
        Ok(PurchaseTicket {
            id,
            product_id: product_id.to_string(),
            product_type,
            payload,
            outcome: receiver,
            slot: Arc::clone(&self.slot),
        })
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Drives a claimed purchase to its outcome. The handle is released as soon
    /// as the remote calls are done; waiting for the user holds no connection.
    pub async fn complete(
        &self,
        mut ticket: PurchaseTicket,
        handle: ConnectionHandle,
    ) -> Result<Purchase> {
        let intent = handle
            .get_buy_intent(
                self.api_version,
                &self.package_name,
                &ticket.product_id,
                ticket.product_type,
                ticket.payload.as_str(),
            )
            .await?;

        match intent.code {
            ResponseCode::OK => {}
            ResponseCode::ITEM_ALREADY_OWNED => {
                let purchase = self.restore_owned(&ticket, &handle).await;
                handle.release();
                return purchase;
            }
            code => {
                handle.release();
                warn!(product_id = %ticket.product_id, %code, "Buy intent refused");
                return Err(BillingError::from_purchase_code(code));
            }
        }

        let flow = intent.flow.ok_or_else(|| {
            BillingError::Remote("buy intent carried no purchase flow".into())
        })?;
        let reporter = FlowReporter {
            id: ticket.id,
            slot: Arc::clone(&ticket.slot),
            reported: false,
        };
        let launched = self.launcher.launch(flow, &ticket.payload, reporter);
        handle.release();
        launched.map_err(|e| BillingError::FlowLaunchFailed(e.to_string()))?;

        let outcome = (&mut ticket.outcome)
            .await
            .unwrap_or(FlowOutcome::Cancelled);
        self.resolve(&ticket, outcome).await
    }

    async fn restore_owned(
        &self,
        ticket: &PurchaseTicket,
        handle: &ConnectionHandle,
    ) -> Result<Purchase> {
        let product_type = ticket.product_type;
        let cached = self
            .cache
            .cached(product_type)
            .await?
            .and_then(|mut map| map.remove(&ticket.product_id));

        let mut purchase = match cached {
            Some(purchase) => purchase,
            None => {
                debug!(product_id = %ticket.product_id, "Owned product missing from cache, reloading");
                let mut map = self
                    .cache
                    .reload(product_type, || {
                        fetch_purchases(
                            &**handle,
                            self.parser.as_ref(),
                            self.api_version,
                            &self.package_name,
                            product_type,
                        )
                    })
                    .await?;
                map.remove(&ticket.product_id)
                    .ok_or_else(|| BillingError::ProductNotFound(ticket.product_id.clone()))?
            }
        };

        purchase.restored = true;
        if !self.checks.merchant_valid_for(&purchase, product_type) {
            return Err(BillingError::MerchantIdMismatch);
        }
        info!(product_id = %purchase.product_id, "Restored owned purchase");
        Ok(purchase)
    }

    async fn resolve(&self, ticket: &PurchaseTicket, outcome: FlowOutcome) -> Result<Purchase> {
        let (echoed_payload, raw_record, signature, already_owned) = match outcome {
            FlowOutcome::Success {
                echoed_payload,
                raw_record,
                signature,
            } => (echoed_payload, raw_record, signature, false),
            FlowOutcome::AlreadyOwned {
                echoed_payload,
                raw_record,
                signature,
            } => (echoed_payload, raw_record, signature, true),
            FlowOutcome::Cancelled => {
                info!(product_id = %ticket.product_id, "Purchase cancelled");
                return Err(BillingError::PurchaseCancelledByUser);
            }
            FlowOutcome::Error(code) => return Err(BillingError::from_purchase_code(code)),
        };

        let payload = &ticket.payload;
        if !payload.matches(echoed_payload.as_deref()) {
            return Err(BillingError::PayloadMismatch {
                expected: payload.to_string(),
                actual: echoed_payload.unwrap_or_default(),
            });
        }

        let mut purchase = self
            .parser
            .parse_purchase(&raw_record)?
            .with_receipt(&raw_record, signature);
        if !payload.matches(Some(purchase.developer_payload.as_str())) {
            return Err(BillingError::PayloadMismatch {
                expected: payload.to_string(),
                actual: purchase.developer_payload,
            });
        }

        if !already_owned && !self.checks.signature_valid(&purchase) {
            return Err(BillingError::SignatureMismatch);
        }
        if !self.checks.merchant_valid_for(&purchase, ticket.product_type) {
            return Err(BillingError::MerchantIdMismatch);
        }

        if already_owned {
            purchase.restored = true;
            let known = self
                .cache
                .cached(ticket.product_type)
                .await?
                .is_some_and(|map| map.contains_key(&purchase.product_id));
            if !known {
                self.cache.put(purchase.clone(), ticket.product_type).await?;
            }
        } else {
            self.cache.put(purchase.clone(), ticket.product_type).await?;
        }

        info!(
            product_id = %purchase.product_id,
            order_id = %purchase.order_id,
            restored = purchase.restored,
            "Purchase completed"
        );
        Ok(purchase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{ExternalFlowLauncher, FlowDescriptor};
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::in_memory::InMemoryStorage;
    use crate::infrastructure::json_parser::JsonRecordParser;
    use std::time::Duration;

    struct NeverLaunch;

    impl ExternalFlowLauncher for NeverLaunch {
        fn launch(
            &self,
            _flow: FlowDescriptor,
            _payload: &PurchasePayload,
            _reporter: FlowReporter,
        ) -> Result<()> {
            Err(BillingError::FlowLaunchFailed("not expected".into()))
        }
    }

    fn coordinator() -> PurchaseFlowCoordinator {
        let parser: RecordParserArc = Arc::new(JsonRecordParser);
        let cache = Arc::new(PurchaseCache::new(
            Arc::new(InMemoryStorage::new()),
            parser.clone(),
            Arc::new(ManualClock::new(0)),
            Duration::from_secs(60),
        ));
        PurchaseFlowCoordinator::new(
            &BillingSettings::new("com.example.app"),
            Arc::new(NeverLaunch),
            parser,
            ReceiptChecks::default(),
            cache,
        )
    }

    fn reporter_for(coordinator: &PurchaseFlowCoordinator, ticket: &PurchaseTicket) -> FlowReporter {
        FlowReporter {
            id: ticket.id,
            slot: Arc::clone(&coordinator.slot),
            reported: false,
        }
    }

    #[test]
    fn test_empty_product_id_rejected() {
        let coordinator = coordinator();
        assert!(matches!(
            coordinator.initiate("  ", ProductType::Managed),
            Err(BillingError::InvalidArgument(_))
        ));
        assert!(!coordinator.is_pending());
    }

    #[test]
    fn test_second_initiate_is_already_pending() {
        let coordinator = coordinator();
        let ticket = coordinator.initiate("premium", ProductType::Managed).unwrap();

        assert!(matches!(
            coordinator.initiate("gold", ProductType::Subscription),
            Err(BillingError::AlreadyPending)
        ));
        // the original claim is intact
        let held = coordinator.slot.lock().as_ref().map(|p| p.id);
        assert_eq!(held, Some(ticket.id));
    }

    #[test]
    fn test_ticket_drop_frees_slot() {
        let coordinator = coordinator();
        let ticket = coordinator.initiate("premium", ProductType::Managed).unwrap();
        assert!(ticket.payload().as_str().starts_with("inapp:"));
        drop(ticket);

        assert!(!coordinator.is_pending());
        assert!(coordinator.initiate("premium", ProductType::Managed).is_ok());
    }

    #[test]
    fn test_stale_ticket_does_not_clear_newer_flow() {
        let coordinator = coordinator();
        let first = coordinator.initiate("premium", ProductType::Managed).unwrap();
        let reporter = reporter_for(&coordinator, &first);
        reporter.report(FlowOutcome::Cancelled);

        let second = coordinator.initiate("gold", ProductType::Managed).unwrap();
        drop(first);
        assert!(coordinator.is_pending());
        drop(second);
        assert!(!coordinator.is_pending());
    }

    #[tokio::test]
    async fn test_first_report_wins() {
        let coordinator = coordinator();
        let mut ticket = coordinator.initiate("premium", ProductType::Managed).unwrap();
        let first = reporter_for(&coordinator, &ticket);
        let late = reporter_for(&coordinator, &ticket);

        first.report(FlowOutcome::Error(ResponseCode::ERROR));
        late.report(FlowOutcome::Cancelled);

        let outcome = (&mut ticket.outcome).await.unwrap();
        assert_eq!(outcome, FlowOutcome::Error(ResponseCode::ERROR));
    }

    #[tokio::test]
    async fn test_dropped_reporter_reports_cancelled() {
        let coordinator = coordinator();
        let mut ticket = coordinator.initiate("premium", ProductType::Managed).unwrap();
        drop(reporter_for(&coordinator, &ticket));

        let outcome = (&mut ticket.outcome).await.unwrap();
        assert_eq!(outcome, FlowOutcome::Cancelled);
        assert!(!coordinator.is_pending());
    }

    #[tokio::test]
    async fn test_mismatched_echo_rejected() {
        let coordinator = coordinator();
        let ticket = coordinator.initiate("premium", ProductType::Managed).unwrap();
        let outcome = FlowOutcome::Success {
            echoed_payload: Some("inapp:someone-else".into()),
            raw_record: "{}".into(),
            signature: None,
        };

        let err = coordinator.resolve(&ticket, outcome).await.unwrap_err();
        assert!(matches!(err, BillingError::PayloadMismatch { .. }));
    }

    #[test]
    fn test_merchant_rule_skips_subscriptions() {
        let checks = ReceiptChecks::new(None, None, Some("1234".into()));
        let purchase = Purchase {
            product_id: "gold".into(),
            order_id: "9999.5678..0".into(),
            purchase_time_millis: 1_400_000_000_000,
            ..Default::default()
        };
        assert!(!checks.merchant_valid_for(&purchase, ProductType::Managed));
        assert!(checks.merchant_valid_for(&purchase, ProductType::Subscription));
    }

    #[test]
    fn test_license_key_without_verifier_fails_closed() {
        let checks = ReceiptChecks::new(None, Some("key".into()), None);
        assert!(!checks.signature_valid(&Purchase::default()));
        assert!(ReceiptChecks::default().signature_valid(&Purchase::default()));
    }
}
