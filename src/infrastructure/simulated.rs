//! In-process stand-in for the platform billing service.
//!
//! Backs the CLI and the test suites. The store contents can be seeded from a
//! JSON fixture; behaviour of the binder and the purchase flow is scripted.

use crate::application::broker::ConnectionListener;
use crate::application::purchase_flow::FlowReporter;
use crate::domain::ports::{
    BuyIntentResponse, ExternalFlowLauncher, FlowDescriptor, FlowOutcome, PurchasesResponse,
    RemoteBillingService, ServiceBinder, SignatureVerifier, SkuDetailsResponse,
};
use crate::domain::product::{ProductType, PurchasePayload, ResponseCode};
use crate::domain::purchase::Purchase;
use crate::domain::sku::SkuDetails;
use crate::error::{BillingError, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Key the simulated store signs receipts with.
pub const SIMULATED_LICENSE_KEY: &str = "simulated-license-key";

/// The real service rejects larger `get_sku_details` requests.
const MAX_SKU_REQUEST: usize = 20;

/// Receipt signature as produced by the simulated store.
pub fn simulated_signature(license_key: &str, product_id: &str, raw_record: &str) -> String {
    format!("{license_key}:{product_id}:{}", raw_record.len())
}

fn managed() -> ProductType {
    ProductType::Managed
}

/// Seed data for the simulated store.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreFixture {
    #[serde(default)]
    pub purchases: Vec<OwnedFixture>,
    #[serde(default)]
    pub catalog: Vec<SkuDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OwnedFixture {
    #[serde(rename = "type", default = "managed")]
    pub product_type: ProductType,
    #[serde(flatten)]
    pub purchase: Purchase,
}

impl StoreFixture {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

struct StoreState {
    owned: Vec<(ProductType, Purchase)>,
    catalog: Vec<SkuDetails>,
    buy_intent_code: Option<ResponseCode>,
    consume_code: Option<ResponseCode>,
    page_size: Option<usize>,
    offline: bool,
    orders: u64,
}

/// Scriptable [`RemoteBillingService`] holding a catalog and owned purchases.
pub struct SimulatedBillingService {
    package_name: String,
    license_key: String,
    state: Mutex<StoreState>,
    purchase_calls: AtomicUsize,
    buy_intent_calls: AtomicUsize,
    consume_calls: AtomicUsize,
    sku_batches: Mutex<Vec<usize>>,
}

impl SimulatedBillingService {
    pub fn new(package_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            license_key: SIMULATED_LICENSE_KEY.to_string(),
            state: Mutex::new(StoreState {
                owned: Vec::new(),
                catalog: Vec::new(),
                buy_intent_code: None,
                consume_code: None,
                page_size: None,
                offline: false,
                orders: 0,
            }),
            purchase_calls: AtomicUsize::new(0),
            buy_intent_calls: AtomicUsize::new(0),
            consume_calls: AtomicUsize::new(0),
            sku_batches: Mutex::new(Vec::new()),
        }
    }

    pub fn from_fixture(package_name: impl Into<String>, fixture: StoreFixture) -> Self {
        let service = Self::new(package_name);
        {
            let mut state = service.state.lock();
            state.catalog = fixture.catalog;
            state.owned = fixture
                .purchases
                .into_iter()
                .map(|owned| (owned.product_type, owned.purchase))
                .collect();
        }
        service
    }

    pub fn add_owned(&self, product_type: ProductType, purchase: Purchase) {
        let mut state = self.state.lock();
        state
            .owned
            .retain(|(t, p)| !(*t == product_type && p.product_id == purchase.product_id));
        state.owned.push((product_type, purchase));
    }

    pub fn add_product(&self, sku: SkuDetails) {
        self.state.lock().catalog.push(sku);
    }

    pub fn owned(&self, product_type: ProductType) -> Vec<Purchase> {
        self.state
            .lock()
            .owned
            .iter()
            .filter(|(t, _)| *t == product_type)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Forces every buy intent to answer with `code`.
    pub fn set_buy_intent_code(&self, code: Option<ResponseCode>) {
        self.state.lock().buy_intent_code = code;
    }

    pub fn set_consume_code(&self, code: Option<ResponseCode>) {
        self.state.lock().consume_code = code;
    }

    /// Splits `get_purchases` answers into pages of `size` records.
    pub fn set_page_size(&self, size: Option<usize>) {
        self.state.lock().page_size = size.filter(|s| *s > 0);
    }

    /// Makes every remote call fail at the transport level.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    pub fn purchase_calls(&self) -> usize {
        self.purchase_calls.load(Ordering::SeqCst)
    }

    pub fn buy_intent_calls(&self) -> usize {
        self.buy_intent_calls.load(Ordering::SeqCst)
    }

    pub fn consume_calls(&self) -> usize {
        self.consume_calls.load(Ordering::SeqCst)
    }

    /// Sizes of the `get_sku_details` requests received so far.
    pub fn sku_batches(&self) -> Vec<usize> {
        self.sku_batches.lock().clone()
    }

    /// Wire form of an owned purchase.
    pub fn record_for(purchase: &Purchase) -> String {
        json!({
            "orderId": purchase.order_id,
            "packageName": purchase.package_name,
            "productId": purchase.product_id,
            "purchaseTime": purchase.purchase_time_millis,
            "purchaseState": purchase.purchase_state,
            "developerPayload": purchase.developer_payload,
            "purchaseToken": purchase.purchase_token,
        })
        .to_string()
    }

    fn signed(&self, purchase: &Purchase) -> (String, String) {
        let raw = Self::record_for(purchase);
        let signature = simulated_signature(&self.license_key, &purchase.product_id, &raw);
        (raw, signature)
    }

    /// Completes the purchase behind `flow` with `payload` as developer
    /// payload and returns its signed record. An already owned product is
    /// re-stamped with the new payload instead of bought twice.
    pub fn fulfil(&self, flow: &FlowDescriptor, payload: &str) -> Result<(String, String)> {
        let (product_type, product_id) = parse_flow(flow)?;
        let mut state = self.state.lock();

        let existing = state
            .owned
            .iter()
            .position(|(t, p)| *t == product_type && p.product_id == product_id);
        if let Some(index) = existing {
            state.owned[index].1.developer_payload = payload.to_string();
            let owned = state.owned[index].1.clone();
            drop(state);
            return Ok(self.signed(&owned));
        }

        state.orders += 1;
        let purchase = Purchase {
            product_id: product_id.to_string(),
            developer_payload: payload.to_string(),
            order_id: format!("GPA.{:04}-{:04}", state.orders / 10_000, state.orders % 10_000),
            package_name: self.package_name.clone(),
            purchase_state: 0,
            purchase_token: format!("token-{product_id}-{}", state.orders),
            purchase_time_millis: Utc::now().timestamp_millis(),
            ..Default::default()
        };
        state.owned.push((product_type, purchase.clone()));
        drop(state);

        debug!(product_id, "Simulated store fulfilled purchase");
        Ok(self.signed(&purchase))
    }

    fn check_online(&self) -> Result<()> {
        if self.state.lock().offline {
            return Err(BillingError::Remote("service is not reachable".into()));
        }
        Ok(())
    }
}

fn parse_flow(flow: &FlowDescriptor) -> Result<(ProductType, &str)> {
    let (product_type, product_id) = flow
        .0
        .split_once(':')
        .ok_or_else(|| BillingError::InvalidArgument(format!("unknown flow {}", flow.0)))?;
    Ok((product_type.parse()?, product_id))
}

#[async_trait]
impl RemoteBillingService for SimulatedBillingService {
    async fn get_buy_intent(
        &self,
        _api_version: u32,
        package_name: &str,
        product_id: &str,
        product_type: ProductType,
        _payload: &str,
    ) -> Result<BuyIntentResponse> {
        self.buy_intent_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let state = self.state.lock();

        let code = if let Some(code) = state.buy_intent_code {
            code
        } else if package_name != self.package_name {
            ResponseCode::DEVELOPER_ERROR
        } else if state
            .owned
            .iter()
            .any(|(t, p)| *t == product_type && p.product_id == product_id)
        {
            ResponseCode::ITEM_ALREADY_OWNED
        } else if !state
            .catalog
            .iter()
            .any(|sku| sku.product_type == product_type && sku.product_id == product_id)
        {
            ResponseCode::ITEM_UNAVAILABLE
        } else {
            ResponseCode::OK
        };

        let flow = code
            .is_ok()
            .then(|| FlowDescriptor(format!("{product_type}:{product_id}")));
        Ok(BuyIntentResponse { code, flow })
    }

    async fn get_purchases(
        &self,
        _api_version: u32,
        package_name: &str,
        product_type: ProductType,
        continuation_token: Option<&str>,
    ) -> Result<PurchasesResponse> {
        self.purchase_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        if package_name != self.package_name {
            return Ok(PurchasesResponse {
                code: ResponseCode::DEVELOPER_ERROR,
                ..Default::default()
            });
        }

        let (owned, page_size) = {
            let state = self.state.lock();
            let owned: Vec<Purchase> = state
                .owned
                .iter()
                .filter(|(t, _)| *t == product_type)
                .map(|(_, p)| p.clone())
                .collect();
            (owned, state.page_size)
        };

        let start = continuation_token
            .and_then(|token| token.parse::<usize>().ok())
            .unwrap_or(0)
            .min(owned.len());
        let end = page_size.map_or(owned.len(), |size| (start + size).min(owned.len()));

        let mut response = PurchasesResponse::default();
        for purchase in &owned[start..end] {
            let (raw, signature) = self.signed(purchase);
            response.records.push(raw);
            response.signatures.push(signature);
        }
        response.continuation_token = (end < owned.len()).then(|| end.to_string());
        Ok(response)
    }

    async fn consume_purchase(
        &self,
        _api_version: u32,
        package_name: &str,
        purchase_token: &str,
    ) -> Result<ResponseCode> {
        self.consume_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let mut state = self.state.lock();
        if let Some(code) = state.consume_code {
            return Ok(code);
        }
        if package_name != self.package_name {
            return Ok(ResponseCode::DEVELOPER_ERROR);
        }

        let before = state.owned.len();
        state.owned.retain(|(t, p)| {
            !(t.is_managed() && p.has_token() && p.purchase_token == purchase_token)
        });
        if state.owned.len() < before {
            Ok(ResponseCode::OK)
        } else {
            Ok(ResponseCode::ITEM_NOT_OWNED)
        }
    }

    async fn get_sku_details(
        &self,
        _api_version: u32,
        package_name: &str,
        product_type: ProductType,
        product_ids: &[String],
    ) -> Result<SkuDetailsResponse> {
        self.sku_batches.lock().push(product_ids.len());
        self.check_online()?;
        if package_name != self.package_name || product_ids.len() > MAX_SKU_REQUEST {
            return Ok(SkuDetailsResponse {
                code: ResponseCode::DEVELOPER_ERROR,
                records: Vec::new(),
            });
        }

        let state = self.state.lock();
        let mut records = Vec::new();
        for id in product_ids {
            if let Some(sku) = state
                .catalog
                .iter()
                .find(|sku| sku.product_type == product_type && &sku.product_id == id)
            {
                records.push(serde_json::to_string(sku)?);
            }
        }
        Ok(SkuDetailsResponse {
            code: ResponseCode::OK,
            records,
        })
    }
}

/// How [`SimulatedBinder`] answers a bind request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindBehavior {
    /// Reports the connection before `bind` returns.
    Connect,
    /// `bind` fails immediately.
    Reject(String),
    /// Accepts the request and never reports back on its own.
    Hang,
}

/// [`ServiceBinder`] over a [`SimulatedBillingService`].
pub struct SimulatedBinder {
    service: Arc<SimulatedBillingService>,
    behavior: Mutex<BindBehavior>,
    listeners: Mutex<Vec<ConnectionListener>>,
    binds: AtomicUsize,
    unbinds: AtomicUsize,
}

impl SimulatedBinder {
    pub fn new(service: Arc<SimulatedBillingService>) -> Self {
        Self {
            service,
            behavior: Mutex::new(BindBehavior::Connect),
            listeners: Mutex::new(Vec::new()),
            binds: AtomicUsize::new(0),
            unbinds: AtomicUsize::new(0),
        }
    }

    pub fn set_behavior(&self, behavior: BindBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn bind_count(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    pub fn unbind_count(&self) -> usize {
        self.unbinds.load(Ordering::SeqCst)
    }

    fn latest_listener(&self) -> Option<ConnectionListener> {
        self.listeners.lock().last().cloned()
    }

    /// Reports the connection for the most recent bind request.
    pub fn connect_pending(&self) {
        if let Some(listener) = self.latest_listener() {
            listener.on_connected(self.service.clone());
        }
    }

    /// Reports the connection for every bind request seen so far, oldest first.
    pub fn connect_all(&self) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_connected(self.service.clone());
        }
    }

    pub fn fail_pending(&self, reason: &str) {
        if let Some(listener) = self.latest_listener() {
            listener.on_bind_failed(reason);
        }
    }

    /// Simulates the service process dying.
    pub fn crash(&self) {
        if let Some(listener) = self.latest_listener() {
            listener.on_disconnected();
        }
    }
}

impl ServiceBinder for SimulatedBinder {
    fn bind(&self, listener: ConnectionListener) -> Result<()> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push(listener.clone());
        let behavior = self.behavior.lock().clone();
        match behavior {
            BindBehavior::Connect => {
                listener.on_connected(self.service.clone());
                Ok(())
            }
            BindBehavior::Reject(reason) => Err(BillingError::Remote(reason)),
            BindBehavior::Hang => Ok(()),
        }
    }

    fn unbind(&self) {
        self.unbinds.fetch_add(1, Ordering::SeqCst);
    }
}

/// How [`ScriptedFlowLauncher`] plays the user's part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchBehavior {
    Approve,
    Cancel,
    /// Drops the reporter without a word.
    Abandon,
    Fail(ResponseCode),
    /// Completes the purchase but echoes the given payload.
    EchoPayload(String),
    /// Answers with the already owned record.
    AlreadyOwned,
    /// Refuses to start the flow.
    Refuse(String),
    /// Parks the flow until [`ScriptedFlowLauncher::approve_held`] or
    /// [`ScriptedFlowLauncher::take_held`].
    Hold,
}

pub struct HeldFlow {
    pub flow: FlowDescriptor,
    pub payload: PurchasePayload,
    pub reporter: FlowReporter,
}

/// [`ExternalFlowLauncher`] that completes purchases against a
/// [`SimulatedBillingService`].
pub struct ScriptedFlowLauncher {
    service: Arc<SimulatedBillingService>,
    behavior: Mutex<LaunchBehavior>,
    held: Mutex<Option<HeldFlow>>,
    launches: AtomicUsize,
}

impl ScriptedFlowLauncher {
    pub fn new(service: Arc<SimulatedBillingService>) -> Self {
        Self {
            service,
            behavior: Mutex::new(LaunchBehavior::Approve),
            held: Mutex::new(None),
            launches: AtomicUsize::new(0),
        }
    }

    pub fn set_behavior(&self, behavior: LaunchBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn has_held(&self) -> bool {
        self.held.lock().is_some()
    }

    pub fn take_held(&self) -> Option<HeldFlow> {
        self.held.lock().take()
    }

    /// Approves a parked flow. Returns false when nothing is parked.
    pub fn approve_held(&self) -> Result<bool> {
        let Some(held) = self.take_held() else {
            return Ok(false);
        };
        let (raw_record, signature) = self.service.fulfil(&held.flow, held.payload.as_str())?;
        held.reporter.report(FlowOutcome::Success {
            echoed_payload: Some(held.payload.to_string()),
            raw_record,
            signature: Some(signature),
        });
        Ok(true)
    }
}

impl ExternalFlowLauncher for ScriptedFlowLauncher {
    fn launch(
        &self,
        flow: FlowDescriptor,
        payload: &PurchasePayload,
        reporter: FlowReporter,
    ) -> Result<()> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().clone();
        match behavior {
            LaunchBehavior::Approve => {
                let (raw_record, signature) = self.service.fulfil(&flow, payload.as_str())?;
                reporter.report(FlowOutcome::Success {
                    echoed_payload: Some(payload.to_string()),
                    raw_record,
                    signature: Some(signature),
                });
            }
            LaunchBehavior::EchoPayload(echoed) => {
                let (raw_record, signature) = self.service.fulfil(&flow, payload.as_str())?;
                reporter.report(FlowOutcome::Success {
                    echoed_payload: Some(echoed),
                    raw_record,
                    signature: Some(signature),
                });
            }
            LaunchBehavior::AlreadyOwned => {
                let (raw_record, signature) = self.service.fulfil(&flow, payload.as_str())?;
                reporter.report(FlowOutcome::AlreadyOwned {
                    echoed_payload: Some(payload.to_string()),
                    raw_record,
                    signature: Some(signature),
                });
            }
            LaunchBehavior::Cancel => reporter.report(FlowOutcome::Cancelled),
            LaunchBehavior::Abandon => drop(reporter),
            LaunchBehavior::Fail(code) => reporter.report(FlowOutcome::Error(code)),
            LaunchBehavior::Refuse(reason) => return Err(BillingError::FlowLaunchFailed(reason)),
            LaunchBehavior::Hold => {
                *self.held.lock() = Some(HeldFlow {
                    flow,
                    payload: payload.clone(),
                    reporter,
                });
            }
        }
        Ok(())
    }
}

/// Accepts exactly the signatures [`simulated_signature`] produces.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedVerifier;

impl SignatureVerifier for SimulatedVerifier {
    fn verify(&self, product_id: &str, license_key: &str, raw_record: &str, signature: &str) -> bool {
        simulated_signature(license_key, product_id, raw_record) == signature
    }
}
