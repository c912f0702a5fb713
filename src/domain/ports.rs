use super::product::{ProductType, PurchasePayload, ResponseCode};
use super::purchase::{Purchase, PurchaseMap};
use super::sku::SkuDetails;
use crate::application::broker::ConnectionListener;
use crate::application::purchase_flow::FlowReporter;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Opaque descriptor of an external purchase flow, as returned by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowDescriptor(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuyIntentResponse {
    pub code: ResponseCode,
    pub flow: Option<FlowDescriptor>,
}

/// One page of owned purchases. `signatures[i]` belongs to `records[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PurchasesResponse {
    pub code: ResponseCode,
    pub records: Vec<String>,
    pub signatures: Vec<String>,
    pub continuation_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SkuDetailsResponse {
    pub code: ResponseCode,
    pub records: Vec<String>,
}

/// The remote billing service, reachable only while bound.
///
/// Transport failures are reported as `Err`; API-level failures come back as
/// a non-OK `ResponseCode` inside the response.
#[async_trait]
pub trait RemoteBillingService: Send + Sync {
    async fn get_buy_intent(
        &self,
        api_version: u32,
        package_name: &str,
        product_id: &str,
        product_type: ProductType,
        payload: &str,
    ) -> Result<BuyIntentResponse>;

    async fn get_purchases(
        &self,
        api_version: u32,
        package_name: &str,
        product_type: ProductType,
        continuation_token: Option<&str>,
    ) -> Result<PurchasesResponse>;

    async fn consume_purchase(
        &self,
        api_version: u32,
        package_name: &str,
        purchase_token: &str,
    ) -> Result<ResponseCode>;

    async fn get_sku_details(
        &self,
        api_version: u32,
        package_name: &str,
        product_type: ProductType,
        product_ids: &[String],
    ) -> Result<SkuDetailsResponse>;
}

pub type RemoteServiceArc = Arc<dyn RemoteBillingService>;

/// Platform side of the bind/connect handshake.
///
/// `bind` only starts the handshake. The outcome is reported later, possibly
/// on another thread, through the listener. An `Err` from `bind` is an
/// immediate rejection.
pub trait ServiceBinder: Send + Sync {
    fn bind(&self, listener: ConnectionListener) -> Result<()>;
    fn unbind(&self);
}

pub type ServiceBinderBox = Box<dyn ServiceBinder>;

impl<T: ServiceBinder + ?Sized> ServiceBinder for Arc<T> {
    fn bind(&self, listener: ConnectionListener) -> Result<()> {
        (**self).bind(listener)
    }

    fn unbind(&self) {
        (**self).unbind()
    }
}

/// The single outcome of an external purchase flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    Success {
        echoed_payload: Option<String>,
        raw_record: String,
        signature: Option<String>,
    },
    AlreadyOwned {
        echoed_payload: Option<String>,
        raw_record: String,
        signature: Option<String>,
    },
    Cancelled,
    Error(ResponseCode),
}

/// Starts the human-facing purchase flow and reports back through `reporter`.
pub trait ExternalFlowLauncher: Send + Sync {
    fn launch(
        &self,
        flow: FlowDescriptor,
        payload: &PurchasePayload,
        reporter: FlowReporter,
    ) -> Result<()>;
}

pub type FlowLauncherArc = Arc<dyn ExternalFlowLauncher>;

pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, product_id: &str, license_key: &str, raw_record: &str, signature: &str)
    -> bool;
}

pub type SignatureVerifierArc = Arc<dyn SignatureVerifier>;

/// Codec for purchase and catalog records.
pub trait RecordParser: Send + Sync {
    fn parse_purchase(&self, raw: &str) -> Result<Purchase>;
    fn parse_sku_details(&self, raw: &str) -> Result<SkuDetails>;
    fn serialize_purchases(&self, purchases: &PurchaseMap) -> Result<String>;
    fn parse_purchases(&self, raw: &str) -> Result<PurchaseMap>;
}

pub type RecordParserArc = Arc<dyn RecordParser>;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: String) -> Result<()>;
}

pub type StorageArc = Arc<dyn Storage>;

/// Wall clock in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

pub type ClockArc = Arc<dyn Clock>;
