#![allow(dead_code)]

use inapps::application::client::BillingClient;
use inapps::application::settings::BillingSettings;
use inapps::domain::product::ProductType;
use inapps::domain::purchase::Purchase;
use inapps::domain::sku::SkuDetails;
use inapps::infrastructure::clock::ManualClock;
use inapps::infrastructure::simulated::{
    ScriptedFlowLauncher, SimulatedBillingService, SimulatedBinder, SimulatedVerifier,
};
use std::io::Error;
use std::path::Path;
use std::sync::Arc;

pub const PACKAGE: &str = "com.example.app";
pub const NOW_MILLIS: i64 = 1_700_000_000_000;

/// A client wired to the simulated store, with every collaborator exposed.
pub struct Harness {
    pub service: Arc<SimulatedBillingService>,
    pub binder: Arc<SimulatedBinder>,
    pub launcher: Arc<ScriptedFlowLauncher>,
    pub clock: Arc<ManualClock>,
    pub client: BillingClient,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(BillingSettings::new(PACKAGE))
    }

    pub fn with_settings(settings: BillingSettings) -> Self {
        let service = Arc::new(SimulatedBillingService::new(settings.package_name.clone()));
        let binder = Arc::new(SimulatedBinder::new(service.clone()));
        let launcher = Arc::new(ScriptedFlowLauncher::new(service.clone()));
        let clock = Arc::new(ManualClock::new(NOW_MILLIS));

        let needs_verifier = settings.license_key().is_some();
        let mut builder = BillingClient::builder(settings, Box::new(binder.clone()), launcher.clone())
            .clock(clock.clone());
        if needs_verifier {
            builder = builder.verifier(Arc::new(SimulatedVerifier));
        }

        Self {
            client: builder.build().unwrap(),
            service,
            binder,
            launcher,
            clock,
        }
    }

    pub async fn cached(&self, product_type: ProductType) -> Vec<String> {
        self.client
            .cache()
            .cached(product_type)
            .await
            .unwrap()
            .map(|map| map.into_keys().collect())
            .unwrap_or_default()
    }
}

pub fn owned(product_id: &str, token: &str) -> Purchase {
    Purchase {
        product_id: product_id.into(),
        order_id: format!("GPA.{product_id}"),
        package_name: PACKAGE.into(),
        purchase_token: token.into(),
        purchase_time_millis: NOW_MILLIS - 60_000,
        ..Default::default()
    }
}

pub fn sku(product_id: &str, product_type: ProductType, price_micros: i64) -> SkuDetails {
    SkuDetails {
        product_id: product_id.into(),
        title: product_id.to_uppercase(),
        description: format!("The {product_id} product"),
        product_type,
        currency: "USD".into(),
        price_micros,
        price_text: format!("${}", price_micros as f64 / 1_000_000.0),
    }
}

pub fn write_fixture(path: &Path, owned: &[(&str, &str)], catalog: &[&str]) -> Result<(), Error> {
    let purchases: Vec<serde_json::Value> = owned
        .iter()
        .map(|(id, product_type)| {
            serde_json::json!({
                "productId": id,
                "type": product_type,
                "orderId": format!("GPA.{id}"),
                "purchaseToken": format!("token-{id}"),
                "purchaseTime": NOW_MILLIS,
            })
        })
        .collect();
    let catalog: Vec<serde_json::Value> = catalog
        .iter()
        .map(|id| {
            serde_json::json!({
                "productId": id,
                "type": "inapp",
                "title": id,
                "price": "$0.99",
                "price_amount_micros": 990000,
                "price_currency_code": "USD",
            })
        })
        .collect();
    let fixture = serde_json::json!({ "purchases": purchases, "catalog": catalog });
    std::fs::write(path, fixture.to_string())
}
