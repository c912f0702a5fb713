use crate::error::{BillingError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Catalog partition. Each type has its own cache namespace and timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProductType {
    /// One-time products.
    #[serde(rename = "inapp")]
    Managed,
    /// Recurring products.
    #[serde(rename = "subs")]
    Subscription,
}

impl ProductType {
    pub const ALL: [ProductType; 2] = [ProductType::Managed, ProductType::Subscription];

    /// Wire name used by the billing API.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Managed => "inapp",
            ProductType::Subscription => "subs",
        }
    }

    pub fn is_managed(&self) -> bool {
        *self == ProductType::Managed
    }

    pub fn is_subscription(&self) -> bool {
        *self == ProductType::Subscription
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inapp" | "managed" => Ok(ProductType::Managed),
            "subs" | "subscription" => Ok(ProductType::Subscription),
            other => Err(BillingError::InvalidArgument(format!(
                "unknown product type: {other}"
            ))),
        }
    }
}

/// Billing API response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseCode(pub i32);

impl ResponseCode {
    pub const OK: Self = Self(0);
    pub const USER_CANCELED: Self = Self(1);
    pub const SERVICE_UNAVAILABLE: Self = Self(2);
    pub const BILLING_UNAVAILABLE: Self = Self(3);
    pub const ITEM_UNAVAILABLE: Self = Self(4);
    pub const DEVELOPER_ERROR: Self = Self(5);
    pub const ERROR: Self = Self(6);
    pub const ITEM_ALREADY_OWNED: Self = Self(7);
    pub const ITEM_NOT_OWNED: Self = Self(8);

    pub fn is_ok(&self) -> bool {
        *self == Self::OK
    }
}

impl Default for ResponseCode {
    fn default() -> Self {
        ResponseCode::OK
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation token round-tripped through the external purchase flow.
///
/// Formatted as `<product type>:<nonce>` so the product type can be recovered
/// from the echoed value alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PurchasePayload(String);

impl PurchasePayload {
    pub fn generate(product_type: ProductType) -> Self {
        Self(format!("{}:{}", product_type.as_str(), Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn product_type(&self) -> Result<ProductType> {
        let prefix = self.0.split(':').next().unwrap_or_default();
        prefix.parse()
    }

    pub fn matches(&self, other: Option<&str>) -> bool {
        other == Some(self.0.as_str())
    }
}

impl fmt::Display for PurchasePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PurchasePayload {
    fn from(value: String) -> Self {
        Self(value)
    }
}
