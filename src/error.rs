use crate::domain::product::ResponseCode;
use thiserror::Error;

/// Why a caller could not obtain a connection to the billing service.
///
/// Cloneable so that one failed connect attempt can be delivered to every
/// caller queued on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    #[error("bind rejected: {0}")]
    Rejected(String),
    #[error("bind timed out after {attempts} attempt(s) of {timeout_ms}ms")]
    TimedOut { attempts: u32, timeout_ms: u64 },
    #[error("connection broker shut down")]
    Closed,
}

#[derive(Error, Debug)]
pub enum BillingError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Can not initialize billing service: {0}")]
    ConnectFailure(#[from] ConnectFailure),
    #[error("Another purchase flow is already pending")]
    AlreadyPending,
    #[error("Product \"{0}\" not found")]
    ProductNotFound(String),
    #[error("Purchase for \"{0}\" not found")]
    PurchaseNotFound(String),
    #[error("Public key signature does not match")]
    SignatureMismatch,
    #[error("Payload mismatch: {expected} != {actual}")]
    PayloadMismatch { expected: String, actual: String },
    #[error("Invalid or tampered merchant id")]
    MerchantIdMismatch,
    #[error("Purchase cancelled by user")]
    PurchaseCancelledByUser,
    #[error("Billing API version is not supported for the type requested")]
    BillingUnavailable,
    #[error("Requested product is not available for purchase")]
    ItemUnavailable,
    #[error("Invalid arguments provided to the billing API")]
    DeveloperError,
    #[error("Fatal error during the API action")]
    FatalError,
    #[error("Failed to consume {product_id}: RESPONSE_CODE={code}")]
    ConsumeFailed {
        product_id: String,
        code: ResponseCode,
    },
    #[error("Remote call failed: RESPONSE_CODE={code}")]
    RemoteCallFailed { code: ResponseCode },
    #[error("Remote service error: {0}")]
    Remote(String),
    #[error("Failed to launch purchase flow: {0}")]
    FlowLaunchFailed(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
}

impl BillingError {
    /// Maps a non-OK purchase response code to its error.
    ///
    /// `ITEM_ALREADY_OWNED` is not an error on the purchase path and is handled
    /// by the caller before reaching here.
    pub fn from_purchase_code(code: ResponseCode) -> Self {
        match code {
            ResponseCode::USER_CANCELED => BillingError::PurchaseCancelledByUser,
            ResponseCode::BILLING_UNAVAILABLE => BillingError::BillingUnavailable,
            ResponseCode::ITEM_UNAVAILABLE => BillingError::ItemUnavailable,
            ResponseCode::DEVELOPER_ERROR => BillingError::DeveloperError,
            ResponseCode::ERROR => BillingError::FatalError,
            code => BillingError::RemoteCallFailed { code },
        }
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::Parse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purchase_code_mapping() {
        assert!(matches!(
            BillingError::from_purchase_code(ResponseCode::USER_CANCELED),
            BillingError::PurchaseCancelledByUser
        ));
        assert!(matches!(
            BillingError::from_purchase_code(ResponseCode::BILLING_UNAVAILABLE),
            BillingError::BillingUnavailable
        ));
        assert!(matches!(
            BillingError::from_purchase_code(ResponseCode::ITEM_UNAVAILABLE),
            BillingError::ItemUnavailable
        ));
        assert!(matches!(
            BillingError::from_purchase_code(ResponseCode::DEVELOPER_ERROR),
            BillingError::DeveloperError
        ));
        assert!(matches!(
            BillingError::from_purchase_code(ResponseCode::ERROR),
            BillingError::FatalError
        ));
        assert!(matches!(
            BillingError::from_purchase_code(ResponseCode(42)),
            BillingError::RemoteCallFailed {
                code: ResponseCode(42)
            }
        ));
    }

    #[test]
    fn test_connect_failure_converts() {
        let err: BillingError = ConnectFailure::Rejected("no service".into()).into();
        assert_eq!(
            err.to_string(),
            "Can not initialize billing service: bind rejected: no service"
        );
    }
}
