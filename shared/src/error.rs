use thiserror::Error;

/// Failure modes of an order reservation. Validation variants are raised
/// before any transaction is opened; conflict variants abort the transaction
/// with a full rollback; `Database` covers everything the store itself
/// reports and maps to a 500 at the HTTP boundary.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("invalid request")]
    InvalidRequest,

    #[error("invalid items")]
    InvalidItems,

    #[error("product {product_id} not found")]
    ProductNotFound { product_id: i64 },

    #[error("insufficient inventory for product {product_id}")]
    InsufficientInventory { product_id: i64 },

    #[error(transparent)]
    Database(#[from] diesel::result::Error),
}

impl OrderError {
    /// Conflict errors name the product that caused them.
    pub fn product_id(&self) -> Option<i64> {
        match self {
            OrderError::ProductNotFound { product_id }
            | OrderError::InsufficientInventory { product_id } => Some(*product_id),
            _ => None,
        }
    }
}
