pub mod error;
pub mod models;
pub mod schema;
pub mod store;

pub use error::OrderError;
pub use models::OrderStatus;
pub use store::DbPool;
