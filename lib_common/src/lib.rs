// Declare the modules to re-export
#[cfg(feature = "connections")]
pub mod connections;
#[cfg(feature = "retrieve")]
pub mod retrieve;

// Re-export the most commonly used types
#[cfg(feature = "connections")]
pub use connections::db_sqlite::{Database, DbError};
#[cfg(feature = "retrieve")]
pub use retrieve::client::{ApiClient, ApiError};
