//! Durable marketplace state and the credit escrow that guards it.
//!
//! [`MarketStore`] is the transactional surface; [`PostgresMarketStore`] is
//! the production backend and [`InMemoryMarketStore`] serves tests and
//! database-less runs. [`CreditLedger`] sits in front of either for every
//! operation that admits escrow or moves credits.

pub mod admission;
pub mod credit;
pub mod memory_store;
pub mod pg_store;
pub mod policy;
pub mod schema;
pub mod store;

use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use tracing::info;

pub use credit::{CreditLedger, LedgerError, Settlement};
pub use memory_store::InMemoryMarketStore;
pub use pg_store::PostgresMarketStore;
pub use policy::SettlementPolicy;
pub use store::{AwardOutcome, MarketStore, SettlementOrder, StoreError};

/// Create a new connection pool to PostgreSQL
pub async fn create_pg_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Connects, applies pending migrations and checks the resulting schema.
/// Drifted tables abort startup with [`StoreError::SchemaMismatch`].
pub async fn create_pg_market_store(
    database_url: &str,
    max_connections: u32,
) -> Result<PostgresMarketStore, StoreError> {
    let pool = create_pg_pool(database_url, max_connections).await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    schema::verify_schema(&pool).await?;
    info!("database schema verified");

    Ok(PostgresMarketStore::new(pool))
}
