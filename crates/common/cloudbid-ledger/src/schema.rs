//! Post-migration schema check. A database whose tables drifted from what
//! this crate expects is refused rather than altered.

use sqlx::PgPool;

use crate::store::StoreError;

pub const EXPECTED_TABLES: &[(&str, &[&str])] = &[
    ("users", &["uid", "username", "password", "created_at"]),
    ("wallets", &["uid", "credits"]),
    ("tokens", &["uid", "token"]),
    (
        "resources",
        &[
            "rid",
            "uid",
            "cpu_cores",
            "memory",
            "storage",
            "gpu",
            "bandwidth",
            "cost_per_minute",
            "available",
            "computing",
            "created_at",
        ],
    ),
    (
        "bids",
        &[
            "bid",
            "uid",
            "rid",
            "amount",
            "duration",
            "status",
            "computing",
            "created_at",
        ],
    ),
];

/// Compares a table's actual column names with the expected ones.
pub fn compare_columns(
    table: &str,
    expected: &[&str],
    mut found: Vec<String>,
) -> Result<(), StoreError> {
    let mut expected: Vec<String> = expected.iter().map(|c| c.to_string()).collect();
    expected.sort();
    found.sort();
    if expected != found {
        return Err(StoreError::SchemaMismatch {
            table: table.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

pub async fn verify_schema(pool: &PgPool) -> Result<(), StoreError> {
    for (table, columns) in EXPECTED_TABLES {
        let found: Vec<String> = sqlx::query_scalar(
            "SELECT column_name::TEXT FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1",
        )
        .bind(*table)
        .fetch_all(pool)
        .await?;
        compare_columns(table, columns, found)?;
    }
    Ok(())
}
