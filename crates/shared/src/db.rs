//! Database utilities and connection management

use sqlx::error::BoxDynError;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgTypeInfo, PgValueRef};
use sqlx::{Decode, Postgres, Type, ValueRef};
use std::{str::FromStr, time::Duration};
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::clock::{parse_stored_instant, StoredInstant};

/// Create a database connection pool
/// Note: Disables statement cache for PgBouncer compatibility
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    // PgBouncer in transaction mode doesn't support prepared statements
    let options = PgConnectOptions::from_str(database_url)?.statement_cache_capacity(0);

    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(60))
        .max_lifetime(Duration::from_secs(300))
        .connect_with(options)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}

// Timestamp columns may be TIMESTAMPTZ, TIMESTAMP or text depending on which
// code path wrote them
impl Type<Postgres> for StoredInstant {
    fn type_info() -> PgTypeInfo {
        <OffsetDateTime as Type<Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <OffsetDateTime as Type<Postgres>>::compatible(ty)
            || <PrimitiveDateTime as Type<Postgres>>::compatible(ty)
            || <&str as Type<Postgres>>::compatible(ty)
    }
}

impl<'r> Decode<'r, Postgres> for StoredInstant {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let ty = value.type_info().into_owned();

        if <OffsetDateTime as Type<Postgres>>::compatible(&ty) {
            let aware = <OffsetDateTime as Decode<Postgres>>::decode(value)?;
            return Ok(StoredInstant::Aware(aware));
        }
        if <PrimitiveDateTime as Type<Postgres>>::compatible(&ty) {
            let naive = <PrimitiveDateTime as Decode<Postgres>>::decode(value)?;
            return Ok(StoredInstant::Naive(naive));
        }

        let raw = <&str as Decode<Postgres>>::decode(value)?;
        Ok(parse_stored_instant(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_create_pool() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = create_pool(&url, 2).await.expect("Failed to create pool");
        run_migrations(&pool).await.expect("Failed to run migrations");
        assert!(pool.size() > 0);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_stored_instant_column_shapes() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = create_pool(&url, 2).await.expect("Failed to create pool");

        let (aware, naive, text, missing): (
            StoredInstant,
            StoredInstant,
            StoredInstant,
            Option<StoredInstant>,
        ) = sqlx::query_as(
            r#"
            SELECT TIMESTAMPTZ '2025-01-01 15:30:00+05:30',
                   TIMESTAMP '2025-01-01 10:00:00',
                   '2025-01-01 10:00:00'::text,
                   NULL::timestamptz
            "#,
        )
        .fetch_one(&pool)
        .await
        .expect("Failed to decode timestamps");

        assert!(matches!(aware, StoredInstant::Aware(_)));
        assert!(matches!(naive, StoredInstant::Naive(_)));
        assert!(matches!(text, StoredInstant::Naive(_)));
        assert_eq!(aware.to_utc(), datetime!(2025-01-01 10:00 UTC));
        assert_eq!(naive, text);
        assert_eq!(naive, aware);
        assert!(missing.is_none());
    }
}
