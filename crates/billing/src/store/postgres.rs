//! Postgres store backed by sqlx

use async_trait::async_trait;
use chatmeter_shared::{
    NewUser, StoredInstant, SubscriptionRecord, SubscriptionStatus, SubscriptionTier, UsagePeriod,
    UsageRecord, UserIdentity, UserRecord,
};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::EntitlementStore;
use crate::error::{StoreError, StoreResult};

const USER_COLUMNS: &str =
    "id, identity, email, display_name, subscription_tier, is_paid, subscription_expiry";

const SUBSCRIPTION_COLUMNS: &str =
    "id, user_id, external_payment_ref, tier, status, period_start, period_end";

const USAGE_COLUMNS: &str = "user_id, month_year, daily_message_count, total_message_count, \
     daily_token_count, total_token_count, last_reset_at";

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    identity: String,
    email: String,
    display_name: Option<String>,
    subscription_tier: String,
    is_paid: bool,
    subscription_expiry: Option<StoredInstant>,
}

impl TryFrom<UserRow> for UserRecord {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(UserRecord {
            user_id: row.id,
            identity: UserIdentity(row.identity),
            email: row.email,
            display_name: row.display_name,
            tier: row.subscription_tier.parse::<SubscriptionTier>()?,
            is_paid: row.is_paid,
            subscription_expiry: row.subscription_expiry,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    external_payment_ref: String,
    tier: String,
    status: String,
    period_start: StoredInstant,
    period_end: StoredInstant,
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = StoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(SubscriptionRecord {
            id: row.id,
            user_id: row.user_id,
            external_payment_ref: row.external_payment_ref,
            tier: row.tier.parse::<SubscriptionTier>()?,
            status: row.status.parse::<SubscriptionStatus>()?,
            period_start: row.period_start,
            period_end: row.period_end,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UsageRow {
    user_id: Uuid,
    month_year: String,
    daily_message_count: i64,
    total_message_count: i64,
    daily_token_count: i64,
    total_token_count: i64,
    last_reset_at: StoredInstant,
}

impl From<UsageRow> for UsageRecord {
    fn from(row: UsageRow) -> Self {
        UsageRecord {
            user_id: row.user_id,
            period: UsagePeriod(row.month_year),
            daily_message_count: row.daily_message_count,
            total_message_count: row.total_message_count,
            daily_token_count: row.daily_token_count,
            total_token_count: row.total_token_count,
            last_reset_at: row.last_reset_at,
        }
    }
}

/// Store over the `users`, `subscriptions` and `user_usage` tables
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntitlementStore for PgStore {
    async fn get_user(&self, identity: &UserIdentity) -> StoreResult<Option<UserRecord>> {
        let row: Option<UserRow> = sqlx::query_as(&format!(
            "SELECT {} FROM users WHERE identity = $1",
            USER_COLUMNS
        ))
        .bind(identity.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(UserRecord::try_from).transpose()
    }

    async fn create_user(&self, new_user: NewUser) -> StoreResult<UserRecord> {
        let row: Option<UserRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO users (id, identity, email, display_name, subscription_tier, is_paid)
            VALUES ($1, $2, $3, $4, 'free', false)
            ON CONFLICT (identity) DO NOTHING
            RETURNING {}
            "#,
            USER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(new_user.identity.as_str())
        .bind(&new_user.email)
        .bind(&new_user.display_name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => UserRecord::try_from(row),
            None => Err(StoreError::Conflict(format!(
                "user {} already exists",
                new_user.identity
            ))),
        }
    }

    async fn set_user_tier(
        &self,
        user_id: Uuid,
        tier: SubscriptionTier,
        is_paid: bool,
        expiry: Option<OffsetDateTime>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET subscription_tier = $2, is_paid = $3, subscription_expiry = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(tier.as_str())
        .bind(is_paid)
        .bind(expiry)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }

    async fn get_active_subscription(
        &self,
        user_id: Uuid,
    ) -> StoreResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE user_id = $1 AND status = 'active'
            ORDER BY period_start DESC, created_at DESC
            LIMIT 1
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn get_subscription_by_ref(
        &self,
        payment_ref: &str,
    ) -> StoreResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE external_payment_ref = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(payment_ref)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn insert_subscription(&self, record: &SubscriptionRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, user_id, external_payment_ref, tier, status, period_start, period_end
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(&record.external_payment_ref)
        .bind(record.tier.as_str())
        .bind(record.status.as_str())
        .bind(record.period_start.to_utc())
        .bind(record.period_end.to_utc())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_subscription_status(
        &self,
        payment_ref: &str,
        status: SubscriptionStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE subscriptions SET status = $2, updated_at = NOW() WHERE external_payment_ref = $1",
        )
        .bind(payment_ref)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_usage(
        &self,
        user_id: Uuid,
        period: &UsagePeriod,
    ) -> StoreResult<Option<UsageRecord>> {
        let row: Option<UsageRow> = sqlx::query_as(&format!(
            "SELECT {} FROM user_usage WHERE user_id = $1 AND month_year = $2",
            USAGE_COLUMNS
        ))
        .bind(user_id)
        .bind(period.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(UsageRecord::from))
    }

    async fn create_usage(&self, record: &UsageRecord) -> StoreResult<UsageRecord> {
        sqlx::query(
            r#"
            INSERT INTO user_usage (
                user_id, month_year, daily_message_count, total_message_count,
                daily_token_count, total_token_count, last_reset_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id, month_year) DO NOTHING
            "#,
        )
        .bind(record.user_id)
        .bind(record.period.as_str())
        .bind(record.daily_message_count)
        .bind(record.total_message_count)
        .bind(record.daily_token_count)
        .bind(record.total_token_count)
        .bind(record.last_reset_at.to_utc())
        .execute(&self.pool)
        .await?;

        self.get_usage(record.user_id, &record.period)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("usage for {}", record.user_id)))
    }

    async fn reset_daily_usage(
        &self,
        user_id: Uuid,
        period: &UsagePeriod,
        at: OffsetDateTime,
    ) -> StoreResult<bool> {
        // The date guard keeps concurrent resets from wiping increments made
        // after the first one landed.
        let result = sqlx::query(
            r#"
            UPDATE user_usage
            SET daily_message_count = 0, daily_token_count = 0, last_reset_at = $3
            WHERE user_id = $1
              AND month_year = $2
              AND (last_reset_at AT TIME ZONE 'UTC')::date < ($3::timestamptz AT TIME ZONE 'UTC')::date
            "#,
        )
        .bind(user_id)
        .bind(period.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn increment_usage(
        &self,
        user_id: Uuid,
        period: &UsagePeriod,
        messages: i64,
        tokens: i64,
        at: OffsetDateTime,
    ) -> StoreResult<UsageRecord> {
        let row: UsageRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO user_usage AS u (
                user_id, month_year, daily_message_count, total_message_count,
                daily_token_count, total_token_count, last_reset_at
            ) VALUES ($1, $2, $3, $3, $4, $4, $5)
            ON CONFLICT (user_id, month_year) DO UPDATE SET
                daily_message_count = CASE
                    WHEN (u.last_reset_at AT TIME ZONE 'UTC')::date < ($5::timestamptz AT TIME ZONE 'UTC')::date
                    THEN EXCLUDED.daily_message_count
                    ELSE u.daily_message_count + EXCLUDED.daily_message_count
                END,
                daily_token_count = CASE
                    WHEN (u.last_reset_at AT TIME ZONE 'UTC')::date < ($5::timestamptz AT TIME ZONE 'UTC')::date
                    THEN EXCLUDED.daily_token_count
                    ELSE u.daily_token_count + EXCLUDED.daily_token_count
                END,
                total_message_count = u.total_message_count + EXCLUDED.total_message_count,
                total_token_count = u.total_token_count + EXCLUDED.total_token_count,
                last_reset_at = CASE
                    WHEN (u.last_reset_at AT TIME ZONE 'UTC')::date < ($5::timestamptz AT TIME ZONE 'UTC')::date
                    THEN EXCLUDED.last_reset_at
                    ELSE u.last_reset_at
                END
            RETURNING {}
            "#,
            USAGE_COLUMNS
        ))
        .bind(user_id)
        .bind(period.as_str())
        .bind(messages)
        .bind(tokens)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn list_lapsed_paid_users(&self, now: OffsetDateTime) -> StoreResult<Vec<UserRecord>> {
        let rows: Vec<UserRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM users
            WHERE is_paid AND (subscription_expiry IS NULL OR subscription_expiry < $1)
            ORDER BY identity
            "#,
            USER_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(UserRecord::try_from).collect()
    }

    async fn expire_lapsed_subscriptions(&self, now: OffsetDateTime) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'expired', updated_at = NOW()
            WHERE status = 'active' AND period_end < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
