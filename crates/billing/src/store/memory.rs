//! In-memory store (for development and tests without Postgres)

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chatmeter_shared::{
    NewUser, StoredInstant, SubscriptionRecord, SubscriptionStatus, SubscriptionTier, UsagePeriod,
    UsageRecord, UserIdentity, UserRecord,
};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::EntitlementStore;
use crate::error::{StoreError, StoreResult};

#[derive(Default)]
struct Tables {
    users: HashMap<UserIdentity, UserRecord>,
    subscriptions: Vec<SubscriptionRecord>,
    usage: HashMap<(Uuid, UsagePeriod), UsageRecord>,
}

/// Process-local store. Every operation holds a single lock, so increments
/// are atomic with respect to each other.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    tier_writes: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read fail with `StoreError::Unavailable`
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every write fail with `StoreError::Unavailable`
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `set_user_tier` calls
    pub fn tier_writes(&self) -> usize {
        self.tier_writes.load(Ordering::SeqCst)
    }

    /// Seed or replace a profile
    pub async fn put_user(&self, user: UserRecord) {
        let mut tables = self.tables.write().await;
        tables.users.insert(user.identity.clone(), user);
    }

    /// Seed a subscription row
    pub async fn put_subscription(&self, record: SubscriptionRecord) {
        self.tables.write().await.subscriptions.push(record);
    }

    /// Seed or replace a usage row
    pub async fn put_usage(&self, record: UsageRecord) {
        let mut tables = self.tables.write().await;
        tables
            .usage
            .insert((record.user_id, record.period.clone()), record);
    }

    fn check_read(&self) -> StoreResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads disabled".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EntitlementStore for InMemoryStore {
    async fn get_user(&self, identity: &UserIdentity) -> StoreResult<Option<UserRecord>> {
        self.check_read()?;
        Ok(self.tables.read().await.users.get(identity).cloned())
    }

    async fn create_user(&self, new_user: NewUser) -> StoreResult<UserRecord> {
        self.check_write()?;
        let mut tables = self.tables.write().await;
        if tables.users.contains_key(&new_user.identity) {
            return Err(StoreError::Conflict(format!(
                "user {} already exists",
                new_user.identity
            )));
        }

        let user = UserRecord {
            user_id: Uuid::new_v4(),
            identity: new_user.identity.clone(),
            email: new_user.email,
            display_name: new_user.display_name,
            tier: SubscriptionTier::Free,
            is_paid: false,
            subscription_expiry: None,
        };
        tables.users.insert(new_user.identity, user.clone());
        Ok(user)
    }

    async fn set_user_tier(
        &self,
        user_id: Uuid,
        tier: SubscriptionTier,
        is_paid: bool,
        expiry: Option<OffsetDateTime>,
    ) -> StoreResult<()> {
        self.check_write()?;
        let mut tables = self.tables.write().await;
        let user = tables
            .users
            .values_mut()
            .find(|u| u.user_id == user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))?;

        user.tier = tier;
        user.is_paid = is_paid;
        user.subscription_expiry = expiry.map(StoredInstant::Aware);
        self.tier_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_active_subscription(
        &self,
        user_id: Uuid,
    ) -> StoreResult<Option<SubscriptionRecord>> {
        self.check_read()?;
        let tables = self.tables.read().await;
        Ok(tables
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id && s.status == SubscriptionStatus::Active)
            .max_by_key(|s| s.period_start.to_utc())
            .cloned())
    }

    async fn get_subscription_by_ref(
        &self,
        payment_ref: &str,
    ) -> StoreResult<Option<SubscriptionRecord>> {
        self.check_read()?;
        let tables = self.tables.read().await;
        Ok(tables
            .subscriptions
            .iter()
            .find(|s| s.external_payment_ref == payment_ref)
            .cloned())
    }

    async fn insert_subscription(&self, record: &SubscriptionRecord) -> StoreResult<()> {
        self.check_write()?;
        let mut tables = self.tables.write().await;
        if tables
            .subscriptions
            .iter()
            .any(|s| s.external_payment_ref == record.external_payment_ref)
        {
            return Err(StoreError::Conflict(format!(
                "payment {} already recorded",
                record.external_payment_ref
            )));
        }
        tables.subscriptions.push(record.clone());
        Ok(())
    }

    async fn set_subscription_status(
        &self,
        payment_ref: &str,
        status: SubscriptionStatus,
    ) -> StoreResult<bool> {
        self.check_write()?;
        let mut tables = self.tables.write().await;
        match tables
            .subscriptions
            .iter_mut()
            .find(|s| s.external_payment_ref == payment_ref)
        {
            Some(record) => {
                record.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_usage(
        &self,
        user_id: Uuid,
        period: &UsagePeriod,
    ) -> StoreResult<Option<UsageRecord>> {
        self.check_read()?;
        let tables = self.tables.read().await;
        Ok(tables.usage.get(&(user_id, period.clone())).cloned())
    }

    async fn create_usage(&self, record: &UsageRecord) -> StoreResult<UsageRecord> {
        self.check_write()?;
        let mut tables = self.tables.write().await;
        let row = tables
            .usage
            .entry((record.user_id, record.period.clone()))
            .or_insert_with(|| record.clone());
        Ok(row.clone())
    }

    async fn reset_daily_usage(
        &self,
        user_id: Uuid,
        period: &UsagePeriod,
        at: OffsetDateTime,
    ) -> StoreResult<bool> {
        self.check_write()?;
        let mut tables = self.tables.write().await;
        match tables.usage.get_mut(&(user_id, period.clone())) {
            Some(row) if row.needs_daily_reset(at) => {
                row.apply_daily_reset(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_usage(
        &self,
        user_id: Uuid,
        period: &UsagePeriod,
        messages: i64,
        tokens: i64,
        at: OffsetDateTime,
    ) -> StoreResult<UsageRecord> {
        self.check_write()?;
        let mut tables = self.tables.write().await;
        let row = tables
            .usage
            .entry((user_id, period.clone()))
            .or_insert_with(|| {
                let mut fresh = UsageRecord::empty(user_id, at);
                fresh.period = period.clone();
                fresh
            });
        row.apply_increment(messages, tokens, at);
        Ok(row.clone())
    }

    async fn list_lapsed_paid_users(&self, now: OffsetDateTime) -> StoreResult<Vec<UserRecord>> {
        self.check_read()?;
        let tables = self.tables.read().await;
        let mut lapsed: Vec<UserRecord> = tables
            .users
            .values()
            .filter(|u| {
                u.is_paid
                    && u
                        .subscription_expiry
                        .map(|expiry| expiry.is_before(now))
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        lapsed.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(lapsed)
    }

    async fn expire_lapsed_subscriptions(&self, now: OffsetDateTime) -> StoreResult<u64> {
        self.check_write()?;
        let mut tables = self.tables.write().await;
        let mut expired = 0;
        for record in tables
            .subscriptions
            .iter_mut()
            .filter(|s| s.status == SubscriptionStatus::Active && s.period_end.is_before(now))
        {
            record.status = SubscriptionStatus::Expired;
            expired += 1;
        }
        Ok(expired)
    }
}
