use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::StoreError;
use crate::models::subscriber::{DeviceSlots, MAX_DEVICE_SLOTS, Subscriber};

const SELECT_SUBSCRIBER_WITH_SLOTS: &str = r#"
    SELECT s.id, s.balance, s.is_trial, s.is_active, s.is_friend,
           s.subscription_end_date, s.last_notice_on,
           d.slot_index, d.credential
    FROM subscribers s
    LEFT JOIN device_slots d ON d.subscriber_id = s.id
"#;

/// Timestamps are bound as `DateTime<Utc>` everywhere, so they share one
/// RFC 3339 encoding and compare correctly as text inside SQL.
#[derive(Debug, Clone)]
pub struct SubscriberRepository {
    pool: SqlitePool,
    slot_count: usize,
}

impl SubscriberRepository {
    pub fn new(pool: SqlitePool, slot_count: usize) -> Self {
        Self {
            pool,
            slot_count: slot_count.clamp(1, MAX_DEVICE_SLOTS),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Folds the joined rows (ordered by subscriber) into subscribers.
    fn rows_to_subscribers(&self, rows: &[SqliteRow]) -> Result<Vec<Subscriber>, StoreError> {
        let mut out: Vec<Subscriber> = Vec::new();
        for row in rows {
            let id: i64 = row.try_get("id")?;
            if out.last().map(|s| s.id) != Some(id) {
                out.push(Subscriber {
                    id,
                    balance: row.try_get("balance")?,
                    is_trial: row.try_get("is_trial")?,
                    is_active: row.try_get("is_active")?,
                    is_friend: row.try_get("is_friend")?,
                    subscription_end_date: row.try_get("subscription_end_date")?,
                    last_notice_on: row.try_get("last_notice_on")?,
                    device_slots: DeviceSlots::new(self.slot_count),
                });
            }

            let slot_index: Option<i64> = row.try_get("slot_index")?;
            let credential: Option<String> = row.try_get("credential")?;
            if let (Some(slot_index), Some(credential), Some(sub)) =
                (slot_index, credential, out.last_mut())
            {
                sub.device_slots.set(slot_index as usize, Some(credential));
            }
        }
        Ok(out)
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Subscriber>, StoreError> {
        let query = format!("{SELECT_SUBSCRIBER_WITH_SLOTS} WHERE s.id = ? ORDER BY d.slot_index");
        let rows = sqlx::query(&query).bind(id).fetch_all(&self.pool).await?;
        Ok(self.rows_to_subscribers(&rows)?.into_iter().next())
    }

    /// Snapshot of every subscriber, ordered by id.
    pub async fn list_all(&self) -> Result<Vec<Subscriber>, StoreError> {
        let query = format!("{SELECT_SUBSCRIBER_WITH_SLOTS} ORDER BY s.id, d.slot_index");
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        self.rows_to_subscribers(&rows)
    }

    /// Registers a new subscriber on an active trial ending `trial_days` after `now`.
    pub async fn create(
        &self,
        id: i64,
        trial_days: i64,
        now: DateTime<Utc>,
    ) -> Result<Subscriber, StoreError> {
        let trial_end = now + Duration::days(trial_days);
        let result = sqlx::query(
            r#"
            INSERT INTO subscribers (id, balance, is_trial, is_active, is_friend, subscription_end_date, created_at)
            VALUES (?, 0, 1, 1, 0, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(trial_end)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(id));
        }
        debug!(subscriber = id, %trial_end, "Subscriber created");

        Ok(Subscriber {
            id,
            balance: 0,
            is_trial: true,
            is_active: true,
            is_friend: false,
            subscription_end_date: Some(trial_end),
            last_notice_on: None,
            device_slots: DeviceSlots::new(self.slot_count),
        })
    }

    /// Records a freshly provisioned credential, but only while the
    /// subscriber is still active.
    pub async fn store_device_credential(
        &self,
        id: i64,
        slot_index: usize,
        credential: &str,
    ) -> Result<(), StoreError> {
        if slot_index == 0 || slot_index > MAX_DEVICE_SLOTS {
            return Err(StoreError::InvalidSlot(slot_index));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO device_slots (subscriber_id, slot_index, credential, updated_at)
            SELECT ?1, ?2, ?3, ?4
            WHERE EXISTS (SELECT 1 FROM subscribers WHERE id = ?1 AND is_active = 1)
            ON CONFLICT(subscriber_id, slot_index) DO UPDATE SET
                credential = excluded.credential,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id)
        .bind(slot_index as i64)
        .bind(credential)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Inactive(id));
        }
        Ok(())
    }

    /// Stores or clears one device slot. An empty value clears it.
    pub async fn set_device_slot(
        &self,
        id: i64,
        slot_index: usize,
        value: Option<&str>,
    ) -> Result<(), StoreError> {
        if slot_index == 0 || slot_index > MAX_DEVICE_SLOTS {
            return Err(StoreError::InvalidSlot(slot_index));
        }

        match value.filter(|v| !v.is_empty()) {
            Some(credential) => {
                sqlx::query(
                    r#"
                    INSERT INTO device_slots (subscriber_id, slot_index, credential, updated_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(subscriber_id, slot_index) DO UPDATE SET
                        credential = excluded.credential,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(id)
                .bind(slot_index as i64)
                .bind(credential)
                .bind(Utc::now())
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM device_slots WHERE subscriber_id = ? AND slot_index = ?")
                    .bind(id)
                    .bind(slot_index as i64)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn update_flag(&self, id: i64, column: &str, value: bool) -> Result<(), StoreError> {
        let query = format!("UPDATE subscribers SET {column} = ? WHERE id = ?");
        let result = sqlx::query(&query)
            .bind(value)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    pub async fn set_trial(&self, id: i64, is_trial: bool) -> Result<(), StoreError> {
        self.update_flag(id, "is_trial", is_trial).await
    }

    pub async fn set_active(&self, id: i64, is_active: bool) -> Result<(), StoreError> {
        self.update_flag(id, "is_active", is_active).await
    }

    pub async fn set_friend(&self, id: i64, is_friend: bool) -> Result<(), StoreError> {
        self.update_flag(id, "is_friend", is_friend).await
    }

    /// Adds `delta` minor units and returns the new balance.
    pub async fn adjust_balance(&self, id: i64, delta: i64) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            "UPDATE subscribers SET balance = balance + ? WHERE id = ? RETURNING balance",
        )
        .bind(delta)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))
    }

    /// Pushes the end date `days` past whichever is later of now and the
    /// current end, and turns the subscriber into a paying, active one.
    pub async fn extend_subscription(
        &self,
        id: i64,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let end = extend_within(&mut *tx, id, days, now).await?;
        tx.commit().await?;
        Ok(end)
    }

    /// Credits a payment and, when `days` is given, extends the subscription
    /// in the same transaction. Returns the new balance and end date.
    pub async fn apply_payment(
        &self,
        id: i64,
        delta: i64,
        days: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<(i64, Option<DateTime<Utc>>), StoreError> {
        let mut tx = self.pool.begin().await?;

        let balance = sqlx::query_scalar::<_, i64>(
            "UPDATE subscribers SET balance = balance + ? WHERE id = ? RETURNING balance",
        )
        .bind(delta)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        let end = match days {
            Some(days) => Some(extend_within(&mut *tx, id, days, now).await?),
            None => None,
        };

        tx.commit().await?;
        Ok((balance, end))
    }

    /// Clears the active and trial flags if the subscription is still over
    /// at `now`, the subscriber is not a friend and no device slot is filled.
    /// Returns false when any of that stopped holding.
    pub async fn deactivate_if_expired(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE subscribers SET is_trial = 0, is_active = 0
            WHERE id = ?1
              AND is_active = 1
              AND is_friend = 0
              AND subscription_end_date IS NOT NULL
              AND subscription_end_date <= ?2
              AND NOT EXISTS (SELECT 1 FROM device_slots WHERE subscriber_id = ?1)
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_notice_sent(&self, id: i64, day: NaiveDate) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE subscribers SET last_notice_on = ? WHERE id = ?")
            .bind(day)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

/// The opening write takes the database write lock, so the end date read
/// back cannot change before the transaction commits.
async fn extend_within(
    conn: &mut SqliteConnection,
    id: i64,
    days: i64,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, StoreError> {
    let current: Option<DateTime<Utc>> = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
        "UPDATE subscribers SET is_trial = 0, is_active = 1 WHERE id = ? RETURNING subscription_end_date",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(StoreError::NotFound(id))?;

    let base = current.filter(|end| *end > now).unwrap_or(now);
    let new_end = base + Duration::days(days);

    sqlx::query("UPDATE subscribers SET subscription_end_date = ? WHERE id = ?")
        .bind(new_end)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(new_end)
}
