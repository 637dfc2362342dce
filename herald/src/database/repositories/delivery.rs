//! Delivery record repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::database::models::{DeliveryRecordDbModel, DeliveryStatusCountRow};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::datetime_to_ms;
use crate::domain::{Channel, DeliveryRecord, NotificationStatus};
use crate::{Error, Result};

/// Delivery record repository trait.
#[async_trait]
pub trait DeliveryRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<DeliveryRecord>;
    async fn get_for_notification(&self, notification_id: &str) -> Result<Vec<DeliveryRecord>>;

    /// Persist `record` if the stored row is still at `record.version`.
    ///
    /// On success the stored version is bumped and returned, and the owning
    /// notification's aggregate status is updated in the same transaction.
    /// Returns [`Error::Conflict`] when another writer advanced the row first.
    async fn compare_and_swap(&self, record: &DeliveryRecord) -> Result<i64>;

    /// Non-terminal records whose scheduled time has passed, oldest first.
    async fn list_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<DeliveryRecord>>;

    /// Sends for (user, channel, type) since `since`.
    ///
    /// Counts every record a provider accepted at or after `since`, whatever
    /// its later status, plus attempts claimed since then whose provider call
    /// has not returned yet.
    async fn count_sent_since(
        &self,
        user_id: &str,
        channel: Channel,
        notification_type: &str,
        since: DateTime<Utc>,
    ) -> Result<i64>;

    async fn count_by_status(&self) -> Result<Vec<DeliveryStatusCountRow>>;
}

/// SQLx implementation of DeliveryRepository.
pub struct SqlxDeliveryRepository {
    pool: SqlitePool,
}

impl SqlxDeliveryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryRepository for SqlxDeliveryRepository {
    async fn get(&self, id: &str) -> Result<DeliveryRecord> {
        sqlx::query_as::<_, DeliveryRecordDbModel>("SELECT * FROM delivery_records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("DeliveryRecord", id))?
            .try_into()
    }

    async fn get_for_notification(&self, notification_id: &str) -> Result<Vec<DeliveryRecord>> {
        let rows = sqlx::query_as::<_, DeliveryRecordDbModel>(
            "SELECT * FROM delivery_records WHERE notification_id = ? ORDER BY created_at",
        )
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DeliveryRecord::try_from).collect()
    }

    async fn compare_and_swap(&self, record: &DeliveryRecord) -> Result<i64> {
        let row = DeliveryRecordDbModel::from(record);
        let aggregate = NotificationStatus::from_delivery(record.status);

        let updated = retry_on_sqlite_busy("delivery_compare_and_swap", || async {
            let mut tx = self.pool.begin().await?;

            let result = sqlx::query(
                r#"
                UPDATE delivery_records SET
                    attempt_count = ?,
                    status = ?,
                    attempted_at = ?,
                    delivered_at = ?,
                    failed_at = ?,
                    bounced_at = ?,
                    sent_at = ?,
                    next_attempt_at = ?,
                    external_id = ?,
                    provider_message_id = ?,
                    response_code = ?,
                    error_code = ?,
                    error_message = ?,
                    provider = ?,
                    updated_at = ?,
                    version = version + 1
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(row.attempt_count)
            .bind(&row.status)
            .bind(row.attempted_at)
            .bind(row.delivered_at)
            .bind(row.failed_at)
            .bind(row.bounced_at)
            .bind(row.sent_at)
            .bind(row.next_attempt_at)
            .bind(&row.external_id)
            .bind(&row.provider_message_id)
            .bind(row.response_code)
            .bind(&row.error_code)
            .bind(&row.error_message)
            .bind(&row.provider)
            .bind(row.updated_at)
            .bind(&row.id)
            .bind(row.version)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(false);
            }

            sqlx::query("UPDATE notifications SET status = ? WHERE id = ?")
                .bind(aggregate.as_str())
                .bind(&row.notification_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(true)
        })
        .await?;

        if updated {
            return Ok(record.version + 1);
        }

        let exists: Option<(i64,)> = sqlx::query_as("SELECT version FROM delivery_records WHERE id = ?")
            .bind(&record.id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Err(Error::conflict("DeliveryRecord", &record.id)),
            None => Err(Error::not_found("DeliveryRecord", &record.id)),
        }
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<DeliveryRecord>> {
        let rows = sqlx::query_as::<_, DeliveryRecordDbModel>(
            r#"
            SELECT * FROM delivery_records
            WHERE status IN ('PENDING', 'IN_PROGRESS')
              AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
            ORDER BY COALESCE(next_attempt_at, updated_at)
            LIMIT ?
            "#,
        )
        .bind(datetime_to_ms(now))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DeliveryRecord::try_from).collect()
    }

    async fn count_sent_since(
        &self,
        user_id: &str,
        channel: Channel,
        notification_type: &str,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let since_ms = datetime_to_ms(since);
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM delivery_records d
            INNER JOIN notifications n ON n.id = d.notification_id
            WHERE n.user_id = ?
              AND n.notification_type = ?
              AND d.channel = ?
              AND (
                d.sent_at >= ?
                OR (d.sent_at IS NULL
                    AND d.status = 'IN_PROGRESS'
                    AND d.next_attempt_at IS NULL
                    AND d.attempted_at >= ?)
              )
            "#,
        )
        .bind(user_id)
        .bind(notification_type)
        .bind(channel.as_str())
        .bind(since_ms)
        .bind(since_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn count_by_status(&self) -> Result<Vec<DeliveryStatusCountRow>> {
        let rows = sqlx::query_as::<_, DeliveryStatusCountRow>(
            r#"
            SELECT channel, status, COUNT(*) AS count
            FROM delivery_records
            GROUP BY channel, status
            ORDER BY channel, status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
