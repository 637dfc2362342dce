//! Notification repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::database::models::{CancellationDbModel, DeliveryRecordDbModel, NotificationDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::datetime_to_ms;
use crate::domain::{DeliveryRecord, Notification};
use crate::{Error, Result};

/// A notification together with its delivery record.
#[derive(Debug, Clone)]
pub struct StoredNotification {
    pub notification: Notification,
    pub delivery: DeliveryRecord,
    /// `false` when the dedup key already existed and the stored rows were returned.
    pub created: bool,
}

/// Notification repository trait.
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Insert a notification and its PENDING delivery record in one transaction.
    ///
    /// Idempotent on the notification's dedup key: a second insert with the
    /// same key returns the rows already stored.
    async fn insert_with_delivery(
        &self,
        notification: &Notification,
        delivery: &DeliveryRecord,
    ) -> Result<StoredNotification>;

    async fn get(&self, id: &str) -> Result<Notification>;
    async fn find_by_dedup_key(&self, dedup_key: &str) -> Result<Option<Notification>>;
    async fn list_for_user(&self, user_id: &str, limit: i64) -> Result<Vec<Notification>>;

    // Cancellations
    /// Record a cancellation sentinel. Returns `false` if one already existed.
    async fn record_cancellation(
        &self,
        notification_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;
    async fn get_cancellation(&self, notification_id: &str) -> Result<Option<CancellationDbModel>>;
}

/// SQLx implementation of NotificationRepository.
pub struct SqlxNotificationRepository {
    pool: SqlitePool,
}

impl SqlxNotificationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationRepository for SqlxNotificationRepository {
    async fn insert_with_delivery(
        &self,
        notification: &Notification,
        delivery: &DeliveryRecord,
    ) -> Result<StoredNotification> {
        let n = NotificationDbModel::from(notification);
        let d = DeliveryRecordDbModel::from(delivery);

        let inserted = retry_on_sqlite_busy("insert_notification", || async {
            let mut tx = self.pool.begin().await?;

            let result = sqlx::query(
                r#"
                INSERT INTO notifications (
                    id, dedup_key, user_id, notification_type, channel, recipient,
                    subject, body, priority, correlation_id, source_event_id, status,
                    digest_key, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(dedup_key) DO NOTHING
                "#,
            )
            .bind(&n.id)
            .bind(&n.dedup_key)
            .bind(&n.user_id)
            .bind(&n.notification_type)
            .bind(&n.channel)
            .bind(&n.recipient)
            .bind(&n.subject)
            .bind(&n.body)
            .bind(&n.priority)
            .bind(&n.correlation_id)
            .bind(&n.source_event_id)
            .bind(&n.status)
            .bind(&n.digest_key)
            .bind(n.created_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(false);
            }

            sqlx::query(
                r#"
                INSERT INTO delivery_records (
                    id, notification_id, channel, recipient, attempt_count, max_attempts,
                    status, next_attempt_at, version, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(notification_id, channel) DO NOTHING
                "#,
            )
            .bind(&d.id)
            .bind(&d.notification_id)
            .bind(&d.channel)
            .bind(&d.recipient)
            .bind(d.attempt_count)
            .bind(d.max_attempts)
            .bind(&d.status)
            .bind(d.next_attempt_at)
            .bind(d.version)
            .bind(d.created_at)
            .bind(d.updated_at)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(true)
        })
        .await?;

        if inserted {
            return Ok(StoredNotification {
                notification: notification.clone(),
                delivery: delivery.clone(),
                created: true,
            });
        }

        let existing = self
            .find_by_dedup_key(&notification.dedup_key)
            .await?
            .ok_or_else(|| Error::not_found("Notification", &notification.dedup_key))?;
        let row = sqlx::query_as::<_, DeliveryRecordDbModel>(
            "SELECT * FROM delivery_records WHERE notification_id = ? AND channel = ?",
        )
        .bind(&existing.id)
        .bind(existing.channel.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("DeliveryRecord", &existing.id))?;

        Ok(StoredNotification {
            notification: existing,
            delivery: row.try_into()?,
            created: false,
        })
    }

    async fn get(&self, id: &str) -> Result<Notification> {
        sqlx::query_as::<_, NotificationDbModel>("SELECT * FROM notifications WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Notification", id))?
            .try_into()
    }

    async fn find_by_dedup_key(&self, dedup_key: &str) -> Result<Option<Notification>> {
        sqlx::query_as::<_, NotificationDbModel>("SELECT * FROM notifications WHERE dedup_key = ?")
            .bind(dedup_key)
            .fetch_optional(&self.pool)
            .await?
            .map(Notification::try_from)
            .transpose()
    }

    async fn list_for_user(&self, user_id: &str, limit: i64) -> Result<Vec<Notification>> {
        let rows = sqlx::query_as::<_, NotificationDbModel>(
            r#"
            SELECT * FROM notifications
            WHERE user_id = ?
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Notification::try_from).collect()
    }

    async fn record_cancellation(
        &self,
        notification_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        retry_on_sqlite_busy("record_cancellation", || async {
            let result = sqlx::query(
                r#"
                INSERT INTO notification_cancellations (notification_id, reason, cancelled_at)
                VALUES (?, ?, ?)
                ON CONFLICT(notification_id) DO NOTHING
                "#,
            )
            .bind(notification_id)
            .bind(reason)
            .bind(datetime_to_ms(now))
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn get_cancellation(&self, notification_id: &str) -> Result<Option<CancellationDbModel>> {
        let row = sqlx::query_as::<_, CancellationDbModel>(
            "SELECT * FROM notification_cancellations WHERE notification_id = ?",
        )
        .bind(notification_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}
