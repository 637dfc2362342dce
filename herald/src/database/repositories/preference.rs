//! Preference repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::database::models::PreferenceDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::domain::{Channel, Preference};
use crate::{Error, Result};

/// Preference repository trait.
#[async_trait]
pub trait PreferenceRepository: Send + Sync {
    async fn find(
        &self,
        user_id: &str,
        channel: Channel,
        notification_type: &str,
    ) -> Result<Option<Preference>>;

    /// Read the preference, creating it with permissive defaults if absent.
    ///
    /// Safe under concurrent first use: all callers observe the same row.
    async fn get_or_create(
        &self,
        user_id: &str,
        channel: Channel,
        notification_type: &str,
        now: DateTime<Utc>,
    ) -> Result<Preference>;

    async fn update(&self, preference: &Preference) -> Result<()>;
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Preference>>;
}

/// SQLx implementation of PreferenceRepository.
pub struct SqlxPreferenceRepository {
    pool: SqlitePool,
}

impl SqlxPreferenceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PreferenceRepository for SqlxPreferenceRepository {
    async fn find(
        &self,
        user_id: &str,
        channel: Channel,
        notification_type: &str,
    ) -> Result<Option<Preference>> {
        sqlx::query_as::<_, PreferenceDbModel>(
            r#"
            SELECT * FROM notification_preferences
            WHERE user_id = ? AND channel = ? AND notification_type = ?
            "#,
        )
        .bind(user_id)
        .bind(channel.as_str())
        .bind(notification_type)
        .fetch_optional(&self.pool)
        .await?
        .map(Preference::try_from)
        .transpose()
    }

    async fn get_or_create(
        &self,
        user_id: &str,
        channel: Channel,
        notification_type: &str,
        now: DateTime<Utc>,
    ) -> Result<Preference> {
        let defaults = PreferenceDbModel::from(&Preference::default_for(
            user_id,
            channel,
            notification_type,
            now,
        ));

        retry_on_sqlite_busy("upsert_preference", || async {
            sqlx::query(
                r#"
                INSERT INTO notification_preferences (
                    id, user_id, channel, notification_type, enabled, global_opt_out,
                    quiet_hours_enabled, quiet_hours_start, quiet_hours_end, timezone,
                    hourly_cap, daily_cap, min_priority, opt_out_reason, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(user_id, channel, notification_type) DO NOTHING
                "#,
            )
            .bind(&defaults.id)
            .bind(&defaults.user_id)
            .bind(&defaults.channel)
            .bind(&defaults.notification_type)
            .bind(defaults.enabled)
            .bind(defaults.global_opt_out)
            .bind(defaults.quiet_hours_enabled)
            .bind(&defaults.quiet_hours_start)
            .bind(&defaults.quiet_hours_end)
            .bind(&defaults.timezone)
            .bind(defaults.hourly_cap)
            .bind(defaults.daily_cap)
            .bind(&defaults.min_priority)
            .bind(&defaults.opt_out_reason)
            .bind(defaults.created_at)
            .bind(defaults.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;

        self.find(user_id, channel, notification_type)
            .await?
            .ok_or_else(|| {
                Error::not_found(
                    "Preference",
                    format!("{}/{}/{}", user_id, channel, notification_type),
                )
            })
    }

    async fn update(&self, preference: &Preference) -> Result<()> {
        let row = PreferenceDbModel::from(preference);
        let result = retry_on_sqlite_busy("update_preference", || async {
            let result = sqlx::query(
                r#"
                UPDATE notification_preferences SET
                    enabled = ?,
                    global_opt_out = ?,
                    quiet_hours_enabled = ?,
                    quiet_hours_start = ?,
                    quiet_hours_end = ?,
                    timezone = ?,
                    hourly_cap = ?,
                    daily_cap = ?,
                    min_priority = ?,
                    opt_out_reason = ?,
                    updated_at = ?
                WHERE user_id = ? AND channel = ? AND notification_type = ?
                "#,
            )
            .bind(row.enabled)
            .bind(row.global_opt_out)
            .bind(row.quiet_hours_enabled)
            .bind(&row.quiet_hours_start)
            .bind(&row.quiet_hours_end)
            .bind(&row.timezone)
            .bind(row.hourly_cap)
            .bind(row.daily_cap)
            .bind(&row.min_priority)
            .bind(&row.opt_out_reason)
            .bind(row.updated_at)
            .bind(&row.user_id)
            .bind(&row.channel)
            .bind(&row.notification_type)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if result == 0 {
            return Err(Error::not_found("Preference", &preference.id));
        }
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Preference>> {
        let rows = sqlx::query_as::<_, PreferenceDbModel>(
            r#"
            SELECT * FROM notification_preferences
            WHERE user_id = ?
            ORDER BY channel, notification_type
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Preference::try_from).collect()
    }
}
