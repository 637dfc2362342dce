//! Preference service.
//!
//! Reads go through the [`PreferenceCache`]; every write invalidates the
//! cached entry before returning.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::Result;
use crate::database::repositories::PreferenceRepository;
use crate::domain::{Channel, Preference, PreferenceUpdate};
use crate::notification::cache::PreferenceCache;

pub struct PreferenceService {
    repo: Arc<dyn PreferenceRepository>,
    cache: PreferenceCache,
}

impl PreferenceService {
    pub fn new(repo: Arc<dyn PreferenceRepository>, cache: PreferenceCache) -> Self {
        Self { repo, cache }
    }

    pub fn cache(&self) -> &PreferenceCache {
        &self.cache
    }

    /// Read-through lookup, lazily creating the row with permissive defaults.
    pub async fn resolve(
        &self,
        user_id: &str,
        channel: Channel,
        notification_type: &str,
        now: DateTime<Utc>,
    ) -> Result<Arc<Preference>> {
        if let Some(cached) = self.cache.get(user_id, channel, notification_type) {
            return Ok(cached);
        }

        let generation = self.cache.generation(user_id, channel, notification_type);
        let preference = Arc::new(
            self.repo
                .get_or_create(user_id, channel, notification_type, now)
                .await?,
        );
        if !self.cache.fill(preference.clone(), generation) {
            debug!(
                user_id = %user_id,
                channel = %channel,
                notification_type = %notification_type,
                "Preference changed during load, not cached"
            );
        }
        Ok(preference)
    }

    /// Current preference, bypassing the cache.
    pub async fn get(
        &self,
        user_id: &str,
        channel: Channel,
        notification_type: &str,
    ) -> Result<Preference> {
        self.repo
            .get_or_create(user_id, channel, notification_type, Utc::now())
            .await
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Preference>> {
        self.repo.list_for_user(user_id).await
    }

    pub async fn update(
        &self,
        user_id: &str,
        channel: Channel,
        notification_type: &str,
        update: PreferenceUpdate,
    ) -> Result<Preference> {
        let now = Utc::now();
        let mut preference = self
            .repo
            .get_or_create(user_id, channel, notification_type, now)
            .await?;
        update.apply(&mut preference, now)?;

        self.repo.update(&preference).await?;
        self.cache.invalidate(user_id, channel, notification_type);

        info!(
            user_id = %user_id,
            channel = %channel,
            notification_type = %notification_type,
            "Preference updated"
        );
        Ok(preference)
    }

    pub async fn opt_out(
        &self,
        user_id: &str,
        channel: Channel,
        notification_type: &str,
        reason: Option<String>,
    ) -> Result<Preference> {
        self.update(
            user_id,
            channel,
            notification_type,
            PreferenceUpdate {
                global_opt_out: Some(true),
                opt_out_reason: reason,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn opt_in(
        &self,
        user_id: &str,
        channel: Channel,
        notification_type: &str,
    ) -> Result<Preference> {
        self.update(
            user_id,
            channel,
            notification_type,
            PreferenceUpdate {
                enabled: Some(true),
                global_opt_out: Some(false),
                ..Default::default()
            },
        )
        .await
    }
}
