use async_trait::async_trait;
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::{
    Ad, AutomationSettings, Campaign, CampaignSettings, Metrics, NewCampaign, User,
};

/// Persistence used by the automation loop, the supervisor and the creation
/// flow. Writes touch only the columns they name, so a concurrent flip of
/// `automate` by another process is never overwritten by a stats update.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn campaign(&self, id: i32) -> Result<Campaign, DatabaseError>;

    async fn user(&self, id: i32) -> Result<User, DatabaseError>;

    /// Ads of a campaign, looked up by the denormalized `campaign_vk_id`.
    async fn campaign_ads(&self, campaign: &Campaign) -> Result<Vec<Ad>, DatabaseError>;

    /// Sets `automate = true` and records `owner` as the running loop.
    async fn claim_automation(&self, campaign_id: i32, owner: Uuid) -> Result<(), DatabaseError>;

    async fn set_automate(&self, campaign_id: i32, automate: bool) -> Result<(), DatabaseError>;

    /// Clears `automate` only while `owner` still holds the campaign.
    /// Returns whether the flag was cleared.
    async fn release_automation(&self, campaign_id: i32, owner: Uuid)
        -> Result<bool, DatabaseError>;

    async fn update_campaign_metrics(
        &self,
        campaign_id: i32,
        metrics: &Metrics,
    ) -> Result<(), DatabaseError>;

    /// Writes spent, reach, cpm, clicks, subscribes, listens, cpl, status and
    /// approved of every given ad.
    async fn bulk_update_ads(&self, ads: &[Ad]) -> Result<(), DatabaseError>;

    async fn insert_automation_settings(
        &self,
        campaign_id: i32,
        target_cost: f64,
        speed_coef: Option<f64>,
        start_tomorrow: bool,
        finish_tomorrow: bool,
    ) -> Result<AutomationSettings, DatabaseError>;

    async fn latest_automation_settings(
        &self,
        campaign_id: i32,
    ) -> Result<AutomationSettings, DatabaseError>;

    async fn automated_campaigns(&self) -> Result<Vec<Campaign>, DatabaseError>;

    async fn campaign_settings(&self, id: i32) -> Result<CampaignSettings, DatabaseError>;

    /// Persists the campaign and all of its ads, or nothing.
    async fn insert_campaign(&self, campaign: &NewCampaign) -> Result<Campaign, DatabaseError>;
}

#[cfg(test)]
pub mod memory {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use chrono::Utc;

    use super::*;
    use crate::models::AdState;

    #[derive(Default)]
    struct State {
        users: BTreeMap<i32, User>,
        campaigns: BTreeMap<i32, Campaign>,
        ads: Vec<Ad>,
        settings: Vec<AutomationSettings>,
        campaign_settings: BTreeMap<i32, CampaignSettings>,
        metric_writes: usize,
    }

    /// In-process stand-in for the Postgres store.
    #[derive(Default)]
    pub struct MemoryStore {
        state: Mutex<State>,
    }

    pub fn campaign(id: i32, campaign_vk_id: i64) -> Campaign {
        Campaign {
            id,
            owner_id: 1,
            cabinet_vk_id: 1_000,
            client_vk_id: None,
            campaign_vk_id,
            campaign_name: format!("Campaign {id}"),
            campaign_budget: 1_000,
            release_artist: "Artist".to_string(),
            release_title: "Title".to_string(),
            release_cover_url: String::new(),
            artist_group_id: 10,
            playlists_group_id: 20,
            metrics: Metrics::default(),
            automate: false,
            automation_owner: None,
            create_datetime: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn ad(id: i32, campaign: &Campaign, ad_vk_id: i64, playlist_id: i64) -> Ad {
        Ad {
            id,
            campaign_id: campaign.id,
            campaign_name: campaign.campaign_name.clone(),
            campaign_vk_id: campaign.campaign_vk_id,
            ad_name: format!("ad {ad_vk_id}"),
            ad_vk_id,
            playlist_url: format!(
                "https://vk.com/music/album/-{}_{playlist_id}",
                campaign.playlists_group_id
            ),
            metrics: Metrics::default(),
            state: AdState::default(),
        }
    }

    impl MemoryStore {
        pub fn put_campaign(&self, campaign: Campaign) {
            self.state
                .lock()
                .unwrap()
                .campaigns
                .insert(campaign.id, campaign);
        }

        pub fn put_ad(&self, ad: Ad) {
            self.state.lock().unwrap().ads.push(ad);
        }

        pub fn put_campaign_settings(&self, settings: CampaignSettings) {
            self.state
                .lock()
                .unwrap()
                .campaign_settings
                .insert(settings.id, settings);
        }

        pub fn put_automation_settings(&self, settings: AutomationSettings) {
            self.state.lock().unwrap().settings.push(settings);
        }

        pub fn snapshot(&self, id: i32) -> Campaign {
            self.state.lock().unwrap().campaigns[&id].clone()
        }

        pub fn ads(&self) -> Vec<Ad> {
            self.state.lock().unwrap().ads.clone()
        }

        pub fn settings(&self) -> Vec<AutomationSettings> {
            self.state.lock().unwrap().settings.clone()
        }

        pub fn metric_writes(&self) -> usize {
            self.state.lock().unwrap().metric_writes
        }
    }

    fn not_found(entity: &'static str, id: i32) -> DatabaseError {
        DatabaseError::NotFound { entity, id }
    }

    #[async_trait]
    impl CampaignStore for MemoryStore {
        async fn campaign(&self, id: i32) -> Result<Campaign, DatabaseError> {
            let state = self.state.lock().unwrap();
            state
                .campaigns
                .get(&id)
                .cloned()
                .ok_or_else(|| not_found("campaign", id))
        }

        async fn user(&self, id: i32) -> Result<User, DatabaseError> {
            let state = self.state.lock().unwrap();
            state
                .users
                .get(&id)
                .cloned()
                .ok_or_else(|| not_found("user", id))
        }

        async fn campaign_ads(&self, campaign: &Campaign) -> Result<Vec<Ad>, DatabaseError> {
            let state = self.state.lock().unwrap();
            Ok(state
                .ads
                .iter()
                .filter(|ad| ad.campaign_vk_id == campaign.campaign_vk_id)
                .cloned()
                .collect())
        }

        async fn claim_automation(
            &self,
            campaign_id: i32,
            owner: Uuid,
        ) -> Result<(), DatabaseError> {
            let mut state = self.state.lock().unwrap();
            let campaign = state
                .campaigns
                .get_mut(&campaign_id)
                .ok_or_else(|| not_found("campaign", campaign_id))?;
            campaign.automate = true;
            campaign.automation_owner = Some(owner);
            Ok(())
        }

        async fn set_automate(&self, campaign_id: i32, automate: bool) -> Result<(), DatabaseError> {
            let mut state = self.state.lock().unwrap();
            let campaign = state
                .campaigns
                .get_mut(&campaign_id)
                .ok_or_else(|| not_found("campaign", campaign_id))?;
            campaign.automate = automate;
            Ok(())
        }

        async fn release_automation(
            &self,
            campaign_id: i32,
            owner: Uuid,
        ) -> Result<bool, DatabaseError> {
            let mut state = self.state.lock().unwrap();
            let campaign = state
                .campaigns
                .get_mut(&campaign_id)
                .ok_or_else(|| not_found("campaign", campaign_id))?;
            if campaign.automation_owner != Some(owner) {
                return Ok(false);
            }
            campaign.automate = false;
            Ok(true)
        }

        async fn update_campaign_metrics(
            &self,
            campaign_id: i32,
            metrics: &Metrics,
        ) -> Result<(), DatabaseError> {
            let mut state = self.state.lock().unwrap();
            state.metric_writes += 1;
            let campaign = state
                .campaigns
                .get_mut(&campaign_id)
                .ok_or_else(|| not_found("campaign", campaign_id))?;
            campaign.metrics = metrics.clone();
            Ok(())
        }

        async fn bulk_update_ads(&self, ads: &[Ad]) -> Result<(), DatabaseError> {
            let mut state = self.state.lock().unwrap();
            for updated in ads {
                if let Some(stored) = state.ads.iter_mut().find(|ad| ad.id == updated.id) {
                    stored.metrics = updated.metrics.clone();
                    stored.state = updated.state;
                }
            }
            Ok(())
        }

        async fn insert_automation_settings(
            &self,
            campaign_id: i32,
            target_cost: f64,
            speed_coef: Option<f64>,
            start_tomorrow: bool,
            finish_tomorrow: bool,
        ) -> Result<AutomationSettings, DatabaseError> {
            let mut state = self.state.lock().unwrap();
            let settings = AutomationSettings {
                id: i32::try_from(state.settings.len()).unwrap_or(i32::MAX) + 1,
                campaign_id,
                target_cost,
                speed_coef,
                start_tomorrow,
                finish_tomorrow,
                created_at: Utc::now(),
            };
            state.settings.push(settings.clone());
            Ok(settings)
        }

        async fn latest_automation_settings(
            &self,
            campaign_id: i32,
        ) -> Result<AutomationSettings, DatabaseError> {
            let state = self.state.lock().unwrap();
            state
                .settings
                .iter()
                .filter(|s| s.campaign_id == campaign_id)
                .max_by_key(|s| s.created_at)
                .cloned()
                .ok_or_else(|| not_found("automation settings for campaign", campaign_id))
        }

        async fn automated_campaigns(&self) -> Result<Vec<Campaign>, DatabaseError> {
            let state = self.state.lock().unwrap();
            Ok(state
                .campaigns
                .values()
                .filter(|c| c.automate)
                .cloned()
                .collect())
        }

        async fn campaign_settings(&self, id: i32) -> Result<CampaignSettings, DatabaseError> {
            let state = self.state.lock().unwrap();
            state
                .campaign_settings
                .get(&id)
                .cloned()
                .ok_or_else(|| not_found("campaign settings", id))
        }

        async fn insert_campaign(
            &self,
            new: &NewCampaign,
        ) -> Result<Campaign, DatabaseError> {
            let mut state = self.state.lock().unwrap();
            let id = i32::try_from(state.campaigns.len()).unwrap_or(i32::MAX) + 1;
            let mut stored = campaign(id, new.campaign_vk_id);
            stored.owner_id = new.owner_id;
            stored.cabinet_vk_id = new.cabinet_vk_id;
            stored.client_vk_id = new.client_vk_id;
            stored.campaign_name = new.campaign_name.clone();
            stored.campaign_budget = new.campaign_budget;
            stored.release_artist = new.release_artist.clone();
            stored.release_title = new.release_title.clone();
            stored.release_cover_url = new.release_cover_url.clone();
            stored.artist_group_id = new.artist_group_id;
            stored.playlists_group_id = new.playlists_group_id;
            state.campaigns.insert(id, stored.clone());

            for new_ad in &new.ads {
                let ad_id = i32::try_from(state.ads.len()).unwrap_or(i32::MAX) + 1;
                let mut row = ad(ad_id, &stored, new_ad.ad_vk_id, 0);
                row.ad_name = new_ad.ad_name.clone();
                row.playlist_url = new_ad.playlist_url.clone();
                state.ads.push(row);
            }
            Ok(stored)
        }
    }
}
