use async_trait::async_trait;
use chrono::Local;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::ads::VkAds;
use crate::audio::VkAudio;
use crate::db::DatabaseError;
use crate::decision::{decide, Decisions, Thresholds};
use crate::models::{Ad, Campaign, Metrics, RunStatus};
use crate::schedule::AutomationWindow;
use crate::stats::{AdsSnapshot, StatsFetcher};
use crate::store::CampaignStore;
use crate::vk::{VkClient, VkError};

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("VK error: {0}")]
    Vk(#[from] VkError),
}

/// Reads and steers the ads of one campaign on the ad platform.
#[async_trait]
pub trait AdsPlatform: Send + Sync {
    /// `ads` maps platform ad id to the playlist URL it promotes.
    async fn snapshot(
        &self,
        ads: &BTreeMap<i64, String>,
        campaign_vk_id: i64,
    ) -> Result<AdsSnapshot, VkError>;

    async fn limit_ads(&self, ad_ids: &[i64], limit: i64) -> Result<(), VkError>;

    async fn start_ads(&self, ad_ids: &[i64]) -> Result<(), VkError>;

    async fn stop_ads(&self, ad_ids: &[i64]) -> Result<(), VkError>;

    async fn update_cpm(&self, cpm: &BTreeMap<i64, f64>) -> Result<(), VkError>;
}

pub struct VkPlatform {
    stats: StatsFetcher,
    ads: VkAds,
}

impl VkPlatform {
    pub fn new(vk: VkClient, campaign: &Campaign) -> Self {
        let ads = VkAds::new(vk.clone(), campaign.cabinet_vk_id, campaign.client_vk_id);
        Self {
            stats: StatsFetcher::new(ads.clone(), VkAudio::new(vk)),
            ads,
        }
    }
}

#[async_trait]
impl AdsPlatform for VkPlatform {
    async fn snapshot(
        &self,
        ads: &BTreeMap<i64, String>,
        campaign_vk_id: i64,
    ) -> Result<AdsSnapshot, VkError> {
        self.stats.fetch(ads, campaign_vk_id).await
    }

    async fn limit_ads(&self, ad_ids: &[i64], limit: i64) -> Result<(), VkError> {
        self.ads.limit_ads(ad_ids, limit).await
    }

    async fn start_ads(&self, ad_ids: &[i64]) -> Result<(), VkError> {
        self.ads.start_ads(ad_ids).await
    }

    async fn stop_ads(&self, ad_ids: &[i64]) -> Result<(), VkError> {
        self.ads.stop_ads(ad_ids).await
    }

    async fn update_cpm(&self, cpm: &BTreeMap<i64, f64>) -> Result<(), VkError> {
        self.ads.update_cpm(cpm).await
    }
}

/// Why an automation run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    WindowElapsed,
    StoppedExternally,
    AllAdsStopped,
    /// Another process claimed the campaign.
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    Continue,
    Finished(RunOutcome),
}

/// Parameters of one automation run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub target_cost: f64,
    pub speed_coef: Option<f64>,
    pub window: AutomationWindow,
    pub thresholds: Thresholds,
    pub cycle_interval: Duration,
    pub window_poll_interval: Duration,
}

/// Control loop of a single campaign. Owns the campaign from
/// [`AutomationRunner::run`] until another process claims it or the
/// `automate` flag is cleared.
pub struct AutomationRunner {
    store: Arc<dyn CampaignStore>,
    platform: Arc<dyn AdsPlatform>,
    campaign_id: i32,
    settings: RunSettings,
    owner: Uuid,
}

impl AutomationRunner {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        platform: Arc<dyn AdsPlatform>,
        campaign_id: i32,
        settings: RunSettings,
    ) -> Self {
        Self {
            store,
            platform,
            campaign_id,
            settings,
            owner: Uuid::new_v4(),
        }
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub async fn run(&self) -> Result<RunOutcome, RunnerError> {
        let mut ads = self.start().await?;

        if let Some(outcome) = self.wait_for_window().await? {
            return Ok(outcome);
        }
        tracing::info!(campaign_id = self.campaign_id, "automation window open");

        loop {
            if self.settings.window.has_elapsed(Local::now().naive_local()) {
                tracing::info!(campaign_id = self.campaign_id, "automation window elapsed");
                return self.finish(RunOutcome::WindowElapsed).await;
            }

            if let CycleOutcome::Finished(outcome) = self.run_cycle(&mut ads).await? {
                tracing::info!(campaign_id = self.campaign_id, ?outcome, "automation finished");
                return self.finish(outcome).await;
            }

            tokio::time::sleep(self.settings.cycle_interval).await;
        }
    }

    /// A run that ends on its own clears the flag, unless another runner
    /// has claimed the campaign meanwhile.
    async fn finish(&self, outcome: RunOutcome) -> Result<RunOutcome, RunnerError> {
        if matches!(outcome, RunOutcome::WindowElapsed | RunOutcome::AllAdsStopped) {
            let released = self
                .store
                .release_automation(self.campaign_id, self.owner)
                .await?;
            if !released {
                tracing::info!(
                    campaign_id = self.campaign_id,
                    "automation flag left to the current owner"
                );
            }
        }
        Ok(outcome)
    }

    /// Lifts the ads' budget limits and claims the campaign for this runner.
    async fn start(&self) -> Result<Vec<Ad>, RunnerError> {
        let campaign = self.store.campaign(self.campaign_id).await?;
        let ads = self.store.campaign_ads(&campaign).await?;

        let ad_ids: Vec<i64> = ads.iter().map(|ad| ad.ad_vk_id).collect();
        if let Err(e) = self.platform.limit_ads(&ad_ids, 0).await {
            tracing::warn!(campaign_id = self.campaign_id, error = %e, "could not lift ad limits");
        }

        self.store
            .claim_automation(self.campaign_id, self.owner)
            .await?;
        tracing::info!(
            campaign_id = self.campaign_id,
            owner = %self.owner,
            ads = ads.len(),
            target_cost = self.settings.target_cost,
            "automation claimed"
        );
        Ok(ads)
    }

    /// Sleeps until the window opens, giving up early if the campaign is
    /// stopped or claimed by someone else meanwhile.
    async fn wait_for_window(&self) -> Result<Option<RunOutcome>, RunnerError> {
        let mut logged = false;
        while !self
            .settings
            .window
            .has_started(Local::now().naive_local())
        {
            if !logged {
                tracing::info!(
                    campaign_id = self.campaign_id,
                    start = %self.settings.window.start,
                    "waiting for automation window"
                );
                logged = true;
            }
            tokio::time::sleep(self.settings.window_poll_interval).await;

            let campaign = self.store.campaign(self.campaign_id).await?;
            if let Some(outcome) = self.ownership_lost(&campaign) {
                return Ok(Some(outcome));
            }
        }
        Ok(None)
    }

    fn ownership_lost(&self, campaign: &Campaign) -> Option<RunOutcome> {
        if campaign.automation_owner != Some(self.owner) {
            Some(RunOutcome::Superseded)
        } else if !campaign.automate {
            Some(RunOutcome::StoppedExternally)
        } else {
            None
        }
    }

    async fn run_cycle(&self, ads: &mut [Ad]) -> Result<CycleOutcome, RunnerError> {
        let campaign = self.store.campaign(self.campaign_id).await?;
        if campaign.automation_owner != Some(self.owner) {
            tracing::info!(
                campaign_id = self.campaign_id,
                "campaign claimed by another runner"
            );
            return Ok(CycleOutcome::Finished(RunOutcome::Superseded));
        }

        let ad_urls: BTreeMap<i64, String> = ads
            .iter()
            .map(|ad| (ad.ad_vk_id, ad.playlist_url.clone()))
            .collect();
        let snapshot = match self
            .platform
            .snapshot(&ad_urls, campaign.campaign_vk_id)
            .await
        {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(campaign_id = self.campaign_id, error = %e, "no stats this cycle");
                None
            }
        };

        match (snapshot, campaign.automate) {
            (Some(snapshot), true) => {
                let decisions = decide(
                    &snapshot.stats,
                    snapshot.statuses.as_ref(),
                    self.settings.target_cost,
                    self.settings.speed_coef,
                    &self.settings.thresholds,
                );
                tracing::info!(
                    campaign_id = self.campaign_id,
                    start = decisions.start.len(),
                    stop = decisions.stop.len(),
                    cpm = decisions.cpm_updates.len(),
                    "cycle decisions"
                );
                if !decisions.is_empty() {
                    self.apply(&decisions).await;
                }
                self.persist(ads, &snapshot, &decisions).await?;

                if snapshot.statuses.is_some() && all_stopped(ads) {
                    return Ok(CycleOutcome::Finished(RunOutcome::AllAdsStopped));
                }
                Ok(CycleOutcome::Continue)
            }
            (Some(snapshot), false) => {
                let decisions = Decisions::stop_all(ad_urls.keys().copied());
                self.apply(&decisions).await;
                self.persist(ads, &snapshot, &decisions).await?;
                Ok(CycleOutcome::Finished(RunOutcome::StoppedExternally))
            }
            (None, false) => Ok(CycleOutcome::Finished(RunOutcome::StoppedExternally)),
            (None, true) => Ok(CycleOutcome::Continue),
        }
    }

    /// Pushes decisions to the platform. Failures are logged and left for
    /// the next cycle to retry.
    async fn apply(&self, decisions: &Decisions) {
        let start: Vec<i64> = decisions.start.iter().copied().collect();
        let stop: Vec<i64> = decisions.stop.iter().copied().collect();

        if !start.is_empty() {
            if let Err(e) = self.platform.start_ads(&start).await {
                tracing::warn!(campaign_id = self.campaign_id, error = %e, "start_ads failed");
            }
        }
        if !stop.is_empty() {
            if let Err(e) = self.platform.stop_ads(&stop).await {
                tracing::warn!(campaign_id = self.campaign_id, error = %e, "stop_ads failed");
            }
        }
        if !decisions.cpm_updates.is_empty() {
            if let Err(e) = self.platform.update_cpm(&decisions.cpm_updates).await {
                tracing::warn!(campaign_id = self.campaign_id, error = %e, "update_cpm failed");
            }
        }
    }

    /// Stores the cycle's stats and resulting statuses on every ad, then the
    /// campaign totals.
    async fn persist(
        &self,
        ads: &mut [Ad],
        snapshot: &AdsSnapshot,
        decisions: &Decisions,
    ) -> Result<(), RunnerError> {
        for ad in ads.iter_mut() {
            if let Some(stat) = snapshot.stats.get(&ad.ad_vk_id) {
                ad.metrics = Metrics::from_stat(stat);
            }
            if let Some(state) = snapshot
                .statuses
                .as_ref()
                .and_then(|statuses| statuses.get(&ad.ad_vk_id))
            {
                ad.state = *state;
            }
            if decisions.start.contains(&ad.ad_vk_id) {
                ad.state.status = RunStatus::Running;
            } else if decisions.stop.contains(&ad.ad_vk_id) {
                ad.state.status = RunStatus::Stopped;
            }
        }

        let totals = Metrics::rollup(ads.iter().map(|ad| &ad.metrics));
        self.store.bulk_update_ads(ads).await?;
        self.store
            .update_campaign_metrics(self.campaign_id, &totals)
            .await?;

        tracing::info!(
            campaign_id = self.campaign_id,
            spent = totals.spent,
            listens = totals.listens,
            cpl = totals.cpl,
            "campaign stats updated"
        );
        Ok(())
    }
}

/// True when no ad is left running. Deleted ads count as not running.
fn all_stopped(ads: &[Ad]) -> bool {
    !ads.is_empty() && ads.iter().all(|ad| ad.state.status != RunStatus::Running)
}
