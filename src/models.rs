use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Run status of an ad as reported by the ads cabinet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RunStatus {
    #[default]
    Stopped,
    Running,
    Deleted,
}

impl RunStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => RunStatus::Running,
            2 => RunStatus::Deleted,
            _ => RunStatus::Stopped,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            RunStatus::Stopped => 0,
            RunStatus::Running => 1,
            RunStatus::Deleted => 2,
        }
    }
}

/// Moderation state of an ad. Only `Approved` ads may be resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ApprovalStatus {
    #[default]
    Unreviewed,
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => ApprovalStatus::Pending,
            2 => ApprovalStatus::Approved,
            3 => ApprovalStatus::Rejected,
            _ => ApprovalStatus::Unreviewed,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            ApprovalStatus::Unreviewed => 0,
            ApprovalStatus::Pending => 1,
            ApprovalStatus::Approved => 2,
            ApprovalStatus::Rejected => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdState {
    pub status: RunStatus,
    pub approved: ApprovalStatus,
}

/// Live counters of one ad for the current cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdStat {
    pub spent: f64,
    pub reach: i64,
    pub cpm: f64,
    pub clicks: i64,
    pub subscribes: i64,
    pub listens: i64,
}

impl AdStat {
    /// Spend per listen, undefined until the playlist has been played.
    pub fn cost_per_listen(&self) -> Option<f64> {
        if self.listens > 0 {
            Some(self.spent / self.listens as f64)
        } else {
            None
        }
    }
}

/// Persisted performance figures, shared by `Campaign` and `Ad` rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub spent: f64,
    pub reach: i64,
    pub cpm: f64,
    pub clicks: i64,
    pub subscribes: i64,
    pub listens: i64,
    pub cpl: f64,
}

impl Metrics {
    pub fn from_stat(stat: &AdStat) -> Self {
        Self {
            spent: stat.spent,
            reach: stat.reach,
            cpm: stat.cpm,
            clicks: stat.clicks,
            subscribes: stat.subscribes,
            listens: stat.listens,
            cpl: stat.cost_per_listen().unwrap_or(0.0),
        }
    }

    /// Sums per-ad counters into campaign totals and derives cpm and cpl
    /// from the sums, guarding against zero reach and zero listens.
    pub fn rollup<'a>(items: impl IntoIterator<Item = &'a Metrics>) -> Self {
        let mut total = Metrics::default();
        for m in items {
            total.spent += m.spent;
            total.reach += m.reach;
            total.clicks += m.clicks;
            total.subscribes += m.subscribes;
            total.listens += m.listens;
        }
        total.cpm = if total.reach > 0 {
            total.spent / (total.reach as f64 / 1000.0)
        } else {
            0.0
        };
        total.cpl = if total.listens > 0 {
            total.spent / total.listens as f64
        } else {
            0.0
        };
        total
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i32,
    pub vk_user_id: i64,
    pub vk_token: String,
}

#[derive(Debug, Clone)]
pub struct Campaign {
    pub id: i32,
    pub owner_id: i32,
    pub cabinet_vk_id: i64,
    pub client_vk_id: Option<i64>,
    pub campaign_vk_id: i64,
    pub campaign_name: String,
    pub campaign_budget: i32,
    pub release_artist: String,
    pub release_title: String,
    pub release_cover_url: String,
    pub artist_group_id: i64,
    pub playlists_group_id: i64,
    pub metrics: Metrics,
    pub automate: bool,
    pub automation_owner: Option<Uuid>,
    pub create_datetime: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Ad {
    pub id: i32,
    pub campaign_id: i32,
    pub campaign_name: String,
    pub campaign_vk_id: i64,
    pub ad_name: String,
    pub ad_vk_id: i64,
    pub playlist_url: String,
    pub metrics: Metrics,
    pub state: AdState,
}

/// Parameters of one automation run. A new row per (re)start.
#[derive(Debug, Clone)]
pub struct AutomationSettings {
    pub id: i32,
    pub campaign_id: i32,
    pub target_cost: f64,
    pub speed_coef: Option<f64>,
    pub start_tomorrow: bool,
    pub finish_tomorrow: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SexFilter {
    #[default]
    Any,
    Male,
    Female,
}

impl SexFilter {
    /// Stored settings use 0 any, 1 male, 2 female.
    pub fn from_settings_code(code: i32) -> Self {
        match code {
            1 => SexFilter::Male,
            2 => SexFilter::Female,
            _ => SexFilter::Any,
        }
    }

    /// Ads targeting uses 0 any, 1 female, 2 male.
    pub fn api_code(self) -> i64 {
        match self {
            SexFilter::Any => 0,
            SexFilter::Female => 1,
            SexFilter::Male => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum AgeDisclaimer {
    #[default]
    Zero,
    Six,
    Twelve,
    Sixteen,
    Eighteen,
}

impl AgeDisclaimer {
    pub fn from_code(code: i32) -> Self {
        match code {
            2 => AgeDisclaimer::Six,
            3 => AgeDisclaimer::Twelve,
            4 => AgeDisclaimer::Sixteen,
            5 => AgeDisclaimer::Eighteen,
            _ => AgeDisclaimer::Zero,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            AgeDisclaimer::Zero => 1,
            AgeDisclaimer::Six => 2,
            AgeDisclaimer::Twelve => 3,
            AgeDisclaimer::Sixteen => 4,
            AgeDisclaimer::Eighteen => 5,
        }
    }

    /// Lowest `age_from` the cabinet accepts together with this disclaimer.
    pub fn adjust_age_from(self, age_from: i64) -> i64 {
        match self {
            AgeDisclaimer::Six if age_from < 6 => 14,
            AgeDisclaimer::Twelve if age_from < 12 => 14,
            AgeDisclaimer::Sixteen if age_from < 16 => 16,
            AgeDisclaimer::Eighteen if age_from < 18 => 18,
            _ => age_from,
        }
    }
}

/// Stored input of the campaign creation flow.
#[derive(Debug, Clone)]
pub struct CampaignSettings {
    pub id: i32,
    pub owner_id: i32,
    pub cabinet_vk_id: i64,
    pub client_vk_id: Option<i64>,
    pub release_url: String,
    pub post_text: String,
    pub artist_group_id: i64,
    pub budget: i32,
    pub musician_names: Vec<String>,
    pub sex_filter: SexFilter,
    pub age_disclaimer: AgeDisclaimer,
    pub age_from: i64,
    pub age_to: i64,
    pub find_related_artists: bool,
}

/// Splits the free-form musician list of a settings row.
pub fn split_musician_names(raw: &str) -> Vec<String> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
pub struct NewAd {
    pub ad_name: String,
    pub ad_vk_id: i64,
    pub playlist_url: String,
}

/// Campaign assembled by the creation flow, persisted together with its ads.
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub owner_id: i32,
    pub cabinet_vk_id: i64,
    pub client_vk_id: Option<i64>,
    pub campaign_vk_id: i64,
    pub campaign_name: String,
    pub campaign_budget: i32,
    pub release_artist: String,
    pub release_title: String,
    pub release_cover_url: String,
    pub artist_group_id: i64,
    pub playlists_group_id: i64,
    pub ads: Vec<NewAd>,
}
