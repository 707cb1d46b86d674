use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use thiserror::Error;

use crate::ads::{AdTargeting, DarkPost, Musician, VkAds};
use crate::artists::{related_artists, ArtistCatalog, CrawlOptions};
use crate::audio::{Release, VkAudio};
use crate::db::DatabaseError;
use crate::models::{AgeDisclaimer, Campaign, CampaignSettings, NewAd, NewCampaign};
use crate::store::CampaignStore;
use crate::vk::{PlaylistRef, VkClient, VkError};

#[derive(Error, Debug)]
pub enum CreationError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("VK error: {0}")]
    Vk(#[from] VkError),
    #[error("No target artists for this release")]
    NoTargetArtists,
    #[error("None of the target artists has an ads audience")]
    NoAudiences,
    #[error("The ads cabinet refused every ad")]
    NoAdsCreated,
}

/// Platform steps of campaign creation, in the order they run.
#[async_trait]
pub trait CreationPlatform: Send + Sync {
    async fn parse_release(&self, release_url: &str) -> Result<Release, VkError>;

    async fn musicians(&self, names: &[String]) -> Result<Vec<Musician>, VkError>;

    /// One playlist copy of the release per audience.
    async fn replicate_release(&self, release: &Release, count: usize)
        -> Result<Vec<String>, VkError>;

    async fn dark_posts(
        &self,
        group_id: i64,
        playlist_urls: &[String],
        post_text: &str,
    ) -> Result<Vec<DarkPost>, VkError>;

    async fn create_campaign(&self, name: &str, budget: i32) -> Result<i64, VkError>;

    async fn create_ads(
        &self,
        campaign_vk_id: i64,
        targets: &[(Musician, DarkPost)],
        targeting: &AdTargeting,
    ) -> Result<Vec<NewAd>, VkError>;
}

pub struct VkCreationPlatform {
    audio: VkAudio,
    ads: VkAds,
}

impl VkCreationPlatform {
    pub fn new(vk: VkClient, settings: &CampaignSettings) -> Self {
        Self {
            audio: VkAudio::new(vk.clone()),
            ads: VkAds::new(vk, settings.cabinet_vk_id, settings.client_vk_id),
        }
    }
}

#[async_trait]
impl CreationPlatform for VkCreationPlatform {
    async fn parse_release(&self, release_url: &str) -> Result<Release, VkError> {
        self.audio.parse_release(release_url).await
    }

    async fn musicians(&self, names: &[String]) -> Result<Vec<Musician>, VkError> {
        self.ads.get_musicians(names).await
    }

    async fn replicate_release(
        &self,
        release: &Release,
        count: usize,
    ) -> Result<Vec<String>, VkError> {
        self.audio.replicate_release(release, count).await
    }

    async fn dark_posts(
        &self,
        group_id: i64,
        playlist_urls: &[String],
        post_text: &str,
    ) -> Result<Vec<DarkPost>, VkError> {
        self.ads
            .create_dark_posts(group_id, playlist_urls, post_text)
            .await
    }

    async fn create_campaign(&self, name: &str, budget: i32) -> Result<i64, VkError> {
        self.ads.create_campaign(name, budget).await
    }

    async fn create_ads(
        &self,
        campaign_vk_id: i64,
        targets: &[(Musician, DarkPost)],
        targeting: &AdTargeting,
    ) -> Result<Vec<NewAd>, VkError> {
        self.ads.create_ads(campaign_vk_id, targets, targeting).await
    }
}

/// Targeting of a release's ads. Explicit releases are always 18+.
pub fn targeting_for(settings: &CampaignSettings, release: &Release) -> AdTargeting {
    let mut targeting = AdTargeting {
        sex: settings.sex_filter,
        age_disclaimer: settings.age_disclaimer,
        age_from: settings.age_from,
        age_to: settings.age_to,
        ..AdTargeting::default()
    };
    if release.is_explicit {
        targeting.age_disclaimer = AgeDisclaimer::Eighteen;
        targeting.age_from = targeting.age_from.max(18);
    }
    targeting
}

/// Explicit names first, then the release's own artists, then related
/// artists; duplicates are dropped ignoring case.
fn target_names(
    explicit: &[String],
    release: &Release,
    related: Vec<String>,
) -> Vec<String> {
    let mut seen = HashSet::new();
    explicit
        .iter()
        .cloned()
        .chain(release.artist_domains.keys().cloned())
        .chain(related)
        .filter(|name| seen.insert(name.to_lowercase()))
        .collect()
}

/// Builds a whole campaign from a stored settings row: audiences, playlist
/// copies, dark posts, the campaign shell and its ads. Rows are written only
/// once every platform step has succeeded.
pub async fn create_campaign(
    store: &dyn CampaignStore,
    platform: &dyn CreationPlatform,
    catalog: &dyn ArtistCatalog,
    settings: &CampaignSettings,
    crawl: &CrawlOptions,
    now: DateTime<Utc>,
) -> Result<Campaign, CreationError> {
    let release = platform.parse_release(&settings.release_url).await?;
    tracing::info!(
        settings_id = settings.id,
        artist = %release.artist_name,
        title = %release.title,
        tracks = release.tracks.len(),
        "release parsed"
    );

    let related = if settings.find_related_artists {
        let seeds: Vec<String> = release
            .artist_domains
            .values()
            .map(|domain| format!("https://vk.com/artist/{domain}"))
            .collect();
        related_artists(catalog, &seeds, crawl, now).await
    } else {
        Vec::new()
    };

    let names = target_names(&settings.musician_names, &release, related);
    if names.is_empty() {
        return Err(CreationError::NoTargetArtists);
    }

    let musicians = platform.musicians(&names).await?;
    tracing::info!(
        settings_id = settings.id,
        names = names.len(),
        audiences = musicians.len(),
        "audiences resolved"
    );
    if musicians.is_empty() {
        return Err(CreationError::NoAudiences);
    }

    let playlist_urls = platform
        .replicate_release(&release, musicians.len())
        .await?;
    let posts = platform
        .dark_posts(settings.artist_group_id, &playlist_urls, &settings.post_text)
        .await?;

    let campaign_name = format!("{} / {}", release.artist_name, release.title);
    let campaign_vk_id = platform
        .create_campaign(&campaign_name, settings.budget)
        .await?;

    let targets: Vec<(Musician, DarkPost)> = musicians.into_iter().zip(posts).collect();
    let targeting = targeting_for(settings, &release);
    let ads = platform
        .create_ads(campaign_vk_id, &targets, &targeting)
        .await?;
    let Some(first) = ads.first() else {
        return Err(CreationError::NoAdsCreated);
    };
    let playlists_group_id = -PlaylistRef::parse(&first.playlist_url)?.owner_id;

    let campaign = store
        .insert_campaign(&NewCampaign {
            owner_id: settings.owner_id,
            cabinet_vk_id: settings.cabinet_vk_id,
            client_vk_id: settings.client_vk_id,
            campaign_vk_id,
            campaign_name,
            campaign_budget: settings.budget,
            release_artist: release.artist_name.clone(),
            release_title: release.title.clone(),
            release_cover_url: release.cover_url.clone(),
            artist_group_id: settings.artist_group_id,
            playlists_group_id,
            ads,
        })
        .await?;

    tracing::info!(
        campaign_id = campaign.id,
        campaign_vk_id,
        "campaign created"
    );
    Ok(campaign)
}
