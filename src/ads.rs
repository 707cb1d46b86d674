use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::constants::{
    ADS_UPDATE_BATCH, CREATE_AD_JITTER, DEFAULT_AD_CPM, DEFAULT_AD_LIMIT, MUSIC_CATEGORY_ID,
    MUSIC_INTEREST_ID, RATE_LIMIT_JITTER, SMARTPHONE_DEVICES,
};
use crate::models::{AdState, AgeDisclaimer, ApprovalStatus, NewAd, RunStatus, SexFilter};
use crate::vk::{jitter, lenient_i64, PlaylistRef, VkClient, VkError};

/// A platform audience of an artist's listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct Musician {
    pub name: String,
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DarkPost {
    pub post_url: String,
    pub playlist_url: String,
}

/// Audience filters shared by every ad of a new campaign.
#[derive(Debug, Clone)]
pub struct AdTargeting {
    pub sex: SexFilter,
    pub age_disclaimer: AgeDisclaimer,
    pub age_from: i64,
    pub age_to: i64,
    pub impressions_limit: i64,
    pub music_interest_filter: bool,
}

impl Default for AdTargeting {
    fn default() -> Self {
        Self {
            sex: SexFilter::Any,
            age_disclaimer: AgeDisclaimer::Zero,
            age_from: 0,
            age_to: 0,
            impressions_limit: 1,
            music_interest_filter: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MusiciansPage {
    #[serde(default)]
    items: Vec<MusicianItem>,
}

#[derive(Debug, Deserialize)]
struct MusicianItem {
    id: i64,
    name: String,
}

/// Ads API client bound to one cabinet (and agency client, if any).
#[derive(Clone)]
pub struct VkAds {
    vk: VkClient,
    account_id: i64,
    client_id: Option<i64>,
    lookup_jitter: (f64, f64),
    create_jitter: (f64, f64),
}

impl VkAds {
    pub fn new(vk: VkClient, account_id: i64, client_id: Option<i64>) -> Self {
        Self {
            vk,
            account_id,
            client_id,
            lookup_jitter: RATE_LIMIT_JITTER,
            create_jitter: CREATE_AD_JITTER,
        }
    }

    #[cfg(test)]
    pub fn with_jitter(mut self, lookup: (f64, f64), create: (f64, f64)) -> Self {
        self.lookup_jitter = lookup;
        self.create_jitter = create;
        self
    }

    async fn call(&self, method: &str, mut params: Vec<(&str, String)>) -> Result<Value, VkError> {
        params.push(("account_id", self.account_id.to_string()));
        if let Some(client_id) = self.client_id {
            params.push(("client_id", client_id.to_string()));
        }
        self.vk.call(method, &params).await
    }

    /// Raw `ads.getStatistics` rows for the given ads, lifetime period.
    pub async fn statistics(&self, ad_ids: &[i64]) -> Result<Value, VkError> {
        let ids = ad_ids
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.call(
            "ads.getStatistics",
            vec![
                ("ids_type", "ad".to_string()),
                ("period", "overall".to_string()),
                ("date_from", "0".to_string()),
                ("date_to", "0".to_string()),
                ("ids", ids),
            ],
        )
        .await
    }

    /// Run and moderation status of every ad of a platform campaign,
    /// deleted ones included.
    pub async fn ad_states(&self, campaign_vk_id: i64) -> Result<BTreeMap<i64, AdState>, VkError> {
        let response = self
            .call(
                "ads.getAds",
                vec![
                    ("campaign_ids", json!([campaign_vk_id]).to_string()),
                    ("include_deleted", "1".to_string()),
                ],
            )
            .await?;

        let items = response
            .as_array()
            .ok_or_else(|| VkError::invalid("ads.getAds", "expected an array"))?;

        let mut states = BTreeMap::new();
        for item in items {
            let Some(id) = lenient_i64(&item["id"]) else {
                continue;
            };
            states.insert(
                id,
                AdState {
                    status: RunStatus::from_code(lenient_i64(&item["status"]).unwrap_or(0)),
                    approved: ApprovalStatus::from_code(lenient_i64(&item["approved"]).unwrap_or(0)),
                },
            );
        }
        Ok(states)
    }

    /// Sends `ads.updateAds` in batches. Every batch is attempted; the first
    /// failure is returned after the rest went out.
    async fn update_ads(&self, items: Vec<Value>) -> Result<(), VkError> {
        let mut first_error = None;
        for batch in items.chunks(ADS_UPDATE_BATCH) {
            let data = Value::Array(batch.to_vec()).to_string();
            if let Err(e) = self.call("ads.updateAds", vec![("data", data)]).await {
                tracing::warn!(account_id = self.account_id, error = %e, "ads.updateAds batch failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Sets a per-ad budget limit, 0 meaning unlimited.
    pub async fn limit_ads(&self, ad_ids: &[i64], limit: i64) -> Result<(), VkError> {
        let items = ad_ids
            .iter()
            .map(|id| json!({"ad_id": id, "all_limit": limit}))
            .collect();
        self.update_ads(items).await
    }

    pub async fn start_ads(&self, ad_ids: &[i64]) -> Result<(), VkError> {
        self.set_status(ad_ids, RunStatus::Running).await
    }

    pub async fn stop_ads(&self, ad_ids: &[i64]) -> Result<(), VkError> {
        self.set_status(ad_ids, RunStatus::Stopped).await
    }

    async fn set_status(&self, ad_ids: &[i64], status: RunStatus) -> Result<(), VkError> {
        let items = ad_ids
            .iter()
            .map(|id| json!({"ad_id": id, "status": status.code()}))
            .collect();
        self.update_ads(items).await
    }

    pub async fn update_cpm(&self, cpm: &BTreeMap<i64, f64>) -> Result<(), VkError> {
        let items = cpm
            .iter()
            .map(|(id, cpm)| json!({"ad_id": id, "cpm": round2(*cpm)}))
            .collect();
        self.update_ads(items).await
    }

    /// Looks up the listener audience of each artist. Only exact
    /// case-insensitive name matches count; failed lookups are skipped.
    pub async fn get_musicians(&self, names: &[String]) -> Result<Vec<Musician>, VkError> {
        let mut musicians: Vec<Musician> = Vec::new();
        for (n, name) in names.iter().enumerate() {
            if n > 0 {
                tokio::time::sleep(jitter(self.lookup_jitter)).await;
            }

            let page: MusiciansPage = match self
                .call("ads.getMusicians", vec![("artist_name", name.clone())])
                .await
                .and_then(|value| {
                    serde_json::from_value(value)
                        .map_err(|e| VkError::invalid("ads.getMusicians", e.to_string()))
                }) {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(artist = %name, error = %e, "musician lookup failed");
                    continue;
                }
            };

            let found = page
                .items
                .into_iter()
                .find(|item| item.name.to_lowercase() == name.to_lowercase());
            if let Some(item) = found {
                if !musicians.iter().any(|m| m.id == item.id) {
                    musicians.push(Musician {
                        name: item.name,
                        id: item.id,
                    });
                }
            }
        }
        Ok(musicians)
    }

    /// Creates a running `promoted_posts` campaign and returns its platform id.
    pub async fn create_campaign(&self, name: &str, money_limit: i32) -> Result<i64, VkError> {
        let mut data = json!({
            "type": "promoted_posts",
            "name": name,
            "all_limit": money_limit,
            "status": 1,
        });
        if let Some(client_id) = self.client_id {
            data["client_id"] = json!(client_id);
        }

        let response = self
            .call("ads.createCampaigns", vec![("data", json!([data]).to_string())])
            .await?;
        created_id("ads.createCampaigns", &response)
    }

    /// Publishes one hidden post per playlist on the artist's group wall.
    pub async fn create_dark_posts(
        &self,
        group_id: i64,
        playlist_urls: &[String],
        post_text: &str,
    ) -> Result<Vec<DarkPost>, VkError> {
        let mut posts = Vec::with_capacity(playlist_urls.len());
        for (n, playlist_url) in playlist_urls.iter().enumerate() {
            if n > 0 {
                tokio::time::sleep(jitter(self.lookup_jitter)).await;
            }
            let playlist = PlaylistRef::parse(playlist_url)?;
            let response = self
                .vk
                .call(
                    "wall.postAdsStealth",
                    &[
                        ("owner_id", (-group_id).to_string()),
                        ("message", post_text.to_string()),
                        (
                            "attachments",
                            format!("audio_playlist{}", playlist.attachment_id()),
                        ),
                        ("signed", "0".to_string()),
                    ],
                )
                .await?;
            let post_id = lenient_i64(&response["post_id"])
                .ok_or_else(|| VkError::invalid("wall.postAdsStealth", "missing post_id"))?;
            posts.push(DarkPost {
                post_url: format!("https://vk.com/wall-{group_id}_{post_id}"),
                playlist_url: playlist_url.clone(),
            });
        }
        Ok(posts)
    }

    /// Creates one ad per musician/post pair. Ads the platform refuses are
    /// logged and left out of the result.
    pub async fn create_ads(
        &self,
        campaign_vk_id: i64,
        targets: &[(Musician, DarkPost)],
        targeting: &AdTargeting,
    ) -> Result<Vec<NewAd>, VkError> {
        let mut created = Vec::with_capacity(targets.len());
        for (n, (musician, post)) in targets.iter().enumerate() {
            if n > 0 {
                tokio::time::sleep(jitter(self.create_jitter)).await;
            }
            let ad_name = format!("{} (listeners)", musician.name);
            let data = ad_payload(&ad_name, campaign_vk_id, &post.post_url, musician.id, targeting);

            let response = self
                .call("ads.createAds", vec![("data", json!([data]).to_string())])
                .await?;
            match created_id("ads.createAds", &response) {
                Ok(ad_vk_id) => created.push(NewAd {
                    ad_name,
                    ad_vk_id,
                    playlist_url: post.playlist_url.clone(),
                }),
                Err(e) => {
                    tracing::warn!(musician = %musician.name, error = %e, "ad was not created");
                }
            }
        }
        Ok(created)
    }
}

/// Settings of a new listener-targeted post ad.
pub fn ad_payload(
    ad_name: &str,
    campaign_vk_id: i64,
    post_url: &str,
    musician_id: i64,
    targeting: &AdTargeting,
) -> Value {
    let mut data = json!({
        "campaign_id": campaign_vk_id,
        "ad_format": 9,
        "autobidding": 0,
        "cost_type": 1,
        "cpm": DEFAULT_AD_CPM,
        "impressions_limit": targeting.impressions_limit,
        "ad_platform": "mobile",
        "all_limit": DEFAULT_AD_LIMIT,
        "category1_id": MUSIC_CATEGORY_ID,
        "age_restriction": targeting.age_disclaimer.code(),
        "status": 1,
        "name": ad_name,
        "link_url": post_url,
        "country": 0,
        "user_devices": SMARTPHONE_DEVICES,
        "sex": targeting.sex.api_code(),
        "age_from": targeting.age_disclaimer.adjust_age_from(targeting.age_from),
        "age_to": targeting.age_to,
        "music_artists_formula": musician_id,
    });
    if targeting.music_interest_filter {
        data["interest_categories"] = json!(MUSIC_INTEREST_ID);
    }
    data
}

/// Id of the single object created by an `ads.create*` call.
fn created_id(method: &str, response: &Value) -> Result<i64, VkError> {
    let first = response
        .get(0)
        .ok_or_else(|| VkError::invalid(method, "empty result"))?;
    if let Some(id) = lenient_i64(&first["id"]).filter(|id| *id > 0) {
        return Ok(id);
    }
    let reason = first["error_desc"]
        .as_str()
        .unwrap_or("no id in result")
        .to_string();
    Err(VkError::invalid(method, reason))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
