use serde_json::Value;
use std::collections::BTreeMap;

use crate::ads::VkAds;
use crate::audio::{PlaylistStat, VkAudio};
use crate::models::{AdStat, AdState};
use crate::vk::{lenient_f64, lenient_i64, PlaylistRef, VkError};

/// Everything one automation cycle knows about the campaign's ads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdsSnapshot {
    pub stats: BTreeMap<i64, AdStat>,
    /// `None` when the status lookup failed this cycle.
    pub statuses: Option<BTreeMap<i64, AdState>>,
}

/// Reads live ad counters from the ads cabinet and playlist listens from
/// the group that hosts the ad playlists.
#[derive(Clone)]
pub struct StatsFetcher {
    ads: VkAds,
    audio: VkAudio,
}

impl StatsFetcher {
    pub fn new(ads: VkAds, audio: VkAudio) -> Self {
        Self { ads, audio }
    }

    /// `ads` maps platform ad id to the playlist URL it promotes.
    pub async fn fetch(
        &self,
        ads: &BTreeMap<i64, String>,
        campaign_vk_id: i64,
    ) -> Result<AdsSnapshot, VkError> {
        let Some(first_url) = ads.values().next() else {
            return Ok(AdsSnapshot::default());
        };
        let group_id = -PlaylistRef::parse(first_url)?.owner_id;

        let playlists = self.audio.group_playlists_stat(group_id).await?;
        let ad_ids: Vec<i64> = ads.keys().copied().collect();
        let raw = self.ads.statistics(&ad_ids).await?;

        let mut stats = parse_statistics(&raw, &ad_ids);
        merge_listens(&mut stats, ads, &playlists);

        let statuses = match self.ads.ad_states(campaign_vk_id).await {
            Ok(statuses) => Some(statuses),
            Err(e) => {
                tracing::warn!(campaign_vk_id, error = %e, "ad statuses unavailable");
                None
            }
        };

        Ok(AdsSnapshot { stats, statuses })
    }
}

/// Turns `ads.getStatistics` rows into per-ad counters. Every requested ad
/// gets an entry; ads without impressions report zeros.
pub fn parse_statistics(response: &Value, ad_ids: &[i64]) -> BTreeMap<i64, AdStat> {
    let mut stats: BTreeMap<i64, AdStat> =
        ad_ids.iter().map(|id| (*id, AdStat::default())).collect();

    for row in response.as_array().into_iter().flatten() {
        let Some(id) = lenient_i64(&row["id"]) else {
            continue;
        };
        let Some(period) = row["stats"].get(0) else {
            continue;
        };

        let stat = stats.entry(id).or_default();
        if let Some(spent) = period.get("spent").and_then(lenient_f64) {
            let reach = period
                .get("impressions")
                .and_then(lenient_i64)
                .unwrap_or(0);
            stat.spent = spent;
            stat.reach = reach;
            stat.cpm = if reach > 0 {
                (spent / (reach as f64 / 1000.0) * 100.0).round() / 100.0
            } else {
                0.0
            };
        }
        if let Some(clicks) = period.get("clicks").and_then(lenient_i64) {
            stat.clicks = clicks;
        }
        if let Some(subscribes) = period.get("join_rate").and_then(lenient_i64) {
            stat.subscribes = subscribes;
        }
    }
    stats
}

/// Copies playlist listens onto the ads that promote those playlists.
pub fn merge_listens(
    stats: &mut BTreeMap<i64, AdStat>,
    ads: &BTreeMap<i64, String>,
    playlists: &BTreeMap<String, PlaylistStat>,
) {
    for (ad_id, url) in ads {
        let key = PlaylistRef::parse(url)
            .map(|p| p.canonical_url())
            .unwrap_or_else(|_| url.clone());
        let listens = playlists.get(&key).map(|p| p.listens).unwrap_or(0);
        stats.entry(*ad_id).or_default().listens = listens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ApprovalStatus, RunStatus};
    use crate::vk::testing;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ok(response: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({ "response": response }))
    }

    #[test]
    fn statistics_report_zeros_for_silent_ads() {
        let response = json!([
            {"id": 1, "type": "ad", "stats": [{"spent": "150.00", "impressions": "3000", "clicks": 4, "join_rate": 2}]},
            {"id": "2", "type": "ad", "stats": []},
            {"id": 3, "type": "ad", "stats": [{"clicks": 1}]}
        ]);
        let stats = parse_statistics(&response, &[1, 2, 3, 4]);

        assert_eq!(stats.len(), 4);
        assert_eq!(stats[&1].spent, 150.0);
        assert_eq!(stats[&1].reach, 3000);
        assert_eq!(stats[&1].cpm, 50.0);
        assert_eq!(stats[&1].clicks, 4);
        assert_eq!(stats[&1].subscribes, 2);
        assert_eq!(stats[&2], AdStat::default());
        assert_eq!(stats[&3].clicks, 1);
        assert_eq!(stats[&3].spent, 0.0);
        assert_eq!(stats[&4], AdStat::default());
    }

    #[test]
    fn cpm_is_rounded_to_kopecks() {
        let response = json!([{"id": 1, "stats": [{"spent": 10, "impressions": 3}]}]);
        let stats = parse_statistics(&response, &[1]);
        assert_eq!(stats[&1].cpm, 3333.33);
    }

    #[test]
    fn spent_without_impressions_has_zero_cpm() {
        let response = json!([{"id": 1, "stats": [{"spent": "5"}]}]);
        let stats = parse_statistics(&response, &[1]);
        assert_eq!(stats[&1].spent, 5.0);
        assert_eq!(stats[&1].cpm, 0.0);
    }

    #[test]
    fn listens_follow_playlist_urls_ignoring_access_keys() {
        let ads: BTreeMap<i64, String> = [
            (1, "https://vk.com/music/album/-20_1_key".to_string()),
            (2, "https://vk.com/music/album/-20_2".to_string()),
        ]
        .into_iter()
        .collect();
        let playlists: BTreeMap<String, PlaylistStat> = [(
            "https://vk.com/music/album/-20_1".to_string(),
            PlaylistStat {
                title: "x".to_string(),
                listens: 9,
                followers: 0,
            },
        )]
        .into_iter()
        .collect();

        let mut stats = BTreeMap::new();
        merge_listens(&mut stats, &ads, &playlists);

        assert_eq!(stats[&1].listens, 9);
        assert_eq!(stats[&2].listens, 0);
    }

    #[tokio::test]
    async fn fetch_combines_stats_listens_and_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/audio.getPlaylists"))
            .respond_with(ok(json!({
                "items": [{"id": 1, "owner_id": -20, "title": "a", "plays": 4, "followers": 0}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ads.getStatistics"))
            .respond_with(ok(json!([
                {"id": 11, "stats": [{"spent": "40", "impressions": "2000"}]}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ads.getAds"))
            .respond_with(ok(json!([{"id": 11, "status": 1, "approved": 2}])))
            .mount(&server)
            .await;

        let vk = testing::client(&server.uri());
        let fetcher = StatsFetcher::new(VkAds::new(vk.clone(), 1, None), VkAudio::new(vk));
        let ads: BTreeMap<i64, String> =
            [(11, "https://vk.com/music/album/-20_1".to_string())].into_iter().collect();

        let snapshot = fetcher.fetch(&ads, 500).await.unwrap();

        let stat = &snapshot.stats[&11];
        assert_eq!(stat.spent, 40.0);
        assert_eq!(stat.listens, 4);
        assert_eq!(stat.cpm, 20.0);
        let statuses = snapshot.statuses.unwrap();
        assert_eq!(statuses[&11].status, RunStatus::Running);
        assert_eq!(statuses[&11].approved, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn failed_status_lookup_keeps_the_stats() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/audio.getPlaylists"))
            .respond_with(ok(json!({"items": []})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ads.getStatistics"))
            .respond_with(ok(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ads.getAds"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error": {"error_code": 603, "error_msg": "campaign not found"}
            })))
            .mount(&server)
            .await;

        let vk = testing::client(&server.uri());
        let fetcher = StatsFetcher::new(VkAds::new(vk.clone(), 1, None), VkAudio::new(vk));
        let ads: BTreeMap<i64, String> =
            [(11, "https://vk.com/music/album/-20_1".to_string())].into_iter().collect();

        let snapshot = fetcher.fetch(&ads, 500).await.unwrap();
        assert_eq!(snapshot.stats[&11], AdStat::default());
        assert!(snapshot.statuses.is_none());
    }

    #[tokio::test]
    async fn failed_statistics_is_no_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/audio.getPlaylists"))
            .respond_with(ok(json!({"items": []})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ads.getStatistics"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let vk = testing::client(&server.uri());
        let fetcher = StatsFetcher::new(VkAds::new(vk.clone(), 1, None), VkAudio::new(vk));
        let ads: BTreeMap<i64, String> =
            [(11, "https://vk.com/music/album/-20_1".to_string())].into_iter().collect();

        assert!(fetcher.fetch(&ads, 500).await.is_err());
    }
}
