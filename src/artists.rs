use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};

use crate::constants::RELATED_ARTISTS_CAP;
use crate::vk::{lenient_i64, VkClient, VkError};

/// Release entry of an artist card, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct CardRelease {
    pub plays: i64,
    pub create_time: i64,
}

/// Artist card as shown in the music catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtistCard {
    pub name: String,
    pub url: String,
    /// `(name, card url)` from the card's related-artists block.
    pub related: Vec<(String, String)>,
    /// `(name, artist id)` of artists featured on the card's tracks.
    pub featured: Vec<(String, String)>,
    pub releases: Vec<CardRelease>,
}

#[async_trait]
pub trait ArtistCatalog: Send + Sync {
    /// Card id for an artist page URL or catalog artist id, `None` when the
    /// artist has no card.
    async fn card_id(&self, artist: &str) -> Result<Option<String>, VkError>;

    async fn card(&self, card_id: &str) -> Result<Option<ArtistCard>, VkError>;
}

/// Optional engagement gates an artist must pass to be targeted.
#[derive(Debug, Clone)]
pub struct EngagementFilter {
    /// Minimum average plays over the last `last_releases` releases.
    pub listens_threshold: Option<i64>,
    pub last_releases: usize,
    pub max_days_since_release: Option<i64>,
}

impl Default for EngagementFilter {
    fn default() -> Self {
        Self {
            listens_threshold: None,
            last_releases: 3,
            max_days_since_release: None,
        }
    }
}

impl EngagementFilter {
    pub fn passes(&self, card: &ArtistCard, now: DateTime<Utc>) -> bool {
        if let Some(threshold) = self.listens_threshold {
            let recent: Vec<i64> = card
                .releases
                .iter()
                .take(self.last_releases.max(1))
                .map(|r| r.plays)
                .collect();
            if recent.is_empty() {
                return false;
            }
            let average = recent.iter().sum::<i64>() as f64 / recent.len() as f64;
            if average <= threshold as f64 {
                return false;
            }
        }
        if let Some(max_days) = self.max_days_since_release {
            let Some(latest) = card.releases.first() else {
                return false;
            };
            let Some(released) = DateTime::from_timestamp(latest.create_time, 0) else {
                return false;
            };
            if (now - released).num_days() > max_days {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub max_depth: usize,
    pub cap: usize,
    pub include_featured: bool,
    pub filter: EngagementFilter,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            max_depth: 1,
            cap: RELATED_ARTISTS_CAP,
            include_featured: false,
            filter: EngagementFilter::default(),
        }
    }
}

/// Breadth-first walk over related-artist cards starting from `seeds`
/// (artist page URLs or ids). Returns the names of artists whose cards were
/// reached within `max_depth` hops and passed the filter, at most `cap`.
/// Lookups that fail are logged and skipped.
pub async fn related_artists(
    catalog: &dyn ArtistCatalog,
    seeds: &[String],
    options: &CrawlOptions,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let mut seen_names: HashSet<String> = HashSet::new();
    let mut queued: HashSet<String> = HashSet::new();
    let mut frontier: VecDeque<(String, usize)> = VecDeque::new();

    for seed in seeds {
        if queued.insert(seed.clone()) {
            frontier.push_back((seed.clone(), 0));
        }
    }

    while let Some((artist, depth)) = frontier.pop_front() {
        if found.len() >= options.cap {
            break;
        }

        let card = match lookup(catalog, &artist).await {
            Ok(Some(card)) => card,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(artist = %artist, error = %e, "artist card lookup failed");
                continue;
            }
        };

        if !seen_names.insert(card.name.clone()) {
            continue;
        }
        if options.filter.passes(&card, now) {
            found.push(card.name.clone());
        }

        if depth >= options.max_depth {
            continue;
        }
        let featured = options
            .include_featured
            .then_some(card.featured.iter())
            .into_iter()
            .flatten();
        for (name, reference) in card.related.iter().chain(featured) {
            if seen_names.contains(name) || !queued.insert(reference.clone()) {
                continue;
            }
            frontier.push_back((reference.clone(), depth + 1));
        }
    }

    found.truncate(options.cap);
    found
}

async fn lookup(catalog: &dyn ArtistCatalog, artist: &str) -> Result<Option<ArtistCard>, VkError> {
    match catalog.card_id(artist).await? {
        Some(card_id) => catalog.card(&card_id).await,
        None => Ok(None),
    }
}

/// Music catalog backed by the VK `catalog.*` methods.
pub struct VkCatalog {
    vk: VkClient,
}

impl VkCatalog {
    pub fn new(vk: VkClient) -> Self {
        Self { vk }
    }

    async fn related_block(&self, block_id: &str) -> Result<Vec<(String, String)>, VkError> {
        let mut related = Vec::new();
        let mut start_from: Option<String> = None;

        loop {
            let mut params = vec![("block_id", block_id.to_string())];
            if let Some(cursor) = &start_from {
                params.push(("start_from", cursor.clone()));
            }

            let page = match self.vk.call("catalog.getBlockItems", &params).await {
                Ok(page) => page,
                // Later pages may come back as an error once the block is exhausted.
                Err(_) if start_from.is_some() => break,
                Err(e) => return Err(e),
            };

            for link in page["links"].as_array().into_iter().flatten() {
                if let (Some(title), Some(url)) = (link["title"].as_str(), link["url"].as_str()) {
                    related.push((title.to_string(), url.to_string()));
                }
            }

            match page["block"]["next_from"].as_str().filter(|n| !n.is_empty()) {
                Some(next) if start_from.as_deref() != Some(next) => {
                    start_from = Some(next.to_string());
                }
                _ => break,
            }
        }
        Ok(related)
    }
}

fn featured_artists(audios: &Value, card_name: &str) -> Vec<(String, String)> {
    let mut featured: Vec<(String, String)> = Vec::new();
    for audio in audios.as_array().into_iter().flatten() {
        let artists = audio["main_artists"]
            .as_array()
            .into_iter()
            .flatten()
            .chain(audio["featured_artists"].as_array().into_iter().flatten());
        for artist in artists {
            let (Some(name), Some(id)) = (artist["name"].as_str(), artist["id"].as_str()) else {
                continue;
            };
            if name != card_name && !featured.iter().any(|(n, _)| n == name) {
                featured.push((name.to_string(), id.to_string()));
            }
        }
    }
    featured
}

#[async_trait]
impl ArtistCatalog for VkCatalog {
    async fn card_id(&self, artist: &str) -> Result<Option<String>, VkError> {
        let key = if artist.contains("vk.com") {
            "url"
        } else {
            "artist_id"
        };
        let response = self
            .vk
            .call("catalog.getAudioArtist", &[(key, artist.to_string())])
            .await?;

        let section = &response["catalog"]["sections"][0];
        if section["title"]
            .as_str()
            .is_some_and(|title| title.contains("{artist_name}"))
        {
            return Ok(None);
        }
        Ok(section["id"].as_str().map(str::to_string))
    }

    async fn card(&self, card_id: &str) -> Result<Option<ArtistCard>, VkError> {
        let response = self
            .vk
            .call("catalog.getSection", &[("section_id", card_id.to_string())])
            .await?;

        let Some(name) = response["artists"][0]["name"].as_str() else {
            return Ok(None);
        };
        let url = response["section"]["url"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let related_block = response["section"]["blocks"]
            .as_array()
            .into_iter()
            .flatten()
            .filter(|block| {
                block["url"]
                    .as_str()
                    .is_some_and(|url| url.contains("related"))
            })
            .filter_map(|block| block["id"].as_str())
            .last();
        let related = match related_block {
            Some(block_id) => self.related_block(block_id).await?,
            None => Vec::new(),
        };

        let releases = response["playlists"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|p| CardRelease {
                plays: lenient_i64(&p["plays"]).unwrap_or(0),
                create_time: lenient_i64(&p["create_time"]).unwrap_or(0),
            })
            .collect();

        Ok(Some(ArtistCard {
            name: name.to_string(),
            url,
            related,
            featured: featured_artists(&response["audios"], name),
            releases,
        }))
    }
}
