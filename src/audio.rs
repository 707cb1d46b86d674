use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::constants::{EXECUTE_BATCH, PLAYLISTS_PAGE_SIZE};
use crate::vk::{lenient_i64, playlist_url, PlaylistRef, VkClient, VkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseKind {
    Single,
    Album,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub number: usize,
    pub artist: String,
    pub title: String,
    pub owner_id: i64,
    pub audio_id: i64,
    pub access_key: Option<String>,
    pub url: Option<String>,
    pub is_explicit: bool,
}

/// A released playlist with everything needed to copy and advertise it.
#[derive(Debug, Clone, PartialEq)]
pub struct Release {
    pub kind: ReleaseKind,
    pub artist_name: String,
    /// Artist name to artist page domain, across all tracks.
    pub artist_domains: BTreeMap<String, String>,
    pub title: String,
    pub is_explicit: bool,
    pub cover_url: String,
    pub tracks_count: i64,
    pub tracks: Vec<Track>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistStat {
    pub title: String,
    pub listens: i64,
    pub followers: i64,
}

#[derive(Debug, Deserialize)]
struct ArtistRef {
    name: String,
    #[serde(default)]
    domain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Photo {
    #[serde(default)]
    photo_1200: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistObject {
    title: String,
    #[serde(default)]
    subtitle: Option<String>,
    #[serde(default)]
    count: i64,
    #[serde(default)]
    is_explicit: bool,
    #[serde(default)]
    photo: Option<Photo>,
    #[serde(default)]
    main_artists: Vec<ArtistRef>,
    #[serde(default)]
    featured_artists: Vec<ArtistRef>,
}

#[derive(Debug, Deserialize)]
struct AudioObject {
    id: i64,
    owner_id: i64,
    artist: String,
    title: String,
    #[serde(default)]
    subtitle: Option<String>,
    #[serde(default)]
    access_key: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    is_explicit: bool,
    #[serde(default)]
    main_artists: Vec<ArtistRef>,
    #[serde(default)]
    featured_artists: Vec<ArtistRef>,
}

#[derive(Debug, Deserialize)]
struct AudioPage {
    #[serde(default)]
    items: Vec<AudioObject>,
}

#[derive(Debug, Deserialize)]
struct PlaylistsPage {
    #[serde(default)]
    items: Vec<Value>,
    #[serde(default)]
    next_from: Option<String>,
}

fn full_title(title: &str, subtitle: Option<&str>) -> String {
    match subtitle.filter(|s| !s.is_empty()) {
        Some(subtitle) => format!("{title} ({subtitle})"),
        None => title.to_string(),
    }
}

fn join_names(artists: &[ArtistRef]) -> String {
    artists
        .iter()
        .map(|a| a.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Release {
    fn from_api(playlist: PlaylistObject, audios: AudioPage) -> Self {
        let mut artist_name = join_names(&playlist.main_artists);
        if !playlist.featured_artists.is_empty() {
            artist_name.push_str(" feat. ");
            artist_name.push_str(&join_names(&playlist.featured_artists));
        }

        let mut artist_domains = BTreeMap::new();
        for audio in &audios.items {
            for artist in audio.main_artists.iter().chain(&audio.featured_artists) {
                if let Some(domain) = &artist.domain {
                    artist_domains.insert(artist.name.clone(), domain.clone());
                }
            }
        }

        let tracks = audios
            .items
            .into_iter()
            .enumerate()
            .map(|(n, audio)| Track {
                number: n + 1,
                title: full_title(&audio.title, audio.subtitle.as_deref()),
                artist: audio.artist,
                owner_id: audio.owner_id,
                audio_id: audio.id,
                access_key: audio.access_key,
                url: audio.url,
                is_explicit: audio.is_explicit,
            })
            .collect();

        Self {
            kind: if playlist.count == 1 {
                ReleaseKind::Single
            } else {
                ReleaseKind::Album
            },
            artist_name,
            artist_domains,
            title: full_title(&playlist.title, playlist.subtitle.as_deref()),
            is_explicit: playlist.is_explicit,
            cover_url: playlist
                .photo
                .and_then(|p| p.photo_1200)
                .unwrap_or_default(),
            tracks_count: playlist.count,
            tracks,
        }
    }
}

/// `execute` code creating `count` empty playlists in a group.
fn create_playlists_code(count: usize, group_id: i64, title: &str) -> String {
    let title: String = title
        .chars()
        .filter(|c| !matches!(c, '#' | '&' | '"' | '\\'))
        .collect();
    let calls = vec![
        format!("API.audio.createPlaylist({{owner_id: -{group_id}, title: \"{title}\"}})");
        count
    ];
    format!("return [{}];", calls.join(", "))
}

/// Audio and playlist side of the VK API.
#[derive(Clone)]
pub struct VkAudio {
    vk: VkClient,
}

impl VkAudio {
    pub fn new(vk: VkClient) -> Self {
        Self { vk }
    }

    fn playlist_params(playlist: &PlaylistRef) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("owner_id", playlist.owner_id.to_string()),
            ("playlist_id", playlist.playlist_id.to_string()),
        ];
        if let Some(key) = &playlist.access_key {
            params.push(("access_key", key.clone()));
        }
        params
    }

    pub async fn parse_release(&self, release_url: &str) -> Result<Release, VkError> {
        let playlist_ref = PlaylistRef::parse(release_url)?;
        let params = Self::playlist_params(&playlist_ref);

        let playlist: PlaylistObject = self.vk.call_as("audio.getPlaylistById", &params).await?;
        let audios: AudioPage = self.vk.call_as("audio.get", &params).await?;

        Ok(Release::from_api(playlist, audios))
    }

    /// Listens and followers of every playlist owned by a group, keyed by
    /// canonical playlist URL.
    pub async fn group_playlists_stat(
        &self,
        group_id: i64,
    ) -> Result<BTreeMap<String, PlaylistStat>, VkError> {
        let mut stats = BTreeMap::new();
        let mut start_from: Option<String> = None;

        loop {
            let mut params = vec![
                ("owner_id", (-group_id).to_string()),
                ("count", PLAYLISTS_PAGE_SIZE.to_string()),
            ];
            if let Some(cursor) = &start_from {
                params.push(("start_from", cursor.clone()));
            }

            let page: PlaylistsPage = self.vk.call_as("audio.getPlaylists", &params).await?;
            for item in &page.items {
                let (Some(owner_id), Some(id)) = (lenient_i64(&item["owner_id"]), lenient_i64(&item["id"]))
                else {
                    continue;
                };
                stats.insert(
                    playlist_url(owner_id, id),
                    PlaylistStat {
                        title: item["title"].as_str().unwrap_or_default().to_string(),
                        listens: lenient_i64(&item["plays"]).unwrap_or(0),
                        followers: lenient_i64(&item["followers"]).unwrap_or(0),
                    },
                );
            }

            match page.next_from.filter(|next| !next.is_empty()) {
                Some(next) if start_from.as_deref() != Some(next.as_str()) => {
                    start_from = Some(next);
                }
                _ => break,
            }
        }

        Ok(stats)
    }

    /// Creates a public group with audio enabled and the creator hidden from
    /// its contacts.
    pub async fn create_group(&self, name: &str) -> Result<i64, VkError> {
        let created = self
            .vk
            .call(
                "groups.create",
                &[
                    ("title", name.to_string()),
                    ("type", "public".to_string()),
                    ("public_category", "1002".to_string()),
                    ("subtype", "3".to_string()),
                ],
            )
            .await?;
        let group_id = lenient_i64(&created["id"])
            .ok_or_else(|| VkError::invalid("groups.create", "missing id"))?;

        self.vk
            .call(
                "groups.edit",
                &[("group_id", group_id.to_string()), ("audio", "1".to_string())],
            )
            .await?;

        let profile = self.vk.call("account.getProfileInfo", &[]).await?;
        let user_id = lenient_i64(&profile["id"])
            .ok_or_else(|| VkError::invalid("account.getProfileInfo", "missing id"))?;

        self.vk
            .call(
                "groups.editManager",
                &[
                    ("group_id", group_id.to_string()),
                    ("user_id", user_id.to_string()),
                    ("is_contact", "0".to_string()),
                ],
            )
            .await?;

        Ok(group_id)
    }

    async fn add_tracks_to_group(&self, group_id: i64, tracks: &[Track]) -> Result<Vec<i64>, VkError> {
        let mut audio_ids = Vec::with_capacity(tracks.len());
        for track in tracks {
            let added = self
                .vk
                .call(
                    "audio.add",
                    &[
                        ("owner_id", track.owner_id.to_string()),
                        ("audio_id", track.audio_id.to_string()),
                        ("group_id", group_id.to_string()),
                    ],
                )
                .await?;
            let id = lenient_i64(&added).ok_or_else(|| VkError::invalid("audio.add", "missing id"))?;
            audio_ids.push(id);
        }
        Ok(audio_ids)
    }

    async fn create_empty_playlists(
        &self,
        count: usize,
        group_id: i64,
        title: &str,
    ) -> Result<Vec<i64>, VkError> {
        let mut ids = Vec::with_capacity(count);
        let mut remaining = count;
        while remaining > 0 {
            let batch = remaining.min(EXECUTE_BATCH);
            let code = create_playlists_code(batch, group_id, title);
            let created = self.vk.call("execute", &[("code", code)]).await?;
            let items = created
                .as_array()
                .ok_or_else(|| VkError::invalid("execute", "expected an array"))?;
            for item in items {
                let id = lenient_i64(&item["id"])
                    .ok_or_else(|| VkError::invalid("execute", "playlist without id"))?;
                ids.push(id);
            }
            remaining -= batch;
        }
        Ok(ids)
    }

    /// Copies the release into `count` fresh playlists of a new group and
    /// returns their URLs.
    pub async fn replicate_release(
        &self,
        release: &Release,
        count: usize,
    ) -> Result<Vec<String>, VkError> {
        let group_id = self.create_group(&release.artist_name).await?;
        tracing::info!(group_id, count, "replicating release");

        let mut audio_ids = self.add_tracks_to_group(group_id, &release.tracks).await?;
        audio_ids.reverse();
        let audios = audio_ids
            .iter()
            .map(|id| format!("-{group_id}_{id}"))
            .collect::<Vec<_>>()
            .join(",");

        let playlist_ids = self
            .create_empty_playlists(count, group_id, &release.title)
            .await?;

        let mut urls = Vec::with_capacity(playlist_ids.len());
        for playlist_id in playlist_ids {
            self.vk
                .call(
                    "audio.addToPlaylist",
                    &[
                        ("owner_id", (-group_id).to_string()),
                        ("playlist_id", playlist_id.to_string()),
                        ("audio_ids", audios.clone()),
                    ],
                )
                .await?;
            urls.push(playlist_url(-group_id, playlist_id));
        }
        Ok(urls)
    }
}
