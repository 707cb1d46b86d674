use async_trait::async_trait;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use postgres_openssl::MakeTlsConnector;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_postgres::{Client, Config, Row};
use uuid::Uuid;

use crate::models::{
    Ad, AdState, AgeDisclaimer, ApprovalStatus, AutomationSettings, Campaign, CampaignSettings,
    Metrics, NewCampaign, RunStatus, SexFilter, User, split_musician_names,
};
use crate::store::CampaignStore;

const SCHEMA: &str = include_str!("../schema.sql");

const CAMPAIGN_COLUMNS: &str = "id, owner_id, cabinet_vk_id, client_vk_id, campaign_vk_id, \
     campaign_name, campaign_budget, release_artist, release_title, release_cover_url, \
     artist_group_id, playlists_group_id, spent, reach, cpm, clicks, subscribes, listens, cpl, \
     automate, automation_owner, create_datetime, updated_at";

const AD_COLUMNS: &str = "id, campaign_id, campaign_name, campaign_vk_id, ad_name, ad_vk_id, \
     playlist_url, spent, reach, cpm, clicks, subscribes, listens, cpl, status, approved";

const SETTINGS_COLUMNS: &str =
    "id, campaign_id, target_cost, speed_coef, start_tomorrow, finish_tomorrow, created_at";

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] tokio_postgres::Error),
    #[error("SSL error: {0}")]
    SslError(#[from] openssl::error::ErrorStack),
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i32 },
}

pub struct Database {
    client: Mutex<Client>,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, DatabaseError> {
        // Configure SSL
        let mut builder = SslConnector::builder(SslMethod::tls())?;
        builder.set_verify(SslVerifyMode::NONE);
        let connector = MakeTlsConnector::new(builder.build());

        // Parse the connection config from URL
        let mut config = Config::from_str(database_url)
            .map_err(|e| DatabaseError::InvalidConnectionString(e.to_string()))?;

        let (client, connection) = config
            .connect_timeout(std::time::Duration::from_secs(5))
            .connect(connector)
            .await
            .map_err(DatabaseError::ConnectionError)?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "database connection error");
            }
        });

        Ok(Self {
            client: Mutex::new(client),
        })
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        self.client.lock().await.batch_execute(SCHEMA).await?;
        Ok(())
    }
}

fn metrics_from_row(row: &Row) -> Metrics {
    Metrics {
        spent: row.get("spent"),
        reach: row.get("reach"),
        cpm: row.get("cpm"),
        clicks: row.get("clicks"),
        subscribes: row.get("subscribes"),
        listens: row.get("listens"),
        cpl: row.get("cpl"),
    }
}

fn campaign_from_row(row: &Row) -> Campaign {
    Campaign {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        cabinet_vk_id: row.get("cabinet_vk_id"),
        client_vk_id: row.get("client_vk_id"),
        campaign_vk_id: row.get("campaign_vk_id"),
        campaign_name: row.get("campaign_name"),
        campaign_budget: row.get("campaign_budget"),
        release_artist: row.get("release_artist"),
        release_title: row.get("release_title"),
        release_cover_url: row.get("release_cover_url"),
        artist_group_id: row.get("artist_group_id"),
        playlists_group_id: row.get("playlists_group_id"),
        metrics: metrics_from_row(row),
        automate: row.get("automate"),
        automation_owner: row.get("automation_owner"),
        create_datetime: row.get("create_datetime"),
        updated_at: row.get("updated_at"),
    }
}

fn ad_from_row(row: &Row) -> Ad {
    Ad {
        id: row.get("id"),
        campaign_id: row.get("campaign_id"),
        campaign_name: row.get("campaign_name"),
        campaign_vk_id: row.get("campaign_vk_id"),
        ad_name: row.get("ad_name"),
        ad_vk_id: row.get("ad_vk_id"),
        playlist_url: row.get("playlist_url"),
        metrics: metrics_from_row(row),
        state: AdState {
            status: RunStatus::from_code(i64::from(row.get::<_, i32>("status"))),
            approved: ApprovalStatus::from_code(i64::from(row.get::<_, i32>("approved"))),
        },
    }
}

fn settings_from_row(row: &Row) -> AutomationSettings {
    AutomationSettings {
        id: row.get("id"),
        campaign_id: row.get("campaign_id"),
        target_cost: row.get("target_cost"),
        speed_coef: row.get("speed_coef"),
        start_tomorrow: row.get("start_tomorrow"),
        finish_tomorrow: row.get("finish_tomorrow"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl CampaignStore for Database {
    async fn campaign(&self, id: i32) -> Result<Campaign, DatabaseError> {
        let query = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1");
        let row = self.client.lock().await.query_opt(&query, &[&id]).await?;
        row.as_ref()
            .map(campaign_from_row)
            .ok_or(DatabaseError::NotFound {
                entity: "campaign",
                id,
            })
    }

    async fn user(&self, id: i32) -> Result<User, DatabaseError> {
        let row = self
            .client
            .lock()
            .await
            .query_opt(
                "SELECT id, vk_user_id, vk_token FROM users WHERE id = $1",
                &[&id],
            )
            .await?;

        row.map(|row| User {
            id: row.get(0),
            vk_user_id: row.get(1),
            vk_token: row.get(2),
        })
        .ok_or(DatabaseError::NotFound { entity: "user", id })
    }

    async fn campaign_ads(&self, campaign: &Campaign) -> Result<Vec<Ad>, DatabaseError> {
        let query = format!("SELECT {AD_COLUMNS} FROM ads WHERE campaign_vk_id = $1 ORDER BY id");
        let rows = self
            .client
            .lock()
            .await
            .query(&query, &[&campaign.campaign_vk_id])
            .await?;

        Ok(rows.iter().map(ad_from_row).collect())
    }

    async fn claim_automation(&self, campaign_id: i32, owner: Uuid) -> Result<(), DatabaseError> {
        let updated = self
            .client
            .lock()
            .await
            .execute(
                "UPDATE campaigns SET automate = TRUE, automation_owner = $2, updated_at = NOW()
                 WHERE id = $1",
                &[&campaign_id, &owner],
            )
            .await?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "campaign",
                id: campaign_id,
            });
        }
        Ok(())
    }

    async fn set_automate(&self, campaign_id: i32, automate: bool) -> Result<(), DatabaseError> {
        let updated = self
            .client
            .lock()
            .await
            .execute(
                "UPDATE campaigns SET automate = $2, updated_at = NOW() WHERE id = $1",
                &[&campaign_id, &automate],
            )
            .await?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "campaign",
                id: campaign_id,
            });
        }
        Ok(())
    }

    async fn release_automation(
        &self,
        campaign_id: i32,
        owner: Uuid,
    ) -> Result<bool, DatabaseError> {
        let updated = self
            .client
            .lock()
            .await
            .execute(
                "UPDATE campaigns SET automate = FALSE, updated_at = NOW()
                 WHERE id = $1 AND automation_owner = $2",
                &[&campaign_id, &owner],
            )
            .await?;

        Ok(updated > 0)
    }

    async fn update_campaign_metrics(
        &self,
        campaign_id: i32,
        metrics: &Metrics,
    ) -> Result<(), DatabaseError> {
        self.client
            .lock()
            .await
            .execute(
                "UPDATE campaigns
                 SET spent = $2, reach = $3, cpm = $4, clicks = $5, subscribes = $6,
                     listens = $7, cpl = $8, updated_at = NOW()
                 WHERE id = $1",
                &[
                    &campaign_id,
                    &metrics.spent,
                    &metrics.reach,
                    &metrics.cpm,
                    &metrics.clicks,
                    &metrics.subscribes,
                    &metrics.listens,
                    &metrics.cpl,
                ],
            )
            .await?;

        Ok(())
    }

    async fn bulk_update_ads(&self, ads: &[Ad]) -> Result<(), DatabaseError> {
        if ads.is_empty() {
            return Ok(());
        }

        let ids: Vec<i32> = ads.iter().map(|ad| ad.id).collect();
        let spent: Vec<f64> = ads.iter().map(|ad| ad.metrics.spent).collect();
        let reach: Vec<i64> = ads.iter().map(|ad| ad.metrics.reach).collect();
        let cpm: Vec<f64> = ads.iter().map(|ad| ad.metrics.cpm).collect();
        let clicks: Vec<i64> = ads.iter().map(|ad| ad.metrics.clicks).collect();
        let subscribes: Vec<i64> = ads.iter().map(|ad| ad.metrics.subscribes).collect();
        let listens: Vec<i64> = ads.iter().map(|ad| ad.metrics.listens).collect();
        let cpl: Vec<f64> = ads.iter().map(|ad| ad.metrics.cpl).collect();
        let status: Vec<i32> = ads.iter().map(|ad| ad.state.status.code()).collect();
        let approved: Vec<i32> = ads.iter().map(|ad| ad.state.approved.code()).collect();

        self.client
            .lock()
            .await
            .execute(
                "UPDATE ads AS a
                 SET spent = u.spent, reach = u.reach, cpm = u.cpm, clicks = u.clicks,
                     subscribes = u.subscribes, listens = u.listens, cpl = u.cpl,
                     status = u.status, approved = u.approved
                 FROM UNNEST($1::int4[], $2::float8[], $3::int8[], $4::float8[], $5::int8[],
                             $6::int8[], $7::int8[], $8::float8[], $9::int4[], $10::int4[])
                      AS u(id, spent, reach, cpm, clicks, subscribes, listens, cpl, status, approved)
                 WHERE a.id = u.id",
                &[
                    &ids,
                    &spent,
                    &reach,
                    &cpm,
                    &clicks,
                    &subscribes,
                    &listens,
                    &cpl,
                    &status,
                    &approved,
                ],
            )
            .await?;

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
        let query = format!(
            "INSERT INTO automation_settings
                 (campaign_id, target_cost, speed_coef, start_tomorrow, finish_tomorrow)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {SETTINGS_COLUMNS}"
        );
        let row = self
            .client
            .lock()
            .await
            .query_one(
                &query,
                &[
                    &campaign_id,
                    &target_cost,
                    &speed_coef,
                    &start_tomorrow,
                    &finish_tomorrow,
                ],
            )
            .await?;

        Ok(settings_from_row(&row))
    }

    async fn latest_automation_settings(
        &self,
        campaign_id: i32,
    ) -> Result<AutomationSettings, DatabaseError> {
        let query = format!(
            "SELECT {SETTINGS_COLUMNS} FROM automation_settings
             WHERE campaign_id = $1
             ORDER BY created_at DESC, id DESC
             LIMIT 1"
        );
        let row = self
            .client
            .lock()
            .await
            .query_opt(&query, &[&campaign_id])
            .await?;

        row.as_ref()
            .map(settings_from_row)
            .ok_or(DatabaseError::NotFound {
                entity: "automation settings for campaign",
                id: campaign_id,
            })
    }

    async fn automated_campaigns(&self) -> Result<Vec<Campaign>, DatabaseError> {
        let query =
            format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE automate = TRUE ORDER BY id");
        let rows = self.client.lock().await.query(&query, &[]).await?;
        Ok(rows.iter().map(campaign_from_row).collect())
    }

    async fn campaign_settings(&self, id: i32) -> Result<CampaignSettings, DatabaseError> {
        let row = self
            .client
            .lock()
            .await
            .query_opt(
                "SELECT id, owner_id, cabinet_vk_id, client_vk_id, release_url, post_text, group_id,
                        budget, musician_names, sex_filter, age_disclaimer, age_from, age_to,
                        find_related_artists
                 FROM campaign_settings WHERE id = $1",
                &[&id],
            )
            .await?;

        let row = row.ok_or(DatabaseError::NotFound {
            entity: "campaign settings",
            id,
        })?;

        Ok(CampaignSettings {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            cabinet_vk_id: row.get("cabinet_vk_id"),
            // Zero means "no agency client" in stored settings.
            client_vk_id: row
                .get::<_, Option<i64>>("client_vk_id")
                .filter(|id| *id != 0),
            release_url: row.get("release_url"),
            post_text: row.get("post_text"),
            artist_group_id: row.get("group_id"),
            budget: row.get("budget"),
            musician_names: split_musician_names(row.get::<_, &str>("musician_names")),
            sex_filter: SexFilter::from_settings_code(row.get("sex_filter")),
            age_disclaimer: AgeDisclaimer::from_code(row.get("age_disclaimer")),
            age_from: i64::from(row.get::<_, i32>("age_from")),
            age_to: i64::from(row.get::<_, i32>("age_to")),
            find_related_artists: row.get("find_related_artists"),
        })
    }

    async fn insert_campaign(&self, new: &NewCampaign) -> Result<Campaign, DatabaseError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        let query = format!(
            "INSERT INTO campaigns (owner_id, cabinet_vk_id, client_vk_id, campaign_vk_id,
                 campaign_name, campaign_budget, release_artist, release_title, release_cover_url,
                 artist_group_id, playlists_group_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             RETURNING {CAMPAIGN_COLUMNS}"
        );
        let row = tx
            .query_one(
                &query,
                &[
                    &new.owner_id,
                    &new.cabinet_vk_id,
                    &new.client_vk_id,
                    &new.campaign_vk_id,
                    &new.campaign_name,
                    &new.campaign_budget,
                    &new.release_artist,
                    &new.release_title,
                    &new.release_cover_url,
                    &new.artist_group_id,
                    &new.playlists_group_id,
                ],
            )
            .await?;
        let campaign = campaign_from_row(&row);

        let insert_ad = tx
            .prepare(
                "INSERT INTO ads (campaign_id, campaign_name, campaign_vk_id, ad_name, ad_vk_id,
                     playlist_url)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .await?;
        for ad in &new.ads {
            tx.execute(
                &insert_ad,
                &[
                    &campaign.id,
                    &campaign.campaign_name,
                    &campaign.campaign_vk_id,
                    &ad.ad_name,
                    &ad.ad_vk_id,
                    &ad.playlist_url,
                ],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(campaign)
    }
}
