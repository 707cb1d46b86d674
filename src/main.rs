mod ads;
mod artists;
mod audio;
mod captcha;
mod config;
mod constants;
mod creation;
mod db;
mod decision;
mod models;
mod schedule;
mod stats;
mod store;
mod supervisor;
mod vk;
mod worker;

use anyhow::Context;
use chrono::{Local, Utc};
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::artists::{CrawlOptions, VkCatalog};
use crate::config::Config;
use crate::creation::VkCreationPlatform;
use crate::db::Database;
use crate::schedule::AutomationWindow;
use crate::store::CampaignStore;
use crate::supervisor::{AutomateArgs, DetachedProcessLauncher, ProcessLauncher};
use crate::vk::VkClient;
use crate::worker::{AutomationRunner, RunSettings, VkPlatform};

#[derive(Debug, Parser)]
#[command(name = "vk-autotarget")]
#[command(about = "Automated VK ads campaigns for music releases")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply the database schema
    Migrate,
    /// Run the automation loop of a campaign in the foreground
    Automate(AutomateCmd),
    /// Start automation in a detached process and return
    Launch(AutomateCmd),
    /// Ask the running automation of a campaign to stop
    Stop {
        #[arg(long)]
        campaign_id: i32,
    },
    /// Relaunch automation of every campaign still flagged as automated
    RestartAll,
    /// Build a campaign from a stored campaign settings row
    CreateCampaign {
        #[arg(long)]
        settings_id: i32,
    },
}

#[derive(Debug, Args)]
struct AutomateCmd {
    #[arg(long)]
    campaign_id: i32,
    #[arg(long)]
    target_cost: f64,
    #[arg(long)]
    start_tomorrow: bool,
    #[arg(long)]
    finish_tomorrow: bool,
    /// Reuse the latest automation settings instead of recording new ones
    #[arg(long)]
    restart: bool,
    #[arg(long, value_parser = parse_speed_coef)]
    speed_coef: Option<f64>,
}

impl AutomateCmd {
    fn to_args(&self) -> AutomateArgs {
        AutomateArgs {
            campaign_id: self.campaign_id,
            target_cost: self.target_cost,
            start_tomorrow: self.start_tomorrow,
            finish_tomorrow: self.finish_tomorrow,
            restart: self.restart,
            speed_coef: self.speed_coef,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("loading configuration")?;

    match cli.command {
        Commands::Migrate => {
            connect(&config).await?.migrate().await?;
            tracing::info!("schema applied");
        }
        Commands::Automate(cmd) => automate(&config, connect(&config).await?, cmd).await?,
        Commands::Launch(cmd) => {
            let launcher = DetachedProcessLauncher::current()?;
            let pid = launcher.launch(&cmd.to_args())?;
            println!("automation of campaign {} in progress (pid {pid})", cmd.campaign_id);
        }
        Commands::Stop { campaign_id } => {
            connect(&config).await?.set_automate(campaign_id, false).await?;
            tracing::info!(campaign_id, "automation stop requested");
        }
        Commands::RestartAll => {
            let db = connect(&config).await?;
            let launcher = DetachedProcessLauncher::current()?;
            let report = supervisor::restart_all(db.as_ref(), &launcher).await?;
            tracing::info!(
                launched = report.launched.len(),
                missing_settings = report.missing_settings.len(),
                failed = report.failed.len(),
                "restart finished"
            );
        }
        Commands::CreateCampaign { settings_id } => {
            let db = connect(&config).await?;
            let settings = db.campaign_settings(settings_id).await?;
            let user = db.user(settings.owner_id).await?;
            let vk = VkClient::new(&config.vk, user.vk_token)?;
            let platform = VkCreationPlatform::new(vk.clone(), &settings);
            let catalog = VkCatalog::new(vk);

            let campaign = creation::create_campaign(
                db.as_ref(),
                &platform,
                &catalog,
                &settings,
                &CrawlOptions::default(),
                Utc::now(),
            )
            .await?;
            println!("campaign {} created", campaign.id);
        }
    }

    Ok(())
}

async fn connect(config: &Config) -> anyhow::Result<Arc<Database>> {
    let db = Database::new(&config.database_url)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(db))
}

/// Speed coefficients scale the cost targets and must be positive.
fn parse_speed_coef(raw: &str) -> Result<f64, String> {
    let coef: f64 = raw.parse().map_err(|e| format!("{e}"))?;
    if coef > 0.0 && coef.is_finite() {
        Ok(coef)
    } else {
        Err(format!("speed coefficient must be positive, got {raw}"))
    }
}

async fn automate(config: &Config, db: Arc<Database>, cmd: AutomateCmd) -> anyhow::Result<()> {
    let campaign = db.campaign(cmd.campaign_id).await?;
    if campaign.automate {
        // Tell a loop that is still running for this campaign to stand down.
        db.set_automate(campaign.id, false).await?;
    }

    let settings = if cmd.restart {
        db.latest_automation_settings(campaign.id).await?
    } else {
        db.insert_automation_settings(
            campaign.id,
            cmd.target_cost,
            cmd.speed_coef,
            cmd.start_tomorrow,
            cmd.finish_tomorrow,
        )
        .await?
    };

    let user = db.user(campaign.owner_id).await?;
    let vk = VkClient::new(&config.vk, user.vk_token)?;
    let platform = Arc::new(VkPlatform::new(vk, &campaign));

    let window = AutomationWindow::new(
        Local::now().date_naive(),
        settings.start_tomorrow,
        settings.finish_tomorrow,
    );
    let runner = AutomationRunner::new(
        db,
        platform,
        campaign.id,
        RunSettings {
            target_cost: settings.target_cost,
            speed_coef: settings.speed_coef,
            window,
            thresholds: config.automation.thresholds,
            cycle_interval: config.automation.cycle_interval,
            window_poll_interval: config.automation.window_poll_interval,
        },
    );

    let outcome = runner.run().await?;
    tracing::info!(campaign_id = campaign.id, ?outcome, "automation ended");
    Ok(())
}
