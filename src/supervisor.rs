use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use thiserror::Error;

use crate::db::DatabaseError;
use crate::store::CampaignStore;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Failed to spawn automation process: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Command line of one `automate` process.
#[derive(Debug, Clone, PartialEq)]
pub struct AutomateArgs {
    pub campaign_id: i32,
    pub target_cost: f64,
    pub start_tomorrow: bool,
    pub finish_tomorrow: bool,
    pub restart: bool,
    pub speed_coef: Option<f64>,
}

impl AutomateArgs {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "automate".to_string(),
            "--campaign-id".to_string(),
            self.campaign_id.to_string(),
            "--target-cost".to_string(),
            self.target_cost.to_string(),
        ];
        if self.start_tomorrow {
            args.push("--start-tomorrow".to_string());
        }
        if self.finish_tomorrow {
            args.push("--finish-tomorrow".to_string());
        }
        if self.restart {
            args.push("--restart".to_string());
        }
        if let Some(coef) = self.speed_coef {
            args.push("--speed-coef".to_string());
            args.push(coef.to_string());
        }
        args
    }
}

/// Starts automation processes that outlive the caller.
pub trait ProcessLauncher: Send + Sync {
    /// Returns the pid of the spawned process.
    fn launch(&self, args: &AutomateArgs) -> Result<u32, SupervisorError>;
}

/// Re-executes the current binary in its own process group with no stdio,
/// so the child survives the caller's exit and terminal hangups.
pub struct DetachedProcessLauncher {
    program: PathBuf,
}

impl DetachedProcessLauncher {
    pub fn current() -> Result<Self, SupervisorError> {
        Ok(Self {
            program: std::env::current_exe()?,
        })
    }
}

impl ProcessLauncher for DetachedProcessLauncher {
    fn launch(&self, args: &AutomateArgs) -> Result<u32, SupervisorError> {
        let child = Command::new(&self.program)
            .args(args.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()?;
        tracing::info!(
            campaign_id = args.campaign_id,
            pid = child.id(),
            restart = args.restart,
            "automation process spawned"
        );
        Ok(child.id())
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct RestartReport {
    /// `(campaign id, pid)`
    pub launched: Vec<(i32, u32)>,
    /// Campaigns flagged as automated without any settings row.
    pub missing_settings: Vec<i32>,
    pub failed: Vec<(i32, String)>,
}

/// Relaunches automation for every campaign still flagged as automated,
/// using each campaign's most recent settings.
pub async fn restart_all(
    store: &dyn CampaignStore,
    launcher: &dyn ProcessLauncher,
) -> Result<RestartReport, SupervisorError> {
    let campaigns = store.automated_campaigns().await?;
    tracing::info!(count = campaigns.len(), "restarting automated campaigns");

    let mut report = RestartReport::default();
    for campaign in campaigns {
        let settings = match store.latest_automation_settings(campaign.id).await {
            Ok(settings) => settings,
            Err(DatabaseError::NotFound { .. }) => {
                tracing::error!(campaign_id = campaign.id, "no automation settings to restart from");
                report.missing_settings.push(campaign.id);
                continue;
            }
            Err(e) => {
                tracing::error!(campaign_id = campaign.id, error = %e, "settings lookup failed");
                report.failed.push((campaign.id, e.to_string()));
                continue;
            }
        };

        let args = AutomateArgs {
            campaign_id: campaign.id,
            target_cost: settings.target_cost,
            start_tomorrow: settings.start_tomorrow,
            finish_tomorrow: settings.finish_tomorrow,
            restart: true,
            speed_coef: settings.speed_coef,
        };
        match launcher.launch(&args) {
            Ok(pid) => report.launched.push((campaign.id, pid)),
            Err(e) => {
                tracing::error!(campaign_id = campaign.id, error = %e, "relaunch failed");
                report.failed.push((campaign.id, e.to_string()));
            }
        }
    }
    Ok(report)
}
