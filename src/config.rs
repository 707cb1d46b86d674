use dotenv::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::constants::{
    AUTOMATION_CYCLE_SECS, CPM_LOWER_CEILING, CPM_RAISE_CEILING, CPM_STEP, HTTP_TIMEOUT_SECS,
    RATE_LIMIT_RETRIES, RUCAPTCHA_BASE_URL, STOP_COST_MULTIPLIER, VK_API_VERSION, VK_BASE_URL,
    WINDOW_POLL_SECS,
};
use crate::decision::Thresholds;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub vk: VkConfig,
    pub automation: AutomationConfig,
}

/// Settings shared by every client that talks to the VK API.
#[derive(Debug, Clone)]
pub struct VkConfig {
    pub base_url: String,
    pub api_version: String,
    pub proxy: Option<String>,
    pub rucaptcha_key: Option<String>,
    pub rucaptcha_base_url: String,
    pub rate_limit_retries: u32,
    pub http_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AutomationConfig {
    pub cycle_interval: Duration,
    pub window_poll_interval: Duration,
    pub thresholds: Thresholds,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable not found: {0}")]
    MissingEnv(String),
    #[error("Invalid database URL: {0}")]
    InvalidDatabaseUrl(String),
    #[error("Invalid URL in {name}: {reason}")]
    InvalidUrl { name: String, reason: String },
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnv("DATABASE_URL".to_string()))?;

        // Validate the URL format
        Url::parse(&database_url).map_err(|e| ConfigError::InvalidDatabaseUrl(e.to_string()))?;

        let vk = VkConfig {
            base_url: url_or("VK_API_BASE_URL", VK_BASE_URL)?,
            api_version: env::var("VK_API_VERSION").unwrap_or_else(|_| VK_API_VERSION.to_string()),
            proxy: non_empty("VK_PROXY"),
            rucaptcha_key: non_empty("RUCAPTCHA_KEY"),
            rucaptcha_base_url: url_or("RUCAPTCHA_BASE_URL", RUCAPTCHA_BASE_URL)?,
            rate_limit_retries: parse_or("VK_RATE_LIMIT_RETRIES", RATE_LIMIT_RETRIES)?,
            http_timeout: Duration::from_secs(parse_or(
                "VK_HTTP_TIMEOUT_SECS",
                HTTP_TIMEOUT_SECS,
            )?),
        };

        let automation = AutomationConfig {
            cycle_interval: Duration::from_secs(parse_or(
                "AUTOMATION_CYCLE_SECS",
                AUTOMATION_CYCLE_SECS,
            )?),
            window_poll_interval: Duration::from_secs(parse_or(
                "AUTOMATION_WINDOW_POLL_SECS",
                WINDOW_POLL_SECS,
            )?),
            thresholds: Thresholds {
                cpm_raise_ceiling: parse_or("CPM_RAISE_CEILING", CPM_RAISE_CEILING)?,
                cpm_lower_ceiling: parse_or("CPM_LOWER_CEILING", CPM_LOWER_CEILING)?,
                cpm_step: parse_or("CPM_STEP", CPM_STEP)?,
                stop_cost_multiplier: parse_or("STOP_COST_MULTIPLIER", STOP_COST_MULTIPLIER)?,
            },
        };

        Ok(Self {
            database_url,
            vk,
            automation,
        })
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match non_empty(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw,
        }),
    }
}

fn url_or(name: &str, default: &str) -> Result<String, ConfigError> {
    let value = non_empty(name).unwrap_or_else(|| default.to_string());
    Url::parse(&value).map_err(|e| ConfigError::InvalidUrl {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    Ok(value.trim_end_matches('/').to_string())
}
