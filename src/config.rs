use anyhow::Result;
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_appconfigdata::Client as AppConfigClient;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{RwLock, watch};

use crate::prober::{DEFAULT_MAX_ATTEMPTS, ProbeSettings};

const DNS_UPSTREAMS: [&str; 3] = ["google", "cloudflare", "quad9"];

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProbeConfig {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_enable_latency_history")]
    pub enable_latency_history: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_dns_upstream")]
    pub dns_upstream: String,
    #[serde(default = "default_dns_timeout_ms")]
    pub dns_timeout_ms: u64,
}

fn default_listen_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    9100
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_enable_latency_history() -> bool {
    false // Default to show current latency only
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_dns_upstream() -> String {
    "google".to_string()
}

fn default_dns_timeout_ms() -> u64 {
    5000
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            metrics_port: default_metrics_port(),
            log_level: default_log_level(),
            enable_latency_history: default_enable_latency_history(),
            max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            dns_upstream: default_dns_upstream(),
            dns_timeout_ms: default_dns_timeout_ms(),
        }
    }
}

impl ProbeConfig {
    /// Get the log level as a tracing::Level
    pub fn get_tracing_level(&self) -> Result<tracing::Level> {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Ok(tracing::Level::TRACE),
            "debug" => Ok(tracing::Level::DEBUG),
            "info" => Ok(tracing::Level::INFO),
            "warn" | "warning" => Ok(tracing::Level::WARN),
            "error" => Ok(tracing::Level::ERROR),
            _ => Err(anyhow::anyhow!(
                "Invalid log level: {}. Valid levels are: trace, debug, info, warn, error",
                self.log_level
            )),
        }
    }

    /// Reject configs the probe cannot run with
    pub fn validate(&self) -> Result<()> {
        self.get_tracing_level()?;
        if self.max_attempts == 0 {
            return Err(anyhow::anyhow!("max_attempts must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("poll_interval_ms must be at least 1"));
        }
        if !DNS_UPSTREAMS.contains(&self.dns_upstream.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid dns_upstream: {}. Valid upstreams are: {}",
                self.dns_upstream,
                DNS_UPSTREAMS.join(", ")
            ));
        }
        Ok(())
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            max_attempts: self.max_attempts,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }
}

pub struct ConfigManager {
    pub config: Arc<RwLock<ProbeConfig>>,

    // for shutdown if needed
    _shutdown: watch::Receiver<()>,
}

impl ConfigManager {
    pub async fn start() -> Result<Self> {
        // Check if we should use AppConfig or local file
        let use_app_config = std::env::var("USE_APP_CONFIG")
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        if use_app_config {
            Self::start_with_app_config().await
        } else {
            Self::start_with_local_file().await
        }
    }

    async fn start_with_app_config() -> Result<Self> {
        println!("Starting with AWS AppConfig");

        // Load AWS config
        let region_provider = RegionProviderChain::default_provider().or_else("us-east-1");
        let aws_cfg = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;
        let client = AppConfigClient::new(&aws_cfg);

        let app_id = std::env::var("APP_CONFIG_APPLICATION_ID")?;
        let env_id = std::env::var("APP_CONFIG_ENVIRONMENT_ID")?;
        let profile_id = std::env::var("APP_CONFIG_PROFILE_ID")?;
        let poll_interval_sec: u64 = std::env::var("APP_CONFIG_POLL_INTERVAL_SECONDS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        let initial = Self::fetch_app_config(&client, &app_id, &env_id, &profile_id).await?;
        let config = Arc::new(RwLock::new(initial));

        // optional: shutdown signal channel (not used here)
        let (_shutdown_tx, shutdown_rx) = watch::channel(());

        {
            let config_clone = config.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(tokio::time::Duration::from_secs(poll_interval_sec)).await;
                    match Self::fetch_app_config(&client, &app_id, &env_id, &profile_id).await {
                        Ok(new_cfg) => Self::apply(&config_clone, new_cfg, "AppConfig").await,
                        Err(e) => {
                            tracing::error!("Error polling AppConfig: {:?}", e);
                        }
                    }
                }
            });
        }

        Ok(ConfigManager {
            config,
            _shutdown: shutdown_rx,
        })
    }

    async fn start_with_local_file() -> Result<Self> {
        let config_file = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "probe.json".to_string());

        let initial = if Path::new(&config_file).exists() {
            println!("Starting with local file: {}", config_file);
            Self::load_file_config(&config_file).await?
        } else {
            println!("Config file {} not found, starting with defaults", config_file);
            ProbeConfig::default()
        };
        let config = Arc::new(RwLock::new(initial));

        let poll_interval_sec: u64 = std::env::var("CONFIG_POLL_INTERVAL_SECONDS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        // optional: shutdown signal channel (not used here)
        let (_shutdown_tx, shutdown_rx) = watch::channel(());

        // Spawn background task to watch file for changes
        {
            let config_clone = config.clone();
            let config_file_clone = config_file.clone();

            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(tokio::time::Duration::from_secs(poll_interval_sec)).await;
                    if !Path::new(&config_file_clone).exists() {
                        continue;
                    }
                    match Self::load_file_config(&config_file_clone).await {
                        Ok(new_cfg) => Self::apply(&config_clone, new_cfg, "Local config file").await,
                        Err(e) => {
                            tracing::error!("Error reading config file {}: {:?}", config_file_clone, e);
                        }
                    }
                }
            });
        }

        Ok(ConfigManager {
            config,
            _shutdown: shutdown_rx,
        })
    }

    /// Swap in a reloaded config if it differs. Ports and the DNS upstream only apply on restart.
    async fn apply(config: &RwLock<ProbeConfig>, new_cfg: ProbeConfig, source: &str) {
        let mut c = config.write().await;
        if *c != new_cfg {
            tracing::info!(
                max_attempts = new_cfg.max_attempts,
                poll_interval_ms = new_cfg.poll_interval_ms,
                "{} updated",
                source
            );
            *c = new_cfg;
        }
    }

    async fn load_file_config(file_path: &str) -> Result<ProbeConfig> {
        let content = fs::read_to_string(file_path).await?;
        Self::parse_config(content.as_bytes())
    }

    fn parse_config(bytes: &[u8]) -> Result<ProbeConfig> {
        let config: ProbeConfig = serde_json::from_slice(bytes)?;
        config.validate()?;
        Ok(config)
    }

    async fn fetch_app_config(
        client: &AppConfigClient,
        app_id: &str,
        env_id: &str,
        profile_id: &str,
    ) -> Result<ProbeConfig> {
        // Start session
        let session_resp = client
            .start_configuration_session()
            .application_identifier(app_id)
            .environment_identifier(env_id)
            .configuration_profile_identifier(profile_id)
            .send()
            .await?;

        let token = session_resp
            .initial_configuration_token()
            .ok_or_else(|| anyhow::anyhow!("No initial token from AppConfigData"))?;

        let latest = client
            .get_latest_configuration()
            .configuration_token(token)
            .send()
            .await?;

        let cfg_bytes = latest
            .configuration()
            .map(|c| c.as_ref())
            .unwrap_or_default();

        Self::parse_config(cfg_bytes)
    }
}
