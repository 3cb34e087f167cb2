use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::Environment;
use crate::tracker::RetryIpPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub tracker: TrackerConfig,
    pub domains: DomainConfig,
    pub ip: IpConfig,
    pub http: HttpConfig,
    /// Path of the JSON file backing session storage for the CLI
    /// If None, session values live in memory only
    pub session_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Tracking endpoint; relative paths are joined onto the resolved backend domain
    pub endpoint: String,
    pub app_id: String,
    pub version: String,
    pub environment: Environment,
    #[serde(default = "TrackerConfig::default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "TrackerConfig::default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub retry_ip: RetryIpPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    /// URL of the JSON document carrying `localhostDomain` and `proxyDomain`
    pub config_url: String,
    /// 0 disables the in-process cache
    #[serde(default = "DomainConfig::default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpConfig {
    /// Public lookup services, tried in order after the first-party endpoint
    pub fallback_services: Vec<String>,
    #[serde(default)]
    pub allow_compressed_ipv6: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "HttpConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl TrackerConfig {
    pub const DEFAULT_ENDPOINT: &'static str = "/tracking";
    /// Upper bound on events per request
    pub const MAX_BATCH_SIZE: usize = 20;

    const fn default_batch_size() -> usize {
        20
    }

    const fn default_retry_delay_ms() -> u64 {
        500
    }

    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            endpoint: Self::DEFAULT_ENDPOINT.to_string(),
            app_id: app_id.into(),
            version: "1.0.0".to_string(),
            environment: Environment::default(),
            batch_size: Self::default_batch_size(),
            retry_delay_ms: Self::default_retry_delay_ms(),
            retry_ip: RetryIpPolicy::default(),
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl DomainConfig {
    const fn default_cache_ttl_secs() -> u64 {
        300
    }

    pub fn new(config_url: impl Into<String>) -> Self {
        Self {
            config_url: config_url.into(),
            cache_ttl_secs: Self::default_cache_ttl_secs(),
        }
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_secs > 0).then(|| Duration::from_secs(self.cache_ttl_secs))
    }
}

impl Default for IpConfig {
    fn default() -> Self {
        Self {
            fallback_services: IpConfig::DEFAULT_FALLBACK_SERVICES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allow_compressed_ipv6: false,
        }
    }
}

impl IpConfig {
    pub const DEFAULT_FALLBACK_SERVICES: [&'static str; 5] = [
        "https://api.ipify.org?format=json",
        "https://ipapi.co/json/",
        "https://ipinfo.io/json",
        "https://api.myip.com",
        "https://worldtimeapi.org/api/ip",
    ];
}

impl HttpConfig {
    const fn default_timeout_secs() -> u64 {
        10
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: Self::default_timeout_secs(),
            user_agent: concat!("sitetrack/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Integer variable with a default; a set but malformed value is an error
fn env_u64(name: &str, default: u64) -> anyhow::Result<u64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{name} must be an integer")),
        Err(_) => Ok(default),
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let app_id = std::env::var("SITETRACK_APP_ID")
            .context("SITETRACK_APP_ID must be set to identify the tracked site")?;

        let endpoint = std::env::var("SITETRACK_ENDPOINT")
            .unwrap_or_else(|_| TrackerConfig::DEFAULT_ENDPOINT.to_string());
        let version = std::env::var("SITETRACK_VERSION").unwrap_or_else(|_| "1.0.0".to_string());

        let environment = match std::env::var("SITETRACK_ENV") {
            Ok(raw) => raw.parse::<Environment>().unwrap_or_else(|_| {
                tracing::warn!(
                    "Unknown SITETRACK_ENV '{raw}', falling back to 'production'. \
                     Supported values: development, test, production"
                );
                Environment::Production
            }),
            Err(_) => Environment::default(),
        };

        let batch_size = std::env::var("SITETRACK_BATCH_SIZE")
            .unwrap_or_else(|_| TrackerConfig::default_batch_size().to_string())
            .parse::<usize>()
            .context("SITETRACK_BATCH_SIZE must be a positive integer")?;
        if batch_size == 0 || batch_size > TrackerConfig::MAX_BATCH_SIZE {
            anyhow::bail!(
                "SITETRACK_BATCH_SIZE must be between 1 and {}",
                TrackerConfig::MAX_BATCH_SIZE
            );
        }

        let retry_delay_ms =
            env_u64("SITETRACK_RETRY_DELAY_MS", TrackerConfig::default_retry_delay_ms())?;

        let retry_ip = if env_flag("SITETRACK_RETRY_FORWARD_IP") {
            RetryIpPolicy::Forward
        } else {
            RetryIpPolicy::Omit
        };

        let config_url = std::env::var("SITETRACK_DOMAIN_CONFIG_URL")
            .context("SITETRACK_DOMAIN_CONFIG_URL must point at the site's customize.json")?;
        let cache_ttl_secs = env_u64(
            "SITETRACK_DOMAIN_CACHE_TTL_SECS",
            DomainConfig::default_cache_ttl_secs(),
        )?;

        let mut ip = IpConfig::default();
        if let Ok(list) = std::env::var("SITETRACK_IP_FALLBACK_SERVICES") {
            ip.fallback_services = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        ip.allow_compressed_ipv6 = env_flag("SITETRACK_ALLOW_COMPRESSED_IPV6");

        let mut http = HttpConfig::default();
        if let Ok(raw) = std::env::var("SITETRACK_HTTP_TIMEOUT_SECS") {
            http.timeout_secs = raw
                .parse::<u64>()
                .context("SITETRACK_HTTP_TIMEOUT_SECS must be an integer")?;
        }

        let session_file = std::env::var("SITETRACK_SESSION_FILE").ok();

        Ok(Config {
            tracker: TrackerConfig {
                endpoint,
                app_id,
                version,
                environment,
                batch_size,
                retry_delay_ms,
                retry_ip,
            },
            domains: DomainConfig {
                config_url,
                cache_ttl_secs,
            },
            ip,
            http,
            session_file,
        })
    }
}
