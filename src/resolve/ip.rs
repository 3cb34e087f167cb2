//! Client IP resolution with session caching
//!
//! Resolution order:
//! 1. A valid value already cached in the session
//! 2. The site's own `/client-ip` endpoint
//! 3. Public lookup services, in configured order
//! 4. The `unknown` sentinel
//!
//! The outcome is validated before it is written back, so a malformed
//! value can never be cached.

use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::domain::DomainResolver;
use super::validate::{IpValidator, UNKNOWN_IP};
use crate::config::IpConfig;
use crate::session::SessionStore;
use crate::transport::Transport;

/// Session key holding the last resolved client IP
pub const IP_CACHE_KEY: &str = "client_ip_cache";

const CLIENT_IP_PATH: &str = "/client-ip";

pub struct IpResolver {
    transport: Arc<dyn Transport>,
    session: Arc<dyn SessionStore>,
    domains: Arc<DomainResolver>,
    fallback_services: Vec<String>,
    validator: IpValidator,
}

impl IpResolver {
    pub fn new(
        transport: Arc<dyn Transport>,
        session: Arc<dyn SessionStore>,
        domains: Arc<DomainResolver>,
        config: &IpConfig,
    ) -> Self {
        Self {
            transport,
            session,
            domains,
            fallback_services: config.fallback_services.clone(),
            validator: IpValidator::new(config.allow_compressed_ipv6),
        }
    }

    pub fn validator(&self) -> IpValidator {
        self.validator
    }

    /// Cached value, if present and well-formed
    pub fn cached(&self) -> Option<String> {
        self.session
            .get(IP_CACHE_KEY)
            .filter(|ip| self.validator.is_valid(ip))
    }

    /// Evict a cached value that fails validation
    ///
    /// Returns whether anything was removed.
    pub fn clear_invalid_cache(&self) -> bool {
        match self.session.get(IP_CACHE_KEY) {
            Some(cached) if !self.validator.is_valid(&cached) => {
                info!(%cached, "clearing invalid cached client IP");
                self.session.remove(IP_CACHE_KEY);
                true
            }
            _ => false,
        }
    }

    /// Resolve the client's public IP
    ///
    /// Never fails: every lookup error degrades to the next source and
    /// finally to `unknown`.
    pub async fn client_ip(&self) -> String {
        if let Some(cached) = self.cached() {
            debug!(ip = %cached, "client IP served from session cache");
            return cached;
        }

        let ip = match self.first_party_ip().await {
            Ok(Some(ip)) => ip,
            Ok(None) => {
                debug!("first-party endpoint returned no usable IP, trying public services");
                self.public_ip().await
            }
            Err(err) => {
                warn!(error = %err, "first-party IP lookup failed, trying public services");
                self.public_ip().await
            }
        };

        if self.validator.is_valid(&ip) {
            self.session.set(IP_CACHE_KEY, &ip);
        } else {
            self.session.remove(IP_CACHE_KEY);
        }
        ip
    }

    async fn first_party_ip(&self) -> Result<Option<String>> {
        let domains = self
            .domains
            .domains()
            .await
            .context("failed to resolve backend domain")?;
        let url = domains.url(CLIENT_IP_PATH);

        let body = self
            .transport
            .get_json(
                &url,
                vec![
                    ("Cache-Control", "no-cache".to_string()),
                    ("X-Requested-With", "XMLHttpRequest".to_string()),
                ],
            )
            .await
            .with_context(|| format!("request to {url} failed"))?;

        Ok(extract_ip(&body, &["ip"]).filter(|ip| self.validator.is_usable(ip)))
    }

    async fn public_ip(&self) -> String {
        for url in &self.fallback_services {
            let body = match self
                .transport
                .get_json(url, vec![("Accept", "application/json".to_string())])
                .await
            {
                Ok(body) => body,
                Err(err) => {
                    debug!(%url, error = %err, "public IP service failed");
                    continue;
                }
            };

            match extract_ip(&body, &["ip", "ipAddress"]) {
                Some(ip) if self.validator.is_usable(&ip) => {
                    debug!(%url, %ip, "client IP resolved by public service");
                    return ip;
                }
                other => {
                    debug!(%url, value = ?other, "public IP service returned no usable IP");
                }
            }
        }

        warn!("every IP lookup failed, reporting client IP as unknown");
        UNKNOWN_IP.to_string()
    }
}

/// First non-empty string among `keys`
fn extract_ip(body: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| body.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|ip| !ip.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomainConfig;
    use crate::models::{PageHandle, PageInfo};
    use crate::session::MemorySessionStore;
    use crate::transport::{Headers, TransportError, TransportResult};
    use async_trait::async_trait;
    use dashmap::DashMap;
    use serde_json::json;
    use std::sync::Mutex;

    /// Answers GETs from a fixed route table and records every URL hit
    #[derive(Default)]
    struct RouteTable {
        routes: DashMap<String, TransportResult<Value>>,
        hits: Mutex<Vec<String>>,
    }

    impl RouteTable {
        fn route(self, url: &str, answer: TransportResult<Value>) -> Self {
            self.routes.insert(url.to_string(), answer);
            self
        }

        fn hits(&self) -> Vec<String> {
            self.hits.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RouteTable {
        async fn get_json(&self, url: &str, _headers: Headers) -> TransportResult<Value> {
            self.hits.lock().unwrap().push(url.to_string());
            match self.routes.get(url) {
                Some(answer) => answer.value().clone(),
                None => Err(TransportError::Status(404)),
            }
        }

        async fn post_json(&self, _: &str, _: Headers, _: &Value) -> TransportResult<()> {
            unreachable!("IP resolution never posts")
        }
    }

    const CONFIG: &str = "https://site.example/customize.json";

    fn setup(
        table: RouteTable,
        fallbacks: &[&str],
    ) -> (Arc<RouteTable>, Arc<MemorySessionStore>, IpResolver) {
        let table = Arc::new(table);
        let session = Arc::new(MemorySessionStore::new());
        let page = PageHandle::new(PageInfo::new("https://site.example/", "ua"));
        let domains = Arc::new(DomainResolver::new(
            table.clone(),
            &DomainConfig::new(CONFIG),
            page,
        ));
        let config = IpConfig {
            fallback_services: fallbacks.iter().map(|s| s.to_string()).collect(),
            allow_compressed_ipv6: false,
        };
        let ip = IpResolver::new(table.clone(), session.clone(), domains, &config);
        (table, session, ip)
    }

    fn site() -> RouteTable {
        RouteTable::default().route(
            CONFIG,
            Ok(json!({ "localhostDomain": "https://api.example.com" })),
        )
    }

    #[tokio::test]
    async fn cache_hit_skips_network() {
        let (table, session, resolver) = setup(site(), &[]);
        session.set(IP_CACHE_KEY, "10.1.2.3");

        assert_eq!(resolver.client_ip().await, "10.1.2.3");
        assert!(table.hits().is_empty());
    }

    #[tokio::test]
    async fn first_party_answer_is_adopted_and_cached() {
        let table = site().route(
            "https://api.example.com/client-ip",
            Ok(json!({ "ip": "203.0.113.9", "is_valid": true })),
        );
        let (_, session, resolver) = setup(table, &["https://public.example/"]);

        assert_eq!(resolver.client_ip().await, "203.0.113.9");
        assert_eq!(session.get(IP_CACHE_KEY).as_deref(), Some("203.0.113.9"));
    }

    #[tokio::test]
    async fn unknown_from_first_party_falls_back_in_order() {
        let table = site()
            .route("https://api.example.com/client-ip", Ok(json!({ "ip": "unknown" })))
            .route("https://one.example/", Err(TransportError::Network("down".into())))
            .route("https://two.example/", Ok(json!({ "country": "NL" })))
            .route("https://three.example/", Ok(json!({ "ipAddress": "198.51.100.4" })))
            .route("https://four.example/", Ok(json!({ "ip": "192.0.2.1" })));
        let (table, _, resolver) = setup(
            table,
            &[
                "https://one.example/",
                "https://two.example/",
                "https://three.example/",
                "https://four.example/",
            ],
        );

        assert_eq!(resolver.client_ip().await, "198.51.100.4");
        let hits = table.hits();
        assert!(hits.contains(&"https://three.example/".to_string()));
        assert!(!hits.contains(&"https://four.example/".to_string()));
    }

    #[tokio::test]
    async fn domain_failure_still_uses_public_services() {
        let table =
            RouteTable::default().route("https://pub.example/", Ok(json!({ "ip": "8.8.4.4" })));
        let (_, _, resolver) = setup(table, &["https://pub.example/"]);

        assert_eq!(resolver.client_ip().await, "8.8.4.4");
    }

    #[tokio::test]
    async fn exhausted_fallbacks_yield_unknown_and_cache_it() {
        let (_, session, resolver) = setup(site(), &["https://gone.example/"]);

        assert_eq!(resolver.client_ip().await, UNKNOWN_IP);
        assert_eq!(session.get(IP_CACHE_KEY).as_deref(), Some(UNKNOWN_IP));
    }

    #[tokio::test]
    async fn malformed_cache_is_ignored_and_overwritten() {
        let table = site().route(
            "https://api.example.com/client-ip",
            Ok(json!({ "ip": "1.2.3.4" })),
        );
        let (_, session, resolver) = setup(table, &[]);
        session.set(IP_CACHE_KEY, "[object Promise]");

        assert_eq!(resolver.client_ip().await, "1.2.3.4");
        assert_eq!(session.get(IP_CACHE_KEY).as_deref(), Some("1.2.3.4"));
    }

    #[tokio::test]
    async fn first_party_failure_keeps_transport_error_as_source() {
        let table = site().route(
            "https://api.example.com/client-ip",
            Err(TransportError::Status(503)),
        );
        let (_, _, resolver) = setup(table, &[]);

        let err = resolver.first_party_ip().await.unwrap_err();
        assert!(err.to_string().contains("https://api.example.com/client-ip"));
        assert!(matches!(
            err.downcast_ref::<TransportError>(),
            Some(TransportError::Status(503))
        ));
    }

    #[test]
    fn clear_invalid_cache_removes_garbage() {
        let (_, session, resolver) = setup(site(), &[]);
        session.set(IP_CACHE_KEY, "[object Promise]");

        assert!(resolver.clear_invalid_cache());
        assert!(session.get(IP_CACHE_KEY).is_none());
    }

    #[test]
    fn clear_invalid_cache_keeps_valid_value() {
        let (_, session, resolver) = setup(site(), &[]);
        session.set(IP_CACHE_KEY, "unknown");

        assert!(!resolver.clear_invalid_cache());
        assert_eq!(session.get(IP_CACHE_KEY).as_deref(), Some("unknown"));
    }

    #[test]
    fn extract_prefers_first_key() {
        let body = json!({ "ip": "", "ipAddress": "1.1.1.1" });
        assert_eq!(extract_ip(&body, &["ip", "ipAddress"]).as_deref(), Some("1.1.1.1"));
        assert_eq!(extract_ip(&json!({ "ip": 5 }), &["ip"]), None);
    }
}
