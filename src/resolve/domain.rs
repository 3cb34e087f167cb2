use moka::future::Cache;
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::DomainConfig;
use crate::models::PageHandle;
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, Error)]
pub enum DomainError {
    #[error("failed to fetch domain config from {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("domain config at {url} is malformed: {reason}")]
    Malformed { url: String, reason: String },
    #[error("domain config at {0} has no 'localhostDomain'")]
    MissingBackend(String),
}

/// Resolved request targets for the site backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domains {
    pub backend_domain: String,
    /// Percent-encoded proxy prefix, empty when the site has no proxy
    pub proxy_prefix: String,
    /// Page URL that relative request URLs are resolved against
    base: Option<String>,
}

impl Domains {
    pub fn new(backend_domain: impl Into<String>, proxy_domain: Option<&str>) -> Self {
        Self {
            backend_domain: backend_domain.into(),
            proxy_prefix: proxy_domain
                .filter(|p| !p.is_empty())
                .map(|p| urlencoding::encode(p).into_owned())
                .unwrap_or_default(),
            base: None,
        }
    }

    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    /// Build a request URL: `proxy_prefix + backend_domain + path`
    ///
    /// A result that is not absolute is resolved against the page URL the
    /// way a browser resolves a relative `fetch` target.
    pub fn url(&self, path: &str) -> String {
        let joined = format!("{}{}{}", self.proxy_prefix, self.backend_domain, path);
        resolve_against(self.base.as_deref(), &joined)
    }
}

/// Resolve `target` against `base` unless it is already absolute
pub(crate) fn resolve_against(base: Option<&str>, target: &str) -> String {
    if Url::parse(target).is_ok() {
        return target.to_string();
    }

    base.and_then(|b| Url::parse(b).ok())
        .and_then(|b| b.join(target).ok())
        .map(String::from)
        .unwrap_or_else(|| target.to_string())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SiteConfigDocument {
    localhost_domain: Option<String>,
    #[serde(default)]
    proxy_domain: Option<String>,
}

/// Resolves backend and proxy domains from the site's config document
pub struct DomainResolver {
    transport: Arc<dyn Transport>,
    config_url: String,
    page: PageHandle,
    cache: Option<Cache<String, Domains>>,
}

impl DomainResolver {
    pub fn new(transport: Arc<dyn Transport>, config: &DomainConfig, page: PageHandle) -> Self {
        let cache = config.cache_ttl().map(|ttl| {
            Cache::builder()
                .max_capacity(16)
                .time_to_live(ttl)
                .build()
        });

        Self {
            transport,
            config_url: config.config_url.clone(),
            page,
            cache,
        }
    }

    /// Absolute URL of the config document for the current page
    pub fn config_url(&self) -> String {
        resolve_against(Some(&self.page.snapshot().url), &self.config_url)
    }

    /// Resolve the domains, serving from cache while the entry is fresh
    ///
    /// Concurrent callers on a cold cache share one fetch.
    pub async fn domains(&self) -> Result<Domains, DomainError> {
        let url = self.config_url();

        match &self.cache {
            Some(cache) => cache
                .try_get_with(url.clone(), self.fetch(&url))
                .await
                .map_err(|err| (*err).clone()),
            None => self.fetch(&url).await,
        }
    }

    /// Drop any cached resolution
    pub fn invalidate(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }

    async fn fetch(&self, url: &str) -> Result<Domains, DomainError> {
        debug!(%url, "fetching domain config");
        let document = self
            .transport
            .get_json(url, Vec::new())
            .await
            .map_err(|source| {
                warn!(%url, error = %source, "failed to fetch domain config");
                DomainError::Fetch {
                    url: url.to_string(),
                    source,
                }
            })?;

        let domains = parse_document(url, document)?.with_base(self.page.snapshot().url);
        debug!(
            backend = %domains.backend_domain,
            proxy = %domains.proxy_prefix,
            "resolved domains"
        );
        Ok(domains)
    }
}

fn parse_document(url: &str, document: Value) -> Result<Domains, DomainError> {
    let parsed: SiteConfigDocument =
        serde_json::from_value(document).map_err(|e| DomainError::Malformed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let backend = parsed
        .localhost_domain
        .filter(|d| !d.is_empty())
        .ok_or_else(|| DomainError::MissingBackend(url.to_string()))?;

    Ok(Domains::new(backend, parsed.proxy_domain.as_deref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PageInfo;
    use crate::transport::{Headers, TransportResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ConfigServer {
        body: TransportResult<Value>,
        hits: AtomicUsize,
    }

    #[async_trait]
    impl Transport for ConfigServer {
        async fn get_json(&self, _url: &str, _headers: Headers) -> TransportResult<Value> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            match &self.body {
                Ok(v) => Ok(v.clone()),
                Err(e) => Err(e.clone()),
            }
        }

        async fn post_json(&self, _: &str, _: Headers, _: &Value) -> TransportResult<()> {
            unreachable!("domain resolution never posts")
        }
    }

    fn setup(body: TransportResult<Value>, ttl_secs: u64) -> (Arc<ConfigServer>, DomainResolver) {
        let server = Arc::new(ConfigServer {
            body,
            hits: AtomicUsize::new(0),
        });
        let page = PageHandle::new(PageInfo::new("https://site.example/memo.html", "ua"));
        let config = DomainConfig {
            config_url: "../static/customize.json".to_string(),
            cache_ttl_secs: ttl_secs,
        };
        let resolver = DomainResolver::new(server.clone(), &config, page);
        (server, resolver)
    }

    #[test]
    fn proxy_prefix_is_percent_encoded() {
        let domains = Domains::new("https://api.example.com", Some("https://proxy.example/?u="));
        assert_eq!(domains.proxy_prefix, "https%3A%2F%2Fproxy.example%2F%3Fu%3D");
    }

    #[test]
    fn url_without_proxy_is_plain_concatenation() {
        let domains = Domains::new("https://api.example.com", None);
        assert_eq!(domains.url("/tracking"), "https://api.example.com/tracking");
    }

    #[test]
    fn proxied_url_resolves_against_page() {
        let domains = Domains::new("api.example.com", Some("https://proxy/"))
            .with_base("https://site.example/memo.html");
        assert_eq!(
            domains.url("/client-ip"),
            "https://site.example/https%3A%2F%2Fproxy%2Fapi.example.com/client-ip"
        );
    }

    #[test]
    fn config_url_is_relative_to_page() {
        let (_, resolver) = setup(Ok(json!({})), 0);
        assert_eq!(resolver.config_url(), "https://site.example/static/customize.json");
    }

    #[tokio::test]
    async fn extracts_both_fields() {
        let (_, resolver) = setup(
            Ok(json!({ "localhostDomain": "https://api.example.com", "proxyDomain": "p/" })),
            0,
        );
        let domains = resolver.domains().await.unwrap();
        assert_eq!(domains.backend_domain, "https://api.example.com");
        assert_eq!(domains.proxy_prefix, "p%2F");
    }

    #[tokio::test]
    async fn missing_backend_is_an_error() {
        let (_, resolver) = setup(Ok(json!({ "proxyDomain": "p" })), 0);
        assert!(matches!(
            resolver.domains().await,
            Err(DomainError::MissingBackend(_))
        ));
    }

    #[tokio::test]
    async fn fetch_failure_propagates() {
        let (_, resolver) = setup(Err(TransportError::Status(404)), 0);
        assert!(matches!(
            resolver.domains().await,
            Err(DomainError::Fetch { source: TransportError::Status(404), .. })
        ));
    }

    #[tokio::test]
    async fn cache_serves_repeat_lookups() {
        let (server, resolver) = setup(Ok(json!({ "localhostDomain": "https://a" })), 300);
        resolver.domains().await.unwrap();
        resolver.domains().await.unwrap();
        assert_eq!(server.hits.load(Ordering::SeqCst), 1);

        resolver.invalidate();
        resolver.domains().await.unwrap();
        assert_eq!(server.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disabled_cache_fetches_every_time() {
        let (server, resolver) = setup(Ok(json!({ "localhostDomain": "https://a" })), 0);
        resolver.domains().await.unwrap();
        resolver.domains().await.unwrap();
        assert_eq!(server.hits.load(Ordering::SeqCst), 2);
    }
}
