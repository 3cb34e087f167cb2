use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::models::{PageHandle, TrackEvent};
use crate::resolve::{DomainError, DomainResolver, IpResolver};
use crate::session::SessionStore;
use crate::tracker::Tracker;
use crate::transport::Transport;

/// Everything one page needs to report events
///
/// Built once per page load and shared (behind an `Arc`) by the page
/// session and the click harness.
pub struct TrackingContext {
    tracker: Tracker,
    ip: IpResolver,
    domains: Arc<DomainResolver>,
    page: PageHandle,
}

impl TrackingContext {
    pub fn from_config(
        config: &Config,
        transport: Arc<dyn Transport>,
        session: Arc<dyn SessionStore>,
        page: PageHandle,
    ) -> Self {
        let domains = Arc::new(DomainResolver::new(
            transport.clone(),
            &config.domains,
            page.clone(),
        ));
        let ip = IpResolver::new(transport.clone(), session, domains.clone(), &config.ip);
        let tracker = Tracker::new(&config.tracker, transport, page.clone());

        Self {
            tracker,
            ip,
            domains,
            page,
        }
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn ip(&self) -> &IpResolver {
        &self.ip
    }

    pub fn domains(&self) -> &DomainResolver {
        &self.domains
    }

    pub fn page(&self) -> &PageHandle {
        &self.page
    }

    /// Resolve the client IP, make sure the endpoint is absolute, then track
    ///
    /// A domain failure aborts this event only; nothing is queued.
    pub async fn dispatch(&self, fields: TrackEvent) -> Result<(), DomainError> {
        let client_ip = self.ip.client_ip().await;

        if self.tracker.needs_endpoint() {
            let domains = self.domains.domains().await?;
            self.tracker.ensure_endpoint(&domains);
        }

        self.tracker.track(fields, Some(&client_ip));
        Ok(())
    }

    pub fn page_view_event(&self) -> TrackEvent {
        let page = self.page.snapshot();
        TrackEvent::new()
            .with("event_type", "page_view")
            .with("event_name", "page_load")
            .with("page_name_lv", "")
            .with("page_title", page.title.as_str())
            .with("account", page.account_digest())
            .with("page_url", page.url)
    }

    pub async fn track_page_view(&self) -> Result<(), DomainError> {
        match self.dispatch(self.page_view_event()).await {
            Ok(()) => {
                debug!("page view tracked");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "page view not tracked");
                Err(err)
            }
        }
    }
}
