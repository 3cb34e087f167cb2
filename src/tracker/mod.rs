//! Event queue and batch sender
//!
//! `track()` appends to an in-memory FIFO and kicks a send attempt. Sends
//! are single-flight: while one batch is on the wire, further attempts are
//! no-ops and new events simply accumulate. A batch that fails is put back
//! at the front of the queue; a batch that succeeds schedules a follow-up
//! attempt if anything is still queued.
//!
//! Nothing is persisted. Whatever is still queued when the tracker is
//! dropped is lost unless [`Tracker::flush`] was awaited first.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::TrackerConfig;
use crate::models::{Environment, PageHandle, TrackEvent};
use crate::resolve::Domains;
use crate::transport::{Transport, TransportResult};

/// Which client IP a scheduled follow-up send carries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryIpPolicy {
    /// Follow-up sends go out without an `X-Client-IP` header
    #[default]
    Omit,
    /// Follow-up sends reuse the IP of the batch that just succeeded
    Forward,
}

struct Endpoint {
    url: String,
    /// Set once the URL is absolute or has been rewritten against the resolved domains
    finalized: bool,
}

struct TrackerInner {
    app_id: String,
    version: String,
    environment: Environment,
    batch_size: usize,
    retry_delay: Duration,
    retry_ip: RetryIpPolicy,
    endpoint: RwLock<Endpoint>,
    queue: Mutex<VecDeque<TrackEvent>>,
    sending: AtomicBool,
    idle: Notify,
    transport: Arc<dyn Transport>,
    page: PageHandle,
}

/// Batching analytics client; cheap to clone, clones share one queue
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

fn is_absolute(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

impl Tracker {
    pub fn new(config: &TrackerConfig, transport: Arc<dyn Transport>, page: PageHandle) -> Self {
        let endpoint = Endpoint {
            url: config.endpoint.clone(),
            finalized: is_absolute(&config.endpoint),
        };

        Self {
            inner: Arc::new(TrackerInner {
                app_id: config.app_id.clone(),
                version: config.version.clone(),
                environment: config.environment,
                batch_size: config.batch_size.clamp(1, TrackerConfig::MAX_BATCH_SIZE),
                retry_delay: config.retry_delay(),
                retry_ip: config.retry_ip,
                endpoint: RwLock::new(endpoint),
                queue: Mutex::new(VecDeque::new()),
                sending: AtomicBool::new(false),
                idle: Notify::new(),
                transport,
                page,
            }),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.inner.app_id
    }

    pub fn environment(&self) -> Environment {
        self.inner.environment
    }

    pub fn endpoint(&self) -> String {
        self.inner
            .endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .url
            .clone()
    }

    /// Replace the endpoint outright
    pub fn set_endpoint(&self, url: impl Into<String>) {
        let mut endpoint = self
            .inner
            .endpoint
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        endpoint.url = url.into();
        endpoint.finalized = true;
    }

    /// Whether the endpoint still has to be joined onto the backend domain
    pub fn needs_endpoint(&self) -> bool {
        !self
            .inner
            .endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .finalized
    }

    /// Rewrite a relative endpoint (e.g. `/tracking`) onto the resolved domains
    ///
    /// Idempotent: once finalized the endpoint is left alone.
    pub fn ensure_endpoint(&self, domains: &Domains) -> String {
        let mut endpoint = self
            .inner
            .endpoint
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !endpoint.finalized {
            endpoint.url = domains.url(&endpoint.url);
            endpoint.finalized = true;
            debug!(endpoint = %endpoint.url, "tracking endpoint finalized");
        }
        endpoint.url.clone()
    }

    /// Number of events waiting to be sent (excludes an in-flight batch)
    pub fn pending(&self) -> usize {
        self.lock_queue().len()
    }

    /// Copy of the queued events, oldest first
    pub fn queued(&self) -> Vec<TrackEvent> {
        self.lock_queue().iter().cloned().collect()
    }

    pub fn is_sending(&self) -> bool {
        self.inner.sending.load(Ordering::Acquire)
    }

    /// Record an event and trigger a send attempt
    ///
    /// Base fields are sampled now; `fields` win on key collisions. The
    /// network request runs on a spawned task, so this must be called from
    /// within a Tokio runtime.
    pub fn track(&self, fields: TrackEvent, client_ip: Option<&str>) {
        let mut event = self.base_fields();
        event.merge(fields);

        self.lock_queue().push_back(event);
        self.send_batch(client_ip.map(str::to_string));
    }

    fn base_fields(&self) -> TrackEvent {
        let page = self.inner.page.snapshot();
        TrackEvent::new()
            .with("app_id", self.inner.app_id.as_str())
            .with("version", self.inner.version.as_str())
            .with("env", self.inner.environment.as_str())
            .with("timestamp", Utc::now().timestamp_millis())
            .with("page_url", page.url)
            .with("referrer", page.referrer)
            .with("user_agent", page.user_agent)
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<TrackEvent>> {
        self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start sending the oldest batch unless a send is already in flight
    fn send_batch(&self, client_ip: Option<String>) {
        let Some(batch) = self.take_batch() else {
            return;
        };

        let tracker = self.clone();
        tokio::spawn(async move {
            if let Err(err) = tracker.deliver(batch, client_ip, true).await {
                debug!(error = %err, "background send ended without delivery");
            }
        });
    }

    /// Acquire the send lock and remove up to `batch_size` oldest events
    fn take_batch(&self) -> Option<Vec<TrackEvent>> {
        if self.pending() == 0 {
            return None;
        }
        if self
            .inner
            .sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let mut queue = self.lock_queue();
        let take = queue.len().min(self.inner.batch_size);
        if take == 0 {
            drop(queue);
            self.release();
            return None;
        }
        Some(queue.drain(..take).collect())
    }

    fn release(&self) {
        self.inner.sending.store(false, Ordering::Release);
        self.inner.idle.notify_waiters();
    }

    /// Put a failed batch back in front of anything queued since
    fn requeue_front(&self, batch: Vec<TrackEvent>) {
        let mut queue = self.lock_queue();
        for event in batch.into_iter().rev() {
            queue.push_front(event);
        }
    }

    async fn deliver(
        &self,
        batch: Vec<TrackEvent>,
        client_ip: Option<String>,
        follow_up: bool,
    ) -> TransportResult<()> {
        let endpoint = self.endpoint();
        let count = batch.len();

        let mut headers = vec![
            ("Content-Type", "application/json".to_string()),
            ("X-User-Agent", self.inner.page.snapshot().user_agent),
        ];
        if let Some(ip) = &client_ip {
            headers.push(("X-Client-IP", ip.clone()));
        }

        let body = json!({ "events": &batch });
        match self.inner.transport.post_json(&endpoint, headers, &body).await {
            Ok(()) => {
                debug!(%endpoint, count, "tracking batch delivered");
                self.release();
                if follow_up && self.pending() > 0 {
                    self.schedule_follow_up(client_ip);
                }
                Ok(())
            }
            Err(err) if !err.is_retryable() => {
                warn!(
                    %endpoint,
                    count,
                    error = %err,
                    "tracking endpoint rejected batch, dropping it"
                );
                self.release();
                if follow_up && self.pending() > 0 {
                    self.schedule_follow_up(client_ip);
                }
                Err(err)
            }
            Err(err) => {
                warn!(%endpoint, count, error = %err, "tracking batch failed, re-queued");
                self.requeue_front(batch);
                self.release();
                Err(err)
            }
        }
    }

    fn schedule_follow_up(&self, client_ip: Option<String>) {
        let client_ip = match self.inner.retry_ip {
            RetryIpPolicy::Omit => None,
            RetryIpPolicy::Forward => client_ip,
        };
        let tracker = self.clone();
        let delay = self.inner.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracker.send_batch(client_ip);
        });
    }

    /// Wait until no send is in flight
    pub async fn settled(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_sending() {
                return;
            }
            notified.await;
        }
    }

    /// Send everything still queued, one batch at a time
    ///
    /// Waits for an in-flight send first. Stops at the first failed batch,
    /// which is re-queued (or dropped if the endpoint rejected it).
    pub async fn flush(&self, client_ip: Option<&str>) -> TransportResult<()> {
        loop {
            self.settled().await;
            if self.pending() == 0 {
                return Ok(());
            }
            let Some(batch) = self.take_batch() else {
                continue;
            };
            self.deliver(batch, client_ip.map(str::to_string), false)
                .await?;
        }
    }
}
