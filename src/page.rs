use std::sync::Arc;
use tracing::{info, warn};

use crate::context::TrackingContext;
use crate::dom::Document;
use crate::harness::ClickHarness;
use crate::transport::TransportResult;

/// Tracking lifecycle of one loaded page
pub struct PageSession {
    context: Arc<TrackingContext>,
    harness: ClickHarness,
}

impl PageSession {
    /// Page-load sequence: drop a corrupt IP cache, report the page view,
    /// then start delegating clicks on `document`
    ///
    /// A failed page view is logged and does not stop the harness.
    pub async fn load(context: Arc<TrackingContext>, document: &Document) -> Self {
        context.ip().clear_invalid_cache();
        // already logged by track_page_view
        let _ = context.track_page_view().await;

        let harness = ClickHarness::new(Arc::clone(&context));
        harness.install(document);
        info!(url = %context.page().snapshot().url, "page session started");

        Self { context, harness }
    }

    pub fn context(&self) -> &TrackingContext {
        &self.context
    }

    pub fn harness(&self) -> &ClickHarness {
        &self.harness
    }

    /// Stop watching the document and send whatever is still queued
    pub async fn unload(&self, document: &Document) -> TransportResult<()> {
        self.harness.disconnect(document);

        let client_ip = self.context.ip().cached();
        let result = self.context.tracker().flush(client_ip.as_deref()).await;
        if let Err(err) = &result {
            warn!(
                error = %err,
                pending = self.context.tracker().pending(),
                "events left unsent at unload"
            );
        }
        result
    }
}
