//! Click delegation
//!
//! One capture-phase listener on the document turns clicks on trackable
//! elements (or anything nested inside them) into tracking events. A
//! mutation observer on the body re-registers the listener whenever the
//! tree changes, so content inserted later is covered without per-element
//! wiring.

use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::context::TrackingContext;
use crate::dom::{
    ClickListener, Document, Element, Mutation, NodeId, ObserverHandle, Phase, TrackMarker,
};
use crate::models::TrackEvent;

/// Key the delegated listener is registered under
pub const LISTENER_KEY: &str = "sitetrack.click";

const HIERARCHY_SEPARATOR: &str = " > ";

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("element is not trackable")]
    NotTrackable,
    #[error("extra data for '{event_name}' is not valid JSON: {source}")]
    MalformedExtra {
        event_name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("extra data for '{event_name}' must be a JSON object")]
    ExtraNotObject { event_name: String },
}

/// A trackable marker whose extra data has been parsed into an object
#[derive(Debug, Clone, PartialEq)]
pub struct TrackDescriptor {
    pub event_name: String,
    pub extra: Map<String, Value>,
}

impl TryFrom<&TrackMarker> for TrackDescriptor {
    type Error = HarnessError;

    fn try_from(marker: &TrackMarker) -> Result<Self, Self::Error> {
        let extra = match marker.extra.as_deref() {
            None => Map::new(),
            Some(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    return Err(HarnessError::ExtraNotObject {
                        event_name: marker.event_name.clone(),
                    })
                }
                Err(source) => {
                    return Err(HarnessError::MalformedExtra {
                        event_name: marker.event_name.clone(),
                        source,
                    })
                }
            },
        };

        Ok(Self {
            event_name: marker.event_name.clone(),
            extra,
        })
    }
}

/// Page location of `node`: `page_level` markers outermost first, then
/// `page_sublevel` markers innermost first, joined with `" > "`
///
/// The walk includes `node` itself and stops below the body.
pub fn hierarchy(document: &Document, node: NodeId) -> String {
    let body = document.body();
    let mut levels: Vec<&str> = Vec::new();
    let mut sublevels: Vec<&str> = Vec::new();

    for id in document.ancestors(node).take_while(|id| *id != body) {
        let element = document.element(id);
        if let Some(level) = element.page_level.as_deref() {
            levels.insert(0, level);
        }
        if let Some(sublevel) = element.page_sublevel.as_deref() {
            sublevels.push(sublevel);
        }
    }

    levels.extend(sublevels);
    levels.join(HIERARCHY_SEPARATOR)
}

/// Event fields for a click on the trackable element `node`
///
/// Extra data is merged last and may override any built-in field.
pub fn build_payload(document: &Document, node: NodeId) -> Result<TrackEvent, HarnessError> {
    let element = document.element(node);
    let marker = element.track.as_ref().ok_or(HarnessError::NotTrackable)?;
    let descriptor = TrackDescriptor::try_from(marker)?;
    let page = document.page().snapshot();

    let mut event = TrackEvent::new()
        .with("account", page.account_digest())
        .with("page_title", page.title)
        .with("event_type", "click")
        .with("event_name", descriptor.event_name)
        .with("page_name_lv", hierarchy(document, node))
        .with("element", element.tag.to_ascii_lowercase())
        .with("element_class", element.class_name());
    event.merge(TrackEvent::from(descriptor.extra));
    Ok(event)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessState {
    Uninstalled,
    Installed { rebinds: u64 },
    Disconnected,
}

struct HarnessInner {
    context: Arc<TrackingContext>,
    state: Mutex<HarnessState>,
    observer: Mutex<Option<ObserverHandle>>,
}

/// Installs and maintains the delegated click listener on a document
#[derive(Clone)]
pub struct ClickHarness {
    inner: Arc<HarnessInner>,
}

impl ClickHarness {
    pub fn new(context: Arc<TrackingContext>) -> Self {
        Self {
            inner: Arc::new(HarnessInner {
                context,
                state: Mutex::new(HarnessState::Uninstalled),
                observer: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> HarnessState {
        *self.lock_state()
    }

    fn lock_state(&self) -> MutexGuard<'_, HarnessState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_observer(&self) -> MutexGuard<'_, Option<ObserverHandle>> {
        self.inner.observer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the click listener and start watching the body
    ///
    /// Safe to call repeatedly: the listener is removed before it is added
    /// again and only one observer is ever kept.
    pub fn install(&self, document: &Document) {
        self.register(document);

        {
            let mut observer = self.lock_observer();
            if observer.is_none() {
                let harness = self.clone();
                *observer = Some(document.observe(
                    document.body(),
                    Arc::new(move |doc: &Document, _: &Mutation| harness.rebind(doc)),
                ));
            }
        }

        let mut state = self.lock_state();
        if !matches!(*state, HarnessState::Installed { .. }) {
            *state = HarnessState::Installed { rebinds: 0 };
        }
        debug!(listener = LISTENER_KEY, "click harness installed");
    }

    /// Re-register the listener after the tree changed
    pub fn rebind(&self, document: &Document) {
        let mut state = self.lock_state();
        if let HarnessState::Installed { rebinds } = &mut *state {
            self.register(document);
            *rebinds += 1;
        }
    }

    /// Stop reacting to tree changes
    ///
    /// The listener itself stays registered; only the observer goes away.
    pub fn disconnect(&self, document: &Document) {
        if let Some(handle) = self.lock_observer().take() {
            document.disconnect(handle);
        }
        *self.lock_state() = HarnessState::Disconnected;
        debug!("click harness disconnected");
    }

    fn register(&self, document: &Document) {
        document.remove_event_listener(LISTENER_KEY);
        document.add_event_listener(
            LISTENER_KEY,
            Phase::Capture,
            Arc::new(DelegatedClick {
                context: Arc::clone(&self.inner.context),
            }),
        );
    }
}

struct DelegatedClick {
    context: Arc<TrackingContext>,
}

impl ClickListener for DelegatedClick {
    fn on_click(&self, document: &Document, target: NodeId) -> Option<JoinHandle<()>> {
        let node = document.closest(target, Element::is_trackable)?;

        let fields = match build_payload(document, node) {
            Ok(fields) => fields,
            Err(err) => {
                error!(error = %err, "click not tracked");
                return None;
            }
        };

        let context = Arc::clone(&self.context);
        Some(tokio::spawn(async move {
            if let Err(err) = context.dispatch(fields).await {
                warn!(error = %err, "click not tracked, backend domain unavailable");
            }
        }))
    }
}
