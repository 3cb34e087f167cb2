//! Headless document model
//!
//! Just enough of a DOM for click delegation: an arena of elements with
//! parent links, a listener registry with capture and bubble phases, and
//! subtree mutation observers that fire after structural changes.

mod element;

pub use element::{Element, TrackMarker};

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::models::PageHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Capture,
    Bubble,
}

/// Structural change reported to mutation observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Added { parent: NodeId, node: NodeId },
    Removed { parent: NodeId, node: NodeId },
}

impl Mutation {
    pub fn parent(&self) -> NodeId {
        match self {
            Mutation::Added { parent, .. } | Mutation::Removed { parent, .. } => *parent,
        }
    }
}

/// Receives clicks dispatched on the document
///
/// Work that outlives the synchronous dispatch (network calls) is spawned
/// and its handle returned so callers can await it.
pub trait ClickListener: Send + Sync {
    fn on_click(&self, document: &Document, target: NodeId) -> Option<JoinHandle<()>>;
}

pub type MutationCallback = Arc<dyn Fn(&Document, &Mutation) + Send + Sync>;

/// Registration handle returned by [`Document::observe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

struct Registration {
    phase: Phase,
    listener: Arc<dyn ClickListener>,
}

struct Observer {
    target: NodeId,
    callback: MutationCallback,
}

struct Node {
    element: Element,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

pub struct Document {
    nodes: Vec<Node>,
    root: NodeId,
    body: NodeId,
    page: PageHandle,
    listeners: DashMap<String, Registration>,
    observers: DashMap<u64, Observer>,
    next_observer: AtomicU64,
}

impl Document {
    /// An `html` root holding an empty `body`
    pub fn new(page: PageHandle) -> Self {
        let mut doc = Self {
            nodes: Vec::new(),
            root: NodeId(0),
            body: NodeId(0),
            page,
            listeners: DashMap::new(),
            observers: DashMap::new(),
            next_observer: AtomicU64::new(1),
        };
        let root = doc.alloc(Element::new("html"), None);
        let body = doc.alloc(Element::new("body"), Some(root));
        doc.nodes[root.0].children.push(body);
        doc.root = root;
        doc.body = body;
        doc
    }

    fn alloc(&mut self, element: Element, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            element,
            parent,
            children: Vec::new(),
        });
        id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    /// Detached element; attach it with [`Document::append_child`]
    pub fn create_element(&self, tag: &str) -> Element {
        Element::new(tag.to_ascii_lowercase())
    }

    pub fn page(&self) -> &PageHandle {
        &self.page
    }

    pub fn element(&self, id: NodeId) -> &Element {
        &self.nodes[id.0].element
    }

    pub fn element_mut(&mut self, id: NodeId) -> &mut Element {
        &mut self.nodes[id.0].element
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    /// `id` followed by each of its ancestors up to the root
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(Some(id), move |n| self.parent(*n))
    }

    /// Nearest element, starting at `id` itself, that satisfies `pred`
    pub fn closest(&self, id: NodeId, pred: impl Fn(&Element) -> bool) -> Option<NodeId> {
        self.ancestors(id).find(|n| pred(self.element(*n)))
    }

    /// Whether `node` is `ancestor` or lies in its subtree
    pub fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        self.ancestors(node).any(|n| n == ancestor)
    }

    /// Whether `node` is currently part of the document tree
    pub fn is_connected(&self, node: NodeId) -> bool {
        self.contains(self.root, node)
    }

    pub fn get_element_by_id(&self, html_id: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, _)| NodeId(i))
            .filter(|n| self.is_connected(*n))
            .find(|n| self.element(*n).id.as_deref() == Some(html_id))
    }

    /// Insert `element` as the last child of `parent` and notify observers
    pub fn append_child(&mut self, parent: NodeId, element: Element) -> NodeId {
        let node = self.alloc(element, Some(parent));
        self.nodes[parent.0].children.push(node);
        self.notify(Mutation::Added { parent, node });
        node
    }

    /// Detach `node` (and its subtree) from its parent
    ///
    /// Returns false for the root or an already detached node.
    pub fn remove(&mut self, node: NodeId) -> bool {
        let Some(parent) = self.parent(node) else {
            return false;
        };
        self.nodes[parent.0].children.retain(|c| *c != node);
        self.nodes[node.0].parent = None;
        self.notify(Mutation::Removed { parent, node });
        true
    }

    /// Register `listener` under `key`, replacing any listener with the same key
    pub fn add_event_listener(&self, key: &str, phase: Phase, listener: Arc<dyn ClickListener>) {
        self.listeners
            .insert(key.to_string(), Registration { phase, listener });
    }

    pub fn remove_event_listener(&self, key: &str) -> bool {
        self.listeners.remove(key).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Dispatch a click on `target`: capture listeners first, then bubble
    ///
    /// Returns the handles of any work the listeners spawned.
    pub fn click(&self, target: NodeId) -> Vec<JoinHandle<()>> {
        let mut capture = Vec::new();
        let mut bubble = Vec::new();
        for entry in self.listeners.iter() {
            let listener = Arc::clone(&entry.value().listener);
            match entry.value().phase {
                Phase::Capture => capture.push(listener),
                Phase::Bubble => bubble.push(listener),
            }
        }

        trace!(?target, listeners = capture.len() + bubble.len(), "dispatching click");
        capture
            .into_iter()
            .chain(bubble)
            .filter_map(|listener| listener.on_click(self, target))
            .collect()
    }

    /// Watch `target` and its whole subtree for child insertions and removals
    pub fn observe(&self, target: NodeId, callback: MutationCallback) -> ObserverHandle {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        self.observers.insert(id, Observer { target, callback });
        ObserverHandle(id)
    }

    pub fn disconnect(&self, handle: ObserverHandle) -> bool {
        self.observers.remove(&handle.0).is_some()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    fn notify(&self, mutation: Mutation) {
        let interested: Vec<MutationCallback> = self
            .observers
            .iter()
            .filter(|entry| self.contains(entry.value().target, mutation.parent()))
            .map(|entry| Arc::clone(&entry.value().callback))
            .collect();

        for callback in interested {
            callback(self, &mutation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PageInfo;
    use std::sync::atomic::AtomicUsize;

    fn document() -> Document {
        Document::new(PageHandle::new(PageInfo::new("https://site.example/", "ua")))
    }

    struct Recorder {
        label: &'static str,
        log: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    impl ClickListener for Recorder {
        fn on_click(&self, _: &Document, _: NodeId) -> Option<JoinHandle<()>> {
            self.log.lock().unwrap().push(self.label);
            None
        }
    }

    #[test]
    fn closest_is_inclusive_and_walks_up() {
        let mut doc = document();
        let section = doc.append_child(doc.body(), Element::new("section").id("shop"));
        let button = doc.append_child(section, Element::new("button"));

        assert_eq!(doc.closest(button, |e| e.tag == "button"), Some(button));
        assert_eq!(doc.closest(button, |e| e.tag == "section"), Some(section));
        assert_eq!(doc.closest(button, |e| e.tag == "table"), None);
        assert_eq!(doc.get_element_by_id("shop"), Some(section));
    }

    #[test]
    fn capture_listeners_run_before_bubble() {
        let doc = document();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        doc.add_event_listener(
            "late",
            Phase::Bubble,
            Arc::new(Recorder { label: "bubble", log: log.clone() }),
        );
        doc.add_event_listener(
            "early",
            Phase::Capture,
            Arc::new(Recorder { label: "capture", log: log.clone() }),
        );

        doc.click(doc.body());
        assert_eq!(*log.lock().unwrap(), ["capture", "bubble"]);
    }

    #[test]
    fn same_key_replaces_listener() {
        let doc = document();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        for _ in 0..3 {
            doc.add_event_listener(
                "k",
                Phase::Capture,
                Arc::new(Recorder { label: "k", log: log.clone() }),
            );
        }

        doc.click(doc.body());
        assert_eq!(doc.listener_count(), 1);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn observers_see_deep_mutations_until_disconnected() {
        let mut doc = document();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handle = doc.observe(
            doc.body(),
            Arc::new(move |_: &Document, _: &Mutation| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let list = doc.append_child(doc.body(), Element::new("ul"));
        let item = doc.append_child(list, Element::new("li"));
        assert!(doc.remove(item));
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        assert!(doc.disconnect(handle));
        doc.append_child(list, Element::new("li"));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn removed_subtree_is_disconnected() {
        let mut doc = document();
        let list = doc.append_child(doc.body(), Element::new("ul"));
        let item = doc.append_child(list, Element::new("li").id("x"));

        assert!(doc.remove(list));
        assert!(!doc.is_connected(item));
        assert_eq!(doc.get_element_by_id("x"), None);
        assert!(!doc.remove(list));
        assert!(!doc.remove(doc.root()));
    }
}
