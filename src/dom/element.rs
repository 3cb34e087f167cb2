/// Markup-level trackable marker: an event name plus optional raw JSON
///
/// The extra data is kept as written; it is only parsed when a click is
/// tracked, so a malformed blob affects that element's events alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackMarker {
    pub event_name: String,
    pub extra: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub tag: String,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub track: Option<TrackMarker>,
    pub page_level: Option<String>,
    pub page_sublevel: Option<String>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            id: None,
            classes: Vec::new(),
            track: None,
            page_level: None,
            page_sublevel: None,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Add one or more whitespace-separated classes
    pub fn class(mut self, classes: &str) -> Self {
        self.classes
            .extend(classes.split_whitespace().map(str::to_string));
        self
    }

    /// Mark the element trackable under `event_name`
    pub fn track(mut self, event_name: impl Into<String>) -> Self {
        self.track = Some(TrackMarker {
            event_name: event_name.into(),
            extra: None,
        });
        self
    }

    /// Attach raw extra-data JSON; only meaningful on a trackable element
    pub fn track_extra(mut self, json: impl Into<String>) -> Self {
        if let Some(marker) = self.track.as_mut() {
            marker.extra = Some(json.into());
        }
        self
    }

    pub fn page_level(mut self, level: impl Into<String>) -> Self {
        self.page_level = Some(level.into());
        self
    }

    pub fn page_sublevel(mut self, level: impl Into<String>) -> Self {
        self.page_sublevel = Some(level.into());
        self
    }

    pub fn is_trackable(&self) -> bool {
        self.track.is_some()
    }

    /// The class attribute as written: classes joined by single spaces
    pub fn class_name(&self) -> String {
        self.classes.join(" ")
    }
}
