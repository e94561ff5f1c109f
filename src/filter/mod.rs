//! Event filtering for projection sources.
//!
//! A filter has two passes: the source pass (is this stream, or its
//! category, part of the projection's input?) and the event pass (is this
//! event type handled?). Events failing either pass still advance the
//! unhandled-byte accounting in the subscription.

use std::collections::HashSet;

/// Category of a stream id: the part before the first dash.
///
/// `"account-123"` is in category `"account"`; streams without a dash have
/// no category.
pub fn category_of(stream_id: &str) -> Option<&str> {
    stream_id.split_once('-').map(|(category, _)| category)
}

/// Source and event-type filter for a projection.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    all_streams: bool,
    streams: HashSet<String>,
    categories: HashSet<String>,
    all_events: bool,
    event_types: HashSet<String>,
}

impl EventFilter {
    /// Pass everything.
    pub fn all() -> Self {
        Self {
            all_streams: true,
            all_events: true,
            ..Self::default()
        }
    }

    /// Pass all events from every stream, subject to a later event-type
    /// restriction.
    pub fn from_all_streams() -> Self {
        Self {
            all_streams: true,
            all_events: true,
            ..Self::default()
        }
    }

    /// Pass only the named streams.
    pub fn from_streams<I, S>(streams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            streams: streams.into_iter().map(Into::into).collect(),
            all_events: true,
            ..Self::default()
        }
    }

    /// Pass only streams in the named categories.
    pub fn from_categories<I, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            categories: categories.into_iter().map(Into::into).collect(),
            all_events: true,
            ..Self::default()
        }
    }

    /// Restrict to the named event types.
    pub fn with_event_types<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.all_events = false;
        self.event_types = event_types.into_iter().map(Into::into).collect();
        self
    }

    /// Source pass: does this stream feed the projection?
    pub fn passes_source(&self, stream_id: &str) -> bool {
        if self.all_streams {
            return true;
        }
        if self.streams.contains(stream_id) {
            return true;
        }
        match category_of(stream_id) {
            Some(category) => self.categories.contains(category),
            None => false,
        }
    }

    /// Event pass: is this event type handled?
    pub fn passes_event(&self, event_type: &str) -> bool {
        self.all_events || self.event_types.contains(event_type)
    }

    /// Both passes.
    pub fn passes(&self, stream_id: &str, event_type: &str) -> bool {
        self.passes_source(stream_id) && self.passes_event(event_type)
    }
}

#[cfg(test)]
mod tests;
