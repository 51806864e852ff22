use std::collections::BTreeSet;

/// Set of ftrace event ids that are enabled.
///
/// One of these is kept centrally for what the kernel currently has enabled,
/// and one per data source for what that session asked for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventFilter {
    enabled: BTreeSet<usize>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_enabled_event(&mut self, ftrace_event_id: usize) {
        self.enabled.insert(ftrace_event_id);
    }

    pub fn disable_event(&mut self, ftrace_event_id: usize) {
        self.enabled.remove(&ftrace_event_id);
    }

    pub fn is_event_enabled(&self, ftrace_event_id: usize) -> bool {
        self.enabled.contains(&ftrace_event_id)
    }

    pub fn get_enabled_events(&self) -> BTreeSet<usize> {
        self.enabled.clone()
    }

    pub fn enable_events_from(&mut self, other: &EventFilter) {
        self.enabled.extend(other.enabled.iter().copied());
    }

    pub fn clear(&mut self) {
        self.enabled.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.enabled.is_empty()
    }
}
