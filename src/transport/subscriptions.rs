//! Per-connection MQTT subscription set

use std::collections::BTreeSet;

/// Topic filters a connection is subscribed to.
///
/// Owned by the transport, so it is discarded together with the connection.
#[derive(Debug, Default)]
pub struct SubscriptionFilter {
    filters: BTreeSet<String>,
}

impl SubscriptionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a filter, returning `false` if it was already present
    pub fn insert(&mut self, filter: &str) -> bool {
        self.filters.insert(filter.to_string())
    }

    /// Forget a filter, returning `false` if it was not present
    pub fn remove(&mut self, filter: &str) -> bool {
        self.filters.remove(filter)
    }

    /// Whether any recorded filter matches a concrete topic
    pub fn matches(&self, topic: &str) -> bool {
        self.filters
            .iter()
            .any(|filter| topic_matches(filter, topic))
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().map(String::as_str)
    }
}

/// MQTT filter matching: `+` matches one level, a trailing `#` matches the
/// rest including the parent level. Wildcards never match a leading `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_idempotent() {
        let mut filter = SubscriptionFilter::new();
        assert!(filter.insert("sensors/#"));
        assert!(!filter.insert("sensors/#"));
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn test_remove_unknown_filter() {
        let mut filter = SubscriptionFilter::new();
        assert!(!filter.remove("sensors/#"));
        filter.insert("sensors/#");
        assert!(filter.remove("sensors/#"));
        assert!(filter.is_empty());
    }

    #[test]
    fn test_iteration_is_sorted() {
        let mut filter = SubscriptionFilter::new();
        filter.insert("b/+");
        filter.insert("a/#");
        let all: Vec<&str> = filter.iter().collect();
        assert_eq!(all, vec!["a/#", "b/+"]);
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("sensors/#", "sensors/temp"));
        assert!(topic_matches("sensors/#", "sensors"));
        assert!(topic_matches("sensors/+/temp", "sensors/a/temp"));
        assert!(!topic_matches("sensors/+", "sensors/a/temp"));
        assert!(!topic_matches("other/#", "sensors/temp"));
        assert!(topic_matches("a/b", "a/b"));
        assert!(!topic_matches("#", "$SYS/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/uptime"));
    }

    #[test]
    fn test_set_matches_any_filter() {
        let mut filter = SubscriptionFilter::new();
        assert!(!filter.matches("sensors/temp"));
        filter.insert("alerts/+");
        filter.insert("sensors/#");
        assert!(filter.matches("sensors/temp"));
        assert!(filter.matches("alerts/fire"));
        assert!(!filter.matches("alerts/fire/now"));
    }
}
