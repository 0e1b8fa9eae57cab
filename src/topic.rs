//! Topic name and filter handling
//!
//! Topics are opaque `/`-separated strings. Publish topics must be exact
//! names; subscribe filters may use the `+` (single level) and `#`
//! (terminal multi-level) wildcards. Validation here is syntactic only.

use crate::error::SessionError;

/// Validate a topic name for publishing (no wildcards allowed)
pub fn validate_topic_name(topic: &str) -> Result<(), SessionError> {
    if topic.is_empty() {
        return Err(SessionError::InvalidTopic("empty topic".to_string()));
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(SessionError::InvalidTopic(format!(
            "wildcards not allowed in publish topic: {topic}"
        )));
    }
    Ok(())
}

/// Validate a topic filter for subscribing
///
/// `+` must occupy a whole level; `#` must occupy the final level.
pub fn validate_topic_filter(filter: &str) -> Result<(), SessionError> {
    if filter.is_empty() {
        return Err(SessionError::InvalidTopic("empty filter".to_string()));
    }

    let segments: Vec<&str> = filter.split('/').collect();
    for (i, segment) in segments.iter().enumerate() {
        let is_last = i == segments.len() - 1;
        if segment.contains('#') {
            if *segment != "#" || !is_last {
                return Err(SessionError::InvalidTopic(format!(
                    "'#' must be the final level: {filter}"
                )));
            }
        } else if segment.contains('+') && *segment != "+" {
            return Err(SessionError::InvalidTopic(format!(
                "'+' must occupy a whole level: {filter}"
            )));
        }
    }
    Ok(())
}

/// Check whether a topic name matches a subscription filter
///
/// `+` matches exactly one level; `#` matches the remainder of the path,
/// including the parent level itself (`a/#` matches `a`).
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut filter_segments = filter.split('/');
    let mut topic_segments = topic.split('/');

    loop {
        match (filter_segments.next(), topic_segments.next()) {
            // "a/#" also matches "a": the '#' level may match zero levels
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("topic_1").is_ok());
        assert!(validate_topic_name("sensors/room1/temperature").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("sensors/+/temperature").is_err());
        assert!(validate_topic_name("sensors/#").is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter("topic_1").is_ok());
        assert!(validate_topic_filter("sensors/+/temperature").is_ok());
        assert!(validate_topic_filter("sensors/#").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("+").is_ok());

        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("sensors/#/temperature").is_err());
        assert!(validate_topic_filter("sensors/temp#").is_err());
        assert!(validate_topic_filter("sensors/te+mp").is_err());
    }

    #[test]
    fn test_exact_match() {
        assert!(filter_matches("topic_1", "topic_1"));
        assert!(!filter_matches("topic_1", "topic_2"));
        assert!(!filter_matches("a/b", "a"));
        assert!(!filter_matches("a", "a/b"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(filter_matches("sensors/+/temperature", "sensors/room1/temperature"));
        assert!(!filter_matches("sensors/+/temperature", "sensors/room1/humidity"));
        assert!(!filter_matches("sensors/+", "sensors/room1/temperature"));
        assert!(filter_matches("+", "anything"));
        assert!(!filter_matches("+", "a/b"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(filter_matches("sensors/#", "sensors/room1/temperature"));
        assert!(filter_matches("sensors/#", "sensors"));
        assert!(filter_matches("#", "a/b/c"));
        assert!(!filter_matches("sensors/#", "actuators/room1"));
    }
}
