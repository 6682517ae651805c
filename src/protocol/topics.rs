//! Topic canonicalization and MQTT filter matching
//!
//! Inbound topics are canonicalized before the address segment is extracted,
//! and republished topics are checked against the inbound subscription filter
//! so that the bridge never consumes its own output.

use thiserror::Error;

/// Canonicalize a broker topic: single leading slash, no empty segments,
/// no trailing slash (except for the root `/`).
pub fn canonicalize_topic(topic: &str) -> String {
    if topic.is_empty() {
        return "/".to_string();
    }

    let mut result = if topic.starts_with('/') {
        topic.to_string()
    } else {
        format!("/{topic}")
    };

    while result.contains("//") {
        result = result.replace("//", "/");
    }

    if result.len() > 1 && result.ends_with('/') {
        result.pop();
    }

    result
}

/// Check whether a concrete topic matches an MQTT subscription filter.
///
/// Implements the MQTT 3.1.1/5 matching rules for `+` (single level) and
/// `#` (multi level, last position only). Topics beginning with `$` are
/// not matched by filters starting with a wildcard.
pub fn topic_matches_filter(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validate a subscription filter's wildcard placement.
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::EmptyFilter);
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (position, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || position != levels.len() - 1) {
            return Err(TopicError::MisplacedWildcard(filter.to_string()));
        }
        if level.contains('+') && *level != "+" {
            return Err(TopicError::MisplacedWildcard(filter.to_string()));
        }
    }

    Ok(())
}

/// Validate a topic used for publishing (no wildcards, not empty).
pub fn validate_publish_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(TopicError::WildcardInTopic(topic.to_string()));
    }
    Ok(())
}

/// Topic validation errors
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Topic filter cannot be empty")]
    EmptyFilter,
    #[error("Topic cannot be empty")]
    EmptyTopic,
    #[error("Wildcard misplaced in topic filter '{0}'")]
    MisplacedWildcard(String),
    #[error("Publish topic '{0}' must not contain wildcards")]
    WildcardInTopic(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn canonicalize_topic_is_idempotent(topic in ".*") {
            let first = canonicalize_topic(&topic);
            let second = canonicalize_topic(&first);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn canonicalize_topic_has_no_empty_segments(topic in ".*") {
            let result = canonicalize_topic(&topic);
            prop_assert!(result.starts_with('/'));
            prop_assert!(!result.contains("//"), "No consecutive slashes allowed: {}", result);
            if result.len() > 1 {
                prop_assert!(!result.ends_with('/'));
            }
        }

        #[test]
        fn hash_filter_matches_everything_below_root(rest in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,4}") {
            let topic = format!("/{rest}");
            prop_assert!(topic_matches_filter("/#", &topic));
            prop_assert!(!topic_matches_filter("/#", &rest));
        }
    }

    #[test]
    fn test_canonicalize_examples() {
        assert_eq!(canonicalize_topic(""), "/");
        assert_eq!(canonicalize_topic("//"), "/");
        assert_eq!(canonicalize_topic("a/b/c"), "/a/b/c");
        assert_eq!(canonicalize_topic("//a//b//c//"), "/a/b/c");
        assert_eq!(canonicalize_topic("/addr/sensor1/"), "/addr/sensor1");
    }

    #[test]
    fn test_filter_matching() {
        assert!(topic_matches_filter("/#", "/aaaaa-aa/sensor"));
        assert!(topic_matches_filter("/#", "/"));
        assert!(topic_matches_filter("#", "out/aaaaa-aa/sensor"));
        assert!(topic_matches_filter("/+/sensor", "/aaaaa-aa/sensor"));
        assert!(!topic_matches_filter("/+/sensor", "/aaaaa-aa/other"));
        assert!(!topic_matches_filter("/+", "/aaaaa-aa/sensor"));
        assert!(topic_matches_filter("out/+/#", "out/aaaaa-aa/x/y"));
        assert!(!topic_matches_filter("/#", "out/aaaaa-aa/sensor"));
        assert!(!topic_matches_filter("#", "$SYS/broker/uptime"));
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter("/#").is_ok());
        assert!(validate_topic_filter("/+/status").is_ok());
        assert_eq!(validate_topic_filter(""), Err(TopicError::EmptyFilter));
        assert!(validate_topic_filter("/#/status").is_err());
        assert!(validate_topic_filter("/a#").is_err());
        assert!(validate_topic_filter("/a+/b").is_err());
    }

    #[test]
    fn test_validate_publish_topic() {
        assert!(validate_publish_topic("presence").is_ok());
        assert_eq!(validate_publish_topic(""), Err(TopicError::EmptyTopic));
        assert!(validate_publish_topic("out/#").is_err());
    }
}
