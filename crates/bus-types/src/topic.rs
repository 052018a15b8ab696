//! # Topics and Patterns
//!
//! A topic is a dot-separated string such as `system.plugins.loaded`. A
//! pattern is a topic whose segments may be wildcards:
//!
//! - `*` matches exactly one segment.
//! - `**` matches one or more trailing segments. It is the only
//!   multi-segment wildcard and is legal only as the final segment.
//!
//! Segment counts must match exactly unless the pattern ends in `**`.

use crate::errors::BusError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Segment separator.
pub const SEPARATOR: char = '.';

/// Single-segment wildcard.
pub const WILDCARD: &str = "*";

/// Trailing multi-segment wildcard.
pub const MULTI_WILDCARD: &str = "**";

/// First segment of topics reserved for bus-internal routing.
pub const RESERVED_PREFIX: &str = "_bus";

fn validate_segments(raw: &str, allow_wildcards: bool) -> Result<(), BusError> {
    if raw.is_empty() {
        return Err(BusError::InvalidMessage("empty topic".to_string()));
    }
    if raw.chars().any(char::is_whitespace) {
        return Err(BusError::InvalidMessage(format!(
            "topic '{raw}' contains whitespace"
        )));
    }

    let segments: Vec<&str> = raw.split(SEPARATOR).collect();
    let last = segments.len() - 1;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            return Err(BusError::InvalidMessage(format!(
                "topic '{raw}' has an empty segment"
            )));
        }
        let is_wildcard = *segment == WILDCARD || *segment == MULTI_WILDCARD;
        if !is_wildcard && segment.contains('*') {
            return Err(BusError::InvalidMessage(format!(
                "segment '{segment}' mixes a wildcard with literal text"
            )));
        }
        if is_wildcard && !allow_wildcards {
            return Err(BusError::InvalidMessage(format!(
                "topic '{raw}' contains a wildcard"
            )));
        }
        if *segment == MULTI_WILDCARD && i != last {
            return Err(BusError::InvalidMessage(format!(
                "'**' must be the final segment of '{raw}'"
            )));
        }
    }
    Ok(())
}

/// A concrete, wildcard-free topic.
///
/// Immutable once created; cloning shares the underlying string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(Arc<str>);

impl Topic {
    /// Parse a user-facing topic. Rejects wildcards and the reserved prefix.
    pub fn parse(raw: &str) -> Result<Self, BusError> {
        validate_segments(raw, false)?;
        let topic = Self(Arc::from(raw));
        if topic.is_internal() {
            return Err(BusError::InvalidMessage(format!(
                "topic '{raw}' uses the reserved '{RESERVED_PREFIX}' prefix"
            )));
        }
        Ok(topic)
    }

    /// Build a topic under the reserved prefix.
    pub fn internal(suffix: &str) -> Result<Self, BusError> {
        let raw = format!("{RESERVED_PREFIX}{SEPARATOR}{suffix}");
        validate_segments(&raw, false)?;
        Ok(Self(Arc::from(raw)))
    }

    /// The topic as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the topic segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }

    /// Whether the topic lives under the reserved prefix.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.segments().next() == Some(RESERVED_PREFIX)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Topic {
    type Error = BusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.0.to_string()
    }
}

/// One compiled pattern segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(Box<str>),
    Any,
    Rest,
}

/// A subscription pattern, possibly containing wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    raw: Arc<str>,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Parse a pattern. Literal-only patterns are exact topics.
    pub fn parse(raw: &str) -> Result<Self, BusError> {
        validate_segments(raw, true)?;
        let segments: Vec<Segment> = raw
            .split(SEPARATOR)
            .map(|s| match s {
                WILDCARD => Segment::Any,
                MULTI_WILDCARD => Segment::Rest,
                literal => Segment::Literal(literal.into()),
            })
            .collect();

        if matches!(segments.first(), Some(Segment::Literal(s)) if &**s == RESERVED_PREFIX) {
            return Err(BusError::InvalidMessage(format!(
                "pattern '{raw}' uses the reserved '{RESERVED_PREFIX}' prefix"
            )));
        }

        Ok(Self {
            raw: Arc::from(raw),
            segments,
        })
    }

    /// An exact pattern for an already validated topic.
    #[must_use]
    pub fn exact(topic: &Topic) -> Self {
        Self {
            raw: Arc::from(topic.as_str()),
            segments: topic
                .segments()
                .map(|s| Segment::Literal(s.into()))
                .collect(),
        }
    }

    /// The pattern as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the pattern has no wildcard segment.
    #[must_use]
    pub fn is_exact(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Segment-by-segment match against a concrete topic.
    #[must_use]
    pub fn matches(&self, topic: &Topic) -> bool {
        let mut topic_segments = topic.segments();
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Rest => {
                    debug_assert_eq!(i, self.segments.len() - 1);
                    return topic_segments.next().is_some();
                }
                Segment::Any => {
                    if topic_segments.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(expected) => match topic_segments.next() {
                    Some(actual) if actual == &**expected => {}
                    _ => return false,
                },
            }
        }
        topic_segments.next().is_none()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
