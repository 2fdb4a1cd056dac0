//! Topic patterns: regular expressions matched against the whole topic.

use std::fmt;

use regex::Regex;

/// A compiled topic pattern.
///
/// Matching is anchored at both ends, so `users/.*` matches `users/user` but
/// not `groups/users/x`.
#[derive(Clone)]
pub struct TopicPattern {
    source: String,
    regex: Regex,
}

impl TopicPattern {
    /// Compile a pattern. Fails with the regex parser's message.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!("^(?:{pattern})$"))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Whether the pattern matches the entire topic.
    pub fn full_match(&self, topic: &str) -> bool {
        self.regex.is_match(topic)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TopicPattern").field(&self.source).finish()
    }
}

impl PartialEq for TopicPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for TopicPattern {}

/// Whether a subscription entry `(sub_realm, sub_pattern)` receives an event
/// published under `(realm, topic)`.
///
/// Realms compare exactly; the topic must fully match the pattern. An invalid
/// pattern matches nothing.
pub fn topic_matches(sub_realm: &str, sub_pattern: &str, realm: &str, topic: &str) -> bool {
    if sub_realm != realm {
        return false;
    }
    TopicPattern::new(sub_pattern).is_ok_and(|pattern| pattern.full_match(topic))
}
