//! Subscription patterns
//!
//! A subscription carries one `Pattern`; the router evaluates it against each
//! envelope through the single `matches` dispatch below. Exact and regex
//! patterns test the payload `type` and the rendered target; predicates see
//! the whole envelope; field matches compare shallow equality against the
//! envelope's own fields and the payload object.

use std::sync::Arc;

use regex::Regex;
use serde_json::Value;

use crate::message::MessageEnvelope;

/// Predicate over a full envelope
pub type EnvelopePredicate = Arc<dyn Fn(&MessageEnvelope) -> bool + Send + Sync>;

/// What a subscription matches on
#[derive(Clone)]
pub enum Pattern {
    /// Exact string equality against the payload `type` or the target
    Exact(String),
    /// Regular expression tested against the payload `type` or the target
    Regex(Regex),
    /// Arbitrary predicate applied to the full envelope
    Predicate(EnvelopePredicate),
    /// Shallow field equality against the envelope and payload
    Fields(serde_json::Map<String, Value>),
}

impl Pattern {
    /// Exact-match pattern
    pub fn exact(s: impl Into<String>) -> Self {
        Pattern::Exact(s.into())
    }

    /// Compile a regex pattern
    pub fn regex(s: &str) -> Result<Self, crate::BrokerError> {
        Ok(Pattern::Regex(Regex::new(s)?))
    }

    /// Predicate pattern
    pub fn predicate(f: impl Fn(&MessageEnvelope) -> bool + Send + Sync + 'static) -> Self {
        Pattern::Predicate(Arc::new(f))
    }

    /// Field-equality pattern built from a JSON object
    ///
    /// Non-object values produce an empty map, which matches nothing.
    pub fn fields(value: Value) -> Self {
        match value {
            Value::Object(map) => Pattern::Fields(map),
            _ => Pattern::Fields(serde_json::Map::new()),
        }
    }

    /// Evaluate this pattern against an envelope
    pub fn matches(&self, envelope: &MessageEnvelope) -> bool {
        match self {
            Pattern::Exact(s) => {
                envelope.message_type() == Some(s.as_str()) || envelope.to.to_string() == *s
            }
            Pattern::Regex(re) => {
                envelope.message_type().is_some_and(|t| re.is_match(t))
                    || re.is_match(&envelope.to.to_string())
            }
            Pattern::Predicate(f) => f(envelope),
            Pattern::Fields(map) => {
                !map.is_empty() && map.iter().all(|(k, v)| field_eq(envelope, k, v))
            }
        }
    }
}

/// Compare one expected field against the envelope
///
/// The envelope's own fields (`id`, `from`, `to`, `type`) take precedence;
/// any other key is looked up in the payload object.
fn field_eq(envelope: &MessageEnvelope, key: &str, expected: &Value) -> bool {
    let expected_str = expected.as_str();
    match key {
        "id" => expected_str == Some(envelope.id.as_str()),
        "from" => expected_str == Some(envelope.from.as_str()),
        "to" => expected_str.is_some_and(|s| envelope.to.to_string() == s),
        "type" => expected_str == envelope.message_type(),
        _ => envelope.message.get(key) == Some(expected),
    }
}

impl std::fmt::Debug for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pattern::Exact(s) => f.debug_tuple("Exact").field(s).finish(),
            Pattern::Regex(re) => f.debug_tuple("Regex").field(&re.as_str()).finish(),
            Pattern::Predicate(_) => f.write_str("Predicate(..)"),
            Pattern::Fields(map) => f.debug_tuple("Fields").field(map).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Target;
    use serde_json::json;

    fn envelope(message: Value) -> MessageEnvelope {
        MessageEnvelope::new("w1", Target::Channel("c1".to_string()), message)
    }

    #[test]
    fn test_exact_matches_type_or_target() {
        let env = envelope(json!({"type": "ping"}));
        assert!(Pattern::exact("ping").matches(&env));
        assert!(Pattern::exact("channel:c1").matches(&env));
        assert!(!Pattern::exact("pong").matches(&env));
    }

    #[test]
    fn test_regex_matches_type_or_target() {
        let env = envelope(json!({"type": "metrics.updated"}));
        assert!(Pattern::regex(r"^metrics\.").unwrap().matches(&env));
        assert!(Pattern::regex("^channel:c").unwrap().matches(&env));
        assert!(!Pattern::regex("^alerts").unwrap().matches(&env));
    }

    #[test]
    fn test_invalid_regex_rejected() {
        assert!(Pattern::regex("[unclosed").is_err());
    }

    #[test]
    fn test_predicate_sees_full_envelope() {
        let env = envelope(json!({"level": 3}));
        let p = Pattern::predicate(|e| {
            e.from == "w1" && e.message.get("level").and_then(|v| v.as_i64()) == Some(3)
        });
        assert!(p.matches(&env));
    }

    #[test]
    fn test_fields_shallow_equality() {
        let env = envelope(json!({"type": "alert", "severity": "high"}));
        assert!(Pattern::fields(json!({"type": "alert", "severity": "high"})).matches(&env));
        assert!(Pattern::fields(json!({"from": "w1"})).matches(&env));
        assert!(!Pattern::fields(json!({"severity": "low"})).matches(&env));
        // Empty or non-object field patterns match nothing
        assert!(!Pattern::fields(json!({})).matches(&env));
        assert!(!Pattern::fields(json!("alert")).matches(&env));
    }
}
