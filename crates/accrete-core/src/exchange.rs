//! The message envelope that flows through the aggregator.
//!
//! An [`Exchange`] carries an opaque JSON body, a header bag and a set of
//! typed properties. The aggregator attaches its bookkeeping (aggregated
//! size, correlation key, completion reason, timeout) as properties.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Header bag.
pub type Headers = BTreeMap<String, Value>;

/// Well-known header names.
pub mod headers {
    /// Force completion of all groups; the carrying message is not aggregated.
    pub const COMPLETE_ALL_GROUPS: &str = "AccreteAggregationCompleteAllGroups";
    /// Aggregate the carrying message, then force completion of all groups.
    pub const COMPLETE_ALL_GROUPS_INCLUSIVE: &str = "AccreteAggregationCompleteAllGroupsInclusive";
    /// Complete the carrying message's group right after this merge.
    pub const COMPLETE_CURRENT_GROUP: &str = "AccreteAggregationCompleteCurrentGroup";
    /// Set on exchanges re-delivered by the recovery task.
    pub const REDELIVERED: &str = "AccreteRedelivered";
    /// Recovery attempt number.
    pub const REDELIVERY_COUNTER: &str = "AccreteRedeliveryCounter";
    /// Maximum recovery attempts before dead-lettering.
    pub const REDELIVERY_MAX_COUNTER: &str = "AccreteRedeliveryMaxCounter";
}

/// Unique identifier for an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExchangeId(Uuid);

impl ExchangeId {
    /// Creates a new random exchange identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ExchangeId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Why a group was completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionReason {
    /// Completion size reached
    Size,
    /// Completion predicate matched
    Predicate,
    /// Batch consumer boundary
    Consumer,
    /// Strategy signalled completion (pre-completion, complete-current-group or discard)
    Strategy,
    /// Periodic interval sweep
    Interval,
    /// Inactivity timeout
    Timeout,
    /// Forced completion
    Force,
}

impl CompletionReason {
    /// All reasons, in reporting order.
    pub const ALL: [CompletionReason; 7] = [
        CompletionReason::Size,
        CompletionReason::Predicate,
        CompletionReason::Consumer,
        CompletionReason::Strategy,
        CompletionReason::Interval,
        CompletionReason::Timeout,
        CompletionReason::Force,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionReason::Size => "size",
            CompletionReason::Predicate => "predicate",
            CompletionReason::Consumer => "consumer",
            CompletionReason::Strategy => "strategy",
            CompletionReason::Interval => "interval",
            CompletionReason::Timeout => "timeout",
            CompletionReason::Force => "force",
        }
    }
}

impl fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed side-channel attached to an exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangeProperties {
    /// Number of input messages merged into this exchange
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated_size: Option<usize>,

    /// Correlation key of the group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,

    /// Reason the group completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<CompletionReason>,

    /// Inactivity timeout applied to the group, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_millis: Option<u64>,

    /// Size of the batch this exchange was consumed in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Complete the current group after this merge
    #[serde(default)]
    pub complete_current_group: bool,

    /// Force completion of all groups
    #[serde(default)]
    pub complete_all_groups: bool,

    /// Free-form properties
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

/// A message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    #[serde(default)]
    id: ExchangeId,

    /// Id of the exchange this one was copied from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<ExchangeId>,

    /// Message body
    #[serde(default)]
    pub body: Value,

    /// Message headers
    #[serde(default)]
    pub headers: Headers,

    /// Typed properties
    #[serde(default)]
    pub properties: ExchangeProperties,

    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
}

impl Exchange {
    /// Creates a new exchange with the given body.
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            id: ExchangeId::new(),
            correlation_id: None,
            body: body.into(),
            headers: Headers::new(),
            properties: ExchangeProperties::default(),
            created_at: Utc::now(),
        }
    }

    /// Builder-style header setter.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn id(&self) -> ExchangeId {
        self.id
    }

    pub fn correlation_id(&self) -> Option<ExchangeId> {
        self.correlation_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.remove(name)
    }

    /// Reads a header as a flag. Accepts JSON booleans and the strings "true"/"false".
    pub fn header_flag(&self, name: &str) -> bool {
        match self.headers.get(name) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// Returns the body as text: strings verbatim, anything else as compact JSON.
    pub fn body_text(&self) -> String {
        match &self.body {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// Creates a copy with a fresh id that remembers where it came from.
    ///
    /// The copy shares nothing with the source, so merging it never mutates
    /// the caller's exchange.
    pub fn correlated_copy(&self) -> Self {
        Self {
            id: ExchangeId::new(),
            correlation_id: Some(self.id),
            body: self.body.clone(),
            headers: self.headers.clone(),
            properties: self.properties.clone(),
            created_at: self.created_at,
        }
    }

    /// True if the message asks for all groups to be completed without itself being aggregated.
    pub fn is_complete_all_groups(&self) -> bool {
        self.header_flag(headers::COMPLETE_ALL_GROUPS) || self.properties.complete_all_groups
    }

    /// True if the message asks for all groups to be completed after it is aggregated.
    pub fn is_complete_all_groups_inclusive(&self) -> bool {
        self.header_flag(headers::COMPLETE_ALL_GROUPS_INCLUSIVE)
    }

    /// True if the message asks for its own group to be completed after the merge.
    pub fn is_complete_current_group(&self) -> bool {
        self.header_flag(headers::COMPLETE_CURRENT_GROUP) || self.properties.complete_current_group
    }

    /// Removes every aggregation control signal.
    pub fn clear_control_flags(&mut self) {
        self.headers.remove(headers::COMPLETE_ALL_GROUPS);
        self.headers.remove(headers::COMPLETE_ALL_GROUPS_INCLUSIVE);
        self.headers.remove(headers::COMPLETE_CURRENT_GROUP);
        self.properties.complete_all_groups = false;
        self.properties.complete_current_group = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_correlated_copy_is_independent() {
        let original = Exchange::new("a").with_header("symbol", "ACME");
        let mut copy = original.correlated_copy();

        assert_ne!(copy.id(), original.id());
        assert_eq!(copy.correlation_id(), Some(original.id()));

        copy.body = json!("b");
        copy.set_header("symbol", "OTHER");
        assert_eq!(original.body, json!("a"));
        assert_eq!(original.header("symbol"), Some(&json!("ACME")));
    }

    #[test]
    fn test_header_flag_parsing() {
        let ex = Exchange::new(Value::Null)
            .with_header(headers::COMPLETE_ALL_GROUPS, "TRUE")
            .with_header(headers::COMPLETE_CURRENT_GROUP, false);
        assert!(ex.is_complete_all_groups());
        assert!(!ex.is_complete_current_group());
        assert!(!ex.is_complete_all_groups_inclusive());
    }

    #[test]
    fn test_clear_control_flags() {
        let mut ex = Exchange::new("x")
            .with_header(headers::COMPLETE_ALL_GROUPS, true)
            .with_header(headers::COMPLETE_ALL_GROUPS_INCLUSIVE, true);
        ex.properties.complete_current_group = true;

        ex.clear_control_flags();
        assert!(!ex.is_complete_all_groups());
        assert!(!ex.is_complete_all_groups_inclusive());
        assert!(!ex.is_complete_current_group());
    }

    #[test]
    fn test_body_text() {
        assert_eq!(Exchange::new("END").body_text(), "END");
        assert_eq!(Exchange::new(json!([1, 2])).body_text(), "[1,2]");
        assert_eq!(Exchange::new(Value::Null).body_text(), "");
    }

    #[test]
    fn test_deserialize_minimal_json() {
        let ex: Exchange = serde_json::from_str(r#"{"body": "hi", "headers": {"k": "A"}}"#).unwrap();
        assert_eq!(ex.body, json!("hi"));
        assert_eq!(ex.header("k"), Some(&json!("A")));
        assert_eq!(ex.properties.aggregated_size, None);
    }

    #[test]
    fn test_completion_reason_display() {
        assert_eq!(CompletionReason::Timeout.to_string(), "timeout");
        let json = serde_json::to_string(&CompletionReason::Force).unwrap();
        assert_eq!(json, "\"force\"");
    }
}
