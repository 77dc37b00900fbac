use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The operator name used by clauses that reference segments by key.
pub const SEGMENT_MATCH_OP: &str = "segmentMatch";

/// A feature flag definition as delivered by the control plane.
///
/// Only the fields the data system itself inspects are modeled explicitly;
/// everything else rides along in `extra` so that items round-trip through
/// persistent stores without loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub key: String,
    pub version: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<FlagRule>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub on: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variations: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallthrough: Option<VariationOrRollout>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off_variation: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl FeatureFlag {
    /// A minimal flag that always serves `value`, used when promoting
    /// short-form `flagValues` entries from data files.
    pub fn always_on(key: impl Into<String>, value: Value) -> Self {
        FeatureFlag {
            key: key.into(),
            version: 1,
            deleted: false,
            prerequisites: Vec::new(),
            rules: Vec::new(),
            on: true,
            variations: vec![value],
            fallthrough: Some(VariationOrRollout { variation: Some(0), extra: BTreeMap::new() }),
            off_variation: None,
            salt: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Reference to another flag that must evaluate to a given variation first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prerequisite {
    pub key: String,
    pub variation: u64,
}

/// A targeting rule on a flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A single condition inside a rule. Clauses with op `segmentMatch` name
/// segment keys in `values`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clause {
    #[serde(default)]
    pub attribute: String,
    #[serde(default)]
    pub op: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub negate: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Clause {
    /// Segment keys referenced by this clause, if it is a segment-match
    /// clause; non-string values are skipped.
    pub fn segment_keys(&self) -> impl Iterator<Item = &str> {
        let matches = self.op == SEGMENT_MATCH_OP;
        self.values
            .iter()
            .filter(move |_| matches)
            .filter_map(Value::as_str)
    }
}

/// Fallthrough / rule outcome. Only the fixed-variation form is inspected;
/// rollouts are carried opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariationOrRollout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_fields_round_trip() {
        let raw = json!({
            "key": "flag-a",
            "version": 3,
            "on": true,
            "trackEvents": true,
            "clientSide": false,
        });
        let flag: FeatureFlag = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(flag.extra.get("trackEvents"), Some(&json!(true)));
        let back = serde_json::to_value(&flag).unwrap();
        assert_eq!(back.get("clientSide"), Some(&json!(false)));
    }

    #[test]
    fn segment_keys_only_for_segment_match() {
        let clause: Clause = serde_json::from_value(json!({
            "attribute": "",
            "op": "segmentMatch",
            "values": ["seg-1", "seg-2", 7],
        }))
        .unwrap();
        let keys: Vec<&str> = clause.segment_keys().collect();
        assert_eq!(keys, vec!["seg-1", "seg-2"]);

        let clause: Clause = serde_json::from_value(json!({
            "attribute": "email",
            "op": "in",
            "values": ["seg-1"],
        }))
        .unwrap();
        assert_eq!(clause.segment_keys().count(), 0);
    }

    #[test]
    fn always_on_flag_shape() {
        let flag = FeatureFlag::always_on("greeting", json!("hello"));
        assert_eq!(flag.version, 1);
        assert!(flag.on);
        assert_eq!(flag.variations, vec![json!("hello")]);
        assert_eq!(flag.fallthrough.unwrap().variation, Some(0));
    }
}
