//! Core types shared by research agents and structurers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Keys under which agents and LLMs commonly wrap their item lists.
const WRAPPER_KEYS: &[&str] = &["leads", "results", "items", "data"];

/// Research agent kinds every query can be fanned out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Organization pages on LinkedIn.
    Linkedin,
    /// Business pages on Facebook.
    Facebook,
    /// Official company websites.
    Website,
    /// Map listings.
    Gmap,
}

impl AgentKind {
    /// Returns every agent kind in fan-out order.
    pub fn all() -> &'static [AgentKind] {
        &[
            AgentKind::Linkedin,
            AgentKind::Facebook,
            AgentKind::Website,
            AgentKind::Gmap,
        ]
    }

    /// Stable label used in records, logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Linkedin => "linkedin",
            AgentKind::Facebook => "facebook",
            AgentKind::Website => "website",
            AgentKind::Gmap => "gmap",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "linkedin" => Ok(AgentKind::Linkedin),
            "facebook" => Ok(AgentKind::Facebook),
            "website" => Ok(AgentKind::Website),
            "gmap" | "gmaps" | "maps" => Ok(AgentKind::Gmap),
            other => Err(format!(
                "unknown agent kind '{}', expected one of linkedin, facebook, website, gmap",
                other
            )),
        }
    }
}

/// Raw output of one research stage, classified by shape.
///
/// Agents return a bare object, a bare list, or a list wrapped under a
/// well-known key. The gate matches on the variant instead of probing
/// JSON at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    /// One item (object, or text the agent could not format).
    SingleItem(Value),
    /// A bare list of items.
    ItemList(Vec<Value>),
    /// A list found under `key` of a wrapper object.
    Wrapped { key: String, items: Vec<Value> },
}

impl RawPayload {
    /// Classifies a JSON value.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Array(items) => RawPayload::ItemList(items),
            Value::Object(mut map) => {
                let key = WRAPPER_KEYS
                    .iter()
                    .find(|key| matches!(map.get(**key), Some(Value::Array(_))));
                match key {
                    Some(key) => {
                        let items = match map.remove(*key) {
                            Some(Value::Array(items)) => items,
                            _ => Vec::new(),
                        };
                        RawPayload::Wrapped {
                            key: (*key).to_string(),
                            items,
                        }
                    }
                    None => RawPayload::SingleItem(Value::Object(map)),
                }
            }
            other => RawPayload::SingleItem(other),
        }
    }

    /// Items carried by the payload.
    pub fn items(&self) -> &[Value] {
        match self {
            RawPayload::SingleItem(item) => std::slice::from_ref(item),
            RawPayload::ItemList(items) => items,
            RawPayload::Wrapped { items, .. } => items,
        }
    }

    /// Number of items carried by the payload.
    pub fn len(&self) -> usize {
        self.items().len()
    }

    /// Returns true if the payload carries no items.
    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Re-assembles the JSON value the payload was classified from.
    pub fn to_value(&self) -> Value {
        match self {
            RawPayload::SingleItem(item) => item.clone(),
            RawPayload::ItemList(items) => Value::Array(items.clone()),
            RawPayload::Wrapped { key, items } => {
                let mut map = serde_json::Map::new();
                map.insert(key.clone(), Value::Array(items.clone()));
                Value::Object(map)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_agent_kind_labels() {
        assert_eq!(AgentKind::Gmap.to_string(), "gmap");
        assert_eq!("LinkedIn".parse::<AgentKind>(), Ok(AgentKind::Linkedin));
        assert_eq!("maps".parse::<AgentKind>(), Ok(AgentKind::Gmap));
        assert!("twitter".parse::<AgentKind>().is_err());

        let json = serde_json::to_string(&AgentKind::Website).expect("serialize");
        assert_eq!(json, "\"website\"");
    }

    #[test]
    fn test_payload_shapes() {
        let single = RawPayload::from_value(json!({"name": "Acme"}));
        assert!(matches!(single, RawPayload::SingleItem(_)));
        assert_eq!(single.len(), 1);

        let list = RawPayload::from_value(json!([{"name": "A"}, {"name": "B"}]));
        assert!(matches!(list, RawPayload::ItemList(ref items) if items.len() == 2));

        let wrapped = RawPayload::from_value(json!({"results": [{"name": "A"}], "message": "ok"}));
        match &wrapped {
            RawPayload::Wrapped { key, items } => {
                assert_eq!(key, "results");
                assert_eq!(items.len(), 1);
            }
            other => panic!("expected Wrapped, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_wrapper_has_no_items() {
        let payload = RawPayload::from_value(json!({"results": [], "message": "No pages found"}));
        assert!(payload.is_empty());
    }

    #[test]
    fn test_wrapper_key_must_hold_list() {
        let payload = RawPayload::from_value(json!({"leads": "none", "name": "Acme"}));
        assert!(matches!(payload, RawPayload::SingleItem(_)));
    }

    #[test]
    fn test_to_value_round_trip_shape() {
        let payload = RawPayload::from_value(json!({"leads": [{"company": "Acme"}]}));
        assert_eq!(payload.to_value(), json!({"leads": [{"company": "Acme"}]}));
    }
}
