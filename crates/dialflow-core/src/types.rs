use std::borrow::Borrow;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Stable, author-assigned node identifier.
    NodeId
);
string_id!(
    /// Answer slot name. Answers are always addressed by key, never by prompt text.
    AnswerKey
);
string_id!(
    /// A candidate sub-flow selected by the path policy.
    PathId
);
string_id!(TenantId);
string_id!(FlowId);
string_id!(
    /// Conversation thread identifier.
    ThreadId
);

/// Monotonic flow version. The first published version is 1.
#[derive(
    Debug, Clone, Copy, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    pub fn initial() -> Self {
        Self(1)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A committed answer with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub value: serde_json::Value,
    /// Turn index the value was committed on.
    pub turn: u64,
    /// Extractor confidence reported with the proposal.
    pub confidence: f32,
}

/// Answers collected in one conversation, keyed by answer slot.
///
/// Ordered so snapshots serialize identically across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Answers(BTreeMap<AnswerKey, Answer>);

impl Answers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Answer> {
        self.0.get(key)
    }

    /// The committed value for a key, if any.
    pub fn value(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key).map(|a| &a.value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: AnswerKey, answer: Answer) {
        self.0.insert(key, answer);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AnswerKey, &Answer)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One `(key, value, confidence)` proposal from the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAnswer {
    pub key: AnswerKey,
    pub value: serde_json::Value,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

fn default_confidence() -> f32 {
    1.0
}

impl ProposedAnswer {
    pub fn new(key: impl Into<AnswerKey>, value: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            value,
            confidence: default_confidence(),
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }
}

/// Per-turn output of the external extraction collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionInput {
    #[serde(default)]
    pub proposed_answers: Vec<ProposedAnswer>,
    #[serde(default)]
    pub proposed_path: Option<PathId>,
    #[serde(default)]
    pub escalate: bool,
}

impl ExtractionInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(mut self, key: impl Into<AnswerKey>, value: serde_json::Value) -> Self {
        self.proposed_answers.push(ProposedAnswer::new(key, value));
        self
    }

    pub fn path(mut self, path: impl Into<PathId>) -> Self {
        self.proposed_path = Some(path.into());
        self
    }

    pub fn escalate(mut self) -> Self {
        self.escalate = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_lookup_by_str() {
        let mut answers = Answers::new();
        answers.insert(
            AnswerKey::new("budget"),
            Answer {
                value: serde_json::json!(7),
                turn: 1,
                confidence: 0.9,
            },
        );
        assert!(answers.contains("budget"));
        assert_eq!(answers.value("budget"), Some(&serde_json::json!(7)));
        assert!(answers.get("missing").is_none());
    }

    #[test]
    fn extraction_input_defaults() {
        let input: ExtractionInput =
            serde_json::from_str(r#"{"proposed_answers":[{"key":"name","value":"Ada"}]}"#).unwrap();
        assert_eq!(input.proposed_answers.len(), 1);
        assert_eq!(input.proposed_answers[0].confidence, 1.0);
        assert!(input.proposed_path.is_none());
        assert!(!input.escalate);
    }

    #[test]
    fn version_ordering() {
        let v = Version::initial();
        assert_eq!(v.next(), Version(2));
        assert!(v < v.next());
        assert_eq!(serde_json::to_string(&v).unwrap(), "1");
    }
}
