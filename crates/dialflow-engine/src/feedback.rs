//! Truthfulness gate for user-facing messages.
//!
//! Agents draft messages before an action runs. The gate rewrites those
//! drafts against the recorded result, so a failure is never announced as a
//! success and internal error text never reaches the user.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use dialflow_core::error::{DialflowError, MutationError, Result};
use dialflow_core::flow::FlowDefinition;

const PLACEHOLDER: &str = r"\{([a-z_][a-z0-9_]*)\}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Conflict,
    Invalid,
    Internal,
}

impl FailureKind {
    fn explanation(self) -> &'static str {
        match self {
            FailureKind::Timeout => {
                "Sorry, that took too long to respond and did not go through. Nothing was changed, so it is safe to try again."
            }
            FailureKind::Conflict => {
                "Someone else changed this flow at the same time, so your changes were not saved. Please review the latest version and try again."
            }
            FailureKind::Invalid => {
                "Those changes could not be applied because they would leave the flow incomplete. Nothing was changed."
            }
            FailureKind::Internal => {
                "Something went wrong on our side and your changes were not saved. Please try again in a moment."
            }
        }
    }
}

/// The recorded outcome of an action the user was told about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ActionResult {
    Success {
        #[serde(default)]
        details: BTreeMap<String, String>,
    },
    Failure {
        kind: FailureKind,
        /// Operator-facing reason. Logged, never shown to the user.
        internal: String,
    },
}

impl ActionResult {
    pub fn success() -> Self {
        ActionResult::Success {
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        match self {
            ActionResult::Success { mut details } => {
                details.insert(key.into(), value.into());
                ActionResult::Success { details }
            }
            failure => failure,
        }
    }

    pub fn failure(kind: FailureKind, internal: impl Into<String>) -> Self {
        ActionResult::Failure {
            kind,
            internal: internal.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ActionResult::Success { .. })
    }
}

impl From<&MutationError> for ActionResult {
    fn from(err: &MutationError) -> Self {
        let kind = match err {
            MutationError::StaleVersion { .. } => FailureKind::Conflict,
            MutationError::Timeout(_) => FailureKind::Timeout,
            MutationError::Store(_) => FailureKind::Internal,
            _ => FailureKind::Invalid,
        };
        ActionResult::failure(kind, err.to_string())
    }
}

impl From<&DialflowError> for ActionResult {
    fn from(err: &DialflowError) -> Self {
        match err {
            DialflowError::Mutation(inner) => inner.into(),
            DialflowError::Timeout(_) => ActionResult::failure(FailureKind::Timeout, err.to_string()),
            DialflowError::Compile(_) | DialflowError::Validation(_) | DialflowError::Eval(_) => {
                ActionResult::failure(FailureKind::Invalid, err.to_string())
            }
            _ => ActionResult::failure(FailureKind::Internal, err.to_string()),
        }
    }
}

impl From<&std::result::Result<FlowDefinition, MutationError>> for ActionResult {
    fn from(result: &std::result::Result<FlowDefinition, MutationError>) -> Self {
        match result {
            Ok(definition) => {
                let mut outcome = ActionResult::success()
                    .with_detail("flow", definition.id.as_str())
                    .with_detail("version", definition.version.to_string());
                if let Some(description) = definition.meta.as_ref().map(|m| &m.description) {
                    outcome = outcome.with_detail("description", description.clone());
                }
                outcome
            }
            Err(err) => err.into(),
        }
    }
}

/// Reconciles drafted messages with what actually happened.
#[derive(Debug, Clone)]
pub struct FeedbackGate {
    placeholder: Regex,
}

impl FeedbackGate {
    pub fn new() -> Result<Self> {
        let placeholder =
            Regex::new(PLACEHOLDER).map_err(|e| DialflowError::Config(e.to_string()))?;
        Ok(Self { placeholder })
    }

    /// Final messages for the user, conditioned on `result`.
    pub fn reconcile(&self, intended: &[String], result: &ActionResult) -> Vec<String> {
        match result {
            ActionResult::Failure { kind, internal } => {
                error!(kind = ?kind, reason = %internal, "Action failed, rewriting drafted messages");
                on_failure(intended, *kind)
            }
            ActionResult::Success { details } => self.on_success(intended, details),
        }
    }

    /// Shorthand for drafts sent around a batch mutation.
    pub fn reconcile_mutation(
        &self,
        intended: &[String],
        result: &std::result::Result<FlowDefinition, MutationError>,
    ) -> Vec<String> {
        self.reconcile(intended, &ActionResult::from(result))
    }

    fn on_success(&self, intended: &[String], details: &BTreeMap<String, String>) -> Vec<String> {
        let summary = summary_line(details);
        if intended.is_empty() {
            return vec![summary];
        }

        let mut messages = Vec::with_capacity(intended.len());
        let mut summarized = false;
        for draft in intended {
            let mut unresolved = false;
            let filled = self.placeholder.replace_all(draft, |caps: &regex::Captures<'_>| {
                match details.get(&caps[1]) {
                    Some(value) => value.clone(),
                    None => {
                        unresolved = true;
                        caps[0].to_string()
                    }
                }
            });
            if !unresolved {
                messages.push(filled.into_owned());
            } else if !summarized {
                messages.push(summary.clone());
                summarized = true;
            }
        }
        messages
    }
}

/// Drafts are written before the action runs, so none survive a failure.
fn on_failure(intended: &[String], kind: FailureKind) -> Vec<String> {
    debug!(dropped = intended.len(), "Drafts discarded after failure");
    vec![kind.explanation().to_string()]
}

fn summary_line(details: &BTreeMap<String, String>) -> String {
    match (details.get("flow"), details.get("version")) {
        (Some(flow), Some(version)) => match details.get("description") {
            Some(description) => format!(
                "Your changes to {} are live as version {}: {}.",
                flow, version, description
            ),
            None => format!("Your changes to {} are live as version {}.", flow, version),
        },
        _ => "Your request went through.".to_string(),
    }
}
