use serde::Serialize;
use tracing::{debug, info};

use dialflow_core::config::PathPolicyConfig;
use dialflow_core::state::PathState;
use dialflow_core::types::PathId;

/// Votes below this are dropped from the vote map.
const PRUNE_BELOW: f64 = 0.01;

/// What the policy did with one turn's signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PathDecision {
    NoSignal,
    /// A path is already locked; the signal was dropped.
    Ignored { path: PathId },
    /// Tentative best guess, not yet committed.
    Tentative { path: PathId, switched: bool },
    Locked { path: PathId },
}

impl PathDecision {
    /// The path that became locked on this turn, if any.
    pub fn locked(&self) -> Option<&PathId> {
        match self {
            PathDecision::Locked { path } => Some(path),
            _ => None,
        }
    }
}

/// Vote accumulation with hysteresis over a noisy per-turn path signal.
///
/// Each signal adds one vote to its path and decays every other path. The
/// tentative path may change while unlocked, but every change raises the
/// number of votes needed to lock by `switch_penalty`. Once locked, signals
/// are ignored until an explicit override.
#[derive(Debug, Clone)]
pub struct PathPolicy {
    config: PathPolicyConfig,
}

impl Default for PathPolicy {
    fn default() -> Self {
        Self::new(PathPolicyConfig::default())
    }
}

impl PathPolicy {
    pub fn new(config: PathPolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PathPolicyConfig {
        &self.config
    }

    /// Votes the active path currently needs to lock.
    pub fn required_votes(&self, state: &PathState) -> f64 {
        self.config.lock_threshold + self.config.switch_penalty * f64::from(state.path_switches)
    }

    /// Fold one turn's signal into the state.
    pub fn observe(&self, state: &mut PathState, signal: Option<&PathId>) -> PathDecision {
        if state.path_locked {
            return match signal {
                Some(path) => {
                    debug!(path = %path, "Path already locked, signal ignored");
                    PathDecision::Ignored { path: path.clone() }
                }
                None => PathDecision::NoSignal,
            };
        }

        let Some(path) = signal else {
            let active = state.active_path.clone();
            self.decay_except(state, active.as_ref());
            return PathDecision::NoSignal;
        };

        self.decay_except(state, Some(path));
        *state.path_votes.entry(path.clone()).or_insert(0.0) += 1.0;

        let switched = state.active_path.as_ref().is_some_and(|active| active != path);
        if switched {
            state.path_switches += 1;
        }
        state.active_path = Some(path.clone());

        let votes = state.votes_for(path.as_str());
        let required = self.required_votes(state);
        if votes >= required {
            state.path_locked = true;
            info!(path = %path, votes, "Path locked");
            return PathDecision::Locked { path: path.clone() };
        }

        debug!(path = %path, votes, required, switched, "Tentative path");
        PathDecision::Tentative {
            path: path.clone(),
            switched,
        }
    }

    /// Lock `path` immediately, whatever the votes say.
    pub fn override_path(&self, state: &mut PathState, path: PathId) -> PathDecision {
        info!(path = %path, previous = ?state.active_path, "Path overridden");
        state.active_path = Some(path.clone());
        state.path_locked = true;
        PathDecision::Locked { path }
    }

    fn decay_except(&self, state: &mut PathState, keep: Option<&PathId>) {
        for (path, votes) in state.path_votes.iter_mut() {
            if Some(path) != keep {
                *votes *= self.config.decay;
            }
        }
        state.path_votes.retain(|path, votes| Some(path) == keep || *votes >= PRUNE_BELOW);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(policy: &PathPolicy, signals: &[&str]) -> (PathState, Vec<PathDecision>) {
        let mut state = PathState::default();
        let decisions = signals
            .iter()
            .map(|s| policy.observe(&mut state, Some(&PathId::new(*s))))
            .collect();
        (state, decisions)
    }

    #[test]
    fn consistent_signals_lock_on_second_turn() {
        let (state, decisions) = run(&PathPolicy::default(), &["p1", "p1"]);
        assert_eq!(
            decisions[0],
            PathDecision::Tentative {
                path: PathId::new("p1"),
                switched: false
            }
        );
        assert_eq!(decisions[1], PathDecision::Locked { path: PathId::new("p1") });
        assert_eq!(state.locked_path().map(|p| p.as_str()), Some("p1"));
    }

    #[test]
    fn alternating_signals_never_lock() {
        let (state, decisions) = run(&PathPolicy::default(), &["p1", "p2", "p1", "p1"]);
        assert!(decisions.iter().all(|d| d.locked().is_none()));
        assert!(!state.path_locked);
        assert_eq!(state.active_path.as_ref().map(|p| p.as_str()), Some("p1"));
        assert_eq!(state.path_switches, 2);
        assert!(state.votes_for("p1") < PathPolicy::default().required_votes(&state));
    }

    #[test]
    fn locked_path_ignores_signals() {
        let policy = PathPolicy::default();
        let (mut state, _) = run(&policy, &["p1", "p1"]);
        let decision = policy.observe(&mut state, Some(&PathId::new("p2")));
        assert_eq!(decision, PathDecision::Ignored { path: PathId::new("p2") });
        assert_eq!(state.locked_path().map(|p| p.as_str()), Some("p1"));
        assert_eq!(state.votes_for("p2"), 0.0);
    }

    #[test]
    fn silence_decays_outliers() {
        let policy = PathPolicy::default();
        let (mut state, _) = run(&policy, &["p2", "p1"]);
        assert_eq!(state.votes_for("p2"), 0.5);
        for _ in 0..8 {
            assert_eq!(policy.observe(&mut state, None), PathDecision::NoSignal);
        }
        assert!(!state.path_votes.contains_key("p2"));
        assert_eq!(state.votes_for("p1"), 1.0);
    }

    #[test]
    fn override_locks_immediately() {
        let policy = PathPolicy::default();
        let (mut state, _) = run(&policy, &["p1"]);
        let decision = policy.override_path(&mut state, PathId::new("p2"));
        assert_eq!(decision.locked().map(|p| p.as_str()), Some("p2"));
        assert!(state.path_locked);
    }

    #[test]
    fn threshold_is_configurable() {
        let policy = PathPolicy::new(PathPolicyConfig {
            lock_threshold: 3.0,
            ..Default::default()
        });
        let (state, _) = run(&policy, &["p1", "p1"]);
        assert!(!state.path_locked);
        let (state, _) = run(&policy, &["p1", "p1", "p1"]);
        assert!(state.path_locked);
    }
}
