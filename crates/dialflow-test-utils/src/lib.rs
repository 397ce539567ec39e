//! Fixtures shared by the dialflow test suites.
//!
//! Depends only on `dialflow-core` so every other crate can pull it in as a
//! dev-dependency.

pub mod fixtures;
pub mod turns;

pub use fixtures::{guard_selection_flow, qualification_flow, snapshot_at, validated_flow};
pub use turns::{answers, TurnScript};
