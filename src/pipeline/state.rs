//! Per-ruleset state machine.

use serde::Serialize;
use std::fmt;

use crate::{Error, Result};

/// A working phase of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Fetching,
    Parsing,
    Normalizing,
    Compiling,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Fetching => "fetching",
            Phase::Parsing => "parsing",
            Phase::Normalizing => "normalizing",
            Phase::Compiling => "compiling",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of one ruleset.
///
/// `Pending → Fetching → Parsing → Normalizing → Compiling → Done`, or
/// `Failed` from any non-terminal state. Transitions never go backwards and
/// terminal states are final.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RulesetState {
    #[default]
    Pending,
    Fetching,
    Parsing,
    Normalizing,
    Compiling,
    Done,
    Failed { phase: Phase, cause: String },
}

impl RulesetState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RulesetState::Done | RulesetState::Failed { .. })
    }

    /// The working phase, if any.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            RulesetState::Fetching => Some(Phase::Fetching),
            RulesetState::Parsing => Some(Phase::Parsing),
            RulesetState::Normalizing => Some(Phase::Normalizing),
            RulesetState::Compiling => Some(Phase::Compiling),
            _ => None,
        }
    }

    /// Move to the next state in the happy path.
    pub fn advance(&mut self) -> Result<()> {
        let next = match self {
            RulesetState::Pending => RulesetState::Fetching,
            RulesetState::Fetching => RulesetState::Parsing,
            RulesetState::Parsing => RulesetState::Normalizing,
            RulesetState::Normalizing => RulesetState::Compiling,
            RulesetState::Compiling => RulesetState::Done,
            terminal => return Err(Error::InvalidTransition(terminal.to_string())),
        };
        *self = next;
        Ok(())
    }

    /// Fail in the current phase. A ruleset that never started fails in
    /// [`Phase::Fetching`].
    pub fn fail(&mut self, cause: impl Into<String>) -> Result<()> {
        if self.is_terminal() {
            return Err(Error::InvalidTransition(self.to_string()));
        }
        let phase = self.phase().unwrap_or(Phase::Fetching);
        *self = RulesetState::Failed {
            phase,
            cause: cause.into(),
        };
        Ok(())
    }
}

impl fmt::Display for RulesetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RulesetState::Pending => write!(f, "pending"),
            RulesetState::Done => write!(f, "done"),
            RulesetState::Failed { phase, cause } => write!(f, "failed while {}: {}", phase, cause),
            working => match working.phase() {
                Some(phase) => write!(f, "{}", phase),
                None => write!(f, "unknown"),
            },
        }
    }
}
