//! Squash run lifecycle.

use serde::{Deserialize, Serialize};
use squash_core::error::{Result, SquashError};

/// Squash state machine.
///
/// `Idle → FetchingLayers → Materializing → Encoding → Publishing → Done`,
/// with `Failed` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SquashState {
    /// Nothing started yet
    Idle,

    /// Resolving the image and acquiring the first layers
    FetchingLayers,

    /// Folding layers into the snapshot
    Materializing,

    /// Writing the flattened archive
    Encoding,

    /// Moving the archive into place
    Publishing,

    /// Output published
    Done,

    /// Run aborted; output untouched
    Failed,
}

impl SquashState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SquashState::Done | SquashState::Failed)
    }

    fn successor(&self) -> Option<SquashState> {
        match self {
            SquashState::Idle => Some(SquashState::FetchingLayers),
            SquashState::FetchingLayers => Some(SquashState::Materializing),
            SquashState::Materializing => Some(SquashState::Encoding),
            SquashState::Encoding => Some(SquashState::Publishing),
            SquashState::Publishing => Some(SquashState::Done),
            SquashState::Done | SquashState::Failed => None,
        }
    }

    pub fn can_advance_to(&self, next: SquashState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == SquashState::Failed || self.successor() == Some(next)
    }
}

impl std::fmt::Display for SquashState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SquashState::Idle => "idle",
            SquashState::FetchingLayers => "fetching_layers",
            SquashState::Materializing => "materializing",
            SquashState::Encoding => "encoding",
            SquashState::Publishing => "publishing",
            SquashState::Done => "done",
            SquashState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks the state of one run and refuses illegal transitions.
#[derive(Debug)]
pub struct StateMachine {
    state: SquashState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: SquashState::Idle,
        }
    }

    pub fn state(&self) -> SquashState {
        self.state
    }

    pub fn advance(&mut self, next: SquashState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(SquashError::Other(format!(
                "Invalid squash state transition: {} -> {}",
                self.state, next
            )));
        }
        tracing::debug!(from = %self.state, to = %next, "Squash state transition");
        self.state = next;
        Ok(())
    }

    /// Move to `Failed` unless already terminal.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            tracing::debug!(from = %self.state, "Squash failed");
            self.state = SquashState::Failed;
        }
    }
}
