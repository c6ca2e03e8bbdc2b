//! Session state machine.

use serde::Serialize;

/// Lifecycle state of an analysis session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Engines are being started; callers for the same dump wait on this.
    #[default]
    Starting,
    /// At least one engine is up and accepting commands.
    Ready,
    /// The last reference was released and engines are being torn down.
    Closing,
    /// An engine failed to recover from a timeout. Cached output stays readable.
    Unusable,
}

impl SessionState {
    /// Check if transition to target state is valid.
    ///
    /// Valid transitions:
    /// - Starting -> Ready
    /// - Starting -> Closing (engine start failed)
    /// - Ready -> Unusable
    /// - Ready -> Closing
    /// - Unusable -> Closing
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (*self, target),
            (Starting, Ready)
                | (Starting, Closing)
                | (Ready, Unusable)
                | (Ready, Closing)
                | (Unusable, Closing)
        )
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&mut self, target: SessionState) -> crate::Result<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(crate::error::RelayError::InvalidStateTransition {
                from: *self,
                to: target,
            })
        }
    }

    /// Check if session can accept commands.
    pub fn can_execute(&self) -> bool {
        matches!(self, SessionState::Ready)
    }
}
