//! Process-wide "command active" flag. The daily pass and manual zone runs
//! both take it before touching a valve; whoever finds it held backs off
//! immediately instead of waiting.

use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("busy: a {holder} command is in progress")]
    Busy { holder: &'static str },
}

#[derive(Debug, Clone, Default)]
pub struct CommandGate {
    holder: Arc<RwLock<Option<&'static str>>>,
}

impl CommandGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the gate for `holder`. Never blocks.
    pub fn try_acquire(&self, holder: &'static str) -> Result<GateGuard, GateError> {
        let mut slot = self.holder.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = *slot {
            return Err(GateError::Busy { holder: current });
        }
        *slot = Some(holder);
        Ok(GateGuard { gate: self.clone() })
    }

    /// Name of the current holder, if any.
    pub fn holder(&self) -> Option<&'static str> {
        *self.holder.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the gate on drop.
#[derive(Debug)]
pub struct GateGuard {
    gate: CommandGate,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        *self
            .gate
            .holder
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}
