//! Symbol -> bracket monitor registry
//!
//! At most one bracket is live per security. Entries are keyed by bracket
//! id as well so a late release from an old task never removes a newer
//! monitor.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::types::SecurityId;

use super::order::BracketState;

struct MonitorEntry {
    bracket_id: Uuid,
    state: BracketState,
    abort: Option<AbortHandle>,
}

#[derive(Default)]
pub struct MonitorRegistry {
    monitors: Mutex<HashMap<SecurityId, MonitorEntry>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the security for a bracket. False if one is already live.
    pub fn try_register(&self, security_id: SecurityId, bracket_id: Uuid) -> bool {
        let mut monitors = self.monitors.lock();
        if monitors.contains_key(&security_id) {
            return false;
        }
        monitors.insert(
            security_id,
            MonitorEntry {
                bracket_id,
                state: BracketState::NoOrder,
                abort: None,
            },
        );
        true
    }

    /// Attach the task handle. No-op if the bracket already finished.
    pub fn attach(&self, security_id: SecurityId, bracket_id: Uuid, abort: AbortHandle) {
        let mut monitors = self.monitors.lock();
        if let Some(entry) = monitors.get_mut(&security_id) {
            if entry.bracket_id == bracket_id {
                entry.abort = Some(abort);
            }
        }
    }

    pub fn set_state(&self, security_id: SecurityId, bracket_id: Uuid, state: BracketState) {
        let mut monitors = self.monitors.lock();
        if let Some(entry) = monitors.get_mut(&security_id) {
            if entry.bracket_id == bracket_id {
                entry.state = state;
            }
        }
    }

    pub fn state(&self, security_id: SecurityId) -> Option<BracketState> {
        self.monitors.lock().get(&security_id).map(|e| e.state)
    }

    /// Remove the bracket's entry. Returns true only for the call that
    /// actually removed it.
    pub fn release(&self, security_id: SecurityId, bracket_id: Uuid) -> bool {
        let mut monitors = self.monitors.lock();
        match monitors.get(&security_id) {
            Some(entry) if entry.bracket_id == bracket_id => {
                monitors.remove(&security_id);
                true
            }
            _ => false,
        }
    }

    /// Abort and drop whatever bracket watches `security_id`
    pub fn cancel(&self, security_id: SecurityId) -> bool {
        match self.monitors.lock().remove(&security_id) {
            Some(entry) => {
                if let Some(abort) = entry.abort {
                    abort.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Abort every monitor task and clear the registry
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<MonitorEntry> = self.monitors.lock().drain().map(|(_, e)| e).collect();
        for entry in &drained {
            if let Some(abort) = &entry.abort {
                abort.abort();
            }
        }
        drained.len()
    }

    pub fn is_monitoring(&self, security_id: SecurityId) -> bool {
        self.monitors.lock().contains_key(&security_id)
    }

    pub fn active(&self) -> Vec<(SecurityId, BracketState)> {
        self.monitors.lock().iter().map(|(id, e)| (*id, e.state)).collect()
    }

    pub fn len(&self) -> usize {
        self.monitors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.lock().is_empty()
    }
}
