//! Session registry with cooperative cancellation flags.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Shared cancellation flag, polled at bounded intervals by long-running
/// work (child-process waits, marker probes, self-test polling).
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

struct SessionState {
    cancel: CancelFlag,
    device_lost: Arc<AtomicBool>,
}

pub struct SessionRegistry {
    sessions: HashMap<Uuid, SessionState>,
}

lazy_static::lazy_static! {
    static ref GLOBAL_REGISTRY: Mutex<SessionRegistry> = Mutex::new(SessionRegistry {
        sessions: HashMap::new(),
    });
}

impl SessionRegistry {
    /// Register a session; returns its cancel flag and device-lost marker.
    pub fn register(session_id: Uuid) -> (CancelFlag, Arc<AtomicBool>) {
        let cancel = CancelFlag::new();
        let device_lost = Arc::new(AtomicBool::new(false));
        if let Ok(mut reg) = GLOBAL_REGISTRY.lock() {
            reg.sessions.insert(
                session_id,
                SessionState {
                    cancel: cancel.clone(),
                    device_lost: device_lost.clone(),
                },
            );
        }
        (cancel, device_lost)
    }

    /// Request cancellation of a registered session.
    pub fn cancel(session_id: &Uuid) -> bool {
        if let Ok(reg) = GLOBAL_REGISTRY.lock() {
            if let Some(state) = reg.sessions.get(session_id) {
                state.cancel.cancel();
                return true;
            }
        }
        false
    }

    /// Mark a session's device as gone from enumeration.
    pub fn mark_device_lost(session_id: &Uuid) -> bool {
        if let Ok(reg) = GLOBAL_REGISTRY.lock() {
            if let Some(state) = reg.sessions.get(session_id) {
                state.device_lost.store(true, Ordering::Relaxed);
                state.cancel.cancel();
                return true;
            }
        }
        false
    }

    pub fn unregister(session_id: &Uuid) {
        if let Ok(mut reg) = GLOBAL_REGISTRY.lock() {
            reg.sessions.remove(session_id);
        }
    }
}
