use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default)]
struct TrackerState {
    active: usize,
    closed: bool,
}

/// Counts sessions that are still relaying or tearing down, and lets shutdown wait for the
/// count to reach zero. Once closed, no new session is admitted.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    state: Arc<watch::Sender<TrackerState>>,
}

/// Held by a running session; dropping it marks the session finished.
#[derive(Debug)]
pub struct SessionGuard {
    state: Arc<watch::Sender<TrackerState>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.state.send_modify(|s| s.active -= 1);
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(TrackerState::default());
        Self {
            state: Arc::new(tx),
        }
    }

    pub fn try_enter(&self) -> Option<SessionGuard> {
        let mut admitted = false;
        self.state.send_modify(|s| {
            if !s.closed {
                s.active += 1;
                admitted = true;
            }
        });

        if admitted {
            Some(SessionGuard {
                state: Arc::clone(&self.state),
            })
        } else {
            None
        }
    }

    pub fn close(&self) {
        self.state.send_modify(|s| s.closed = true);
    }

    pub fn active(&self) -> usize {
        self.state.borrow().active
    }

    pub async fn wait_idle(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| s.active == 0).await;
    }
}
