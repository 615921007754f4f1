//! Session management core module.
//!
//! This module provides the per-channel proxy session engine and the types it is built from:
//! channel endpoints, control requests, the outstanding-session tracker and the terminal
//! geometry shared between a session's tasks.

use std::sync::{Arc, Mutex};

/// Submodule for the byte-stream and request endpoints a session relays between.
pub mod endpoint;
/// Submodule for channel request decoding and classification.
pub mod request;
/// Submodule for the session engine.
pub mod session;
/// Submodule for counting and waiting on in-flight sessions.
pub mod session_tracker;

/// Last terminal size the client announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TerminalGeometry {
    pub width: u32,
    pub height: u32,
}

/// Geometry shared between the request forwarder and anything that reports on the session.
/// Width and height are always read and written together under one lock.
#[derive(Debug, Clone, Default)]
pub struct SharedGeometry {
    inner: Arc<Mutex<TerminalGeometry>>,
}

impl SharedGeometry {
    pub fn set(&self, width: u32, height: u32) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = TerminalGeometry { width, height };
    }

    pub fn get(&self) -> TerminalGeometry {
        match self.inner.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_defaults_to_zero() {
        assert_eq!(SharedGeometry::default().get(), TerminalGeometry::default());
    }

    #[test]
    fn test_geometry_pairs_stay_consistent() {
        let geometry = SharedGeometry::default();
        geometry.set(1, 1);

        let mut writers = Vec::new();
        for i in 1..=4u32 {
            let g = geometry.clone();
            writers.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    g.set(i, i);
                }
            }));
        }

        let reader = {
            let g = geometry.clone();
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    let seen = g.get();
                    assert_eq!(seen.width, seen.height, "torn geometry {:?}", seen);
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();

        let last = geometry.get();
        assert!((1..=4).contains(&last.width));
        assert_eq!(last.width, last.height);
    }
}
