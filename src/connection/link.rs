use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::domain::ConnectionState;
use crate::error::{DerivError, Result};
use crate::transport::FrameSink;

struct Attached {
    generation: u64,
    sink: Option<Arc<dyn FrameSink>>,
}

/// The live outbound half of the connection plus its observable state.
///
/// Shared by the manager, which attaches and detaches sinks, and the
/// correlator, which sends through it. Each attached sink gets a new
/// generation number so stale tasks of an old link can tell they are
/// no longer current.
pub struct ConnectionLink {
    current: RwLock<Attached>,
    state: watch::Sender<ConnectionState>,
    last_sent: Mutex<Instant>,
}

impl Default for ConnectionLink {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionLink {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            current: RwLock::new(Attached {
                generation: 0,
                sink: None,
            }),
            state,
            last_sent: Mutex::new(Instant::now()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Move to `target`; illegal edges are refused and logged
    pub fn set_state(&self, target: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == target {
                return false;
            }
            if !current.can_transition_to(target) {
                warn!(from = %current, to = %target, "Refusing connection state change");
                return false;
            }
            info!(from = %current, to = %target, "Connection state changed");
            *current = target;
            true
        })
    }

    /// Wait until the state satisfies `predicate`
    pub async fn wait_for<F>(&self, predicate: F) -> ConnectionState
    where
        F: Fn(ConnectionState) -> bool,
    {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if predicate(state) {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    pub fn generation(&self) -> u64 {
        self.read_current(|current| current.generation)
    }

    /// Install a freshly opened sink, returning its generation
    pub fn attach(&self, sink: Arc<dyn FrameSink>) -> u64 {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        current.generation += 1;
        current.sink = Some(sink);
        self.touch();
        debug!(generation = current.generation, "Link attached");
        current.generation
    }

    /// Take the sink of `generation` if it is still the current one.
    ///
    /// Retires the generation, so its tasks stop on their next check.
    pub fn detach(&self, generation: u64) -> Option<Arc<dyn FrameSink>> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        if current.generation != generation {
            return None;
        }
        let sink = current.sink.take()?;
        current.generation += 1;
        Some(sink)
    }

    /// Send one text frame on the current sink
    pub async fn send(&self, frame: String) -> Result<()> {
        let sink = self
            .read_current(|current| current.sink.clone())
            .ok_or(DerivError::ConnectionLost)?;
        sink.send(frame).await?;
        self.touch();
        Ok(())
    }

    /// Time since the last outbound frame
    pub fn idle_for(&self) -> Duration {
        self.last_sent().elapsed()
    }

    pub fn last_sent(&self) -> Instant {
        *self.last_sent.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        *self.last_sent.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn read_current<T>(&self, f: impl FnOnce(&Attached) -> T) -> T {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        f(&current)
    }
}
