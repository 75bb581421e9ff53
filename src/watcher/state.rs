//! Watcher lifecycle state

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Number of past states kept for diagnostics.
const HISTORY_LEN: usize = 16;

/// Local (per-process) watcher state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    NotRunning,
    Watching,
    FightForJudge,
    SwitchMaster,
    Closed,
}

impl std::fmt::Display for WatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatcherState::NotRunning => write!(f, "not-running"),
            WatcherState::Watching => write!(f, "watching"),
            WatcherState::FightForJudge => write!(f, "fight-for-judge"),
            WatcherState::SwitchMaster => write!(f, "switch-master"),
            WatcherState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    current: WatcherState,
    history: VecDeque<WatcherState>,
}

impl Inner {
    fn enter(&mut self, next: WatcherState) -> WatcherState {
        let previous = self.current;
        self.current = next;
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(next);
        previous
    }
}

/// The single guarded copy of a watcher's state. All transitions are
/// compare-and-set under one lock.
#[derive(Debug)]
pub struct StateCell {
    inner: Mutex<Inner>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let mut history = VecDeque::with_capacity(HISTORY_LEN);
        history.push_back(WatcherState::NotRunning);
        Self {
            inner: Mutex::new(Inner {
                current: WatcherState::NotRunning,
                history,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self) -> WatcherState {
        self.lock().current
    }

    /// Move to `to` only if the current state is one of `from`.
    pub fn transition(&self, from: &[WatcherState], to: WatcherState) -> bool {
        let mut inner = self.lock();
        if !from.contains(&inner.current) {
            return false;
        }
        let previous = inner.enter(to);
        tracing::debug!("Watcher state {} -> {}", previous, to);
        true
    }

    /// Unconditionally enter `to`, returning the previous state.
    pub fn replace(&self, to: WatcherState) -> WatcherState {
        let mut inner = self.lock();
        if inner.current == to {
            return to;
        }
        let previous = inner.enter(to);
        tracing::debug!("Watcher state {} -> {}", previous, to);
        previous
    }

    /// Recent states, oldest first (including the current one).
    pub fn history(&self) -> Vec<WatcherState> {
        self.lock().history.iter().copied().collect()
    }
}
