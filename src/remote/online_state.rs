/// Whether the engine believes it can reach the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnlineState {
    /// Connectivity has not been established or lost yet.
    #[default]
    Unknown,
    Online,
    /// Views report `from_cache` and stop waiting for the server.
    Offline,
}

const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// Derives [`OnlineState`] from watch stream health.
#[derive(Debug)]
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
}

impl Default for OnlineStateTracker {
    fn default() -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
        }
    }
}

impl OnlineStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    /// Returns the new state when it changed.
    pub fn handle_watch_stream_start(&mut self) -> Option<OnlineState> {
        if self.watch_stream_failures == 0 {
            return self.transition(OnlineState::Unknown);
        }
        None
    }

    pub fn handle_watch_stream_failure(&mut self) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            return self.transition(OnlineState::Unknown);
        }
        self.watch_stream_failures += 1;
        if self.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
            log::debug!(
                "watch stream failed {} times; considering the client offline",
                self.watch_stream_failures
            );
            return self.transition(OnlineState::Offline);
        }
        None
    }

    /// Explicit transition; clears the failure count.
    pub fn set(&mut self, state: OnlineState) -> Option<OnlineState> {
        self.watch_stream_failures = 0;
        self.transition(state)
    }

    fn transition(&mut self, state: OnlineState) -> Option<OnlineState> {
        if self.state == state {
            return None;
        }
        self.state = state;
        Some(state)
    }
}
