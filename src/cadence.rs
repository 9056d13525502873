// Adaptive typing-cadence state machine
//
// One machine per active session classifies how fast the user is typing and
// decides when a suggestion request should fire. Fast typists get out of the
// way; a pause after typing is the moment to surface a suggestion. The
// machine is a pure (state, input) -> (state, output) function driven on the
// caller's thread; cross-session instances are independent.

/// Typing states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CadenceState {
    /// No keystrokes for at least `idle_timeout_ms`.
    Idle,
    /// Normal typing rhythm.
    Typing,
    /// Inter-key gaps below the `fast` threshold; suggestions suppressed.
    FastTyping,
    /// A gap above the `pause` threshold; the natural suggestion moment.
    Paused,
}

/// Speed classification reported back to the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedClass {
    Fast,
    Moderate,
    Exploratory,
}

impl SpeedClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeedClass::Fast => "fast",
            SpeedClass::Moderate => "moderate",
            SpeedClass::Exploratory => "exploratory",
        }
    }
}

/// Hint returned to the shell: how the user is typing and how long the shim
/// should wait before asking for suggestions on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingHint {
    pub user_speed_class: SpeedClass,
    pub suggested_pause_threshold_ms: u64,
}

/// Cadence thresholds, milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct CadenceConfig {
    pub fast_ms: i64,
    pub pause_ms: i64,
    pub idle_timeout_ms: i64,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            fast_ms: 100,
            pause_ms: 300,
            idle_timeout_ms: 2000,
        }
    }
}

/// Per-session cadence machine. Safe for use from a single session thread;
/// sessions never share an instance.
#[derive(Debug)]
pub struct CadenceMachine {
    state: CadenceState,
    last_keystroke_ms: i64,
    config: CadenceConfig,
}

impl CadenceMachine {
    pub fn new(config: CadenceConfig) -> Self {
        Self {
            state: CadenceState::Idle,
            last_keystroke_ms: 0,
            config,
        }
    }

    pub fn state(&self) -> CadenceState {
        self.state
    }

    /// Feed one keystroke. Returns whether a suggestion request should be
    /// emitted for this keystroke.
    pub fn on_keystroke(&mut self, now_ms: i64) -> bool {
        let delta = now_ms - self.last_keystroke_ms;
        self.last_keystroke_ms = now_ms;

        let (next, emit) = match self.state {
            // Leaving Idle or Paused starts a new typing burst; debounce.
            CadenceState::Idle | CadenceState::Paused => (CadenceState::Typing, false),
            CadenceState::Typing => {
                if delta > self.config.pause_ms {
                    (CadenceState::Paused, true)
                } else if delta < self.config.fast_ms {
                    (CadenceState::FastTyping, false)
                } else {
                    (CadenceState::Typing, false)
                }
            }
            CadenceState::FastTyping => {
                if delta > self.config.pause_ms {
                    (CadenceState::Paused, true)
                } else {
                    (CadenceState::FastTyping, false)
                }
            }
        };

        self.state = next;
        emit
    }

    /// Idle sweep, driven by a timer rather than a keystroke. Never emits.
    pub fn on_idle(&mut self, now_ms: i64) {
        if now_ms - self.last_keystroke_ms >= self.config.idle_timeout_ms {
            self.state = CadenceState::Idle;
        }
    }

    /// Timing hint for the shell, derived from the current state.
    pub fn timing_hint(&self) -> TimingHint {
        match self.state {
            CadenceState::FastTyping => TimingHint {
                user_speed_class: SpeedClass::Fast,
                suggested_pause_threshold_ms: 500,
            },
            CadenceState::Paused => TimingHint {
                user_speed_class: SpeedClass::Moderate,
                suggested_pause_threshold_ms: 150,
            },
            CadenceState::Typing => TimingHint {
                user_speed_class: SpeedClass::Moderate,
                suggested_pause_threshold_ms: 200,
            },
            CadenceState::Idle => TimingHint {
                user_speed_class: SpeedClass::Exploratory,
                suggested_pause_threshold_ms: 0,
            },
        }
    }
}

impl Default for CadenceMachine {
    fn default() -> Self {
        Self::new(CadenceConfig::default())
    }
}
