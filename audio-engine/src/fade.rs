//! Cubic fade envelope queried once per callback block.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FadeState {
    None,
    FadeIn,
    FadeOut,
}

/// Time-varying gain for smooth starts and stops. The cubic shape keeps
/// short fades (up to ~500 ms) free of perceptible steps.
#[derive(Debug)]
pub(crate) struct FadeEnvelope {
    state: FadeState,
    duration: Duration,
    started: Instant,
}

impl FadeEnvelope {
    pub fn new() -> Self {
        Self {
            state: FadeState::None,
            duration: Duration::ZERO,
            started: Instant::now(),
        }
    }

    pub fn start_fade_in(&mut self, duration: Duration) {
        self.duration = duration;
        self.started = Instant::now();
        self.state = FadeState::FadeIn;
    }

    pub fn start_fade_out(&mut self, duration: Duration) {
        self.duration = duration;
        self.started = Instant::now();
        self.state = FadeState::FadeOut;
    }

    pub fn state(&self) -> FadeState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = FadeState::None;
    }

    /// Current gain in [0, 1]. Returns 1 when no fade is active. On
    /// completion transitions to `None` and returns the endpoint exactly
    /// once from the fading state.
    pub fn gain(&mut self) -> f32 {
        if self.state == FadeState::None {
            return 1.0;
        }
        let elapsed = self.started.elapsed();
        if elapsed >= self.duration {
            let endpoint = if self.state == FadeState::FadeIn { 1.0 } else { 0.0 };
            self.state = FadeState::None;
            return endpoint;
        }
        let frac = elapsed.as_secs_f32() / self.duration.as_secs_f32();
        shape(self.state, frac)
    }
}

/// Cubic gain curve at `frac` of the fade, `frac` in [0, 1).
fn shape(state: FadeState, frac: f32) -> f32 {
    match state {
        FadeState::None => 1.0,
        FadeState::FadeIn => frac * frac * frac,
        FadeState::FadeOut => {
            let inv = 1.0 - frac;
            inv * inv * inv
        }
    }
}
