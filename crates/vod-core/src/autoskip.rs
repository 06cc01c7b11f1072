//! Intro skip and auto-next, driven by playback progress samples.
//!
//! The engine has no timer of its own; it advances only when the controller
//! forwards a `(current_time, duration)` sample from the media element.
//!
//! ```text
//!  Normal ──(remaining < outro)──▶ OutroActive ──(next exists)──▶ Advancing
//!    ▲                                                               │
//!    └──────────────────── reset_for_episode ◀───────────────────────┘
//! ```
//!
//! The outro only arms after a sample from outside the outro window has been
//! seen for the current episode, so a late sample from the previous episode
//! cannot trigger a second advance.

use vod_proto::config::SkipWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipPhase {
    Normal,
    OutroActive,
    Advancing,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipAction {
    /// Seek forward past the intro.
    SeekTo(f64),
    /// Move on to the next episode in the active direction.
    AdvanceEpisode,
}

#[derive(Debug, Clone)]
pub struct AutoSkipEngine {
    window: SkipWindow,
    phase: SkipPhase,
    intro_skipped: bool,
    outro_armed: bool,
    last_time: Option<f64>,
}

impl AutoSkipEngine {
    pub fn new(window: SkipWindow) -> Self {
        Self {
            window,
            phase: SkipPhase::Normal,
            intro_skipped: false,
            outro_armed: false,
            last_time: None,
        }
    }

    /// Clear the per-episode guards. Called on every episode change.
    pub fn reset_for_episode(&mut self, window: SkipWindow) {
        *self = Self::new(window);
    }

    pub fn phase(&self) -> SkipPhase {
        self.phase
    }

    pub fn is_outro_active(&self) -> bool {
        self.phase != SkipPhase::Normal
    }

    pub fn window(&self) -> SkipWindow {
        self.window
    }

    /// Feed one progress sample. `has_next` says whether an episode exists
    /// after the current one in the active direction.
    pub fn observe(
        &mut self,
        current_time: f64,
        duration: f64,
        has_next: bool,
    ) -> Option<SkipAction> {
        if !current_time.is_finite() || current_time < 0.0 {
            return None;
        }
        if !duration.is_finite() || duration <= 0.0 {
            return None;
        }

        let in_order = self.last_time.map_or(true, |last| current_time >= last);
        self.last_time = Some(current_time);
        if !in_order {
            return None;
        }
        if duration - current_time >= self.window.outro_secs {
            self.outro_armed = true;
        }

        if self.should_skip_intro(current_time, duration) {
            self.intro_skipped = true;
            return Some(SkipAction::SeekTo(self.window.intro_end_secs));
        }

        if !self.outro_armed || !self.in_outro(current_time, duration) {
            return None;
        }

        if self.phase == SkipPhase::Normal {
            self.phase = SkipPhase::OutroActive;
        }
        // Without a next episode the outro stays active and plays out.
        if self.phase == SkipPhase::OutroActive && has_next {
            self.phase = SkipPhase::Advancing;
            return Some(SkipAction::AdvanceEpisode);
        }
        None
    }

    fn should_skip_intro(&self, current_time: f64, duration: f64) -> bool {
        !self.intro_skipped
            && self.window.has_intro()
            && self.window.intro_end_secs < duration
            && current_time >= self.window.intro_start_secs
            && current_time < self.window.intro_end_secs
    }

    fn in_outro(&self, current_time: f64, duration: f64) -> bool {
        // Episodes shorter than the window would be skipped on the first tick.
        self.window.has_outro()
            && duration > self.window.outro_secs
            && duration - current_time < self.window.outro_secs
    }
}
