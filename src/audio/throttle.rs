use log::{debug, info};

use super::{FRAME_INTERVAL_USECS, LOUDNESS_TO_DISTANCE_RATIO};

const TRAILING_AVERAGE_FRAMES: u32 = 100;
const CURRENT_FRAME_RATIO: f32 = 1.0 / TRAILING_AVERAGE_FRAMES as f32;
const PREVIOUS_FRAMES_RATIO: f32 = 1.0 - CURRENT_FRAME_RATIO;

/// At or below this share of the frame spent sleeping the mixer is falling behind
const STRUGGLE_TRIGGER_SLEEP_PERCENTAGE_THRESHOLD: f32 = 0.10;
/// At or above this share the mixer has headroom to let quiet sources back in
const BACK_OFF_TRIGGER_SLEEP_PERCENTAGE_THRESHOLD: f32 = 0.20;
const RATIO_BACK_OFF: f32 = 0.02;

/// Closed-loop admission control. Watches how much of each frame the scheduler
/// spends asleep and raises the loudness-per-distance cutoff when that headroom
/// disappears.
#[derive(Debug, Clone)]
pub struct ThrottleController {
    trailing_sleep_ratio: f32,
    performance_throttling_ratio: f32,
    min_audibility_threshold: f32,
    frames_since_last_change: u32,
    baseline: f32,
    frame_interval_usecs: u64,
}

impl ThrottleController {
    pub fn new() -> Self {
        Self::with_baseline(LOUDNESS_TO_DISTANCE_RATIO, FRAME_INTERVAL_USECS)
    }

    pub fn with_baseline(baseline: f32, frame_interval_usecs: u64) -> Self {
        Self {
            trailing_sleep_ratio: 1.0,
            performance_throttling_ratio: 0.0,
            min_audibility_threshold: baseline / 2.0,
            frames_since_last_change: TRAILING_AVERAGE_FRAMES,
            baseline,
            frame_interval_usecs: frame_interval_usecs.max(1),
        }
    }

    /// Folds the time slept after the previous frame into the trailing average and,
    /// once per averaging window, moves the throttling ratio. Negative sleep
    /// (an overrun) counts as zero. Returns true when the threshold changed.
    pub fn update(&mut self, usecs_slept: i64) -> bool {
        let usecs_slept = usecs_slept.max(0) as f32;
        let current_fraction = (usecs_slept / self.frame_interval_usecs as f32).min(1.0);

        self.trailing_sleep_ratio =
            PREVIOUS_FRAMES_RATIO * self.trailing_sleep_ratio + CURRENT_FRAME_RATIO * current_fraction;

        let last_ratio = self.performance_throttling_ratio;
        let mut has_ratio_changed = false;

        if self.frames_since_last_change >= TRAILING_AVERAGE_FRAMES {
            if self.trailing_sleep_ratio <= STRUGGLE_TRIGGER_SLEEP_PERCENTAGE_THRESHOLD {
                self.performance_throttling_ratio += 0.5 * (1.0 - self.performance_throttling_ratio);
                info!(
                    "Mixer is struggling, sleeping {:.1}% of frame time. Throttling ratio {} -> {}",
                    self.trailing_sleep_ratio * 100.0,
                    last_ratio,
                    self.performance_throttling_ratio
                );
                has_ratio_changed = true;
            } else if self.trailing_sleep_ratio >= BACK_OFF_TRIGGER_SLEEP_PERCENTAGE_THRESHOLD
                && self.performance_throttling_ratio > 0.0
            {
                self.performance_throttling_ratio =
                    (self.performance_throttling_ratio - RATIO_BACK_OFF).max(0.0);
                info!(
                    "Mixer is recovering, sleeping {:.1}% of frame time. Throttling ratio {} -> {}",
                    self.trailing_sleep_ratio * 100.0,
                    last_ratio,
                    self.performance_throttling_ratio
                );
                has_ratio_changed = true;
            }
        }

        if has_ratio_changed {
            self.performance_throttling_ratio = self.performance_throttling_ratio.clamp(0.0, 1.0);
            self.min_audibility_threshold = self.threshold_for(self.performance_throttling_ratio);
            debug!(
                "Minimum audibility required to be mixed is now {}",
                self.min_audibility_threshold
            );
            self.frames_since_last_change = 0;
        } else {
            self.frames_since_last_change = self.frames_since_last_change.saturating_add(1);
        }

        has_ratio_changed
    }

    fn threshold_for(&self, ratio: f32) -> f32 {
        // ratio only approaches 1 asymptotically in f32 arithmetic but can round to it
        let headroom = (1.0 - ratio).max(f32::EPSILON);
        self.baseline / (2.0 * headroom)
    }

    pub fn trailing_sleep_ratio(&self) -> f32 {
        self.trailing_sleep_ratio
    }

    pub fn performance_throttling_ratio(&self) -> f32 {
        self.performance_throttling_ratio
    }

    pub fn min_audibility_threshold(&self) -> f32 {
        self.min_audibility_threshold
    }

    pub fn frames_since_last_change(&self) -> u32 {
        self.frames_since_last_change
    }
}

impl Default for ThrottleController {
    fn default() -> Self {
        Self::new()
    }
}
