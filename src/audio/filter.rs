//! Penumbra filter: a per-ear high shelf that darkens sources heard from the side
//! or from behind.

use std::f32::consts::{FRAC_PI_2, PI, TAU};

use super::geometry::RADIUS_OF_HEAD;
use super::SAMPLE_RATE;

const TWO_OVER_PI: f32 = 2.0 / PI;

const ZERO_DB: f32 = 1.0;
const NEGATIVE_THREE_DB: f32 = 0.708;
const NEGATIVE_SIX_DB: f32 = 0.501;

/// Source straight ahead
const FILTER_GAIN_AT_0: f32 = ZERO_DB;
/// Source level with the left or right ear
const FILTER_GAIN_AT_90: f32 = NEGATIVE_SIX_DB;
/// Source behind
const FILTER_GAIN_AT_180: f32 = NEGATIVE_SIX_DB;

pub const FILTER_CUTOFF_FREQUENCY_HZ: f32 = 1000.0;
pub const FILTER_SLOPE: f32 = NEGATIVE_THREE_DB;

/// Shelf gains for the left and right ear given the bearing of the source.
pub fn penumbra_gains(bearing: f32, distance: f32) -> (f32, f32) {
    let angle = -bearing;

    let (mut left, mut right) = if angle < -FRAC_PI_2 && angle >= -PI {
        (
            TWO_OVER_PI * (FILTER_GAIN_AT_0 - FILTER_GAIN_AT_180) * (angle + FRAC_PI_2)
                + FILTER_GAIN_AT_0,
            TWO_OVER_PI * (FILTER_GAIN_AT_90 - FILTER_GAIN_AT_180) * (angle + FRAC_PI_2)
                + FILTER_GAIN_AT_90,
        )
    } else if angle <= PI && angle > FRAC_PI_2 {
        (
            TWO_OVER_PI * (FILTER_GAIN_AT_180 - FILTER_GAIN_AT_90) * (angle - PI)
                + FILTER_GAIN_AT_180,
            TWO_OVER_PI * (FILTER_GAIN_AT_180 - FILTER_GAIN_AT_0) * (angle - PI)
                + FILTER_GAIN_AT_180,
        )
    } else if angle <= FRAC_PI_2 && angle > 0.0 {
        (
            TWO_OVER_PI * (FILTER_GAIN_AT_90 - FILTER_GAIN_AT_0) * (angle - FRAC_PI_2)
                + FILTER_GAIN_AT_90,
            FILTER_GAIN_AT_0,
        )
    } else {
        (
            FILTER_GAIN_AT_0,
            TWO_OVER_PI * (FILTER_GAIN_AT_0 - FILTER_GAIN_AT_90) * angle + FILTER_GAIN_AT_0,
        )
    };

    if distance < RADIUS_OF_HEAD {
        let inside = 1.0 - distance / RADIUS_OF_HEAD;
        left += (1.0 - left) * inside;
        right += (1.0 - right) * inside;
    }

    (left, right)
}

/// Second order section, direct form I
#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl Biquad {
    fn high_shelf(gain: f32) -> Self {
        let mut biquad = Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        };
        biquad.set_high_shelf(SAMPLE_RATE as f32, FILTER_CUTOFF_FREQUENCY_HZ, gain, FILTER_SLOPE);
        biquad
    }

    /// Shelf coefficients from the audio EQ cookbook, with `gain` used directly as A.
    /// History is kept so gain changes between frames don't click.
    fn set_high_shelf(&mut self, sample_rate: f32, frequency: f32, gain: f32, slope: f32) {
        let a = gain;
        let a_add_1 = a + 1.0;
        let a_sub_1 = a - 1.0;
        let omega = TAU * frequency / sample_rate;
        let a_add_1_cos = a_add_1 * omega.cos();
        let a_sub_1_cos = a_sub_1 * omega.cos();
        let alpha = 0.5 * omega.sin() / slope;
        let zeta = 2.0 * a.sqrt() * alpha;

        let b0 = (a_add_1 + a_sub_1_cos + zeta) * a;
        let b1 = -2.0 * (a_sub_1 + a_add_1_cos) * a;
        let b2 = (a_add_1 + a_sub_1_cos - zeta) * a;
        let a0 = a_add_1 - a_sub_1_cos + zeta;
        let a1 = 2.0 * (a_sub_1 - a_add_1_cos);
        let a2 = a_add_1 - a_sub_1_cos - zeta;

        let norm = 1.0 / a0;
        self.b0 = b0 * norm;
        self.b1 = b1 * norm;
        self.b2 = b2 * norm;
        self.a1 = a1 * norm;
        self.a2 = a2 * norm;
    }

    fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

/// Stereo high-shelf whose state lives across frames for one listener/source pair.
///
/// Each ear is a second order (RBJ cookbook) shelf rather than a one-pole filter,
/// with the shelf gain used directly as the cookbook's `A`. This keeps the 1 kHz
/// corner and the 0.708 slope exact.
#[derive(Debug, Clone)]
pub struct PenumbraFilter {
    channels: [Biquad; 2],
}

impl PenumbraFilter {
    pub fn new() -> Self {
        Self {
            channels: [Biquad::high_shelf(ZERO_DB), Biquad::high_shelf(ZERO_DB)],
        }
    }

    pub fn set_gains(&mut self, left: f32, right: f32) {
        let sample_rate = SAMPLE_RATE as f32;
        self.channels[0].set_high_shelf(sample_rate, FILTER_CUTOFF_FREQUENCY_HZ, left, FILTER_SLOPE);
        self.channels[1].set_high_shelf(sample_rate, FILTER_CUTOFF_FREQUENCY_HZ, right, FILTER_SLOPE);
    }

    /// Filters interleaved stereo samples in place
    pub fn render(&mut self, interleaved: &mut [i16]) {
        for frame in interleaved.chunks_exact_mut(2) {
            for (sample, channel) in frame.iter_mut().zip(self.channels.iter_mut()) {
                let filtered = channel.process(*sample as f32);
                *sample = filtered
                    .round()
                    .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            }
        }
    }
}

impl Default for PenumbraFilter {
    fn default() -> Self {
        Self::new()
    }
}
