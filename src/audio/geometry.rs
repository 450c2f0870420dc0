use glam::{Quat, Vec3};
use std::f32::consts::FRAC_PI_2;
use std::str::FromStr;
use thiserror::Error;

use super::SAMPLE_PHASE_DELAY_AT_90;

/// Distances below this are clamped so loudness / distance stays finite
pub const EPSILON: f32 = 0.000001;

pub const ATTENUATION_BEGINS_AT_DISTANCE: f32 = 1.0;
pub const ATTENUATION_AMOUNT_PER_DOUBLING_IN_DISTANCE: f32 = 0.18;
pub const RADIUS_OF_HEAD: f32 = 0.076;

const MAX_OFF_AXIS_ATTENUATION: f32 = 0.2;
const OFF_AXIS_ATTENUATION_FORMULA_STEP: f32 = (1.0 - MAX_OFF_AXIS_ATTENUATION) / 2.0;
const PHASE_AMPLITUDE_RATIO_AT_90: f32 = 0.5;

/// Axis-aligned box described by its minimum corner and its size on each axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AABox {
    corner: Vec3,
    dimensions: Vec3,
}

impl AABox {
    pub fn new(corner: Vec3, dimensions: Vec3) -> Self {
        Self { corner, dimensions }
    }

    pub fn corner(&self) -> Vec3 {
        self.corner
    }

    pub fn dimensions(&self) -> Vec3 {
        self.dimensions
    }

    pub fn center(&self) -> Vec3 {
        self.corner + self.dimensions * 0.5
    }

    /// Inclusive on every face
    pub fn contains(&self, point: Vec3) -> bool {
        let far = self.corner + self.dimensions;
        point.cmpge(self.corner).all() && point.cmple(far).all()
    }
}

/// Errors raised while parsing an unattenuated zone description
#[derive(Debug, Error, PartialEq)]
pub enum ZoneParseError {
    #[error("expected 12 comma separated values, found {0}")]
    FieldCount(usize),

    #[error("field {index} is not a number: {value:?}")]
    InvalidNumber { index: usize, value: String },
}

/// Paired source/listener regions. A source standing in the source box is heard
/// without distance attenuation by any listener standing in the listener box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnattenuatedZones {
    pub source: AABox,
    pub listener: AABox,
}

impl UnattenuatedZones {
    pub fn new(source: AABox, listener: AABox) -> Self {
        Self { source, listener }
    }
}

impl FromStr for UnattenuatedZones {
    type Err = ZoneParseError;

    /// Parses `sx,sy,sz,sw,sh,sd,lx,ly,lz,lw,lh,ld`: source corner, source
    /// dimensions, listener corner, listener dimensions.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(',').map(str::trim).collect();
        if fields.len() != 12 {
            return Err(ZoneParseError::FieldCount(fields.len()));
        }

        let mut values = [0.0f32; 12];
        for (index, field) in fields.iter().enumerate() {
            values[index] = field.parse().map_err(|_| ZoneParseError::InvalidNumber {
                index,
                value: field.to_string(),
            })?;
        }

        let v = |i: usize| Vec3::new(values[i], values[i + 1], values[i + 2]);
        Ok(Self {
            source: AABox::new(v(0), v(3)),
            listener: AABox::new(v(6), v(9)),
        })
    }
}

/// Logarithmic falloff: 0.18 of the coefficient is lost per doubling of distance
/// past the 1 unit reference. Never negative.
pub fn distance_coefficient(distance: f32) -> f32 {
    if distance < ATTENUATION_BEGINS_AT_DISTANCE {
        return 1.0;
    }

    let coefficient = 1.0
        - (distance / ATTENUATION_BEGINS_AT_DISTANCE).log2()
            * ATTENUATION_AMOUNT_PER_DOUBLING_IN_DISTANCE;
    coefficient.max(0.0)
}

/// Unsigned angle between two unit vectors
pub fn angle(a: Vec3, b: Vec3) -> f32 {
    a.dot(b).clamp(-1.0, 1.0).acos()
}

/// Angle from `from` to `to`, negative when the rotation runs clockwise about `reference`
pub fn oriented_angle(from: Vec3, to: Vec3, reference: Vec3) -> f32 {
    let unsigned = angle(from, to);
    if reference.dot(from.cross(to)) < 0.0 {
        -unsigned
    } else {
        unsigned
    }
}

/// Gain applied to a talking participant depending on where they face.
///
/// `relative_position` is the source position minus the listener position. The
/// angle is measured between the source's forward axis (-Z) and that vector in the
/// source's frame, so a source facing the listener gets 1.0 and one facing directly
/// away gets 0.2.
pub fn off_axis_coefficient(source_orientation: Quat, relative_position: Vec3) -> f32 {
    let rotated_listener_position = source_orientation.inverse() * relative_position;
    let Some(direction) = rotated_listener_position.try_normalize() else {
        return 1.0;
    };

    let angle_of_delivery = angle(Vec3::NEG_Z, direction);
    MAX_OFF_AXIS_ATTENUATION + OFF_AXIS_ATTENUATION_FORMULA_STEP * (angle_of_delivery / FRAC_PI_2)
}

/// Signed horizontal angle between the listener's forward axis and the source.
/// Positive values put the source on the listener's left.
pub fn bearing_to_source(listener_orientation: Quat, relative_position: Vec3) -> f32 {
    let mut rotated_source_position = listener_orientation.inverse() * relative_position;
    rotated_source_position.y = 0.0;

    match rotated_source_position.try_normalize() {
        Some(direction) => oriented_angle(Vec3::NEG_Z, direction, Vec3::Y),
        None => 0.0,
    }
}

/// Interaural delay and level difference for one source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhasePanning {
    /// Samples the far ear lags behind the near ear
    pub samples_delay: usize,
    /// Amplitude of the far ear relative to the near ear
    pub weak_channel_ratio: f32,
}

impl PhasePanning {
    pub const CENTERED: PhasePanning = PhasePanning {
        samples_delay: 0,
        weak_channel_ratio: 1.0,
    };
}

pub fn phase_panning(bearing: f32, distance: f32) -> PhasePanning {
    let sin_ratio = bearing.sin().abs();
    let mut samples_delay = (SAMPLE_PHASE_DELAY_AT_90 as f32 * sin_ratio) as usize;
    let mut weak_attenuation = PHASE_AMPLITUDE_RATIO_AT_90 * sin_ratio;

    if distance < RADIUS_OF_HEAD {
        // a source inside the head is not panned
        let inside = distance / RADIUS_OF_HEAD;
        samples_delay = (samples_delay as f32 * inside) as usize;
        weak_attenuation *= inside;
    }

    PhasePanning {
        samples_delay,
        weak_channel_ratio: 1.0 - weak_attenuation,
    }
}
