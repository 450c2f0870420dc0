mod filter;
pub mod geometry;
pub mod mixer;
pub mod scheduler;
pub mod spatial;
pub mod stream;
mod throttle;

pub use filter::{penumbra_gains, PenumbraFilter};
pub use geometry::{AABox, UnattenuatedZones, ZoneParseError};
pub use mixer::{
    AudioMixer, FrameReport, MixerCommand, MixerContext, MixerError, MixerHandle, MixerStats,
    StreamStats,
};
pub use scheduler::{FrameClock, FrameScheduler, StopHandle, SystemClock};
pub use spatial::{
    measure_stereo_levels, render_contribution, spatialize, MixParams, MixSettings, SkipReason,
    Spatialization,
};
pub use stream::{SourceStream, StreamFeed, StreamFrame, StreamId, StreamKind};
pub use throttle::ThrottleController;

// Network audio format
pub const SAMPLE_RATE: u32 = 24_000;
pub const FRAME_SAMPLES_PER_CHANNEL: usize = 256;
pub const FRAME_SAMPLES_STEREO: usize = FRAME_SAMPLES_PER_CHANNEL * 2;
pub const FRAME_INTERVAL_USECS: u64 =
    FRAME_SAMPLES_PER_CHANNEL as u64 * 1_000_000 / SAMPLE_RATE as u64;

/// Far-ear delay, in samples, for a source level with one ear
pub const SAMPLE_PHASE_DELAY_AT_90: usize = 20;

/// Baseline loudness-per-distance cutoff before any throttling
pub const LOUDNESS_TO_DISTANCE_RATIO: f32 = 0.00001;
