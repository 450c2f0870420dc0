// Spatial audio relay: mixes every participant's streams into a per-listener
// stereo frame on a fixed cadence.
// Expose public modules for use in integration tests

pub mod app;
pub mod audio;
pub mod network;

// Re-export commonly used types for convenience
pub use app::config::{ConfigError, MixerConfig};
pub use app::session::{Session, SessionId};
pub use app::{App, RunOptions};
pub use audio::{AudioMixer, FrameScheduler, MixerContext, MixerHandle, SourceStream};
pub use network::{OutboundFrame, TransportError, TransportSink};
