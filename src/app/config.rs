use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

use crate::audio::{MixerContext, UnattenuatedZones, ZoneParseError};

/// Prefix for environment overrides, e.g. `MIXER__AUDIO__ENABLE_FILTER=false`
const ENV_PREFIX: &str = "MIXER";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid unattenuated zone: {0}")]
    InvalidZone(#[from] ZoneParseError),
}

/// Top level settings, read once at startup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    pub server: ServerSettings,
    pub audio: AudioSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Where mixes are sent from
    pub bind_address: SocketAddr,
    /// Frames each stream may queue ahead of the mixer
    pub ingest_queue_frames: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 40103)),
            ingest_queue_frames: crate::audio::stream::DEFAULT_QUEUE_FRAMES,
        }
    }
}

/// Audio stream and mixing settings. The jitter buffer options belong to the
/// ingest side and are carried here so there is one place to configure them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub dynamic_jitter_buffers: bool,
    pub static_desired_jitter_buffer_frames: u32,
    pub max_frames_over_desired: u32,
    pub use_stdev_for_jitter_calc: bool,
    pub window_starve_threshold: u32,
    pub window_seconds_for_desired_calc_on_too_many_starves: u32,
    pub window_seconds_for_desired_reduction: u32,
    pub repetition_with_fade: bool,
    pub print_stream_stats: bool,
    pub enable_filter: bool,
    /// Twelve comma separated numbers: source corner, source dimensions,
    /// listener corner, listener dimensions
    pub unattenuated_zone: Option<String>,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            dynamic_jitter_buffers: false,
            static_desired_jitter_buffer_frames: 1,
            max_frames_over_desired: 10,
            use_stdev_for_jitter_calc: false,
            window_starve_threshold: 3,
            window_seconds_for_desired_calc_on_too_many_starves: 50,
            window_seconds_for_desired_reduction: 10,
            repetition_with_fade: false,
            print_stream_stats: false,
            enable_filter: true,
            unattenuated_zone: None,
        }
    }
}

impl AudioSettings {
    /// The configured zone pair. An empty string counts as no zone.
    pub fn unattenuated_zones(&self) -> Result<Option<UnattenuatedZones>, ZoneParseError> {
        match self.unattenuated_zone.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(zone) => zone.parse().map(Some),
        }
    }

    pub fn mixer_context(&self) -> Result<MixerContext, ConfigError> {
        let mut context = MixerContext::default()
            .with_zones(self.unattenuated_zones()?)
            .with_filter(self.enable_filter)
            .with_repetition_with_fade(self.repetition_with_fade);
        context.print_stream_stats = self.print_stream_stats;
        Ok(context)
    }

    fn log_summary(&self) {
        if self.dynamic_jitter_buffers {
            debug!("Dynamic jitter buffers enabled");
        } else {
            debug!("Dynamic jitter buffers disabled");
        }
        debug!(
            "Static desired jitter buffer frames: {}",
            self.static_desired_jitter_buffer_frames
        );
        debug!("Max frames over desired: {}", self.max_frames_over_desired);
        debug!(
            "Jitter calculation uses {}",
            if self.use_stdev_for_jitter_calc {
                "standard deviation"
            } else {
                "max gap"
            }
        );
        debug!(
            "Starve window: threshold {} over {}s, reduction window {}s",
            self.window_starve_threshold,
            self.window_seconds_for_desired_calc_on_too_many_starves,
            self.window_seconds_for_desired_reduction
        );
        info!(
            "Repetition with fade {}, penumbra filter {}",
            if self.repetition_with_fade { "enabled" } else { "disabled" },
            if self.enable_filter { "enabled" } else { "disabled" }
        );
        if self.print_stream_stats {
            info!("Stream stats will be logged every second");
        }
    }
}

impl MixerConfig {
    /// Loads defaults, then the optional TOML file, then `MIXER__` environment
    /// overrides. A malformed unattenuated zone fails the load.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let settings: MixerConfig = builder.build()?.try_deserialize()?;
        settings.validate()?;
        settings.audio.log_summary();
        Ok(settings)
    }

    /// Parses TOML text without consulting the environment
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let settings: MixerConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.audio.unattenuated_zones()?;
        Ok(())
    }
}
