pub mod config;
pub mod demo;
pub mod session;

use anyhow::{Context, Result};
use log::{info, warn};
use std::net::SocketAddr;

use crate::audio::{AudioMixer, FrameScheduler, MixerHandle, StopHandle};
use crate::network::{ChannelTransport, TransportSink, UdpTransport};
use self::config::MixerConfig;

/// Outbound frames buffered for the in-process consumer in demo mode
const DEMO_DELIVERY_QUEUE: usize = 256;

/// Runtime choices made on the command line rather than in the config file
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overrides `server.bind_address`
    pub bind: Option<SocketAddr>,
    /// Synthetic tone sessions to mix instead of serving real clients
    pub demo_sources: usize,
}

/// Wires configuration, mixer, scheduler and transport together.
///
/// Sessions reach the mixer through [`handle`](Self::handle). A session added
/// with an address starts receiving UDP mixes at the next frame.
pub struct App {
    config: MixerConfig,
    stop: StopHandle,
    mixer: AudioMixer,
    handle: MixerHandle,
}

impl App {
    pub fn new(config: MixerConfig) -> Result<Self> {
        let context = config
            .audio
            .mixer_context()
            .context("Invalid audio settings")?;
        let (mixer, handle) = AudioMixer::new(context);

        Ok(Self {
            config,
            stop: StopHandle::new(),
            mixer,
            handle,
        })
    }

    pub fn config(&self) -> &MixerConfig {
        &self.config
    }

    pub fn mixer(&self) -> &AudioMixer {
        &self.mixer
    }

    /// For the ingest side: adds and removes sessions and injectors
    pub fn handle(&self) -> MixerHandle {
        self.handle.clone()
    }

    /// Raising this ends [`run`](Self::run) after the frame in progress
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Runs the frame loop on a blocking thread until the stop handle is raised.
    /// Returns the number of frames mixed.
    pub async fn run(self, options: RunOptions) -> Result<u64> {
        let App {
            config,
            stop,
            mixer,
            handle,
        } = self;
        let mut scheduler = FrameScheduler::new(mixer).with_stop(stop.clone());

        let mut demo_tasks = Vec::new();
        let mut monitor = None;
        let mut sink: Box<dyn TransportSink + Send> = if options.demo_sources > 0 {
            let (transport, receiver) = ChannelTransport::new(DEMO_DELIVERY_QUEUE);
            monitor = Some(tokio::spawn(demo::monitor_deliveries(receiver)));
            demo_tasks = demo::spawn_demo_sessions(
                &handle,
                options.demo_sources,
                config.server.ingest_queue_frames,
                stop.clone(),
            )?;
            info!("Mixing {} demo sessions", options.demo_sources);
            Box::new(transport)
        } else {
            let bind = options.bind.unwrap_or(config.server.bind_address);
            Box::new(UdpTransport::bind(bind).context("Failed to bind mix transport")?)
        };

        let mixing = tokio::task::spawn_blocking(move || scheduler.run(&mut sink));

        let frames = mixing.await.context("Mixer thread failed")?;

        for task in demo_tasks {
            if let Err(e) = task.await {
                warn!("Demo source ended abnormally: {}", e);
            }
        }
        // the transport, and with it the delivery channel, is gone once the loop returns
        if let Some(monitor) = monitor {
            let delivered = monitor.await.context("Delivery monitor failed")?;
            info!("{} mixes delivered", delivered);
        }

        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SourceStream;
    use crate::network::MixPacket;
    use super::session::{Session, SessionId};
    use std::net::UdpSocket;
    use std::time::Duration;

    #[test]
    fn app_builds_mixer_from_config() {
        let mut config = MixerConfig::default();
        config.audio.enable_filter = false;
        config.audio.repetition_with_fade = true;

        let app = App::new(config).unwrap();
        assert!(!app.mixer().context().filter_enabled);
        assert!(app.mixer().context().repetition_with_fade);
        assert!(app.mixer().context().zones.is_none());
    }

    #[test]
    fn bad_zone_fails_app_creation() {
        let mut config = MixerConfig::default();
        config.audio.unattenuated_zone = Some("1,2".to_string());
        assert!(App::new(config).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn demo_run_stops_on_request() {
        let app = App::new(MixerConfig::default()).unwrap();
        let stop = app.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stop.stop();
        });

        let frames = app
            .run(RunOptions {
                bind: None,
                demo_sources: 2,
            })
            .await
            .unwrap();
        assert!(frames > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn session_added_through_handle_receives_datagrams() {
        let app = App::new(MixerConfig::default()).unwrap();
        let handle = app.handle();
        let stop = app.stop_handle();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let id = SessionId::new();
        let (microphone, _feed) = SourceStream::microphone(false);
        handle
            .add_session(Session::new(id, microphone).with_address(client.local_addr().unwrap()))
            .unwrap();

        let running = tokio::spawn(app.run(RunOptions {
            bind: Some("127.0.0.1:0".parse().unwrap()),
            demo_sources: 0,
        }));

        let packet = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 2048];
            let (size, _) = client.recv_from(&mut buf).unwrap();
            bincode::deserialize::<MixPacket>(&buf[..size]).unwrap()
        })
        .await
        .unwrap();

        stop.stop();
        let frames = running.await.unwrap().unwrap();

        // alone in the room, so the first mix is a silent frame
        assert_eq!(
            packet,
            MixPacket::Silent {
                sequence: 0,
                sample_count: crate::audio::FRAME_SAMPLES_STEREO as u16
            }
        );
        assert!(frames > 0);
    }
}
