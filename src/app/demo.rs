//! Synthetic participants for running the mixer without real clients.
//!
//! Each demo session stands on a circle around the origin facing the center and
//! speaks a steady tone into its microphone stream.

use glam::{Quat, Vec3};
use log::{debug, info};
use std::f32::consts::TAU;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::session::{Session, SessionId};
use crate::audio::{
    measure_stereo_levels, MixerError, MixerHandle, SourceStream, StopHandle, StreamFeed,
    StreamFrame, StreamKind, FRAME_INTERVAL_USECS, FRAME_SAMPLES_PER_CHANNEL, SAMPLE_RATE,
};
use crate::network::{Delivery, MixPacket};

const CIRCLE_RADIUS: f32 = 2.0;
const BASE_FREQUENCY_HZ: f32 = 220.0;
const TONE_AMPLITUDE: f32 = 0.25;

/// Sine oscillator producing mono network frames
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    frequency: f32,
    amplitude: f32,
    phase: f32,
}

impl ToneGenerator {
    pub fn new(frequency: f32, amplitude: f32) -> Self {
        Self {
            frequency,
            amplitude: amplitude.clamp(0.0, 1.0),
            phase: 0.0,
        }
    }

    pub fn next_frame(&mut self) -> Vec<i16> {
        let step = TAU * self.frequency / SAMPLE_RATE as f32;
        let mut frame = Vec::with_capacity(FRAME_SAMPLES_PER_CHANNEL);
        for _ in 0..FRAME_SAMPLES_PER_CHANNEL {
            frame.push((self.phase.sin() * self.amplitude * i16::MAX as f32) as i16);
            self.phase = (self.phase + step) % TAU;
        }
        frame
    }
}

/// Positions for `count` participants evenly spaced on a circle, each facing the center
pub fn arrange_in_circle(count: usize, radius: f32) -> Vec<(Vec3, Quat)> {
    (0..count)
        .map(|i| {
            let angle = TAU * i as f32 / count as f32;
            let position = Vec3::new(angle.sin() * radius, 0.0, -angle.cos() * radius);
            let orientation = (-position)
                .try_normalize()
                .map_or(Quat::IDENTITY, |toward_center| {
                    Quat::from_rotation_arc(Vec3::NEG_Z, toward_center)
                });
            (position, orientation)
        })
        .collect()
}

/// Registers `count` tone-speaking sessions with the mixer and spawns a task per
/// session that feeds one frame every frame interval until `stop` is raised.
pub fn spawn_demo_sessions(
    handle: &MixerHandle,
    count: usize,
    queue_frames: usize,
    stop: StopHandle,
) -> Result<Vec<JoinHandle<()>>, MixerError> {
    let mut tasks = Vec::with_capacity(count);

    for (index, (position, orientation)) in arrange_in_circle(count, CIRCLE_RADIUS)
        .into_iter()
        .enumerate()
    {
        let (microphone, feed) =
            SourceStream::with_queue_frames(StreamKind::Microphone, false, queue_frames);
        let id = SessionId::new();
        handle.add_session(Session::new(id, microphone.with_pose(position, orientation)))?;

        let tone = ToneGenerator::new(BASE_FREQUENCY_HZ * (index + 1) as f32, TONE_AMPLITUDE);
        info!("Demo session {} at {} speaking {}Hz", id, position, tone.frequency);
        tasks.push(tokio::spawn(feed_tone(feed, tone, position, orientation, stop.clone())));
    }

    Ok(tasks)
}

async fn feed_tone(
    mut feed: StreamFeed,
    mut tone: ToneGenerator,
    position: Vec3,
    orientation: Quat,
    stop: StopHandle,
) {
    let mut interval = tokio::time::interval(Duration::from_micros(FRAME_INTERVAL_USECS));
    while !stop.is_stopped() {
        interval.tick().await;
        if !feed.push(StreamFrame::new(tone.next_frame(), position, orientation)) {
            debug!("Demo feed is ahead of the mixer, frame dropped");
        }
    }
}

/// Drains delivered mixes and logs their levels now and then
pub async fn monitor_deliveries(mut receiver: mpsc::Receiver<Delivery>) -> u64 {
    const LOG_EVERY: u64 = 500;

    let mut delivered = 0u64;
    while let Some(delivery) = receiver.recv().await {
        delivered += 1;
        if delivered % LOG_EVERY != 0 {
            continue;
        }

        match &delivery.packet {
            MixPacket::Mixed { sequence, samples } => {
                let (left, right) = measure_stereo_levels(samples);
                debug!(
                    "Mix {} for {}: left {:.0}, right {:.0}",
                    sequence, delivery.listener, left, right
                );
            }
            MixPacket::Silent { sequence, .. } => {
                debug!("Mix {} for {} was silent", sequence, delivery.listener);
            }
        }
    }
    delivered
}
