//! Positional source streams and the ingest hand-off that feeds them.
//!
//! The receiving side of the relay owns a [`StreamFeed`] per stream and pushes
//! decoded frames into it from its own thread. The mixer owns the matching
//! [`SourceStream`] and pops at most one frame per tick, so neither side ever
//! waits on the other.

use glam::{Quat, Vec3};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::geometry::{AABox, UnattenuatedZones};
use super::{FRAME_INTERVAL_USECS, FRAME_SAMPLES_PER_CHANNEL, FRAME_SAMPLES_STEREO};

/// Frames of popped audio kept for the delayed channel of phase panning
const HISTORY_FRAMES: usize = 10;

/// Frames the ingest side may queue ahead of the mixer
pub const DEFAULT_QUEUE_FRAMES: usize = 10;

const TRAILING_AVERAGE_FRAMES: f32 = 100.0;
const CURRENT_FRAME_RATIO: f32 = 1.0 / TRAILING_AVERAGE_FRAMES;
const PREVIOUS_FRAMES_RATIO: f32 = 1.0 - CURRENT_FRAME_RATIO;
const LOUDNESS_EPSILON: f32 = 0.000001;

const INITIAL_MSECS_NO_FADE: f32 = 20.0;
const MSECS_FADE_TO_ZERO: f32 = 320.0;

/// Unique identifier for a source stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct StreamId(Uuid);

impl StreamId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// What produces a stream. Decided once when the stream is created.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamKind {
    /// A participant's own voice
    Microphone,
    /// Injected sound with its own gain
    Injector { attenuation_ratio: f32 },
    /// A participant that is connected but only sends silence
    Silent,
}

/// One frame of received audio together with the pose it was captured at.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    pub samples: Vec<i16>,
    pub position: Vec3,
    pub orientation: Quat,
}

impl StreamFrame {
    pub fn new(samples: Vec<i16>, position: Vec3, orientation: Quat) -> Self {
        Self {
            samples,
            position,
            orientation,
        }
    }
}

/// Producer half of a stream's ingest queue
pub struct StreamFeed {
    producer: HeapProducer<StreamFrame>,
    dropped: Arc<AtomicU64>,
}

impl StreamFeed {
    /// Queues a frame for the mixer. When the queue is full the frame is dropped
    /// and counted rather than waiting for room.
    pub fn push(&mut self, frame: StreamFrame) -> bool {
        match self.producer.push(frame) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.producer.len()
    }
}

/// Ring of recently popped frames, stored slot by slot so every frame is contiguous.
struct FrameHistory {
    samples: Vec<i16>,
    frame_len: usize,
    next_slot: usize,
}

impl FrameHistory {
    fn new(frame_len: usize) -> Self {
        Self {
            samples: vec![0; frame_len * HISTORY_FRAMES],
            frame_len,
            next_slot: 0,
        }
    }

    fn append(&mut self, frame: &[i16]) -> usize {
        let start = self.next_slot * self.frame_len;
        let slot = &mut self.samples[start..start + self.frame_len];
        let copied = frame.len().min(self.frame_len);
        slot[..copied].copy_from_slice(&frame[..copied]);
        slot[copied..].fill(0);

        self.next_slot = (self.next_slot + 1) % HISTORY_FRAMES;
        start
    }

    fn frame(&self, start: usize) -> &[i16] {
        &self.samples[start..start + self.frame_len]
    }

    fn sample_before(&self, start: usize, samples_back: usize) -> i16 {
        let capacity = self.samples.len();
        self.samples[(start + capacity - samples_back % capacity) % capacity]
    }
}

/// Gain for the `index_of_repeat`-th consecutive repeat of a starved stream's last
/// frame: untouched for the first 20 ms, then an exponential fade that reaches
/// silence after a further 320 ms.
pub fn repeated_frame_fade_factor(index_of_repeat: u32) -> f32 {
    let initial_frames_no_fade = INITIAL_MSECS_NO_FADE * 1000.0 / FRAME_INTERVAL_USECS as f32;
    let frames_fade_to_zero = MSECS_FADE_TO_ZERO * 1000.0 / FRAME_INTERVAL_USECS as f32;
    let sample_range = i16::MAX as f32;

    let index = index_of_repeat as f32;
    if index <= initial_frames_no_fade {
        1.0
    } else if index <= initial_frames_no_fade + frames_fade_to_zero {
        sample_range.powf(-(index - initial_frames_no_fade) / frames_fade_to_zero)
    } else {
        0.0
    }
}

fn frame_loudness(frame: &[i16]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f32 = frame.iter().map(|&sample| (sample as f32).abs()).sum();
    sum / frame.len() as f32 / i16::MAX as f32
}

/// A positional audio source as seen by the mixer
pub struct SourceStream {
    id: StreamId,
    kind: StreamKind,
    stereo: bool,
    loopback: bool,
    position: Vec3,
    orientation: Quat,
    incoming: HeapConsumer<StreamFrame>,
    history: FrameHistory,
    last_popped: Option<usize>,
    last_pop_succeeded: bool,
    last_pop_loudness: f32,
    trailing_loudness: f32,
    consecutive_not_mixed: u32,
    listener_unattenuated_zone: Option<AABox>,
    frames_popped: u64,
    pop_failures: u64,
    dropped: Arc<AtomicU64>,
}

impl SourceStream {
    /// Creates a stream and the feed the ingest side writes into
    pub fn new(kind: StreamKind, stereo: bool) -> (Self, StreamFeed) {
        Self::with_queue_frames(kind, stereo, DEFAULT_QUEUE_FRAMES)
    }

    pub fn with_queue_frames(kind: StreamKind, stereo: bool, queue_frames: usize) -> (Self, StreamFeed) {
        let (producer, consumer) = HeapRb::<StreamFrame>::new(queue_frames.max(1)).split();
        let dropped = Arc::new(AtomicU64::new(0));
        let frame_len = if stereo {
            FRAME_SAMPLES_STEREO
        } else {
            FRAME_SAMPLES_PER_CHANNEL
        };

        let stream = Self {
            id: StreamId::new(),
            kind,
            stereo,
            loopback: false,
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            incoming: consumer,
            history: FrameHistory::new(frame_len),
            last_popped: None,
            last_pop_succeeded: false,
            last_pop_loudness: 0.0,
            trailing_loudness: 0.0,
            consecutive_not_mixed: 0,
            listener_unattenuated_zone: None,
            frames_popped: 0,
            pop_failures: 0,
            dropped: Arc::clone(&dropped),
        };

        (stream, StreamFeed { producer, dropped })
    }

    pub fn microphone(stereo: bool) -> (Self, StreamFeed) {
        Self::new(StreamKind::Microphone, stereo)
    }

    pub fn injector(attenuation_ratio: f32, stereo: bool) -> (Self, StreamFeed) {
        Self::new(StreamKind::Injector { attenuation_ratio }, stereo)
    }

    /// Mix this stream back into its own session's output
    pub fn with_loopback(mut self, loopback: bool) -> Self {
        self.loopback = loopback;
        self
    }

    pub fn with_pose(mut self, position: Vec3, orientation: Quat) -> Self {
        self.set_pose(position, orientation);
        self
    }

    pub fn set_pose(&mut self, position: Vec3, orientation: Quat) {
        self.position = position;
        self.orientation = orientation;
    }

    /// Takes the next queued frame, if any. On failure the previous frame stays
    /// available for repetition and the not-mixed count grows.
    pub fn pop_frame(&mut self) -> bool {
        match self.incoming.pop() {
            Some(frame) => {
                self.set_pose(frame.position, frame.orientation);
                let start = self.history.append(&frame.samples);
                self.last_popped = Some(start);
                self.last_pop_succeeded = true;
                self.consecutive_not_mixed = 0;
                self.frames_popped += 1;
                self.update_loudness();
                true
            }
            None => {
                self.last_pop_succeeded = false;
                self.consecutive_not_mixed = self.consecutive_not_mixed.saturating_add(1);
                self.pop_failures += 1;
                false
            }
        }
    }

    fn update_loudness(&mut self) {
        self.last_pop_loudness = match (self.kind, self.last_popped_frame()) {
            (StreamKind::Silent, _) | (_, None) => 0.0,
            (_, Some(frame)) => frame_loudness(frame),
        };

        if self.last_pop_loudness >= self.trailing_loudness {
            self.trailing_loudness = self.last_pop_loudness;
        } else {
            self.trailing_loudness = self.trailing_loudness * PREVIOUS_FRAMES_RATIO
                + self.last_pop_loudness * CURRENT_FRAME_RATIO;
            if self.trailing_loudness < LOUDNESS_EPSILON {
                self.trailing_loudness = 0.0;
            }
        }
    }

    /// Applies the global zone pair for this frame: when the stream stands in the
    /// source box, listeners in the listener box hear it unattenuated.
    pub fn assign_unattenuated_zone(&mut self, zones: Option<&UnattenuatedZones>) {
        self.listener_unattenuated_zone = zones
            .filter(|zones| zones.source.contains(self.position))
            .map(|zones| zones.listener);
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn is_stereo(&self) -> bool {
        self.stereo
    }

    pub fn loopback(&self) -> bool {
        self.loopback
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn orientation(&self) -> Quat {
        self.orientation
    }

    pub fn pop_succeeded(&self) -> bool {
        self.last_pop_succeeded
    }

    pub fn last_popped_frame(&self) -> Option<&[i16]> {
        self.last_popped.map(|start| self.history.frame(start))
    }

    /// Sample `samples_back` positions before the start of the last popped frame
    pub fn historical_sample(&self, samples_back: usize) -> i16 {
        match self.last_popped {
            Some(start) => self.history.sample_before(start, samples_back),
            None => 0,
        }
    }

    pub fn loudness(&self) -> f32 {
        self.last_pop_loudness
    }

    pub fn trailing_loudness(&self) -> f32 {
        self.trailing_loudness
    }

    pub fn consecutive_not_mixed(&self) -> u32 {
        self.consecutive_not_mixed
    }

    pub fn attenuation_ratio(&self) -> Option<f32> {
        match self.kind {
            StreamKind::Injector { attenuation_ratio } => Some(attenuation_ratio),
            _ => None,
        }
    }

    pub fn listener_unattenuated_zone(&self) -> Option<&AABox> {
        self.listener_unattenuated_zone.as_ref()
    }

    pub fn frames_popped(&self) -> u64 {
        self.frames_popped
    }

    pub fn pop_failures(&self) -> u64 {
        self.pop_failures
    }

    /// Frames the ingest side dropped because the queue was full
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for SourceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceStream")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stereo", &self.stereo)
            .field("position", &self.position)
            .field("trailing_loudness", &self.trailing_loudness)
            .field("consecutive_not_mixed", &self.consecutive_not_mixed)
            .finish()
    }
}
