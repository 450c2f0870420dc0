//! Fixed-cadence driver for the mixer.
//!
//! Frame `n` is due `n` intervals after the loop started, so a slow frame only
//! delays the frames behind it and never shifts the whole timeline.

use log::{debug, info, log, Level};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::mixer::{AudioMixer, FrameReport};
use super::FRAME_INTERVAL_USECS;
use crate::network::TransportSink;

const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Time source for the frame loop
#[cfg_attr(test, mockall::automock)]
pub trait FrameClock {
    /// Time since the clock started
    fn elapsed(&self) -> Duration;
    fn sleep(&mut self, duration: Duration);
}

/// Wall clock started when it is created
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameClock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Shared flag that asks the frame loop to finish after the current frame
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct FrameScheduler<C: FrameClock> {
    mixer: AudioMixer,
    clock: C,
    stop: StopHandle,
    next_frame: u64,
    usecs_to_sleep: i64,
    overruns: u64,
    last_stats_at: Duration,
}

impl FrameScheduler<SystemClock> {
    pub fn new(mixer: AudioMixer) -> Self {
        Self::with_clock(mixer, SystemClock::new())
    }
}

impl<C: FrameClock> FrameScheduler<C> {
    pub fn with_clock(mixer: AudioMixer, clock: C) -> Self {
        let last_stats_at = clock.elapsed();
        Self {
            mixer,
            clock,
            stop: StopHandle::new(),
            next_frame: 0,
            usecs_to_sleep: FRAME_INTERVAL_USECS as i64,
            overruns: 0,
            last_stats_at,
        }
    }

    /// Shares a stop flag raised elsewhere, e.g. by a signal handler
    pub fn with_stop(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Throttle update, stats, then the mix itself. The sleep observed after
    /// the previous frame is what feeds the throttle.
    pub fn run_frame<S: TransportSink + ?Sized>(&mut self, sink: &mut S) -> FrameReport {
        self.mixer.throttle_mut().update(self.usecs_to_sleep);

        let now = self.clock.elapsed();
        if now.saturating_sub(self.last_stats_at) >= STATS_INTERVAL {
            self.report_stats();
            self.last_stats_at = now;
        }

        self.mixer.mix_frame(sink)
    }

    /// Sleeps until the next frame is due. An overrun does not sleep and is not
    /// made up later.
    pub fn wait_for_next_frame(&mut self) {
        self.next_frame += 1;
        let due = self.next_frame as i64 * FRAME_INTERVAL_USECS as i64;
        let elapsed = self.clock.elapsed().as_micros() as i64;
        self.usecs_to_sleep = due - elapsed;

        if self.usecs_to_sleep > 0 {
            self.clock
                .sleep(Duration::from_micros(self.usecs_to_sleep as u64));
        } else {
            self.overruns += 1;
            debug!(
                "Frame {} overran its slot by {}us",
                self.next_frame - 1,
                -self.usecs_to_sleep
            );
        }
    }

    /// Runs frames until stopped. The frame in progress when the stop arrives
    /// still sends everything it mixed. Returns the number of frames run.
    pub fn run<S: TransportSink + ?Sized>(&mut self, sink: &mut S) -> u64 {
        info!(
            "Mixing every {}us for {} sessions",
            FRAME_INTERVAL_USECS,
            self.mixer.session_count()
        );

        let mut frames = 0;
        loop {
            self.run_frame(sink);
            frames += 1;

            if self.stop.is_stopped() {
                break;
            }

            self.wait_for_next_frame();
        }

        info!("Mixer stopped after {} frames, {} overran", frames, self.overruns);
        frames
    }

    fn report_stats(&mut self) {
        let level = if self.mixer.context().print_stream_stats {
            Level::Info
        } else {
            Level::Debug
        };

        let stats = self.mixer.take_stats();
        let throttle = self.mixer.throttle();
        log!(
            level,
            "frames: {}, avg listeners/frame: {:.2}, avg mixes/listener: {:.2}, trailing sleep: {:.1}%, throttling ratio: {:.3}",
            stats.frames,
            stats.average_listeners_per_frame(),
            stats.average_mixes_per_listener(),
            throttle.trailing_sleep_ratio() * 100.0,
            throttle.performance_throttling_ratio()
        );

        if self.mixer.context().print_stream_stats {
            for stream in self.mixer.stream_stats() {
                info!(
                    "session {} stream {} ({:?}): popped {}, starved {}, dropped {}",
                    stream.session,
                    stream.stream,
                    stream.kind,
                    stream.frames_popped,
                    stream.pop_failures,
                    stream.dropped_frames
                );
            }
        }
    }

    pub fn mixer(&self) -> &AudioMixer {
        &self.mixer
    }

    pub fn mixer_mut(&mut self) -> &mut AudioMixer {
        &mut self.mixer
    }

    pub fn next_frame(&self) -> u64 {
        self.next_frame
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    pub fn into_mixer(self) -> AudioMixer {
        self.mixer
    }
}
