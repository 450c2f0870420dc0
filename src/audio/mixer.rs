//! Per-frame mix orchestration: one personalised stereo frame per listening session.

use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::mpsc;

use super::filter::PenumbraFilter;
use super::geometry::UnattenuatedZones;
use super::spatial::{render_contribution, spatialize, MixSettings, Spatialization};
use super::stream::{SourceStream, StreamId, StreamKind};
use super::throttle::ThrottleController;
use super::FRAME_SAMPLES_STEREO;
use crate::app::session::{Session, SessionId};
use crate::network::{OutboundFrame, TransportSink};

#[derive(Debug, Error, PartialEq)]
pub enum MixerError {
    #[error("Unknown session {0}")]
    UnknownSession(SessionId),

    #[error("Session {session} has no injected stream {stream}")]
    UnknownStream { session: SessionId, stream: StreamId },

    #[error("Mixer has shut down")]
    Stopped,
}

/// Everything the mixer reads besides the streams themselves
#[derive(Debug, Clone)]
pub struct MixerContext {
    pub repetition_with_fade: bool,
    pub filter_enabled: bool,
    pub print_stream_stats: bool,
    pub zones: Option<UnattenuatedZones>,
    pub throttle: ThrottleController,
}

impl MixerContext {
    pub fn with_zones(mut self, zones: Option<UnattenuatedZones>) -> Self {
        self.zones = zones;
        self
    }

    pub fn with_filter(mut self, enabled: bool) -> Self {
        self.filter_enabled = enabled;
        self
    }

    pub fn with_repetition_with_fade(mut self, enabled: bool) -> Self {
        self.repetition_with_fade = enabled;
        self
    }

    fn mix_settings(&self) -> MixSettings {
        MixSettings {
            repetition_with_fade: self.repetition_with_fade,
            filter_enabled: self.filter_enabled,
            min_audibility_threshold: self.throttle.min_audibility_threshold(),
        }
    }
}

impl Default for MixerContext {
    fn default() -> Self {
        Self {
            repetition_with_fade: false,
            filter_enabled: true,
            print_stream_stats: false,
            zones: None,
            throttle: ThrottleController::new(),
        }
    }
}

/// Registry changes, applied at the start of the next frame
#[derive(Debug)]
pub enum MixerCommand {
    AddSession(Session),
    RemoveSession(SessionId),
    AddInjector {
        session: SessionId,
        stream: SourceStream,
    },
    RemoveInjector {
        session: SessionId,
        stream: StreamId,
    },
    SetActive {
        session: SessionId,
        active: bool,
    },
}

/// Cloneable handle other tasks use to change what the mixer mixes. Never blocks.
#[derive(Debug, Clone)]
pub struct MixerHandle {
    commands: mpsc::UnboundedSender<MixerCommand>,
}

impl MixerHandle {
    pub fn send(&self, command: MixerCommand) -> Result<(), MixerError> {
        self.commands.send(command).map_err(|_| MixerError::Stopped)
    }

    pub fn add_session(&self, session: Session) -> Result<(), MixerError> {
        self.send(MixerCommand::AddSession(session))
    }

    pub fn remove_session(&self, session: SessionId) -> Result<(), MixerError> {
        self.send(MixerCommand::RemoveSession(session))
    }

    pub fn add_injector(&self, session: SessionId, stream: SourceStream) -> Result<(), MixerError> {
        self.send(MixerCommand::AddInjector { session, stream })
    }

    pub fn remove_injector(&self, session: SessionId, stream: StreamId) -> Result<(), MixerError> {
        self.send(MixerCommand::RemoveInjector { session, stream })
    }

    pub fn set_active(&self, session: SessionId, active: bool) -> Result<(), MixerError> {
        self.send(MixerCommand::SetActive { session, active })
    }
}

/// Counters accumulated between stats reports
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MixerStats {
    pub frames: u64,
    /// Listener mixes produced, summed over frames
    pub listeners: u64,
    /// Pairs that passed the audibility gate
    pub mix_attempts: u64,
    pub streams_mixed: u64,
    pub silent_frames: u64,
    pub emit_failures: u64,
}

impl MixerStats {
    pub fn average_listeners_per_frame(&self) -> f32 {
        if self.frames == 0 {
            return 0.0;
        }
        self.listeners as f32 / self.frames as f32
    }

    pub fn average_mixes_per_listener(&self) -> f32 {
        if self.listeners == 0 {
            return 0.0;
        }
        self.mix_attempts as f32 / self.listeners as f32
    }
}

/// Per-stream ingest counters
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStats {
    pub session: SessionId,
    pub stream: StreamId,
    pub kind: StreamKind,
    pub frames_popped: u64,
    pub pop_failures: u64,
    pub dropped_frames: u64,
}

/// What one frame produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameReport {
    pub listeners: usize,
    pub streams_mixed: usize,
}

pub struct AudioMixer {
    context: MixerContext,
    sessions: BTreeMap<SessionId, Session>,
    commands: mpsc::UnboundedReceiver<MixerCommand>,
    /// Output for the listener being mixed, reused every frame
    client_samples: Vec<i16>,
    scratch: Vec<i16>,
    filters: HashMap<(SessionId, StreamId), PenumbraFilter>,
    listeners: Vec<SessionId>,
    /// Reply addresses gained or lost since the last frame, handed to the sink
    route_changes: Vec<RouteChange>,
    stats: MixerStats,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RouteChange {
    Connect(SessionId, SocketAddr),
    Disconnect(SessionId),
}

impl AudioMixer {
    pub fn new(context: MixerContext) -> (Self, MixerHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();

        if let Some(zones) = &context.zones {
            info!(
                "Unattenuated zone with source center at {} covers listeners in a box centered at {}",
                zones.source.center(),
                zones.listener.center()
            );
        }

        let mixer = Self {
            context,
            sessions: BTreeMap::new(),
            commands: receiver,
            client_samples: vec![0; FRAME_SAMPLES_STEREO],
            scratch: vec![0; FRAME_SAMPLES_STEREO],
            filters: HashMap::new(),
            listeners: Vec::new(),
            route_changes: Vec::new(),
            stats: MixerStats::default(),
        };

        (mixer, MixerHandle { commands: sender })
    }

    pub fn add_session(&mut self, session: Session) {
        info!("Session {} joined the mix", session.id());
        let id = session.id();
        let address = session.address();
        if let Some(previous) = self.sessions.insert(id, session) {
            warn!("Session {} replaced an existing session", previous.id());
            self.forget_filters_for(&previous);
            if previous.address().is_some() {
                self.route_changes.push(RouteChange::Disconnect(id));
            }
        }
        if let Some(address) = address {
            self.route_changes.push(RouteChange::Connect(id, address));
        }
    }

    pub fn remove_session(&mut self, id: SessionId) -> Result<Session, MixerError> {
        let session = self
            .sessions
            .remove(&id)
            .ok_or(MixerError::UnknownSession(id))?;
        self.forget_filters_for(&session);
        if session.address().is_some() {
            self.route_changes.push(RouteChange::Disconnect(id));
        }
        info!("Session {} left the mix", id);
        Ok(session)
    }

    pub fn add_injector(&mut self, id: SessionId, stream: SourceStream) -> Result<StreamId, MixerError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(MixerError::UnknownSession(id))?;
        let stream_id = session.add_injector(stream);
        debug!("Session {} started injecting stream {}", id, stream_id);
        Ok(stream_id)
    }

    pub fn remove_injector(&mut self, id: SessionId, stream: StreamId) -> Result<SourceStream, MixerError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(MixerError::UnknownSession(id))?;
        let removed = session
            .remove_injector(&stream)
            .ok_or(MixerError::UnknownStream {
                session: id,
                stream,
            })?;
        self.filters.retain(|(_, source), _| *source != stream);
        debug!("Session {} stopped injecting stream {}", id, stream);
        Ok(removed)
    }

    pub fn set_active(&mut self, id: SessionId, active: bool) -> Result<(), MixerError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(MixerError::UnknownSession(id))?;
        session.set_active(active);
        Ok(())
    }

    fn forget_filters_for(&mut self, session: &Session) {
        let listener = session.id();
        let streams: Vec<StreamId> = session.streams().map(SourceStream::id).collect();
        self.filters
            .retain(|(l, s), _| *l != listener && !streams.contains(s));
    }

    fn apply(&mut self, command: MixerCommand) -> Result<(), MixerError> {
        match command {
            MixerCommand::AddSession(session) => {
                self.add_session(session);
                Ok(())
            }
            MixerCommand::RemoveSession(id) => self.remove_session(id).map(|_| ()),
            MixerCommand::AddInjector { session, stream } => {
                self.add_injector(session, stream).map(|_| ())
            }
            MixerCommand::RemoveInjector { session, stream } => {
                self.remove_injector(session, stream).map(|_| ())
            }
            MixerCommand::SetActive { session, active } => self.set_active(session, active),
        }
    }

    /// Applies every queued registry change. Returns how many were taken.
    pub fn drain_commands(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(command) = self.commands.try_recv() {
            if let Err(e) = self.apply(command) {
                warn!("Ignoring mixer command: {}", e);
            }
            applied += 1;
        }
        applied
    }

    /// Pops one frame from every stream and refreshes its unattenuated zone
    pub fn prepare_streams(&mut self) {
        let zones = self.context.zones.as_ref();
        for session in self.sessions.values_mut() {
            for stream in session.streams_mut() {
                stream.pop_frame();
                stream.assign_unattenuated_zone(zones);
            }
        }
    }

    /// Mixes every audible stream into the listener's frame, which is left in
    /// [`client_samples`](Self::client_samples). Returns how many streams contributed.
    pub fn mix_for_listener(&mut self, listener_id: SessionId) -> usize {
        let settings = self.context.mix_settings();
        let Self {
            sessions,
            client_samples,
            scratch,
            filters,
            stats,
            ..
        } = self;

        client_samples.fill(0);

        let Some(listener) = sessions.get(&listener_id).map(Session::microphone) else {
            return 0;
        };

        let mut streams_mixed = 0;
        for (other_id, other) in sessions.iter() {
            for stream in other.streams() {
                if *other_id == listener_id && !stream.loopback() {
                    continue;
                }

                let Spatialization::Mix(params) = spatialize(stream, listener, &settings) else {
                    continue;
                };
                stats.mix_attempts += 1;

                let filter = match params.filter_gains {
                    Some(_) => Some(filters.entry((listener_id, stream.id())).or_default()),
                    None => None,
                };
                render_contribution(stream, &params, filter, client_samples, scratch);
                streams_mixed += 1;
            }
        }

        streams_mixed
    }

    pub fn client_samples(&self) -> &[i16] {
        &self.client_samples
    }

    /// Runs one complete frame: registry changes (with their routes passed on to
    /// `sink`), stream preparation, then a mix for every active session.
    pub fn mix_frame<S: TransportSink + ?Sized>(&mut self, sink: &mut S) -> FrameReport {
        self.drain_commands();
        for change in self.route_changes.drain(..) {
            match change {
                RouteChange::Connect(listener, address) => sink.connect(listener, address),
                RouteChange::Disconnect(listener) => sink.disconnect(&listener),
            }
        }
        self.prepare_streams();

        let mut listeners = std::mem::take(&mut self.listeners);
        listeners.clear();
        listeners.extend(
            self.sessions
                .values()
                .filter(|session| session.is_active())
                .map(Session::id),
        );

        let mut report = FrameReport::default();
        for &listener in &listeners {
            let streams_mixed = self.mix_for_listener(listener);
            let Some(sequence) = self.sessions.get_mut(&listener).map(Session::next_sequence) else {
                continue;
            };

            let frame = if streams_mixed > 0 {
                OutboundFrame::Mixed {
                    sequence,
                    samples: &self.client_samples,
                }
            } else {
                self.stats.silent_frames += 1;
                OutboundFrame::Silent {
                    sequence,
                    sample_count: FRAME_SAMPLES_STEREO as u16,
                }
            };

            if let Err(e) = sink.emit(listener, &frame) {
                self.stats.emit_failures += 1;
                warn!("Failed to send mix to {}: {}", listener, e);
            }

            report.listeners += 1;
            report.streams_mixed += streams_mixed;
        }
        self.listeners = listeners;

        self.stats.frames += 1;
        self.stats.listeners += report.listeners as u64;
        self.stats.streams_mixed += report.streams_mixed as u64;
        report
    }

    pub fn session(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn context(&self) -> &MixerContext {
        &self.context
    }

    pub fn throttle(&self) -> &ThrottleController {
        &self.context.throttle
    }

    pub fn throttle_mut(&mut self) -> &mut ThrottleController {
        &mut self.context.throttle
    }

    pub fn stats(&self) -> &MixerStats {
        &self.stats
    }

    /// Returns the counters gathered since the last call and starts over
    pub fn take_stats(&mut self) -> MixerStats {
        std::mem::take(&mut self.stats)
    }

    pub fn stream_stats(&self) -> Vec<StreamStats> {
        self.sessions
            .values()
            .flat_map(|session| {
                session.streams().map(move |stream| StreamStats {
                    session: session.id(),
                    stream: stream.id(),
                    kind: stream.kind(),
                    frames_popped: stream.frames_popped(),
                    pop_failures: stream.pop_failures(),
                    dropped_frames: stream.dropped_frames(),
                })
            })
            .collect()
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{StreamFeed, StreamFrame, FRAME_SAMPLES_PER_CHANNEL};
    use crate::network::TransportError;
    use glam::{Quat, Vec3};

    #[derive(Default)]
    struct RecordingSink {
        frames: Vec<(SessionId, u16, bool)>,
        routes: Vec<(SessionId, Option<SocketAddr>)>,
    }

    impl TransportSink for RecordingSink {
        fn emit(&mut self, listener: SessionId, frame: &OutboundFrame<'_>) -> Result<(), TransportError> {
            self.frames.push((listener, frame.sequence(), frame.is_silent()));
            Ok(())
        }

        fn connect(&mut self, listener: SessionId, address: SocketAddr) {
            self.routes.push((listener, Some(address)));
        }

        fn disconnect(&mut self, listener: &SessionId) {
            self.routes.push((*listener, None));
        }
    }

    fn join(mixer: &mut AudioMixer, position: Vec3) -> (SessionId, StreamFeed) {
        let (microphone, feed) = SourceStream::microphone(false);
        let microphone = microphone.with_pose(position, Quat::IDENTITY);
        let id = SessionId::new();
        mixer.add_session(Session::new(id, microphone));
        (id, feed)
    }

    fn speak(feed: &mut StreamFeed, value: i16, position: Vec3) {
        feed.push(StreamFrame::new(
            vec![value; FRAME_SAMPLES_PER_CHANNEL],
            position,
            Quat::IDENTITY,
        ));
    }

    #[test]
    fn lone_listener_gets_silence() {
        let (mut mixer, _handle) = AudioMixer::new(MixerContext::default());
        let (id, mut feed) = join(&mut mixer, Vec3::ZERO);
        speak(&mut feed, 5000, Vec3::ZERO);

        let mut sink = RecordingSink::default();
        let report = mixer.mix_frame(&mut sink);

        assert_eq!(report.listeners, 1);
        assert_eq!(report.streams_mixed, 0);
        assert_eq!(sink.frames, vec![(id, 0, true)]);
        assert_eq!(mixer.stats().silent_frames, 1);
    }

    #[test]
    fn sequence_advances_for_every_emitted_frame() {
        let (mut mixer, _handle) = AudioMixer::new(MixerContext::default());
        let (a, mut feed_a) = join(&mut mixer, Vec3::ZERO);
        let (b, _feed_b) = join(&mut mixer, Vec3::new(0.0, 0.0, -2.0));

        let mut sink = RecordingSink::default();
        speak(&mut feed_a, 5000, Vec3::ZERO);
        mixer.mix_frame(&mut sink);
        mixer.mix_frame(&mut sink);

        let for_b: Vec<(u16, bool)> = sink
            .frames
            .iter()
            .filter(|(id, _, _)| *id == b)
            .map(|(_, seq, silent)| (*seq, *silent))
            .collect();
        // b hears a in the first frame only
        assert_eq!(for_b, vec![(0, false), (1, true)]);
        assert_eq!(mixer.session(&a).unwrap().sequence(), 2);
    }

    #[test]
    fn inactive_sessions_are_not_mixed_for() {
        let (mut mixer, handle) = AudioMixer::new(MixerContext::default());
        let (a, _feed_a) = join(&mut mixer, Vec3::ZERO);
        let (b, _feed_b) = join(&mut mixer, Vec3::ONE);
        handle.set_active(b, false).unwrap();

        let mut sink = RecordingSink::default();
        mixer.mix_frame(&mut sink);
        assert_eq!(sink.frames.len(), 1);
        assert_eq!(sink.frames[0].0, a);
    }

    #[test]
    fn commands_apply_at_frame_start() {
        let (mut mixer, handle) = AudioMixer::new(MixerContext::default());
        let (microphone, _feed) = SourceStream::microphone(false);
        let id = SessionId::new();
        handle.add_session(Session::new(id, microphone)).unwrap();
        assert_eq!(mixer.session_count(), 0);

        let (injector, _injector_feed) = SourceStream::injector(0.5, false);
        let injector_id = injector.id();
        handle.add_injector(id, injector).unwrap();
        // unknown ids are logged and skipped
        handle.remove_session(SessionId::new()).unwrap();

        let mut sink = RecordingSink::default();
        mixer.mix_frame(&mut sink);
        assert_eq!(mixer.session_count(), 1);
        assert_eq!(mixer.session(&id).unwrap().injector_count(), 1);

        handle.remove_injector(id, injector_id).unwrap();
        handle.remove_session(id).unwrap();
        assert_eq!(mixer.drain_commands(), 2);
        assert_eq!(mixer.session_count(), 0);
    }

    #[test]
    fn session_addresses_reach_the_sink_before_its_first_mix() {
        let (mut mixer, handle) = AudioMixer::new(MixerContext::default());
        let address: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let (microphone, _feed) = SourceStream::microphone(false);
        let id = SessionId::new();
        handle
            .add_session(Session::new(id, microphone).with_address(address))
            .unwrap();
        // sessions without an address are never routed
        let (other, _other_feed) = SourceStream::microphone(false);
        handle.add_session(Session::new(SessionId::new(), other)).unwrap();

        let mut sink = RecordingSink::default();
        mixer.mix_frame(&mut sink);
        assert_eq!(sink.routes, vec![(id, Some(address))]);
        assert_eq!(sink.frames.len(), 2);

        mixer.mix_frame(&mut sink);
        assert_eq!(sink.routes.len(), 1);

        handle.remove_session(id).unwrap();
        mixer.mix_frame(&mut sink);
        assert_eq!(sink.routes, vec![(id, Some(address)), (id, None)]);
    }

    #[test]
    fn direct_registry_errors() {
        let (mut mixer, _handle) = AudioMixer::new(MixerContext::default());
        let ghost = SessionId::new();
        assert_eq!(
            mixer.remove_session(ghost).unwrap_err(),
            MixerError::UnknownSession(ghost)
        );

        let (id, _feed) = join(&mut mixer, Vec3::ZERO);
        let stream = StreamId::new();
        assert_eq!(
            mixer.remove_injector(id, stream).unwrap_err(),
            MixerError::UnknownStream {
                session: id,
                stream
            }
        );
    }

    #[test]
    fn handle_reports_stopped_mixer() {
        let (mixer, handle) = AudioMixer::new(MixerContext::default());
        drop(mixer);
        assert_eq!(
            handle.set_active(SessionId::new(), true),
            Err(MixerError::Stopped)
        );
    }

    #[test]
    fn filters_are_kept_per_pair_and_dropped_with_the_session() {
        let (mut mixer, _handle) = AudioMixer::new(MixerContext::default());
        let (_a, mut feed_a) = join(&mut mixer, Vec3::ZERO);
        let (b, mut feed_b) = join(&mut mixer, Vec3::new(2.0, 0.0, 0.0));
        let (_c, _feed_c) = join(&mut mixer, Vec3::new(-2.0, 0.0, 0.0));

        speak(&mut feed_a, 4000, Vec3::ZERO);
        speak(&mut feed_b, 4000, Vec3::new(2.0, 0.0, 0.0));
        let mut sink = RecordingSink::default();
        mixer.mix_frame(&mut sink);

        // a is heard by b and c, b is heard by a and c
        assert_eq!(mixer.filter_count(), 4);

        mixer.remove_session(b).unwrap();
        assert_eq!(mixer.filter_count(), 1);
    }

    #[test]
    fn stats_average_over_frames() {
        let (mut mixer, _handle) = AudioMixer::new(MixerContext::default());
        let (_a, mut feed_a) = join(&mut mixer, Vec3::ZERO);
        let (_b, _feed_b) = join(&mut mixer, Vec3::new(0.0, 0.0, -1.0));
        speak(&mut feed_a, 4000, Vec3::ZERO);

        let mut sink = RecordingSink::default();
        mixer.mix_frame(&mut sink);
        mixer.mix_frame(&mut sink);

        let stats = mixer.take_stats();
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.listeners, 4);
        assert_eq!(stats.mix_attempts, 1);
        assert_eq!(stats.average_listeners_per_frame(), 2.0);
        assert_eq!(stats.average_mixes_per_listener(), 0.25);
        assert_eq!(mixer.stats(), &MixerStats::default());

        let streams = mixer.stream_stats();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams.iter().map(|s| s.frames_popped).sum::<u64>(), 1);
        assert_eq!(streams.iter().map(|s| s.pop_failures).sum::<u64>(), 3);
    }
}
