//! Scores one source stream against one listener and renders its contribution.
//!
//! [`spatialize`] runs the gating and gain math and either skips the pair or
//! returns the parameters to mix with. [`render_contribution`] then writes the
//! source into the listener's stereo frame.

use super::filter::{penumbra_gains, PenumbraFilter};
use super::geometry::{
    bearing_to_source, distance_coefficient, off_axis_coefficient, phase_panning, PhasePanning,
    ATTENUATION_BEGINS_AT_DISTANCE, EPSILON,
};
use super::stream::{repeated_frame_fade_factor, SourceStream, StreamKind};
use super::{FRAME_SAMPLES_PER_CHANNEL, FRAME_SAMPLES_STEREO};

/// Per-frame knobs the spatializer reads
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixSettings {
    pub repetition_with_fade: bool,
    pub filter_enabled: bool,
    pub min_audibility_threshold: f32,
}

/// Why a source was left out of a listener's mix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Nothing was popped this frame and there is nothing to repeat
    NoFrame,
    /// The repeated frame has faded to silence
    Faded,
    /// The frame to mix has zero loudness
    Silent,
    /// Too quiet for its distance under the current throttling threshold
    Inaudible,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixParams {
    /// Gain from repeating a stale frame, 1.0 for a fresh one
    pub fade: f32,
    /// Product of injector, off-axis and distance gains
    pub attenuation: f32,
    pub distance: f32,
    /// Positive when the source is on the listener's left
    pub bearing: f32,
    pub panning: PhasePanning,
    /// Shelf gains for the left and right ear, when the penumbra filter applies
    pub filter_gains: Option<(f32, f32)>,
    pub source_is_self: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Spatialization {
    Skip(SkipReason),
    Mix(MixParams),
}

/// Decides whether `source` is heard by `listener` this frame and how.
pub fn spatialize(
    source: &SourceStream,
    listener: &SourceStream,
    settings: &MixSettings,
) -> Spatialization {
    let mut fade = 1.0;

    if !source.pop_succeeded() {
        if !settings.repetition_with_fade || source.last_popped_frame().is_none() {
            return Spatialization::Skip(SkipReason::NoFrame);
        }
        fade = repeated_frame_fade_factor(source.consecutive_not_mixed().saturating_sub(1));
        if fade == 0.0 {
            return Spatialization::Skip(SkipReason::Faded);
        }
    }

    if source.loudness() == 0.0 {
        return Spatialization::Skip(SkipReason::Silent);
    }

    let source_is_self = source.id() == listener.id();
    let relative_position = source.position() - listener.position();
    let distance = relative_position.length().max(EPSILON);

    if source.trailing_loudness() / distance <= settings.min_audibility_threshold {
        return Spatialization::Skip(SkipReason::Inaudible);
    }

    let should_distance_attenuate = source
        .listener_unattenuated_zone()
        .map_or(true, |zone| !zone.contains(listener.position()));

    let mut attenuation = 1.0;

    if let Some(ratio) = source.attenuation_ratio() {
        attenuation *= ratio;
    }

    if !source_is_self && source.kind() == StreamKind::Microphone {
        attenuation *= off_axis_coefficient(source.orientation(), relative_position);
    }

    if should_distance_attenuate && distance >= ATTENUATION_BEGINS_AT_DISTANCE {
        attenuation *= distance_coefficient(distance);
    }

    let (bearing, panning) = if source_is_self {
        (0.0, PhasePanning::CENTERED)
    } else {
        let bearing = bearing_to_source(listener.orientation(), relative_position);
        (bearing, phase_panning(bearing, distance))
    };

    let filter_gains = (settings.filter_enabled && !source_is_self)
        .then(|| penumbra_gains(bearing, distance));

    Spatialization::Mix(MixParams {
        fade,
        attenuation,
        distance,
        bearing,
        panning,
        filter_gains,
        source_is_self,
    })
}

/// Adds `source`'s last popped frame into `output` with the given parameters.
///
/// With a filter the contribution is rendered into `scratch` first, shelved, and
/// then added, so the filter only ever sees this one source.
pub fn render_contribution(
    source: &SourceStream,
    params: &MixParams,
    filter: Option<&mut PenumbraFilter>,
    output: &mut [i16],
    scratch: &mut [i16],
) {
    let Some(frame) = source.last_popped_frame() else {
        return;
    };

    match (filter, params.filter_gains) {
        (Some(filter), Some((left, right))) => {
            let len = output.len().min(scratch.len());
            let scratch = &mut scratch[..len];
            scratch.fill(0);
            accumulate(source, frame, params, scratch);

            filter.set_gains(left, right);
            filter.render(scratch);

            for (out, contribution) in output.iter_mut().zip(scratch.iter()) {
                *out = out.saturating_add(*contribution);
            }
        }
        _ => accumulate(source, frame, params, output),
    }
}

fn accumulate(source: &SourceStream, frame: &[i16], params: &MixParams, output: &mut [i16]) {
    if source.is_stereo() {
        accumulate_stereo(frame, params.attenuation * params.fade, output);
    } else {
        accumulate_mono(source, frame, params, output);
    }
}

fn scale(sample: i16, gain: f32) -> i16 {
    (sample as f32 * gain) as i16
}

fn add_at(output: &mut [i16], index: usize, sample: i16) {
    // the delayed channel runs past the end of the frame
    if let Some(slot) = output.get_mut(index) {
        *slot = slot.saturating_add(sample);
    }
}

fn accumulate_mono(source: &SourceStream, frame: &[i16], params: &MixParams, output: &mut [i16]) {
    let attenuation_and_fade = params.attenuation * params.fade;
    let weak_attenuation = attenuation_and_fade * params.panning.weak_channel_ratio;
    let delay = params.panning.samples_delay;

    let right_side_weak_and_delayed = params.bearing > 0.0;
    let (left_gain, right_gain, delayed_channel) = if right_side_weak_and_delayed {
        (attenuation_and_fade, weak_attenuation, 1)
    } else {
        (weak_attenuation, attenuation_and_fade, 0)
    };
    let left_offset = if delayed_channel == 0 { delay } else { 0 };
    let right_offset = if delayed_channel == 1 { delay } else { 0 };

    // leading samples of the delayed ear come from the end of earlier frames
    for i in 0..delay {
        let historical = source.historical_sample(delay - i);
        add_at(output, delayed_channel + i * 2, scale(historical, weak_attenuation));
    }

    for (i, &sample) in frame.iter().take(FRAME_SAMPLES_PER_CHANNEL).enumerate() {
        add_at(output, (i + left_offset) * 2, scale(sample, left_gain));
        add_at(output, (i + right_offset) * 2 + 1, scale(sample, right_gain));
    }
}

fn accumulate_stereo(frame: &[i16], attenuation_and_fade: f32, output: &mut [i16]) {
    for (out, &sample) in output.iter_mut().zip(frame.iter()).take(FRAME_SAMPLES_STEREO) {
        *out = out.saturating_add(scale(sample, attenuation_and_fade));
    }
}

/// Mean absolute level of the left and right channels of an interleaved buffer
pub fn measure_stereo_levels(stereo_audio: &[i16]) -> (f32, f32) {
    let frames = stereo_audio.len() / 2;
    if frames == 0 {
        return (0.0, 0.0);
    }

    let (left_sum, right_sum) = stereo_audio
        .chunks_exact(2)
        .fold((0.0f32, 0.0f32), |(left, right), frame| {
            (left + (frame[0] as f32).abs(), right + (frame[1] as f32).abs())
        });

    (left_sum / frames as f32, right_sum / frames as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::geometry::{AABox, UnattenuatedZones};
    use crate::audio::stream::{StreamFeed, StreamFrame};
    use crate::audio::LOUDNESS_TO_DISTANCE_RATIO;
    use glam::{Quat, Vec3};
    use std::f32::consts::FRAC_PI_2;

    /// Scores and renders one pair. Returns 1 when the source was mixed in.
    fn add_stream_to_mix(
        source: &SourceStream,
        listener: &SourceStream,
        settings: &MixSettings,
        filter: Option<&mut PenumbraFilter>,
        output: &mut [i16],
        scratch: &mut [i16],
    ) -> usize {
        match spatialize(source, listener, settings) {
            Spatialization::Skip(_) => 0,
            Spatialization::Mix(params) => {
                render_contribution(source, &params, filter, output, scratch);
                1
            }
        }
    }

    fn settings() -> MixSettings {
        MixSettings {
            repetition_with_fade: false,
            filter_enabled: false,
            min_audibility_threshold: LOUDNESS_TO_DISTANCE_RATIO / 2.0,
        }
    }

    fn listener() -> SourceStream {
        let (stream, _feed) = SourceStream::microphone(false);
        stream
    }

    fn feed_constant(feed: &mut StreamFeed, value: i16, len: usize, position: Vec3, orientation: Quat) {
        feed.push(StreamFrame::new(vec![value; len], position, orientation));
    }

    /// Microphone at `position` facing the origin with one frame of `value` already popped
    fn microphone_at(position: Vec3, value: i16) -> (SourceStream, StreamFeed) {
        let (mut stream, mut feed) = SourceStream::microphone(false);
        let orientation = (-position)
            .try_normalize()
            .map_or(Quat::IDENTITY, |toward_origin| {
                Quat::from_rotation_arc(Vec3::NEG_Z, toward_origin)
            });
        feed_constant(&mut feed, value, FRAME_SAMPLES_PER_CHANNEL, position, orientation);
        stream.pop_frame();
        (stream, feed)
    }

    fn mix(source: &SourceStream, listener: &SourceStream, settings: &MixSettings) -> (usize, Vec<i16>) {
        let mut output = vec![0i16; FRAME_SAMPLES_STEREO];
        let mut scratch = vec![0i16; FRAME_SAMPLES_STEREO];
        let mut filter = PenumbraFilter::new();
        let contributed = add_stream_to_mix(
            source,
            listener,
            settings,
            Some(&mut filter),
            &mut output,
            &mut scratch,
        );
        (contributed, output)
    }

    #[test]
    fn source_without_frame_is_skipped() {
        let (source, _feed) = SourceStream::microphone(false);
        assert_eq!(
            spatialize(&source, &listener(), &settings()),
            Spatialization::Skip(SkipReason::NoFrame)
        );
    }

    #[test]
    fn starved_source_repeats_with_fade() {
        let (mut source, _feed) = microphone_at(Vec3::new(0.0, 0.0, -0.5), 8000);
        source.pop_frame();
        let listener = listener();

        assert_eq!(
            spatialize(&source, &listener, &settings()),
            Spatialization::Skip(SkipReason::NoFrame)
        );

        let fading = MixSettings {
            repetition_with_fade: true,
            ..settings()
        };
        match spatialize(&source, &listener, &fading) {
            Spatialization::Mix(params) => assert_eq!(params.fade, 1.0),
            other => panic!("expected a repeat, got {other:?}"),
        }

        for _ in 0..40 {
            source.pop_frame();
        }
        assert_eq!(
            spatialize(&source, &listener, &fading),
            Spatialization::Skip(SkipReason::Faded)
        );
    }

    #[test]
    fn silent_frame_is_skipped() {
        let (source, _feed) = microphone_at(Vec3::new(0.0, 0.0, -2.0), 0);
        let (contributed, output) = mix(&source, &listener(), &settings());
        assert_eq!(contributed, 0);
        assert!(output.iter().all(|&s| s == 0));
    }

    #[test]
    fn quiet_distant_source_is_inaudible() {
        let (source, _feed) = microphone_at(Vec3::new(0.0, 0.0, -4.0), 1);
        let strict = MixSettings {
            min_audibility_threshold: 0.001,
            ..settings()
        };
        assert_eq!(
            spatialize(&source, &listener(), &strict),
            Spatialization::Skip(SkipReason::Inaudible)
        );
        assert!(matches!(
            spatialize(&source, &listener(), &settings()),
            Spatialization::Mix(_)
        ));
    }

    #[test]
    fn zone_bypasses_distance_attenuation() {
        let (mut source, _feed) = microphone_at(Vec3::new(0.0, 0.0, 4.0), 1000);
        let zones = UnattenuatedZones::new(
            AABox::new(Vec3::new(-1.0, -1.0, 3.0), Vec3::splat(2.0)),
            AABox::new(Vec3::splat(-1.0), Vec3::splat(2.0)),
        );

        let Spatialization::Mix(attenuated) = spatialize(&source, &listener(), &settings()) else {
            panic!("source should be audible");
        };
        assert!((attenuated.attenuation - 0.64).abs() < 1e-3);

        source.assign_unattenuated_zone(Some(&zones));
        let Spatialization::Mix(bypassed) = spatialize(&source, &listener(), &settings()) else {
            panic!("source should be audible");
        };
        assert!((bypassed.attenuation - 1.0).abs() < 1e-3);
    }

    #[test]
    fn injector_gain_skips_off_axis() {
        let (mut source, mut feed) = SourceStream::injector(0.5, false);
        // facing away from the listener, which would cost a microphone 80%
        feed_constant(
            &mut feed,
            1000,
            FRAME_SAMPLES_PER_CHANNEL,
            Vec3::new(0.0, 0.0, -1.0),
            Quat::from_rotation_y(std::f32::consts::PI),
        );
        source.pop_frame();

        let Spatialization::Mix(params) = spatialize(&source, &listener(), &settings()) else {
            panic!("injector should be audible");
        };
        assert!((params.attenuation - 0.5).abs() < 1e-5);
    }

    #[test]
    fn left_source_delays_right_ear() {
        let (source, _feed) = microphone_at(Vec3::new(-3.0, 0.0, 0.0), 10_000);
        let Spatialization::Mix(params) = spatialize(&source, &listener(), &settings()) else {
            panic!("source should be audible");
        };
        assert!((params.bearing - FRAC_PI_2).abs() < 1e-4);
        assert_eq!(params.panning.samples_delay, crate::audio::SAMPLE_PHASE_DELAY_AT_90);

        let (_, output) = mix(&source, &listener(), &settings());
        // right ear is silent for the first 20 samples (no history yet)
        assert_eq!(output[1], 0);
        assert_ne!(output[0], 0);
        let (left, right) = measure_stereo_levels(&output);
        assert!(left > right);
    }

    #[test]
    fn self_stream_is_centered_and_unfiltered() {
        let (source, _feed) = microphone_at(Vec3::new(3.0, 0.0, 0.0), 4000);
        let filtered = MixSettings {
            filter_enabled: true,
            ..settings()
        };
        let Spatialization::Mix(params) = spatialize(&source, &source, &filtered) else {
            panic!("loopback should mix");
        };
        assert!(params.source_is_self);
        assert_eq!(params.panning, PhasePanning::CENTERED);
        assert_eq!(params.filter_gains, None);
        assert_eq!(params.attenuation, 1.0);

        let (_, output) = mix(&source, &source, &filtered);
        assert!(output.iter().all(|&s| s == 4000));
    }

    #[test]
    fn stereo_source_is_scaled_per_channel() {
        let (mut source, mut feed) = SourceStream::injector(1.0, true);
        let samples: Vec<i16> = (0..FRAME_SAMPLES_STEREO)
            .map(|i| if i % 2 == 0 { 1000 } else { -2000 })
            .collect();
        feed.push(StreamFrame::new(samples, Vec3::new(0.0, 0.0, -2.0), Quat::IDENTITY));
        source.pop_frame();

        let (contributed, output) = mix(&source, &listener(), &settings());
        assert_eq!(contributed, 1);
        assert!((output[0] - 820).abs() <= 1);
        assert!((output[1] + 1640).abs() <= 1);
    }

    #[test]
    fn accumulation_saturates() {
        let (source, _feed) = microphone_at(Vec3::new(0.0, 0.0, -0.5), i16::MAX);
        let mut output = vec![i16::MAX - 10; FRAME_SAMPLES_STEREO];
        let mut scratch = vec![0i16; FRAME_SAMPLES_STEREO];
        add_stream_to_mix(&source, &listener(), &settings(), None, &mut output, &mut scratch);
        assert!(output.iter().all(|&s| s == i16::MAX));
    }

    #[test]
    fn filter_only_touches_its_own_contribution() {
        let (source, _feed) = microphone_at(Vec3::new(3.0, 0.0, 0.0), 0);
        let (loud, _loud_feed) = microphone_at(Vec3::new(3.0, 0.0, 0.0), 3000);

        let filtered = MixSettings {
            filter_enabled: true,
            ..settings()
        };
        let mut output = vec![500i16; FRAME_SAMPLES_STEREO];
        let mut scratch = vec![0i16; FRAME_SAMPLES_STEREO];
        let mut filter = PenumbraFilter::new();

        // a skipped source leaves earlier contributions alone
        add_stream_to_mix(&source, &listener(), &filtered, Some(&mut filter), &mut output, &mut scratch);
        assert!(output.iter().all(|&s| s == 500));

        let contributed =
            add_stream_to_mix(&loud, &listener(), &filtered, Some(&mut filter), &mut output, &mut scratch);
        assert_eq!(contributed, 1);
        let (left, right) = measure_stereo_levels(&output);
        assert!(left > 500.0 && right > 500.0);
    }

    #[test]
    fn filtered_render_uses_only_the_output_length_of_scratch() {
        let (loud, _feed) = microphone_at(Vec3::new(-2.0, 0.0, 1.0), 3000);
        let filtered = MixSettings {
            filter_enabled: true,
            ..settings()
        };
        let Spatialization::Mix(params) = spatialize(&loud, &listener(), &filtered) else {
            panic!("source should be mixed");
        };
        assert!(params.filter_gains.is_some());

        let mut output = vec![0i16; FRAME_SAMPLES_STEREO];
        let mut scratch = vec![7i16; FRAME_SAMPLES_STEREO * 2];
        let mut filter = PenumbraFilter::new();
        render_contribution(&loud, &params, Some(&mut filter), &mut output, &mut scratch);

        assert!(output.iter().any(|&s| s != 0));
        assert!(scratch[FRAME_SAMPLES_STEREO..].iter().all(|&s| s == 7));
    }

    #[test]
    fn stereo_levels() {
        let audio = [100i16, -300, -100, 300];
        assert_eq!(measure_stereo_levels(&audio), (100.0, 300.0));
        assert_eq!(measure_stereo_levels(&[]), (0.0, 0.0));
    }
}
