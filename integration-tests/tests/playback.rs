//! Whole-file playback: finish accounting, mix levels, linearity, loops.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use integration_tests::{
    peak, rms, settle_start_tick, silence_source, sine_source, TestRig, BLOCK_FRAMES,
};
use serial_test::serial;

#[test]
#[serial]
fn one_shot_silence_finishes_exactly_once() {
    let rig = TestRig::new();
    let stream = rig.device.create_stream(silence_source(44100));

    let finishes = Arc::new(AtomicUsize::new(0));
    let finishes_cb = finishes.clone();
    stream.set_finish_callback(move |_| {
        finishes_cb.fetch_add(1, Ordering::SeqCst);
    });

    stream.play(1, Duration::ZERO).unwrap();
    settle_start_tick();
    let mix = rig.drive_until_stopped(&stream);

    assert!(!stream.is_playing());
    assert!(peak(&mix) == 0.0);

    rig.system.dispatch_callbacks();
    assert_eq!(finishes.load(Ordering::SeqCst), 1);

    // Extra blocks and dispatches produce nothing further.
    rig.drive_block();
    rig.system.dispatch_callbacks();
    assert_eq!(finishes.load(Ordering::SeqCst), 1);
}

#[test]
#[serial]
fn sine_level_reflects_amplitude_and_volume() {
    let rig = TestRig::new();
    let stream = rig.device.create_stream(sine_source(440.0, 0.3, 44100));
    stream.set_volume(0.5);
    stream.play(1, Duration::ZERO).unwrap();
    settle_start_tick();

    let mut mix = rig.drive_until_stopped(&stream);
    // Drop the short tail block; the source length is not a block multiple.
    mix.truncate(44100 * 2 / (BLOCK_FRAMES * 2) * (BLOCK_FRAMES * 2));

    let expected = 0.3 * 0.5 / 2f32.sqrt();
    let got = rms(&mix);
    assert!(
        (got - expected).abs() <= expected * 0.01,
        "rms {got} vs expected {expected}"
    );
}

#[test]
#[serial]
fn mixing_two_streams_is_linear() {
    let run = |count: usize| -> (Vec<f32>, usize) {
        let rig = TestRig::new();
        let finishes = Arc::new(AtomicUsize::new(0));
        let streams: Vec<_> = (0..count)
            .map(|_| {
                let stream = rig.device.create_stream(sine_source(440.0, 0.3, 44100));
                stream.set_volume(0.5);
                let finishes_cb = finishes.clone();
                stream.set_finish_callback(move |_| {
                    finishes_cb.fetch_add(1, Ordering::SeqCst);
                });
                stream
            })
            .collect();
        for stream in &streams {
            stream.play(1, Duration::ZERO).unwrap();
        }
        settle_start_tick();

        let mut mix = Vec::new();
        for _ in 0..48 {
            mix.extend(rig.drive_block());
        }
        rig.system.dispatch_callbacks();
        (mix, finishes.load(Ordering::SeqCst))
    };

    let (single, single_finishes) = run(1);
    let (double, double_finishes) = run(2);
    assert_eq!(single_finishes, 1);
    assert_eq!(double_finishes, 2);

    // Identical sources decode identical samples, and x + x is exact in
    // float, so the pair mix must equal twice the single mix per sample.
    assert_eq!(single.len(), double.len());
    for (i, (&a, &b)) in single.iter().zip(&double).enumerate() {
        assert_eq!(2.0 * a, b, "sample {i}: single {a} double {b}");
    }
}

#[test]
#[serial]
fn looped_playback_fires_loops_then_finish() {
    let rig = TestRig::new();
    let stream = rig.device.create_stream(sine_source(440.0, 0.3, 4410));

    let events = Arc::new(Mutex::new(Vec::new()));
    let events_loop = events.clone();
    stream.set_loop_callback(move |_| events_loop.lock().unwrap().push("loop"));
    let events_finish = events.clone();
    stream.set_finish_callback(move |_| events_finish.lock().unwrap().push("finish"));

    stream.play(3, Duration::ZERO).unwrap();
    settle_start_tick();
    rig.drive_until_stopped(&stream);
    rig.system.dispatch_callbacks();

    assert_eq!(*events.lock().unwrap(), vec!["loop", "loop", "finish"]);
}

#[test]
#[serial]
fn non_seekable_source_plays_once_then_goes_silent() {
    let rig = TestRig::new();
    let source = audio_engine::AudioSource::new(
        Box::new(
            audio_engine::synth::SineDecoder::new(440.0, 0.3, 44100, 2, 4410).non_seekable(),
        ),
        Box::new(audio_engine::MemoryStream::empty()),
    );
    let stream = rig.device.create_stream(source);
    // Infinite looping requested, but the source cannot rewind: the first
    // pass is all there is.
    stream.play(0, Duration::ZERO).unwrap();
    settle_start_tick();

    let first = rig.drive_block();
    assert!(peak(&first) > 0.0);
    for _ in 0..8 {
        rig.drive_block();
    }
    let tail = rig.drive_block();
    assert_eq!(peak(&tail), 0.0);
}

#[test]
#[serial]
fn replay_after_finish_works() {
    let rig = TestRig::new();
    let stream = rig.device.create_stream(sine_source(440.0, 0.3, 4410));
    stream.play(1, Duration::ZERO).unwrap();
    settle_start_tick();
    rig.drive_until_stopped(&stream);
    assert!(!stream.is_playing());

    stream.play(1, Duration::ZERO).unwrap();
    settle_start_tick();
    let mix = rig.drive_block();
    assert!(peak(&mix) > 0.0);
}
