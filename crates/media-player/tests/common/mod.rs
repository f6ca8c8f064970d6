#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use media_player::frame::{AudioDescriptor, SampleFormat};
use media_player::render::{
    MemoryAudioRenderer, MemoryVideoRenderer, PresentedAudio, PresentedVideo, Recording,
};
use media_player::source::SyntheticOpener;
use media_player::{Asset, PlayerEvent, PlayerItem, PlayerOptions, ScaledTimeSource, TimeSource};

pub const RATE_HZ: u32 = 8_000;

/// Virtual time for render loops, running this many times faster than real time.
pub const SPEED: f64 = 4.0;

pub struct Harness {
    pub item: PlayerItem,
    pub events: Receiver<PlayerEvent>,
    pub audio: Recording<PresentedAudio>,
    pub video: Recording<PresentedVideo>,
}

pub fn options() -> PlayerOptions {
    let mut options = PlayerOptions::default();
    options.processor.width = Some(32);
    options.processor.height = Some(16);
    // Sped-up time magnifies scheduling jitter.
    options.clock.drop_threshold_ms = 250;
    options
}

pub fn harness(asset: Asset) -> Harness {
    harness_with(asset, options())
}

pub fn harness_with(asset: Asset, options: PlayerOptions) -> Harness {
    let time: Arc<dyn TimeSource> = Arc::new(ScaledTimeSource::new(SPEED));
    let audio = MemoryAudioRenderer::new(
        AudioDescriptor::new(RATE_HZ, 1, SampleFormat::F32),
        time.clone(),
    );
    let video = MemoryVideoRenderer::new(time.clone());
    let (audio_log, video_log) = (audio.recording(), video.recording());
    let item = PlayerItem::builder(asset)
        .options(options)
        .opener(Arc::new(SyntheticOpener))
        .audio_renderer(audio)
        .video_renderer(video)
        .time_source(time)
        .prepare()
        .expect("prepare");
    let events = item.subscribe();
    Harness {
        item,
        events,
        audio: audio_log,
        video: video_log,
    }
}

/// Collect events until one matches `stop` or `timeout` of real time passes.
pub fn collect_until(
    events: &Receiver<PlayerEvent>,
    timeout: Duration,
    stop: impl Fn(&PlayerEvent) -> bool,
) -> Vec<PlayerEvent> {
    let deadline = std::time::Instant::now() + timeout;
    let mut out = Vec::new();
    while let Some(left) = deadline.checked_duration_since(std::time::Instant::now()) {
        match events.recv_timeout(left) {
            Ok(e) => {
                let done = stop(&e);
                out.push(e);
                if done {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    out
}

pub fn ended(e: &PlayerEvent) -> bool {
    matches!(e, PlayerEvent::PlaybackEnded { .. })
}
