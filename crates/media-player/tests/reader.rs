use std::sync::Arc;

use media_player::decoder::CompositeDecoderFactory;
use media_player::frame::Frame;
use media_player::source::SyntheticOpener;
use media_player::{
    Asset, FrameReader, MediaTime, MutableAsset, PlaybackEndReason, PlayerOptions, Segment,
    TrackKind,
};

fn reader(asset: Asset) -> FrameReader {
    let mut options = PlayerOptions::default();
    options.processor.sample_rate = 8_000;
    options.processor.channels = 2;
    FrameReader::with_collaborators(
        asset,
        options,
        Arc::new(SyntheticOpener),
        Arc::new(CompositeDecoderFactory),
    )
    .unwrap()
}

#[test]
fn seek_reads_from_the_target_on_every_track() {
    let asset = Asset::builder()
        .url("synth://?duration=3&audio=44100x2&video=32x16@30&reorder=1")
        .padding(MediaTime::from_secs(1))
        .url("synth://?duration=3&audio=22050x1&video=32x16@25")
        .build()
        .unwrap();
    let mut r = reader(asset);
    for _ in 0..5 {
        r.read().unwrap();
    }

    for target in [5_250, 3_400, 1_001, 0] {
        let target = MediaTime::from_millis(target);
        r.seek(target).unwrap();
        assert_eq!(r.buffered(TrackKind::Audio), 0);
        assert_eq!(r.buffered(TrackKind::Video), 0);
        let audio = r.read_audio().unwrap();
        let video = r.read_video().unwrap();
        assert!(audio.pts >= target, "audio {} before {target}", audio.pts);
        assert!(audio.pts - target < MediaTime::from_millis(1));
        assert!(video.pts >= target, "video {} before {target}", video.pts);
    }
}

#[test]
fn reordered_video_comes_out_in_presentation_order() {
    let mut r = reader(Asset::from_url("synth://?duration=2&audio=0&video=32x16@25&reorder=1"));
    let mut pts = Vec::new();
    while let Some(f) = r.read_video() {
        pts.push(f.pts);
    }
    assert_eq!(pts.len(), 50);
    assert!(pts.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(r.end_reason(), Some(PlaybackEndReason::Eof));
}

#[test]
fn corrupt_packets_are_skipped_without_failing_the_segment() {
    let mut r = reader(Asset::from_url(
        "synth://?duration=2&audio=8000x1&video=0&corrupt_every=5&corrupt_kind=audio",
    ));
    let mut last_end = MediaTime::ZERO;
    while let Some(Frame::Audio(f)) = r.read() {
        // Skipped packets are filled with silence, so audio stays contiguous.
        assert!((f.pts - last_end).abs() <= MediaTime::from_micros(1));
        last_end = f.end();
    }
    assert_eq!(last_end, MediaTime::from_secs(2));
    assert_eq!(r.end_reason(), Some(PlaybackEndReason::Eof));
}

#[test]
fn segments_appended_to_a_mutable_asset_are_played() {
    let asset = MutableAsset::new();
    asset
        .append(Segment::url("synth://?duration=1&audio=8000x1&video=0"))
        .unwrap();
    let snapshot = asset.snapshot().unwrap();
    assert!(asset.insert(0, Segment::padding(MediaTime::from_secs(1))).is_err());
    asset.append(Segment::padding(MediaTime::from_millis(250))).unwrap();

    let mut r = reader(snapshot);
    let mut end = MediaTime::ZERO;
    while let Some(f) = r.read_audio() {
        end = f.end();
    }
    assert_eq!(end, MediaTime::from_millis(1_250));
}
