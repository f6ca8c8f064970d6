mod common;

use std::cell::RefCell;
use std::time::Duration;

use common::{collect_until, ended, harness, RATE_HZ};
use media_player::track::TrackId;
use media_player::{
    Asset, MediaTime, PlaybackEndReason, PlaybackState, PlayerEvent, PlayerError, Segment,
    TrackKind,
};

const TIMEOUT: Duration = Duration::from_secs(30);

fn secs(s: i64) -> MediaTime {
    MediaTime::from_secs(s)
}

#[test]
fn url_padding_url_plays_continuously_with_changes_at_the_boundaries() {
    let asset = Asset::builder()
        .url("synth://a?duration=5&audio=8000x1&video=32x16@25")
        .padding(secs(2))
        .url("synth://b?duration=5&audio=8000x1&video=32x16@25&freq=660")
        .build()
        .unwrap();
    let h = harness(asset);
    assert_eq!(h.item.duration(), secs(12));
    h.item.play().unwrap();
    // Position of the item when each boundary notification arrives.
    let seen = RefCell::new(Vec::new());
    let events = collect_until(&h.events, TIMEOUT, |e| {
        if let PlayerEvent::TrackChanged { at, .. } | PlayerEvent::FormatChanged { at, .. } = e {
            seen.borrow_mut().push((*at, h.item.position()));
        }
        ended(e)
    });
    let seen = seen.into_inner();
    assert_eq!(seen.len(), 4);
    for (at, position) in seen {
        assert!(position >= at, "boundary at {at} announced at {position}");
    }

    assert!(
        events.contains(&PlayerEvent::PlaybackEnded {
            reason: PlaybackEndReason::Eof
        }),
        "{events:?}"
    );
    assert_eq!(h.item.state(), PlaybackState::Ended);

    let audio = h.audio.snapshot();
    assert_eq!(audio.first().unwrap().pts, MediaTime::ZERO);
    for w in audio.windows(2) {
        assert!(
            (w[1].pts - w[0].end()).abs() <= MediaTime::from_micros(1),
            "gap between {:?} and {:?}",
            w[0].pts,
            w[1].pts
        );
    }
    let played: usize = audio.iter().map(|a| a.frames).sum();
    assert_eq!(played, 12 * RATE_HZ as usize);

    let at = |pred: fn(&PlayerEvent) -> Option<MediaTime>| -> Vec<MediaTime> {
        events.iter().filter_map(pred).collect()
    };
    let track_changes = at(|e| match e {
        PlayerEvent::TrackChanged { at, .. } => Some(*at),
        _ => None,
    });
    assert_eq!(track_changes, vec![secs(5), secs(7)]);
    let format_changes = at(|e| match e {
        PlayerEvent::FormatChanged { at, .. } => Some(*at),
        _ => None,
    });
    assert_eq!(format_changes, vec![secs(5), secs(7)]);

    // Padding shows a blank picture; both sources show real ones.
    let video = h.video.snapshot();
    assert!(video.iter().any(|v| v.blank && v.pts == secs(5)));
    assert!(video.iter().any(|v| !v.blank && v.pts >= secs(7)));
    assert!(video.iter().all(|v| v.width == 32 && v.height == 16));
}

#[test]
fn demux_failure_skips_to_the_next_segment() {
    let asset = Asset::builder()
        .url("synth://?duration=3&audio=8000x1&video=32x16@25&fail_at=1")
        .url("synth://?duration=2&audio=8000x1&video=32x16@25")
        .build()
        .unwrap();
    let h = harness(asset);
    h.item.play().unwrap();
    let events = collect_until(&h.events, TIMEOUT, ended);

    let errors: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            PlayerEvent::RecoverableError { segment, .. } => Some(*segment),
            _ => None,
        })
        .collect();
    assert_eq!(errors, vec![Some(0)]);
    assert!(!events.iter().any(|e| matches!(e, PlayerEvent::FatalError { .. })));
    assert!(events.contains(&PlayerEvent::PlaybackEnded {
        reason: PlaybackEndReason::Eof
    }));

    let audio = h.audio.snapshot();
    // Everything demuxed before the failure at 1 s is heard without a hole; the last
    // whole packet ends at sample 8192.
    let failed: Vec<_> = audio.iter().take_while(|a| a.pts < secs(3)).collect();
    assert_eq!(failed.first().unwrap().pts, MediaTime::ZERO);
    for w in failed.windows(2) {
        assert!((w[1].pts - w[0].end()).abs() <= MediaTime::from_micros(1));
    }
    assert_eq!(failed.last().unwrap().end(), MediaTime::from_samples(8_192, RATE_HZ));
    let resumed = audio.iter().find(|a| a.pts > MediaTime::from_millis(1_500)).unwrap();
    assert_eq!(resumed.pts, secs(3));
    assert_eq!(audio.last().unwrap().end(), secs(5));
}

#[test]
fn failing_last_segment_ends_with_an_error() {
    let h = harness(Asset::from_url("synth://?duration=2&audio=8000x1&video=0&fail_at=1"));
    h.item.play().unwrap();
    let events = collect_until(&h.events, TIMEOUT, ended);
    assert!(events.contains(&PlayerEvent::PlaybackEnded {
        reason: PlaybackEndReason::Error
    }));
    assert_eq!(h.item.state(), PlaybackState::Failed);
    assert_eq!(h.item.status().end_reason, Some(PlaybackEndReason::Error));
}

#[test]
fn seek_restarts_every_track_at_the_target() {
    let h = harness(Asset::from_url("synth://?duration=20&audio=8000x1&video=32x16@25"));
    h.item.play().unwrap();
    collect_until(&h.events, Duration::from_millis(300), |_| false);
    h.item.pause().unwrap();

    let target = MediaTime::from_millis(12_340);
    h.item.seek(target).unwrap().wait().unwrap();
    assert_eq!(h.item.position(), target);
    let (audio_before, video_before) = (h.audio.len(), h.video.len());

    h.item.play().unwrap();
    let events = collect_until(&h.events, Duration::from_millis(400), |_| false);
    assert!(events.iter().any(|e| matches!(
        e,
        PlayerEvent::SeekCompleted { target: t, result: Ok(()) } if *t == target
    )));

    let audio = h.audio.snapshot();
    let video = h.video.snapshot();
    assert!(audio.len() > audio_before && video.len() > video_before);
    let first = audio[audio_before].pts;
    assert!(first >= target && first - target < MediaTime::from_millis(1));
    assert!(audio[audio_before..].iter().all(|a| a.pts >= target));
    assert!(video[video_before..].iter().all(|v| v.pts >= target));
    assert!(h.item.position() >= target);
}

#[test]
fn seek_after_the_end_brings_playback_back() {
    let h = harness(Asset::from_url("synth://?duration=1&audio=8000x1&video=0"));
    h.item.play().unwrap();
    collect_until(&h.events, TIMEOUT, ended);
    assert_eq!(h.item.state(), PlaybackState::Ended);

    h.item.seek(MediaTime::from_millis(500)).unwrap().wait().unwrap();
    assert_eq!(h.item.state(), PlaybackState::Paused);
    assert_eq!(h.item.status().end_reason, None);
    h.item.play().unwrap();
    let events = collect_until(&h.events, TIMEOUT, ended);
    assert!(events.contains(&PlayerEvent::PlaybackEnded {
        reason: PlaybackEndReason::Eof
    }));
}

#[test]
fn invalid_seek_is_reported_to_the_caller() {
    let h = harness(Asset::from_url("synth://?duration=2&audio=8000x1"));
    assert!(matches!(
        h.item.seek(secs(5)),
        Err(PlayerError::Clock { .. })
    ));
}

#[test]
fn playback_rate_shortens_audio_output() {
    let h = harness(Asset::from_url("synth://?duration=4&audio=8000x1&video=0"));
    h.item.set_rate(2.0).unwrap();
    h.item.play().unwrap();
    collect_until(&h.events, TIMEOUT, ended);

    let audio = h.audio.snapshot();
    let played: usize = audio.iter().map(|a| a.frames).sum();
    let expected = 2 * RATE_HZ as usize;
    let block = 1024;
    assert!(
        played.abs_diff(expected) <= 2 * block,
        "played {played} frames, expected about {expected}"
    );
    let end = audio.last().unwrap().end();
    assert!((end - secs(4)).abs() < MediaTime::from_millis(1), "ended at {end}");
}

#[test]
fn switching_the_audio_track_restarts_only_audio() {
    let h = harness(Asset::from_url("synth://?duration=20&audio=8000x1&video=32x16@25&aux=1"));
    h.item.play().unwrap();
    collect_until(&h.events, Duration::from_millis(200), |_| false);

    h.item.select_track(TrackKind::Audio, Some(TrackId(3))).unwrap();
    let events = collect_until(&h.events, Duration::from_millis(200), |_| false);
    assert!(events.iter().any(|e| matches!(
        e,
        PlayerEvent::TrackChanged { audio: Some(TrackId(3)), .. }
    )));
    assert!(matches!(
        h.item.select_track(TrackKind::Audio, Some(TrackId(42))),
        Err(PlayerError::Configuration(_))
    ));

    // Video kept running without a restart.
    let video = h.video.snapshot();
    assert!(video.windows(2).all(|w| w[1].pts >= w[0].pts));
}

#[test]
fn switching_a_kind_the_item_does_not_play_is_rejected() {
    let h = harness(Asset::from_url("synth://?duration=5&audio=8000x1&video=0"));
    h.item.play().unwrap();
    assert!(matches!(
        h.item.select_track(TrackKind::Video, Some(TrackId(2))),
        Err(PlayerError::Configuration(_))
    ));
    assert_eq!(h.item.state(), PlaybackState::Playing);
}

#[test]
fn pause_holds_the_position() {
    let h = harness(Asset::from_url("synth://?duration=20&audio=8000x1&video=0"));
    h.item.play().unwrap();
    collect_until(&h.events, Duration::from_millis(200), |_| false);
    h.item.pause().unwrap();
    let held = h.item.position();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(h.item.position(), held);
    assert_eq!(h.item.status().state, PlaybackState::Paused);
}

#[test]
fn appended_segment_extends_the_timeline() {
    // Longer than the output buffer, so production is still on the first segment.
    let h = harness(Asset::from_url("synth://?duration=5&audio=8000x1&video=0"));
    let seg = h
        .item
        .append_segment(Segment::padding(MediaTime::from_millis(500)))
        .unwrap();
    assert_eq!(seg.start, secs(5));
    assert_eq!(h.item.duration(), MediaTime::from_millis(5_500));
    h.item.play().unwrap();
    collect_until(&h.events, TIMEOUT, ended);
    assert_eq!(
        h.audio.snapshot().last().unwrap().end(),
        MediaTime::from_millis(5_500)
    );
}
