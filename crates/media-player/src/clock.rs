//! Master clock and audio/video pacing.
//!
//! Audio is the master: every audio frame handed to the renderer re-anchors the
//! clock at the frame's pts and the renderer-reported start time. Video is slaved
//! to that position; frames that are already too late are dropped, early ones are
//! scheduled for their deadline, and a bounded run of drops forces a catch-up
//! presentation. With no audio anchor the clock free-runs on the time source.
//!
//! All state lives behind one mutex, so drift accumulators and anchors are only
//! ever updated serially.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use media_player_types::{PlaybackEndReason, PlaybackState, TrackKind};

use crate::cancel::{CANCEL_POLL, CancelToken};
use crate::config::ClockOptions;
use crate::error::{PlayerError, Result};
use crate::time::MediaTime;

/// Wall-clock collaborator; swapped for a virtual one in tests.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Instant;

    /// Block until `deadline`, giving up early once `interrupted` returns true.
    ///
    /// Returns whether the deadline was reached.
    fn sleep_until(&self, deadline: Instant, interrupted: &dyn Fn() -> bool) -> bool;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant, interrupted: &dyn Fn() -> bool) -> bool {
        loop {
            if interrupted() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(CANCEL_POLL));
        }
    }
}

/// Virtual time that only moves when [`advance`](Self::advance) is called.
#[derive(Debug)]
pub struct ManualTimeSource {
    now: Mutex<Instant>,
    cv: Condvar,
}

impl Default for ManualTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualTimeSource {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Instant> {
        self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn advance(&self, by: Duration) {
        *self.lock() += by;
        self.cv.notify_all();
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Instant {
        *self.lock()
    }

    fn sleep_until(&self, deadline: Instant, interrupted: &dyn Fn() -> bool) -> bool {
        let mut now = self.lock();
        loop {
            if *now >= deadline {
                return true;
            }
            if interrupted() {
                return false;
            }
            let (g, _timeout) = self
                .cv
                .wait_timeout(now, CANCEL_POLL)
                .unwrap_or_else(|e| e.into_inner());
            now = g;
        }
    }
}

/// Real time running `speed` times faster, for exercising render loops quickly.
#[derive(Clone, Copy, Debug)]
pub struct ScaledTimeSource {
    origin: Instant,
    speed: f64,
}

impl ScaledTimeSource {
    pub fn new(speed: f64) -> Self {
        Self {
            origin: Instant::now(),
            speed: if speed.is_finite() && speed > 0.0 { speed } else { 1.0 },
        }
    }
}

impl TimeSource for ScaledTimeSource {
    fn now(&self) -> Instant {
        self.origin + self.origin.elapsed().mul_f64(self.speed)
    }

    fn sleep_until(&self, deadline: Instant, interrupted: &dyn Fn() -> bool) -> bool {
        loop {
            if interrupted() {
                return false;
            }
            let now = self.now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).div_f64(self.speed).min(CANCEL_POLL));
        }
    }
}

/// What the video render loop should do with the next frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoDecision {
    /// Present at `at` (possibly now).
    Present { at: Instant },
    /// Too late; discard without rendering.
    Drop { late: MediaTime },
    /// Too many drops in a row: present now and resynchronise.
    ForceSync { at: Instant },
}

/// Point-in-time view of the clock.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClockSnapshot {
    pub state: PlaybackState,
    pub position: MediaTime,
    pub rate: f64,
    pub video_drift_us: i64,
    pub presented: u64,
    pub dropped: u64,
    pub corrections: u64,
}

pub struct Clock {
    opts: ClockOptions,
    time: Arc<dyn TimeSource>,
    state: Mutex<ClockState>,
    cv: Condvar,
}

struct ClockState {
    status: PlaybackState,
    anchor_media: MediaTime,
    anchor_wall: Instant,
    /// Content advanced per wall second.
    rate: f64,
    requested_rate: f64,
    /// Audio has anchored the clock since the last seek.
    audio_master: bool,
    floor: MediaTime,
    /// Highest position handed out since the last seek.
    reported: MediaTime,
    limit: Option<MediaTime>,
    /// Smoothed `expected - actual` delivery time per track kind, in microseconds.
    drift: HashMap<TrackKind, f64>,
    consecutive_drops: u32,
    presented: u64,
    dropped: u64,
    corrections: u64,
}

impl ClockState {
    fn position_at(&self, now: Instant) -> MediaTime {
        let pos = match self.status {
            PlaybackState::Playing => self.anchor_media + signed_wall(now, self.anchor_wall).scale(self.rate),
            _ => self.anchor_media,
        };
        let pos = pos.max(self.floor);
        match self.limit {
            Some(limit) => pos.min(limit),
            None => pos,
        }
    }

    fn report_position(&mut self, now: Instant) -> MediaTime {
        let pos = self.position_at(now).max(self.reported);
        self.reported = pos;
        pos
    }

    /// Wall time at which content `pts` plays.
    fn deadline(&self, pts: MediaTime) -> Instant {
        let offset = (pts - self.anchor_media).scale(1.0 / self.rate);
        shift(self.anchor_wall, offset)
    }

    fn reanchor(&mut self, now: Instant) {
        self.anchor_media = self.position_at(now);
        self.anchor_wall = now;
    }
}

fn signed_wall(now: Instant, since: Instant) -> MediaTime {
    if now >= since {
        MediaTime::from_duration(now - since)
    } else {
        -MediaTime::from_duration(since - now)
    }
}

fn shift(at: Instant, by: MediaTime) -> Instant {
    if by.is_negative() {
        at.checked_sub(by.abs().to_duration()).unwrap_or(at)
    } else {
        at + by.to_duration()
    }
}

impl Clock {
    pub fn new(opts: ClockOptions, time: Arc<dyn TimeSource>) -> Self {
        let now = time.now();
        Self {
            opts,
            time,
            state: Mutex::new(ClockState {
                status: PlaybackState::Idle,
                anchor_media: MediaTime::ZERO,
                anchor_wall: now,
                rate: 1.0,
                requested_rate: 1.0,
                audio_master: false,
                floor: MediaTime::ZERO,
                reported: MediaTime::ZERO,
                limit: None,
                drift: HashMap::new(),
                consecutive_drops: 0,
                presented: 0,
                dropped: 0,
                corrections: 0,
            }),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn time_source(&self) -> &Arc<dyn TimeSource> {
        &self.time
    }

    pub fn now(&self) -> Instant {
        self.time.now()
    }

    pub fn state(&self) -> PlaybackState {
        self.lock().status
    }

    /// Master position. Never goes backwards between seeks, even when audio
    /// re-anchors the clock slightly behind what was already reported.
    pub fn position(&self) -> MediaTime {
        let now = self.time.now();
        self.lock().report_position(now)
    }

    /// Requested playback rate.
    pub fn rate(&self) -> f64 {
        self.lock().requested_rate
    }

    /// Upper bound for the reported position, normally the asset duration.
    pub fn set_limit(&self, limit: MediaTime) {
        self.lock().limit = Some(limit);
    }

    pub fn play(&self) -> Result<()> {
        let now = self.time.now();
        let mut st = self.lock();
        match st.status {
            PlaybackState::Playing => return Ok(()),
            PlaybackState::Idle | PlaybackState::Paused => {}
            PlaybackState::Ended | PlaybackState::Failed => {
                return Err(PlayerError::Clock {
                    message: format!("cannot play from state {:?}", st.status),
                });
            }
        }
        st.anchor_wall = now;
        st.status = PlaybackState::Playing;
        drop(st);
        self.cv.notify_all();
        Ok(())
    }

    pub fn pause(&self) {
        let now = self.time.now();
        let mut st = self.lock();
        if st.status == PlaybackState::Playing {
            st.reanchor(now);
            st.status = PlaybackState::Paused;
        }
        drop(st);
        self.cv.notify_all();
    }

    /// Reset master time to `target`. An ended clock comes back paused.
    pub fn seek(&self, target: MediaTime) {
        let now = self.time.now();
        let mut st = self.lock();
        st.anchor_media = target;
        st.anchor_wall = now;
        st.floor = target;
        st.reported = MediaTime::ZERO;
        st.audio_master = false;
        st.rate = st.requested_rate;
        st.consecutive_drops = 0;
        st.drift.clear();
        if st.status == PlaybackState::Ended {
            st.status = PlaybackState::Paused;
        }
        drop(st);
        self.cv.notify_all();
    }

    /// Change the playback rate; accepted within `[1 / max_rate, max_rate]`.
    pub fn set_rate(&self, rate: f64) -> Result<()> {
        let max = self.opts.max_rate;
        if !(rate.is_finite() && rate >= 1.0 / max && rate <= max) {
            return Err(PlayerError::Clock {
                message: format!("rate {rate} outside [{}, {max}]", 1.0 / max),
            });
        }
        let now = self.time.now();
        let mut st = self.lock();
        st.reanchor(now);
        st.requested_rate = rate;
        if !st.audio_master {
            st.rate = rate;
        }
        Ok(())
    }

    /// Audio renderer started playing content `pts` at `at`, advancing `rate` content
    /// seconds per wall second.
    pub fn audio_presented(&self, pts: MediaTime, at: Instant, rate: f64) {
        let mut st = self.lock();
        if st.status != PlaybackState::Playing {
            return;
        }
        st.anchor_media = pts;
        st.anchor_wall = at;
        st.rate = if rate.is_finite() && rate > 0.0 { rate } else { 1.0 };
        st.audio_master = true;
    }

    /// Forget the audio anchor, e.g. when a failed segment left a hole in the audio.
    pub fn release_audio(&self) {
        let now = self.time.now();
        let mut st = self.lock();
        st.reanchor(now);
        st.reported = MediaTime::ZERO;
        st.audio_master = false;
        st.rate = st.requested_rate;
    }

    /// Decide how to present a video frame with presentation time `pts`.
    pub fn schedule_video(&self, pts: MediaTime) -> VideoDecision {
        let now = self.time.now();
        let mut st = self.lock();
        let position = st.position_at(now);
        let late = position - pts;
        let threshold = MediaTime::from_millis(self.opts.drop_threshold_ms as i64).scale(st.rate);
        if late > threshold {
            st.consecutive_drops += 1;
            if st.consecutive_drops > self.opts.max_consecutive_drops {
                st.consecutive_drops = 0;
                st.corrections += 1;
                st.presented += 1;
                if !st.audio_master {
                    st.anchor_media = pts;
                    st.anchor_wall = now;
                    st.reported = MediaTime::ZERO;
                }
                tracing::warn!(pts = %pts, late = %late, "video fell behind; forcing sync");
                return VideoDecision::ForceSync { at: now };
            }
            st.dropped += 1;
            return VideoDecision::Drop { late };
        }
        st.consecutive_drops = 0;
        st.presented += 1;
        let bound = self.opts.drop_threshold_ms as f64 * 500.0;
        let correction = st
            .drift
            .get(&TrackKind::Video)
            .copied()
            .unwrap_or(0.0)
            .clamp(-bound, bound);
        let at = shift(st.deadline(pts), MediaTime::from_micros(correction as i64));
        VideoDecision::Present { at: at.max(now) }
    }

    /// Renderer feedback: a frame due at `expected` was delivered at `actual`.
    pub fn report_delivery(&self, kind: TrackKind, expected: Instant, actual: Instant) {
        let drift = -signed_wall(actual, expected).as_micros() as f64;
        let alpha = self.opts.drift_smoothing;
        let mut st = self.lock();
        let ema = st.drift.entry(kind).or_insert(drift);
        *ema += alpha * (drift - *ema);
    }

    /// Smoothed drift for `kind`, in microseconds.
    pub fn drift(&self, kind: TrackKind) -> i64 {
        self.lock().drift.get(&kind).copied().unwrap_or(0.0) as i64
    }

    /// Terminal transition; wakes every waiter.
    pub fn finish(&self, reason: PlaybackEndReason) {
        let now = self.time.now();
        let mut st = self.lock();
        if matches!(st.status, PlaybackState::Ended | PlaybackState::Failed) {
            return;
        }
        st.reanchor(now);
        st.status = match reason {
            PlaybackEndReason::Error => PlaybackState::Failed,
            PlaybackEndReason::Eof | PlaybackEndReason::Stopped => PlaybackState::Ended,
        };
        drop(st);
        self.cv.notify_all();
    }

    /// Park while idle or paused. Returns `false` once cancelled or ended.
    pub fn wait_until_playing(&self, cancel: &CancelToken) -> bool {
        let mut st = self.lock();
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            match st.status {
                PlaybackState::Playing => return true,
                PlaybackState::Ended | PlaybackState::Failed => return false,
                PlaybackState::Idle | PlaybackState::Paused => {}
            }
            let (g, _timeout) = self
                .cv
                .wait_timeout(st, CANCEL_POLL)
                .unwrap_or_else(|e| e.into_inner());
            st = g;
        }
    }

    /// Sleep until `at`, returning early (`false`) on cancel or when playback stops.
    ///
    /// Deadlines within the wait tolerance count as reached immediately.
    pub fn wait_until(&self, at: Instant, cancel: &CancelToken) -> bool {
        let tolerance = Duration::from_millis(self.opts.wait_tolerance_ms);
        let now = self.time.now();
        if at <= now + tolerance {
            return true;
        }
        let interrupted = || cancel.is_cancelled() || self.state() != PlaybackState::Playing;
        self.time.sleep_until(at - tolerance, &interrupted)
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        let now = self.time.now();
        let mut st = self.lock();
        ClockSnapshot {
            state: st.status,
            position: st.report_position(now),
            rate: st.requested_rate,
            video_drift_us: st.drift.get(&TrackKind::Video).copied().unwrap_or(0.0) as i64,
            presented: st.presented,
            dropped: st.dropped,
            corrections: st.corrections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> (Clock, Arc<ManualTimeSource>) {
        let time = Arc::new(ManualTimeSource::new());
        (Clock::new(ClockOptions::default(), time.clone()), time)
    }

    #[test]
    fn position_follows_time_and_freezes_when_paused() {
        let (clock, time) = clock();
        assert_eq!(clock.state(), PlaybackState::Idle);
        time.advance(Duration::from_secs(1));
        assert_eq!(clock.position(), MediaTime::ZERO);
        clock.play().unwrap();
        time.advance(Duration::from_millis(500));
        assert_eq!(clock.position(), MediaTime::from_millis(500));
        clock.pause();
        time.advance(Duration::from_secs(3));
        assert_eq!(clock.position(), MediaTime::from_millis(500));
        clock.play().unwrap();
        time.advance(Duration::from_millis(250));
        assert_eq!(clock.position(), MediaTime::from_millis(750));
    }

    #[test]
    fn rate_scales_media_time() {
        let (clock, time) = clock();
        clock.play().unwrap();
        time.advance(Duration::from_secs(1));
        clock.set_rate(2.0).unwrap();
        time.advance(Duration::from_secs(1));
        assert_eq!(clock.position(), MediaTime::from_secs(3));
        assert!(clock.set_rate(0.0).is_err());
        assert!(clock.set_rate(f64::NAN).is_err());
        assert!(matches!(clock.set_rate(10.0), Err(PlayerError::Clock { .. })));
    }

    #[test]
    fn seek_resets_master_time() {
        let (clock, time) = clock();
        clock.play().unwrap();
        time.advance(Duration::from_secs(2));
        clock.seek(MediaTime::from_secs(9));
        assert_eq!(clock.position(), MediaTime::from_secs(9));
        time.advance(Duration::from_millis(100));
        assert_eq!(clock.position(), MediaTime::from_millis(9_100));
    }

    #[test]
    fn audio_presentation_reanchors_the_clock() {
        let (clock, time) = clock();
        clock.play().unwrap();
        let start = time.now() + Duration::from_millis(50);
        clock.audio_presented(MediaTime::from_secs(4), start, 1.0);
        time.advance(Duration::from_millis(150));
        assert_eq!(clock.position(), MediaTime::from_millis(4_100));
    }

    #[test]
    fn reported_position_does_not_step_back() {
        let (clock, time) = clock();
        clock.play().unwrap();
        time.advance(Duration::from_millis(300));
        assert_eq!(clock.position(), MediaTime::from_millis(300));
        // Late output re-anchors the same content a little later.
        clock.audio_presented(MediaTime::from_millis(280), time.now(), 1.0);
        assert_eq!(clock.position(), MediaTime::from_millis(300));
        time.advance(Duration::from_millis(40));
        assert_eq!(clock.position(), MediaTime::from_millis(320));
        clock.seek(MediaTime::from_millis(100));
        assert_eq!(clock.position(), MediaTime::from_millis(100));
    }

    #[test]
    fn early_frames_wait_and_late_frames_drop() {
        let (clock, time) = clock();
        clock.play().unwrap();
        let now = time.now();
        match clock.schedule_video(MediaTime::from_millis(40)) {
            VideoDecision::Present { at } => assert_eq!(at - now, Duration::from_millis(40)),
            other => panic!("unexpected {other:?}"),
        }
        time.advance(Duration::from_millis(500));
        assert!(matches!(
            clock.schedule_video(MediaTime::from_millis(80)),
            VideoDecision::Drop { .. }
        ));
        // Slightly late but inside the threshold: shown immediately.
        assert_eq!(
            clock.schedule_video(MediaTime::from_millis(460)),
            VideoDecision::Present { at: time.now() }
        );
    }

    #[test]
    fn consecutive_drops_are_bounded_by_forced_sync() {
        let (clock, time) = clock();
        let max = ClockOptions::default().max_consecutive_drops;
        clock.play().unwrap();
        time.advance(Duration::from_secs(10));
        let mut run = 0;
        let mut longest = 0;
        let mut forced = 0;
        // Audio keeps the master clock racing ahead of the video frames.
        clock.audio_presented(MediaTime::from_secs(10), time.now(), 1.0);
        for i in 0..100 {
            match clock.schedule_video(MediaTime::from_millis(i * 40)) {
                VideoDecision::Drop { .. } => {
                    run += 1;
                    longest = longest.max(run);
                }
                VideoDecision::ForceSync { .. } => {
                    run = 0;
                    forced += 1;
                }
                VideoDecision::Present { .. } => run = 0,
            }
        }
        assert!(longest <= max, "{longest} consecutive drops");
        assert!(forced > 0);
        assert_eq!(clock.snapshot().corrections, forced);
    }

    #[test]
    fn forced_sync_catches_up_without_audio() {
        let (clock, time) = clock();
        clock.play().unwrap();
        time.advance(Duration::from_secs(10));
        let max = ClockOptions::default().max_consecutive_drops as i64;
        for i in 0..=max {
            clock.schedule_video(MediaTime::from_millis(i * 40));
        }
        // The forced frame re-anchored the free-running clock.
        assert!(matches!(
            clock.schedule_video(MediaTime::from_millis((max + 1) * 40)),
            VideoDecision::Present { .. }
        ));
    }

    #[test]
    fn drift_is_smoothed() {
        let (clock, time) = clock();
        let t0 = time.now();
        clock.report_delivery(TrackKind::Video, t0, t0 + Duration::from_millis(10));
        assert_eq!(clock.drift(TrackKind::Video), -10_000);
        for _ in 0..50 {
            clock.report_delivery(TrackKind::Video, t0, t0);
        }
        assert!(clock.drift(TrackKind::Video).abs() < 100);
        assert_eq!(clock.drift(TrackKind::Audio), 0);
    }

    #[test]
    fn waiters_wake_on_play_and_end() {
        let (clock, _time) = clock();
        let clock = Arc::new(clock);
        let waiter = {
            let clock = clock.clone();
            thread::spawn(move || clock.wait_until_playing(&CancelToken::new()))
        };
        thread::sleep(Duration::from_millis(30));
        clock.play().unwrap();
        assert!(waiter.join().unwrap());

        clock.finish(PlaybackEndReason::Eof);
        assert_eq!(clock.state(), PlaybackState::Ended);
        assert!(!clock.wait_until_playing(&CancelToken::new()));
        assert!(clock.play().is_err());
        clock.seek(MediaTime::ZERO);
        assert_eq!(clock.state(), PlaybackState::Paused);
    }

    #[test]
    fn manual_sleep_wakes_on_advance() {
        let time = Arc::new(ManualTimeSource::new());
        let deadline = time.now() + Duration::from_millis(100);
        let sleeper = {
            let time = time.clone();
            thread::spawn(move || time.sleep_until(deadline, &|| false))
        };
        thread::sleep(Duration::from_millis(30));
        time.advance(Duration::from_millis(100));
        assert!(sleeper.join().unwrap());
        assert!(!time.sleep_until(deadline + Duration::from_secs(1), &|| true));
    }
}
