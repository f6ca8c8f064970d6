//! Audio output through a CPAL stream.
//!
//! The stream lives on its own thread (CPAL streams are not `Send`). The real-time
//! callback:
//! - refills a small local buffer from the shared sample queue without blocking
//! - applies gain
//! - converts `f32` samples to the device sample format
//!
//! Pause outputs silence without draining, so playback resumes where it stopped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Sender, bounded};

use crate::error::{PlayerError, Result};
use crate::frame::{AudioDescriptor, AudioFrame, SampleFormat};
use crate::render::AudioRenderer;
use crate::render::device;

/// Where and how to open the output stream.
#[derive(Clone, Debug)]
pub struct OutputOptions {
    /// Substring of the device name; the default device when unset.
    pub device: Option<String>,
    /// Preferred sample rate; the device's best rate when unset.
    pub sample_rate: Option<u32>,
    /// Maximum frames pulled from the queue per refill.
    pub refill_max_frames: usize,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: None,
            refill_max_frames: 4096,
        }
    }
}

/// State shared between the renderer and the stream callback.
struct OutputShared {
    samples: Mutex<VecDeque<f32>>,
    channels: usize,
    paused: AtomicBool,
    /// `f32` gain bits.
    gain: AtomicU32,
    played_frames: AtomicU64,
    underrun_frames: AtomicU64,
    underrun_events: AtomicU64,
}

impl OutputShared {
    fn lock(&self) -> MutexGuard<'_, VecDeque<f32>> {
        self.samples.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn gain(&self) -> f32 {
        f32::from_bits(self.gain.load(Ordering::Relaxed))
    }

    /// Pop up to `max_frames` interleaved frames without blocking.
    fn pop_chunk(&self, max_frames: usize, out: &mut Vec<f32>) -> bool {
        let mut q = self.lock();
        let n = (max_frames * self.channels).min(q.len());
        out.clear();
        out.extend(q.drain(..n));
        n > 0
    }
}

pub struct CpalAudioRenderer {
    shared: Arc<OutputShared>,
    descriptor: AudioDescriptor,
    device_name: String,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalAudioRenderer {
    /// Open the device and start a stream that plays silence until fed.
    pub fn open(opts: &OutputOptions) -> Result<Self> {
        let (ready_tx, ready_rx) = bounded::<Result<(AudioDescriptor, String, Arc<OutputShared>)>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let opts = opts.clone();
        let thread = thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || {
                let stream = match start_stream(&opts) {
                    Ok((stream, descriptor, name, shared)) => {
                        let _ = ready_tx.send(Ok((descriptor, name, shared)));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(PlayerError::Render(format!("{e:#}"))));
                        return;
                    }
                };
                // Keep the stream alive until the renderer is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| PlayerError::Render(format!("spawn output thread: {e}")))?;

        let (descriptor, device_name, shared) = ready_rx
            .recv()
            .map_err(|_| PlayerError::Render("output thread exited".into()))??;
        tracing::info!(
            device = %device_name,
            rate_hz = descriptor.sample_rate,
            channels = descriptor.channels,
            "audio output opened"
        );
        Ok(Self {
            shared,
            descriptor,
            device_name,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Frames queued but not yet handed to the device.
    pub fn queued_frames(&self) -> usize {
        self.shared.lock().len() / self.shared.channels
    }

    /// `(frames, events)` of silence output because the queue ran dry.
    pub fn underruns(&self) -> (u64, u64) {
        (
            self.shared.underrun_frames.load(Ordering::Relaxed),
            self.shared.underrun_events.load(Ordering::Relaxed),
        )
    }

    pub fn played_frames(&self) -> u64 {
        self.shared.played_frames.load(Ordering::Relaxed)
    }
}

impl Drop for CpalAudioRenderer {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl AudioRenderer for CpalAudioRenderer {
    fn output_descriptor(&self) -> AudioDescriptor {
        self.descriptor
    }

    fn present(&mut self, frame: &AudioFrame, _when: Instant) -> Result<Instant> {
        if frame.descriptor.channels != self.descriptor.channels
            || frame.descriptor.sample_rate != self.descriptor.sample_rate
        {
            return Err(PlayerError::Render(format!(
                "frame format {} does not match output {}",
                frame.descriptor, self.descriptor
            )));
        }
        let samples = frame.samples.to_f32();
        let queued = {
            let mut q = self.shared.lock();
            let queued = q.len() / self.shared.channels;
            q.extend(samples);
            queued
        };
        let latency = Duration::from_secs_f64(queued as f64 / self.descriptor.sample_rate as f64);
        Ok(Instant::now() + latency)
    }

    fn set_paused(&mut self, paused: bool) {
        self.shared.paused.store(paused, Ordering::Relaxed);
    }

    fn set_volume(&mut self, volume: f32) {
        self.shared
            .gain
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn flush(&mut self) {
        self.shared.lock().clear();
    }

    fn underruns(&self) -> u64 {
        self.shared.underrun_events.load(Ordering::Relaxed)
    }
}

fn start_stream(
    opts: &OutputOptions,
) -> anyhow::Result<(cpal::Stream, AudioDescriptor, String, Arc<OutputShared>)> {
    let host = cpal::default_host();
    let device = device::pick_device(&host, opts.device.as_deref())?;
    let name = device
        .description()
        .map(|d| d.name().to_string())
        .unwrap_or_else(|_| "unknown".into());
    let config = device::pick_output_config(&device, opts.sample_rate)?;
    let mut stream_config: cpal::StreamConfig = config.clone().into();
    if let Some(buf) = device::pick_buffer_size(&config) {
        stream_config.buffer_size = buf;
    }
    let shared = Arc::new(OutputShared {
        samples: Mutex::new(VecDeque::new()),
        channels: stream_config.channels.max(1) as usize,
        paused: AtomicBool::new(false),
        gain: AtomicU32::new(1.0f32.to_bits()),
        played_frames: AtomicU64::new(0),
        underrun_frames: AtomicU64::new(0),
        underrun_events: AtomicU64::new(0),
    });
    let refill = opts.refill_max_frames.max(1);
    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, &shared, refill)?,
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, &shared, refill)?,
        cpal::SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, &shared, refill)?,
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, &shared, refill)?,
        other => return Err(anyhow!("Unsupported sample format: {other:?}")),
    };
    stream.play()?;
    let descriptor = AudioDescriptor::new(
        stream_config.sample_rate,
        stream_config.channels,
        SampleFormat::F32,
    );
    Ok((stream, descriptor, name, shared))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: &Arc<OutputShared>,
    refill_max_frames: usize,
) -> anyhow::Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels = shared.channels;
    let shared = shared.clone();
    let mut local: Vec<f32> = Vec::new();
    let mut pos = 0usize;
    let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);
    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            if shared.paused.load(Ordering::Relaxed) {
                data.fill(silence);
                return;
            }
            let gain = shared.gain();
            let frames = data.len() / channels;
            let mut filled = 0usize;
            for frame in 0..frames {
                if pos >= local.len() {
                    pos = 0;
                    if !shared.pop_chunk(refill_max_frames, &mut local) {
                        // No more audio ready; fill the rest with silence.
                        shared.underrun_events.fetch_add(1, Ordering::Relaxed);
                        shared
                            .underrun_frames
                            .fetch_add((frames - frame) as u64, Ordering::Relaxed);
                        data[frame * channels..].fill(silence);
                        break;
                    }
                }
                for (out, s) in data[frame * channels..(frame + 1) * channels]
                    .iter_mut()
                    .zip(&local[pos..pos + channels])
                {
                    *out = <T as cpal::Sample>::from_sample::<f32>(s * gain);
                }
                pos += channels;
                filled += 1;
            }
            if filled > 0 {
                shared.played_frames.fetch_add(filled as u64, Ordering::Relaxed);
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}
