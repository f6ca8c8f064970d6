//! `player`: plays a sequence of media URLs as one timeline through the default
//! output device, printing player events as JSON lines on stdout.
//!
//! ## Modes
//! - `play`: resolve the URLs (with optional silent gaps), open the output device and play.
//! - `probe`: resolve the URLs and print the resulting segments and tracks.
//! - `--list-devices`: print the output devices and exit.

mod cli;

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use crossbeam_channel::{bounded, select};
use media_player::render::{CpalAudioRenderer, OutputOptions, device};
use media_player::source::CompositeOpener;
use media_player::timeline::ResolvedKind;
use media_player::{Asset, MediaTime, PlayerEvent, PlayerItem, PlayerOptions, Timeline};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,player=info,media_player=info")
        }))
        .with_writer(std::io::stderr)
        .init();

    if args.list_devices {
        let host = cpal::default_host();
        for d in device::list_devices(&host)? {
            println!("{}", serde_json::to_string(&d)?);
        }
        return Ok(());
    }

    let options = load_options(args.config.as_deref())?;
    match args.cmd {
        Some(cli::Command::Play {
            urls,
            gap,
            rate,
            start,
            volume,
            device,
            sample_rate,
            chunk_frames,
            refill_max_frames,
            buffer_seconds,
        }) => {
            let mut options = options;
            if let Some(n) = chunk_frames {
                options.processor.resample_chunk_frames = n;
            }
            if let Some(s) = buffer_seconds {
                options.buffering.output_audio_seconds = s;
            }
            let output = OutputOptions {
                device,
                sample_rate,
                refill_max_frames,
            };
            let asset = build_asset(&urls, gap)?;
            play(asset, options, &output, rate, start, volume)
        }
        Some(cli::Command::Probe { urls }) => probe(build_asset(&urls, 0.0)?, &options),
        None => Err(anyhow!("no command given; try `player play <url>` or `--list-devices`")),
    }
}

fn load_options(path: Option<&Path>) -> Result<PlayerOptions> {
    match path {
        Some(path) => PlayerOptions::load(path),
        None => Ok(PlayerOptions::default()),
    }
}

fn build_asset(urls: &[String], gap: f64) -> Result<Asset> {
    if !gap.is_finite() || gap < 0.0 {
        return Err(anyhow!("--gap must be a non-negative number of seconds"));
    }
    let gap = MediaTime::from_secs_f64(gap);
    let mut builder = Asset::builder();
    for (i, url) in urls.iter().enumerate() {
        if i > 0 && gap > MediaTime::ZERO {
            builder = builder.padding(gap);
        }
        builder = builder.url(url.as_str());
    }
    Ok(builder.build()?)
}

fn play(
    asset: Asset,
    options: PlayerOptions,
    output: &OutputOptions,
    rate: f64,
    start: Option<f64>,
    volume: f32,
) -> Result<()> {
    let renderer = CpalAudioRenderer::open(output).context("open audio output")?;
    tracing::info!(device = %renderer.device_name(), "output device");

    let item = PlayerItem::builder(asset)
        .options(options)
        .audio_renderer(renderer)
        .prepare()
        .context("prepare player item")?;
    let events = item.subscribe();
    tracing::info!(duration = %item.duration(), "prepared");

    item.set_volume(volume);
    item.set_rate(rate)?;
    if let Some(start) = start {
        let target = MediaTime::from_secs_f64(start);
        item.seek(target)?.wait().context("initial seek")?;
    }

    let (quit_tx, quit_rx) = bounded::<()>(1);
    let _ = ctrlc::set_handler(move || {
        let _ = quit_tx.try_send(());
    });

    item.play()?;
    let stdout = std::io::stdout();
    loop {
        select! {
            recv(events) -> ev => {
                let Ok(ev) = ev else { break };
                let mut out = stdout.lock();
                writeln!(out, "{}", serde_json::to_string(&ev)?)?;
                out.flush()?;
                if matches!(ev, PlayerEvent::PlaybackEnded { .. }) {
                    break;
                }
            }
            recv(quit_rx) -> _ => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    item.stop();
    let status = item.status();
    tracing::info!(
        position_ms = status.position_ms,
        end_reason = ?status.end_reason,
        "playback finished"
    );
    Ok(())
}

fn probe(asset: Asset, options: &PlayerOptions) -> Result<()> {
    let timeline = Timeline::resolve(&asset, &CompositeOpener::new(), &options.demuxer)
        .context("resolve timeline")?;
    let segments: Vec<_> = timeline
        .segments()
        .iter()
        .map(|seg| {
            let mut value = serde_json::json!({
                "index": seg.index,
                "start": seg.start,
                "duration": seg.duration,
            });
            if let ResolvedKind::Source {
                url,
                source_start,
                tracks,
                selection,
            } = &seg.kind
            {
                value["url"] = serde_json::json!(url);
                value["source_start"] = serde_json::json!(source_start);
                value["tracks"] = serde_json::json!(tracks);
                value["selection"] = serde_json::json!(selection);
            } else {
                value["padding"] = serde_json::json!(true);
            }
            value
        })
        .collect();
    let report = serde_json::json!({
        "duration": timeline.duration(),
        "segments": segments,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
