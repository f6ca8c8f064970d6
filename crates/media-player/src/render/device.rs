//! Output device discovery and selection over CPAL.

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

/// Pick the first output device whose name contains `needle` (case-insensitive),
/// or the host default when no needle is given.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let mut devices = host.output_devices().context("No output devices")?;
        return devices
            .find(|d| {
                d.description()
                    .map(|n| matches_device_name(&n.name(), needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }
    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose the output config closest to `target_rate`.
///
/// Prefers the highest supported rate at or below the target, then the lowest one
/// above it; among equal rates, `f32` output wins.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: Option<u32>,
) -> Result<cpal::SupportedStreamConfig> {
    let mut best: Option<(bool, u32, u8, cpal::SupportedStreamConfig)> = None;
    for range in device.supported_output_configs()? {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let below = target_rate.is_none_or(|t| rate <= t);
        let rank = sample_format_rank(range.sample_format());
        let replace = match &best {
            None => true,
            Some((b_below, b_rate, b_rank, _)) => {
                is_better_candidate(below, rate, rank, *b_below, *b_rate, *b_rank)
            }
        };
        if replace {
            best = Some((below, rate, rank, range.with_sample_rate(rate)));
        }
    }
    best.map(|b| b.3)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Largest fixed buffer the device allows, capped to keep latency sane.
///
/// `None` lets CPAL use the device default.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    const MAX_FRAMES: u32 = 16_384;
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            Some(cpal::BufferSize::Fixed((*max).min(MAX_FRAMES).max(*min)))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Output device metadata for `--list-devices`.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub min_rate: u32,
    pub max_rate: u32,
    pub default: bool,
}

pub fn list_devices(host: &cpal::Host) -> Result<Vec<DeviceInfo>> {
    let default_name = host
        .default_output_device()
        .and_then(|d| d.description().ok())
        .map(|d| d.name().to_string());
    let mut out = Vec::new();
    for d in host.output_devices().context("No output devices")? {
        let name = d.description()?.name().to_string();
        let (mut min_rate, mut max_rate) = (u32::MAX, 0u32);
        if let Ok(ranges) = d.supported_output_configs() {
            for r in ranges {
                min_rate = min_rate.min(r.min_sample_rate());
                max_rate = max_rate.max(r.max_sample_rate());
            }
        }
        if max_rate == 0 {
            match d.default_output_config() {
                Ok(cfg) => {
                    min_rate = cfg.sample_rate();
                    max_rate = min_rate;
                }
                Err(e) => {
                    tracing::warn!(device = %name, "skipping device without usable configs: {e}");
                    continue;
                }
            }
        }
        out.push(DeviceInfo {
            default: default_name.as_deref() == Some(name.as_str()),
            name,
            min_rate,
            max_rate,
        });
    }
    Ok(out)
}

fn pick_rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(t) => t.clamp(min, max.max(min)),
        None => max,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn is_better_candidate(
    below: bool,
    rate: u32,
    format_rank: u8,
    best_below: bool,
    best_rate: u32,
    best_rank: u8,
) -> bool {
    if below != best_below {
        below
    } else if rate != best_rate {
        // Below the target the higher rate is closer, above it the lower one.
        if below { rate > best_rate } else { rate < best_rate }
    } else {
        format_rank < best_rank
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    !needle.is_empty() && name.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_device_name_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(matches_device_name("usb dac", "USB"));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", "  "));
    }

    #[test]
    fn rate_is_clamped_into_the_range() {
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(48_000)), 48_000);
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(22_050)), 44_100);
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(192_000)), 96_000);
        assert_eq!(pick_rate_for_range(44_100, 96_000, None), 96_000);
    }

    #[test]
    fn candidates_prefer_rates_at_or_below_target() {
        assert!(is_better_candidate(true, 48_000, 1, false, 48_000, 1));
        assert!(!is_better_candidate(false, 96_000, 0, true, 44_100, 3));
    }

    #[test]
    fn candidates_prefer_the_closest_rate() {
        assert!(is_better_candidate(true, 96_000, 2, true, 48_000, 2));
        assert!(is_better_candidate(false, 88_200, 2, false, 96_000, 2));
    }

    #[test]
    fn candidates_prefer_float_output_at_equal_rate() {
        assert!(is_better_candidate(true, 48_000, 0, true, 48_000, 2));
        assert!(!is_better_candidate(true, 48_000, 3, true, 48_000, 0));
    }
}
