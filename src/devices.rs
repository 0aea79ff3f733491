//! Output device listing for the `devices` subcommand.

use rodio::cpal;
use rodio::cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use crate::error::AppError;

#[derive(Debug, Serialize)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub is_default: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_format: Option<String>,
}

/// Enumerate output devices on the default host. With `full`, each
/// device also reports its default stream configuration.
pub fn list_output_devices(full: bool) -> Result<Vec<DeviceInfo>, AppError> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let mut devices = Vec::new();
    let iterator = host
        .output_devices()
        .map_err(|e| AppError::Playback(format!("device enumeration failed: {e}")))?;
    for (index, device) in iterator.enumerate() {
        let name = device.name().unwrap_or_else(|_| format!("device {index}"));
        let mut info = DeviceInfo {
            index,
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            sample_rate: None,
            channels: None,
            sample_format: None,
        };
        if full {
            if let Ok(config) = device.default_output_config() {
                info.sample_rate = Some(config.sample_rate().0);
                info.channels = Some(config.channels());
                info.sample_format = Some(format!("{:?}", config.sample_format()));
            }
        }
        devices.push(info);
    }
    Ok(devices)
}

/// Render the listing either as text lines or as a JSON array.
pub fn render_devices(devices: &[DeviceInfo], json: bool) -> String {
    if json {
        return serde_json::to_string_pretty(devices).unwrap_or_else(|_| "[]".to_string());
    }
    let mut out = String::new();
    for device in devices {
        let marker = if device.is_default { " (default)" } else { "" };
        out.push_str(&format!("{:>3}: {}{}\n", device.index, device.name, marker));
        if let (Some(rate), Some(channels)) = (device.sample_rate, device.channels) {
            let format = device.sample_format.as_deref().unwrap_or("?");
            out.push_str(&format!("     {} Hz, {} ch, {}\n", rate, channels, format));
        }
    }
    out
}
