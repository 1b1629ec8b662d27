//! Platform-agnostic audio types shared by the device layer and backends
//!
//! Nothing in here talks to hardware; backends translate their native
//! structures into these.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum number of interleaved channels a buffer can address
pub const MAX_CHANNELS: usize = 6;

/// Stream direction of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Capture (recording)
    Input,
    /// Render (playback)
    Output,
}

impl Direction {
    /// Check if this is the capture direction
    pub fn is_input(self) -> bool {
        matches!(self, Self::Input)
    }

    /// Check if this is the render direction
    pub fn is_output(self) -> bool {
        matches!(self, Self::Output)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

/// Sample encoding of a mix format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    /// 32-bit IEEE float
    Float32,
    /// 16-bit signed integer PCM
    Int16,
    /// 24-bit signed integer PCM
    Int24,
    /// 32-bit signed integer PCM
    Int32,
    /// Anything the shared-mode engine cannot convert to float
    Unknown,
}

impl SampleFormat {
    /// Container size in bits
    pub fn bits(self) -> u16 {
        match self {
            Self::Float32 | Self::Int32 => 32,
            Self::Int24 => 24,
            Self::Int16 => 16,
            Self::Unknown => 0,
        }
    }
}

/// Sample layout negotiated with an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixFormat {
    /// Frames per second
    pub sample_rate: u32,
    /// Interleaved channel count
    pub channels: u16,
    /// Container bits per sample
    pub bits_per_sample: u16,
    /// Significant bits per sample
    pub valid_bits_per_sample: u16,
    /// Sample encoding
    pub sample_format: SampleFormat,
    /// Bytes per frame
    pub block_align: u16,
    /// Bytes per second
    pub avg_bytes_per_sec: u32,
}

impl MixFormat {
    /// Create a 32-bit float format with derived fields filled in
    pub fn float32(sample_rate: u32, channels: u16) -> Self {
        let mut format = Self {
            sample_rate,
            channels,
            bits_per_sample: 32,
            valid_bits_per_sample: 32,
            sample_format: SampleFormat::Float32,
            block_align: 0,
            avg_bytes_per_sec: 0,
        };
        format.fixup();
        format
    }

    /// Check whether samples are 32-bit float
    pub fn is_float32(&self) -> bool {
        self.sample_format == SampleFormat::Float32 && self.bits_per_sample == 32
    }

    /// Switch the format to 32-bit float samples
    pub fn set_float32(&mut self) {
        self.sample_format = SampleFormat::Float32;
        self.bits_per_sample = 32;
        self.valid_bits_per_sample = 32;
        self.fixup();
    }

    /// Recompute block align and byte rate after a field changed
    ///
    /// Values that do not fit their field saturate.
    pub fn fixup(&mut self) {
        let frame_bits = u64::from(self.channels) * u64::from(self.bits_per_sample);
        self.block_align = u16::try_from(frame_bits / 8).unwrap_or(u16::MAX);
        self.avg_bytes_per_sec =
            u32::try_from(u64::from(self.sample_rate) * frame_bits / 8).unwrap_or(u32::MAX);
    }
}

/// An endpoint as reported by the backend's enumerator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Opaque platform identifier
    pub id: String,
    /// Human-readable name (may be empty if the platform has none)
    pub name: String,
    /// Stream direction
    pub direction: Direction,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, name: impl Into<String>, direction: Direction) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            direction,
        }
    }
}

/// Role a default endpoint is assigned for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceRole {
    /// Games, system sounds, voice commands
    Console,
    /// Music, movies, recording
    Multimedia,
    /// Voice communications
    Communications,
}

/// Raw endpoint notification as delivered by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceNotification {
    /// A new endpoint appeared
    DeviceAdded { id: String },
    /// An endpoint disappeared
    DeviceRemoved { id: String },
    /// An endpoint changed state (active, disabled, unplugged)
    DeviceStateChanged { id: String, state: u32 },
    /// The default endpoint for a direction and role changed
    DefaultDeviceChanged {
        direction: Direction,
        role: DeviceRole,
        id: Option<String>,
    },
    /// A property of an endpoint changed
    PropertyValueChanged { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixup_recomputes_derived_fields() {
        let mut format = MixFormat {
            sample_rate: 44100,
            channels: 2,
            bits_per_sample: 16,
            valid_bits_per_sample: 16,
            sample_format: SampleFormat::Int16,
            block_align: 4,
            avg_bytes_per_sec: 176_400,
        };

        format.sample_rate = 48000;
        format.fixup();
        assert_eq!(format.block_align, 4);
        assert_eq!(format.avg_bytes_per_sec, 192_000);

        format.set_float32();
        assert!(format.is_float32());
        assert_eq!(format.block_align, 8);
        assert_eq!(format.avg_bytes_per_sec, 384_000);
    }

    #[test]
    fn test_fixup_saturates_on_huge_rates() {
        let mut format = MixFormat::float32(48_000, 8);
        format.sample_rate = 200_000_000;
        format.fixup();
        assert_eq!(format.block_align, 32);
        assert_eq!(format.avg_bytes_per_sec, u32::MAX);

        format.sample_rate = u32::MAX;
        format.fixup();
        assert_eq!(format.avg_bytes_per_sec, u32::MAX);
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::Input.to_string(), "input");
        assert_eq!(Direction::Output.to_string(), "output");
        assert!(Direction::Output.is_output());
        assert!(!Direction::Output.is_input());
    }
}
