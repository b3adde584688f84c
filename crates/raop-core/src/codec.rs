//! Codec parameters announced by the sender.
//!
//! RAOP senders describe the Apple Lossless stream in the SDP `a=fmtp:`
//! attribute as twelve space-separated integers, e.g.
//! `96 352 0 16 40 10 14 2 255 0 0 44100`.

use crate::error::ParseError;
use std::str::FromStr;

/// Number of integers in an ALAC fmtp attribute.
const FMTP_FIELDS: usize = 12;

/// Audio format delivered to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bit_depth: u8,
    pub channels: u8,
    pub frames_per_packet: u32,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            bit_depth: 16,
            channels: 2,
            frames_per_packet: 352,
        }
    }
}

impl AudioFormat {
    /// Duration of one packet in milliseconds.
    pub fn packet_duration_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames_per_packet as f64 * 1000.0 / self.sample_rate as f64
    }
}

/// Parsed ALAC fmtp attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fmtp {
    pub payload_type: u8,
    pub frames_per_packet: u32,
    pub compatible_version: u8,
    pub bit_depth: u8,
    pub rice_history_mult: u8,
    pub rice_initial_history: u8,
    pub rice_limit: u8,
    pub channels: u8,
    pub max_run: u16,
    pub max_frame_bytes: u32,
    pub avg_bit_rate: u32,
    pub sample_rate: u32,
}

impl Fmtp {
    /// Parse the attribute value (without the `a=fmtp:` prefix).
    pub fn parse(fmtp: &str) -> Result<Self, ParseError> {
        let fields = fmtp
            .split_whitespace()
            .map(|field| {
                field.parse::<u32>().map_err(|_| {
                    ParseError::InvalidFormat(format!("fmtp field {:?} is not an integer", field))
                })
            })
            .collect::<Result<Vec<u32>, ParseError>>()?;

        if fields.len() != FMTP_FIELDS {
            return Err(ParseError::InvalidFormat(format!(
                "fmtp has {} fields, expected {}",
                fields.len(),
                FMTP_FIELDS
            )));
        }

        let fmtp = Self {
            payload_type: narrow(fields[0], "payload type")?,
            frames_per_packet: fields[1],
            compatible_version: narrow(fields[2], "compatible version")?,
            bit_depth: narrow(fields[3], "bit depth")?,
            rice_history_mult: narrow(fields[4], "rice history mult")?,
            rice_initial_history: narrow(fields[5], "rice initial history")?,
            rice_limit: narrow(fields[6], "rice limit")?,
            channels: narrow(fields[7], "channels")?,
            max_run: narrow(fields[8], "max run")?,
            max_frame_bytes: fields[9],
            avg_bit_rate: fields[10],
            sample_rate: fields[11],
        };
        fmtp.validate()?;
        Ok(fmtp)
    }

    fn validate(&self) -> Result<(), ParseError> {
        if self.frames_per_packet == 0 {
            return Err(ParseError::InvalidValue("frames per packet is 0".into()));
        }
        if !matches!(self.bit_depth, 16 | 24) {
            return Err(ParseError::InvalidValue(format!(
                "unsupported bit depth {}",
                self.bit_depth
            )));
        }
        if !(1..=8).contains(&self.channels) {
            return Err(ParseError::InvalidValue(format!(
                "unsupported channel count {}",
                self.channels
            )));
        }
        if self.sample_rate == 0 {
            return Err(ParseError::InvalidValue("sample rate is 0".into()));
        }
        Ok(())
    }

    /// Audio format described by these parameters.
    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            bit_depth: self.bit_depth,
            channels: self.channels,
            frames_per_packet: self.frames_per_packet,
        }
    }
}

impl FromStr for Fmtp {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn narrow<T: TryFrom<u32>>(value: u32, name: &str) -> Result<T, ParseError> {
    T::try_from(value).map_err(|_| ParseError::InvalidValue(format!("{} {} out of range", name, value)))
}
