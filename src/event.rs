use crate::{DecodeError, Malformed, TriggerMode};
use ndarray::Array2;
use std::fmt;
use time::OffsetDateTime;

/// "DRS4" in little-endian byte order.
pub const FRAME_MAGIC: u32 = 0x3453_5244;
pub const FRAME_VERSION: u8 = 1;
pub const HEADER_BYTES: usize = 32;
/// Number of cells in one DRS4 domino ring.
pub const N_CELLS: usize = 1024;
/// Input channels per board.
pub const MAX_CHANNELS: usize = 8;

/// Set of enabled input channels, bit n = channel n.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelMask(pub u8);

impl ChannelMask {
    pub fn from_channels(channels: &[u8]) -> Option<Self> {
        let mut mask = 0u8;
        for &ch in channels {
            if ch as usize >= MAX_CHANNELS {
                return None;
            }
            mask |= 1 << ch;
        }
        Some(Self(mask))
    }

    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, channel: u8) -> bool {
        (channel as usize) < MAX_CHANNELS && self.0 & (1 << channel) != 0
    }

    /// Enabled channels in ascending order.
    pub fn channels(self) -> Vec<u8> {
        (0..MAX_CHANNELS as u8)
            .filter(|&ch| self.contains(ch))
            .collect()
    }
}

impl fmt::Debug for ChannelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelMask({:#04x})", self.0)
    }
}

/// One capture as delivered by the instrument link, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Arrival sequence number assigned by the link, strictly increasing.
    pub sequence: u64,
    /// Host arrival time, ns since the Unix epoch.
    pub host_time_ns: i64,
    pub payload: Vec<u8>,
}

/// Fixed 32-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub channel_mask: ChannelMask,
    pub sample_depth: u16,
    pub trigger_counter: u64,
    pub device_time_ns: u64,
    pub stop_cell: u16,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn parse(sequence: u64, bytes: &[u8]) -> Result<Self, DecodeError> {
        let malformed = |reason| DecodeError::Malformed { sequence, reason };
        if bytes.len() < HEADER_BYTES {
            return Err(malformed(Malformed::ShortHeader(bytes.len())));
        }
        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let u32_at = |at: usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(word)
        };
        let u64_at = |at: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(word)
        };

        let magic = u32_at(0);
        if magic != FRAME_MAGIC {
            return Err(malformed(Malformed::BadMagic(magic)));
        }
        if bytes[5] != FRAME_VERSION {
            return Err(malformed(Malformed::UnsupportedVersion(bytes[5])));
        }

        Ok(Self {
            channel_mask: ChannelMask(bytes[4]),
            sample_depth: u16_at(6),
            trigger_counter: u64_at(8),
            device_time_ns: u64_at(16),
            stop_cell: u16_at(24),
            payload_len: u32_at(28),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        out.push(self.channel_mask.0);
        out.push(FRAME_VERSION);
        out.extend_from_slice(&self.sample_depth.to_le_bytes());
        out.extend_from_slice(&self.trigger_counter.to_le_bytes());
        out.extend_from_slice(&self.device_time_ns.to_le_bytes());
        out.extend_from_slice(&self.stop_cell.to_le_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.payload_len.to_le_bytes());
    }
}

/// Build a complete frame from a header and per-channel ADC counts
/// (channels in ascending order, `sample_depth` counts each).
/// `payload_len` is filled in from `samples`.
pub fn encode_frame(header: FrameHeader, samples: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_BYTES + samples.len() * 2);
    FrameHeader {
        payload_len: (samples.len() * 2) as u32,
        ..header
    }
    .write(&mut out);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// A decoded and calibrated event.
///
/// `time_ns` and `amplitude_mv` are `channels × samples`, row `i`
/// belonging to `channels[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformRecord {
    pub event_id: u64,
    pub trigger_counter: u64,
    /// Device-relative timestamp from the frame header.
    pub device_time_ns: u64,
    pub host_time_ns: i64,
    pub stop_cell: u16,
    pub channels: Vec<u8>,
    pub time_ns: Array2<f32>,
    pub amplitude_mv: Array2<f32>,
}

impl WaveformRecord {
    pub fn n_samples(&self) -> usize {
        self.time_ns.ncols()
    }
}

/// How much the wall-clock timestamp of a record can be trusted.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftFlag {
    /// Derived from the current anchor within tolerance.
    Locked = 0,
    /// Drift exceeded tolerance; the anchor was moved to this record.
    ReAnchored = 1,
    /// The trigger counter went backwards; passed through as received.
    OutOfOrder = 2,
}

impl DriftFlag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Locked),
            1 => Some(Self::ReAnchored),
            2 => Some(Self::OutOfOrder),
            _ => None,
        }
    }
}

/// A waveform record with its resolved wall-clock time.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedRecord {
    pub record: WaveformRecord,
    /// Wall-clock time, ns since the Unix epoch.
    pub timestamp_ns: i64,
    pub drift: DriftFlag,
}

/// Session-wide facts tagged onto the dataset once at open.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMetadata {
    pub obsid: String,
    pub start: OffsetDateTime,
    pub device_id: String,
    pub calibration_id: String,
    pub calibration_version: u32,
    pub channels: Vec<u8>,
    pub sample_depth: usize,
    pub trigger_mode: TriggerMode,
    pub trigger_interval_ns: u64,
}
