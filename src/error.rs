use std::{io, path::PathBuf, time::Duration};
use thiserror::Error;

/// Failures reported by the instrument link and its backends.
#[derive(Error, Debug)]
pub enum LinkError {
    /// The link could not be established. Fatal at session start.
    #[error("connection error: {0}")]
    Connection(String),
    /// The acquisition configuration was rejected before touching hardware.
    #[error("invalid link configuration: {0}")]
    InvalidConfig(String),
    /// No frame arrived within the read timeout. Callers poll again.
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    /// Hardware- or transport-reported fault.
    #[error("device error: {message}")]
    Device { message: String, transient: bool },
    /// A transient fault persisted past the retry ceiling.
    #[error("device error after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },
    /// The device ended the acquisition on its own.
    #[error("acquisition stopped by device")]
    Stopped,
    #[error("link is closed")]
    Closed,
}

impl LinkError {
    pub fn transient(message: impl Into<String>) -> Self {
        LinkError::Device {
            message: message.into(),
            transient: true,
        }
    }

    pub fn fault(message: impl Into<String>) -> Self {
        LinkError::Device {
            message: message.into(),
            transient: false,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LinkError::Device {
                transient: true,
                ..
            }
        )
    }
}

/// Why a frame was rejected by the decoder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Malformed {
    #[error("frame of {0} bytes is shorter than the header")]
    ShortHeader(usize),
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported header version {0}")]
    UnsupportedVersion(u8),
    #[error("channel mask {found:#04x} does not match configured {expected:#04x}")]
    ChannelMask { expected: u8, found: u8 },
    #[error("sample depth {found} does not match configured {expected}")]
    SampleDepth { expected: usize, found: usize },
    #[error("payload length: header says {declared}, configuration needs {expected}, frame has {actual}")]
    PayloadLength {
        declared: usize,
        expected: usize,
        actual: usize,
    },
    #[error("channel {0} has no calibration")]
    Uncalibrated(u8),
    #[error("stop cell {stop_cell} outside of {n_cells} cells")]
    StopCell { stop_cell: u16, n_cells: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed frame {sequence}: {reason}")]
    Malformed { sequence: u64, reason: Malformed },
}

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("calibration has no entry for channel {0}")]
    MissingChannel(u8),
    #[error("channel {channel}: {name} has {found} cells, expected {expected}")]
    CellCount {
        channel: u8,
        name: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("channel {channel}: bin width {width} at cell {cell} is not a positive number")]
    BinWidth { channel: u8, cell: usize, width: f32 },
    #[error("calibration covers {n_cells} cells, sample depth is {depth}")]
    TooFewCells { n_cells: usize, depth: usize },
    #[error("calibration attribute {0}: {1}")]
    Attribute(&'static str, String),
    #[error(transparent)]
    Storage(#[from] hdf5::Error),
}

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("writer is closed")]
    Closed,
    #[error("record {event_id} has shape {found:?}, dataset expects {expected:?}")]
    Shape {
        event_id: u64,
        expected: (Vec<u8>, usize),
        found: (Vec<u8>, usize),
    },
    #[error("existing dataset is incompatible: {0}")]
    Incompatible(String),
    #[error("{0} already exists")]
    Exists(PathBuf),
    #[error("metadata: {0}")]
    Metadata(String),
    #[error(transparent)]
    Storage(#[from] hdf5::Error),
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("channel {0} is not stored in this dataset")]
    UnknownChannel(u8),
    #[error("metadata: {0}")]
    Metadata(String),
    #[error(transparent)]
    Storage(#[from] hdf5::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl ConfigError {
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Errors that prevent a session from starting.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{0} thread panicked")]
    Panicked(&'static str),
}
