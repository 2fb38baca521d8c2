//! Acquisition pipeline for DRS4 waveform digitizers: instrument link,
//! frame decoding, trigger synchronization, bounded buffering and chunked
//! HDF5 storage with time-range queries.

mod buffer;
mod calibration;
mod config;
mod decoder;
mod error;
mod event;
mod link;
mod query;
mod scpi;
mod session;
mod sim;
mod sync;
mod udp;
mod utils;
mod writer;

pub use buffer::*;
pub use calibration::*;
pub use config::*;
pub use decoder::*;
pub use error::*;
pub use event::*;
pub use link::*;
pub use query::*;
pub use scpi::*;
pub use session::*;
pub use sim::*;
pub use sync::*;
pub use udp::*;
pub use utils::*;
pub use writer::*;
