use crate::{query::read_metadata, SessionMetadata, SyncedRecord, WriteError};
use hdf5::{types::VarLenUnicode, Dataset, File, H5Type};
use log::{debug, info};
use ndarray::{s, Array1, Array3, ArrayView1};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use time::format_description::well_known::Rfc3339;

/// Layout version stored in the `format_version` root attribute.
pub const FORMAT_VERSION: u32 = 2;
/// Root attribute holding the number of events readers may trust.
pub const COMMITTED_EVENTS: &str = "committed_events";
/// Obsid of every session that wrote to the file, indexed by the
/// per-event `session` column.
pub const SESSIONS: &str = "sessions";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Refuse to touch an existing file.
    Create,
    Overwrite,
    /// Continue a compatible existing file, or create it.
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterOptions {
    pub mode: OpenMode,
    /// Events per chunk along the event dimension.
    pub chunk_events: usize,
    /// Also cut a chunk once its records span this much time.
    pub chunk_span: Option<Duration>,
    /// Blosc/Zstd level, 0 disables compression.
    pub compression_level: u8,
    pub blosc_threads: u8,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            mode: OpenMode::Create,
            chunk_events: 64,
            chunk_span: None,
            compression_level: 2,
            blosc_threads: 5,
        }
    }
}

/// In-memory copy of the chunk being filled.
struct ChunkBuffer {
    count: usize,
    event_id: Vec<u64>,
    timestamp: Vec<i64>,
    trigger_counter: Vec<u64>,
    device_time: Vec<u64>,
    host_time: Vec<i64>,
    stop_cell: Vec<u16>,
    drift_flag: Vec<u8>,
    time: Array3<f32>,
    amplitude: Array3<f32>,
}

impl ChunkBuffer {
    fn new(capacity: usize, n_channels: usize, n_samples: usize) -> Self {
        Self {
            count: 0,
            event_id: Vec::with_capacity(capacity),
            timestamp: Vec::with_capacity(capacity),
            trigger_counter: Vec::with_capacity(capacity),
            device_time: Vec::with_capacity(capacity),
            host_time: Vec::with_capacity(capacity),
            stop_cell: Vec::with_capacity(capacity),
            drift_flag: Vec::with_capacity(capacity),
            time: Array3::zeros((capacity, n_channels, n_samples)),
            amplitude: Array3::zeros((capacity, n_channels, n_samples)),
        }
    }

    fn push(&mut self, synced: &SyncedRecord) {
        let record = &synced.record;
        self.event_id.push(record.event_id);
        self.timestamp.push(synced.timestamp_ns);
        self.trigger_counter.push(record.trigger_counter);
        self.device_time.push(record.device_time_ns);
        self.host_time.push(record.host_time_ns);
        self.stop_cell.push(record.stop_cell);
        self.drift_flag.push(synced.drift as u8);
        self.time
            .slice_mut(s![self.count, .., ..])
            .assign(&record.time_ns);
        self.amplitude
            .slice_mut(s![self.count, .., ..])
            .assign(&record.amplitude_mv);
        self.count += 1;
    }

    /// Time covered so far. Out-of-order records can carry a timestamp
    /// before the first one; they never count as negative span.
    fn span_ns(&self) -> u64 {
        match (self.timestamp.first(), self.timestamp.last()) {
            (Some(first), Some(last)) => last.saturating_sub(*first).max(0) as u64,
            _ => 0,
        }
    }

    fn clear(&mut self) {
        self.count = 0;
        self.event_id.clear();
        self.timestamp.clear();
        self.trigger_counter.clear();
        self.device_time.clear();
        self.host_time.clear();
        self.stop_cell.clear();
        self.drift_flag.clear();
    }
}

struct EventDatasets {
    session: Dataset,
    event_id: Dataset,
    timestamp: Dataset,
    trigger_counter: Dataset,
    device_time: Dataset,
    host_time: Dataset,
    stop_cell: Dataset,
    drift_flag: Dataset,
    time: Dataset,
    amplitude: Dataset,
}

impl EventDatasets {
    fn create(
        file: &File,
        options: &WriterOptions,
        n_channels: usize,
        n_samples: usize,
    ) -> hdf5::Result<Self> {
        let chunk = options.chunk_events;
        let level = options.compression_level;
        Ok(Self {
            session: per_event::<u32>(file, "session", chunk, level)?,
            event_id: per_event::<u64>(file, "event_id", chunk, level)?,
            timestamp: per_event::<i64>(file, "timestamp", chunk, level)?,
            trigger_counter: per_event::<u64>(file, "trigger_counter", chunk, level)?,
            device_time: per_event::<u64>(file, "device_time", chunk, level)?,
            host_time: per_event::<i64>(file, "host_time", chunk, level)?,
            stop_cell: per_event::<u16>(file, "stop_cell", chunk, level)?,
            drift_flag: per_event::<u8>(file, "drift_flag", chunk, level)?,
            time: per_sample(file, "time", chunk, level, n_channels, n_samples)?,
            amplitude: per_sample(file, "amplitude", chunk, level, n_channels, n_samples)?,
        })
    }

    fn open(file: &File) -> hdf5::Result<Self> {
        Ok(Self {
            session: file.dataset("session")?,
            event_id: file.dataset("event_id")?,
            timestamp: file.dataset("timestamp")?,
            trigger_counter: file.dataset("trigger_counter")?,
            device_time: file.dataset("device_time")?,
            host_time: file.dataset("host_time")?,
            stop_cell: file.dataset("stop_cell")?,
            drift_flag: file.dataset("drift_flag")?,
            time: file.dataset("time")?,
            amplitude: file.dataset("amplitude")?,
        })
    }

    /// Cut every dataset back to `len` events.
    fn truncate(&self, len: usize, n_channels: usize, n_samples: usize) -> hdf5::Result<()> {
        for ds in [
            &self.session,
            &self.event_id,
            &self.timestamp,
            &self.trigger_counter,
            &self.device_time,
            &self.host_time,
            &self.stop_cell,
            &self.drift_flag,
        ] {
            ds.resize((len,))?;
        }
        self.time.resize((len, n_channels, n_samples))?;
        self.amplitude.resize((len, n_channels, n_samples))?;
        Ok(())
    }
}

/// Appends synchronized records to an HDF5 file, one chunk at a time.
///
/// Records are held in memory until the chunk is full (or spans
/// `chunk_span`), then written in one piece. The `committed_events` root
/// attribute is advanced only after the chunk is on disk. Dropping a
/// writer without [`close`](Self::close) loses the partial chunk, like a
/// crash would.
///
/// Event ids restart with every session. Appending sessions are told
/// apart by the `session` column, an index into the `sessions` list of
/// obsids; the root attributes describe the session that created the
/// file.
pub struct DatasetWriter {
    file: File,
    path: PathBuf,
    options: WriterOptions,
    channels: Vec<u8>,
    n_samples: usize,
    datasets: EventDatasets,
    buffer: ChunkBuffer,
    session: u32,
    committed: usize,
    chunks_written: u64,
    closed: bool,
}

impl DatasetWriter {
    pub fn open<P: AsRef<Path>>(
        path: P,
        metadata: &SessionMetadata,
        options: WriterOptions,
    ) -> Result<Self, WriteError> {
        let path = path.as_ref().to_path_buf();
        let options = WriterOptions {
            chunk_events: options.chunk_events.max(1),
            ..options
        };
        let n_channels = metadata.channels.len();
        let n_samples = metadata.sample_depth;

        if options.compression_level > 0 {
            hdf5::filters::blosc_set_nthreads(options.blosc_threads.max(1));
        }

        let exists = path.exists();
        let (file, datasets, session, committed) = match options.mode {
            OpenMode::Create if exists => return Err(WriteError::Exists(path)),
            OpenMode::Append if exists => {
                let file = File::append(&path)?;
                check_compatible(&file, metadata)?;
                let committed = file.attr(COMMITTED_EVENTS)?.read_scalar::<u64>()? as usize;
                let datasets = EventDatasets::open(&file)?;
                // drop anything written past the last commit
                datasets.truncate(committed, n_channels, n_samples)?;
                let sessions = file.dataset(SESSIONS)?;
                let session = sessions.size();
                append_slice(&sessions, session, &[obsid(metadata)?])?;
                file.flush()?;
                info!(
                    "Appending session {} to {} after {} committed events",
                    session,
                    path.display(),
                    committed
                );
                (file, datasets, session as u32, committed)
            }
            _ => {
                let file = File::create(&path)?;
                write_metadata(&file, metadata)?;
                let channel = Array1::from(metadata.channels.clone());
                file.new_dataset_builder()
                    .with_data(&channel)
                    .create("channel")?;
                let datasets = EventDatasets::create(&file, &options, n_channels, n_samples)?;
                let sessions = per_event::<VarLenUnicode>(&file, SESSIONS, 16, 0)?;
                append_slice(&sessions, 0, &[obsid(metadata)?])?;
                file.flush()?;
                info!("Created {}", path.display());
                (file, datasets, 0, 0)
            }
        };

        Ok(Self {
            file,
            path,
            buffer: ChunkBuffer::new(options.chunk_events, n_channels, n_samples),
            options,
            channels: metadata.channels.clone(),
            n_samples,
            datasets,
            session,
            committed,
            chunks_written: 0,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Events durably on disk.
    pub fn records_written(&self) -> usize {
        self.committed
    }

    /// Events held in memory waiting for the chunk to fill.
    pub fn pending(&self) -> usize {
        self.buffer.count
    }

    /// Chunks written by this writer.
    pub fn chunks_written(&self) -> u64 {
        self.chunks_written
    }

    pub fn append(&mut self, synced: &SyncedRecord) -> Result<(), WriteError> {
        if self.closed {
            return Err(WriteError::Closed);
        }
        let record = &synced.record;
        if record.channels != self.channels
            || record.amplitude_mv.dim() != (self.channels.len(), self.n_samples)
            || record.time_ns.dim() != (self.channels.len(), self.n_samples)
        {
            return Err(WriteError::Shape {
                event_id: record.event_id,
                expected: (self.channels.clone(), self.n_samples),
                found: (record.channels.clone(), record.n_samples()),
            });
        }

        self.buffer.push(synced);
        let spanned = self
            .options
            .chunk_span
            .is_some_and(|span| self.buffer.span_ns() as u128 >= span.as_nanos());
        if self.buffer.count == self.options.chunk_events || spanned {
            self.write_chunk()?;
        }
        Ok(())
    }

    /// Write the partial chunk, if any, and flush the file.
    pub fn flush(&mut self) -> Result<(), WriteError> {
        if self.closed {
            return Err(WriteError::Closed);
        }
        self.write_chunk()?;
        self.file.flush()?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), WriteError> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.closed = true;
        info!(
            "Closed {} with {} events in {} chunks",
            self.path.display(),
            self.committed,
            self.chunks_written
        );
        Ok(())
    }

    fn write_chunk(&mut self) -> Result<(), WriteError> {
        let count = self.buffer.count;
        if count == 0 {
            return Ok(());
        }
        let start = self.committed;
        let end = start + count;
        let (n_channels, n_samples) = (self.channels.len(), self.n_samples);
        let ds = &self.datasets;
        let buf = &self.buffer;

        append_slice(&ds.session, start, &vec![self.session; count])?;
        append_slice(&ds.event_id, start, &buf.event_id)?;
        append_slice(&ds.timestamp, start, &buf.timestamp)?;
        append_slice(&ds.trigger_counter, start, &buf.trigger_counter)?;
        append_slice(&ds.device_time, start, &buf.device_time)?;
        append_slice(&ds.host_time, start, &buf.host_time)?;
        append_slice(&ds.stop_cell, start, &buf.stop_cell)?;
        append_slice(&ds.drift_flag, start, &buf.drift_flag)?;

        ds.time.resize((end, n_channels, n_samples))?;
        ds.time
            .write_slice(buf.time.slice(s![0..count, .., ..]), s![start..end, .., ..])?;
        ds.amplitude.resize((end, n_channels, n_samples))?;
        ds.amplitude.write_slice(
            buf.amplitude.slice(s![0..count, .., ..]),
            s![start..end, .., ..],
        )?;

        self.file
            .attr(COMMITTED_EVENTS)?
            .write_scalar(&(end as u64))?;
        self.file.flush()?;

        self.committed = end;
        self.chunks_written += 1;
        self.buffer.clear();
        debug!("Committed events {}..{}", start, end);
        Ok(())
    }
}

fn per_event<T: H5Type>(file: &File, name: &str, chunk: usize, level: u8) -> hdf5::Result<Dataset> {
    let mut builder = file.new_dataset::<T>().shape((0..,)).chunk((chunk,));
    if level > 0 {
        builder = builder.blosc_zstd(level, true);
    }
    builder.create(name)
}

fn per_sample(
    file: &File,
    name: &str,
    chunk: usize,
    level: u8,
    n_channels: usize,
    n_samples: usize,
) -> hdf5::Result<Dataset> {
    let mut builder = file
        .new_dataset::<f32>()
        .shape((0.., n_channels, n_samples))
        .chunk((chunk, n_channels, n_samples));
    if level > 0 {
        builder = builder.blosc_zstd(level, true);
    }
    builder.create(name)
}

fn append_slice<T: H5Type>(dataset: &Dataset, offset: usize, data: &[T]) -> hdf5::Result<()> {
    let end = offset + data.len();
    dataset.resize((end,))?;
    dataset.write_slice(ArrayView1::from(data), s![offset..end])
}

fn obsid(metadata: &SessionMetadata) -> Result<VarLenUnicode, WriteError> {
    VarLenUnicode::from_str(&metadata.obsid)
        .map_err(|e| WriteError::Metadata(format!("obsid: {e}")))
}

fn set_attr_str(file: &File, name: &str, value: &str) -> Result<(), WriteError> {
    let value =
        VarLenUnicode::from_str(value).map_err(|e| WriteError::Metadata(format!("{name}: {e}")))?;
    file.new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn set_attr<T: H5Type>(file: &File, name: &str, value: &T) -> Result<(), WriteError> {
    file.new_attr::<T>().create(name)?.write_scalar(value)?;
    Ok(())
}

fn write_metadata(file: &File, metadata: &SessionMetadata) -> Result<(), WriteError> {
    let start = metadata
        .start
        .format(&Rfc3339)
        .map_err(|e| WriteError::Metadata(format!("start: {e}")))?;

    set_attr(file, "format_version", &FORMAT_VERSION)?;
    set_attr_str(file, "obsid", &metadata.obsid)?;
    set_attr_str(file, "start", &start)?;
    set_attr_str(file, "device_id", &metadata.device_id)?;
    set_attr_str(file, "calibration_id", &metadata.calibration_id)?;
    set_attr(file, "calibration_version", &metadata.calibration_version)?;
    set_attr(file, "sample_depth", &(metadata.sample_depth as u64))?;
    set_attr_str(file, "trigger_mode", &metadata.trigger_mode.to_string())?;
    set_attr(file, "trigger_interval_ns", &metadata.trigger_interval_ns)?;
    set_attr(file, COMMITTED_EVENTS, &0u64)?;
    Ok(())
}

fn check_compatible(file: &File, metadata: &SessionMetadata) -> Result<(), WriteError> {
    let version = file.attr("format_version")?.read_scalar::<u32>()?;
    if version != FORMAT_VERSION {
        return Err(WriteError::Incompatible(format!(
            "format version {version}, writer has {FORMAT_VERSION}"
        )));
    }
    let existing = read_metadata(file).map_err(|e| WriteError::Incompatible(e.to_string()))?;
    let mismatch = if existing.channels != metadata.channels {
        Some(format!(
            "channels {:?}, session has {:?}",
            existing.channels, metadata.channels
        ))
    } else if existing.sample_depth != metadata.sample_depth {
        Some(format!(
            "sample depth {}, session has {}",
            existing.sample_depth, metadata.sample_depth
        ))
    } else if (existing.calibration_id.as_str(), existing.calibration_version)
        != (metadata.calibration_id.as_str(), metadata.calibration_version)
    {
        Some(format!(
            "calibration {} v{}, session has {} v{}",
            existing.calibration_id,
            existing.calibration_version,
            metadata.calibration_id,
            metadata.calibration_version
        ))
    } else {
        None
    };
    match mismatch {
        Some(message) => Err(WriteError::Incompatible(message)),
        None => Ok(()),
    }
}
