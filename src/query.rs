use crate::{
    DriftFlag, QueryError, SessionMetadata, SyncedRecord, WaveformRecord, COMMITTED_EVENTS,
    SESSIONS,
};
use hdf5::{types::VarLenUnicode, Dataset, File, H5Type};
use ndarray::{s, Array1, Array3, Axis, Ix3};
use std::{collections::VecDeque, ops::Range, path::Path};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Half-open interval of synchronized timestamps, ns since epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start_ns: i64,
    pub end_ns: i64,
}

impl TimeRange {
    pub fn new(start_ns: i64, end_ns: i64) -> Self {
        Self { start_ns, end_ns }
    }

    pub fn all() -> Self {
        Self::new(i64::MIN, i64::MAX)
    }

    pub fn between(start: OffsetDateTime, end: OffsetDateTime) -> Self {
        let ns = |t: OffsetDateTime| {
            t.unix_timestamp_nanos()
                .clamp(i64::MIN as i128, i64::MAX as i128) as i64
        };
        Self::new(ns(start), ns(end))
    }

    pub fn contains(&self, timestamp_ns: i64) -> bool {
        if self.end_ns == i64::MAX {
            return timestamp_ns >= self.start_ns;
        }
        (self.start_ns..self.end_ns).contains(&timestamp_ns)
    }
}

/// Committed events written by one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSpan {
    pub obsid: String,
    /// Positions in the file, not event ids.
    pub events: Range<usize>,
}

/// Read-only view of a dataset written by [`DatasetWriter`](crate::DatasetWriter).
///
/// Only the events counted by `committed_events` at open time are
/// visible.
pub struct DatasetReader {
    file: File,
    metadata: SessionMetadata,
    sessions: Vec<SessionSpan>,
    committed: usize,
    chunk_events: usize,
}

impl DatasetReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, QueryError> {
        let file = File::open(path)?;
        let metadata = read_metadata(&file)?;
        let committed = file.attr(COMMITTED_EVENTS)?.read_scalar::<u64>()? as usize;
        let chunk_events = file
            .dataset("amplitude")?
            .chunk()
            .and_then(|chunk| chunk.first().copied())
            .unwrap_or(64)
            .max(1);
        let sessions = read_sessions(&file, committed)?;
        Ok(Self {
            file,
            metadata,
            sessions,
            committed,
            chunk_events,
        })
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    /// Sessions with committed events, in file order.
    pub fn sessions(&self) -> &[SessionSpan] {
        &self.sessions
    }

    pub fn len(&self) -> usize {
        self.committed
    }

    pub fn is_empty(&self) -> bool {
        self.committed == 0
    }

    /// Records with a timestamp inside `range`, restricted to `channels`
    /// (all stored channels when empty), read one chunk at a time.
    pub fn select(&self, range: TimeRange, channels: &[u8]) -> Result<Selection<'_>, QueryError> {
        let stored = &self.metadata.channels;
        let wanted = if channels.is_empty() {
            stored.clone()
        } else {
            channels.to_vec()
        };
        let columns = wanted
            .iter()
            .map(|ch| {
                stored
                    .iter()
                    .position(|s| s == ch)
                    .ok_or(QueryError::UnknownChannel(*ch))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Selection {
            reader: self,
            range,
            channels: wanted,
            columns,
            next_event: 0,
            ready: VecDeque::new(),
        })
    }
}

/// Lazy iterator returned by [`DatasetReader::select`].
pub struct Selection<'a> {
    reader: &'a DatasetReader,
    range: TimeRange,
    channels: Vec<u8>,
    columns: Vec<usize>,
    next_event: usize,
    ready: VecDeque<SyncedRecord>,
}

impl Selection<'_> {
    fn read_chunk(&mut self, start: usize, end: usize) -> Result<(), QueryError> {
        let file = &self.reader.file;
        let timestamps = read_range::<i64>(&file.dataset("timestamp")?, start, end)?;
        let hits: Vec<usize> = timestamps
            .iter()
            .enumerate()
            .filter(|(_, ts)| self.range.contains(**ts))
            .map(|(i, _)| i)
            .collect();
        if hits.is_empty() {
            return Ok(());
        }

        let event_id = read_range::<u64>(&file.dataset("event_id")?, start, end)?;
        let trigger_counter = read_range::<u64>(&file.dataset("trigger_counter")?, start, end)?;
        let device_time = read_range::<u64>(&file.dataset("device_time")?, start, end)?;
        let host_time = read_range::<i64>(&file.dataset("host_time")?, start, end)?;
        let stop_cell = read_range::<u16>(&file.dataset("stop_cell")?, start, end)?;
        let drift_flag = read_range::<u8>(&file.dataset("drift_flag")?, start, end)?;
        let time = self.read_samples(&file.dataset("time")?, start, end)?;
        let amplitude = self.read_samples(&file.dataset("amplitude")?, start, end)?;

        for i in hits {
            let drift = DriftFlag::from_u8(drift_flag[i]).ok_or_else(|| {
                QueryError::Metadata(format!("event {}: drift flag {}", event_id[i], drift_flag[i]))
            })?;
            self.ready.push_back(SyncedRecord {
                record: WaveformRecord {
                    event_id: event_id[i],
                    trigger_counter: trigger_counter[i],
                    device_time_ns: device_time[i],
                    host_time_ns: host_time[i],
                    stop_cell: stop_cell[i],
                    channels: self.channels.clone(),
                    time_ns: time.index_axis(Axis(0), i).to_owned(),
                    amplitude_mv: amplitude.index_axis(Axis(0), i).to_owned(),
                },
                timestamp_ns: timestamps[i],
                drift,
            });
        }
        Ok(())
    }

    fn read_samples(&self, ds: &Dataset, start: usize, end: usize) -> Result<Array3<f32>, QueryError> {
        let block = ds.read_slice::<f32, _, Ix3>(s![start..end, .., ..])?;
        Ok(block.select(Axis(1), &self.columns))
    }
}

impl Iterator for Selection<'_> {
    type Item = Result<SyncedRecord, QueryError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.ready.pop_front() {
                return Some(Ok(record));
            }
            let committed = self.reader.committed;
            if self.next_event >= committed {
                return None;
            }
            let start = self.next_event;
            let end = (start + self.reader.chunk_events).min(committed);
            self.next_event = end;
            if let Err(e) = self.read_chunk(start, end) {
                self.next_event = committed;
                return Some(Err(e));
            }
        }
    }
}

fn read_range<T: H5Type>(ds: &Dataset, start: usize, end: usize) -> Result<Array1<T>, QueryError> {
    Ok(ds.read_slice_1d::<T, _>(s![start..end])?)
}

/// Group the `session` column into runs and name each by its obsid.
fn read_sessions(file: &File, committed: usize) -> Result<Vec<SessionSpan>, QueryError> {
    if committed == 0 {
        return Ok(Vec::new());
    }
    let obsids = file.dataset(SESSIONS)?.read_raw::<VarLenUnicode>()?;
    let column = read_range::<u32>(&file.dataset("session")?, 0, committed)?;

    let mut spans: Vec<SessionSpan> = Vec::new();
    let mut current = None;
    for (i, &session) in column.iter().enumerate() {
        if current == Some(session) {
            if let Some(span) = spans.last_mut() {
                span.events.end = i + 1;
            }
            continue;
        }
        let obsid = obsids
            .get(session as usize)
            .ok_or_else(|| QueryError::Metadata(format!("event {i}: unknown session {session}")))?;
        spans.push(SessionSpan {
            obsid: obsid.as_str().to_string(),
            events: i..i + 1,
        });
        current = Some(session);
    }
    Ok(spans)
}

fn read_attr_str(file: &File, name: &str) -> Result<String, QueryError> {
    let value: VarLenUnicode = file.attr(name)?.read_scalar()?;
    Ok(value.as_str().to_string())
}

/// Session metadata stored as root attributes plus the `channel`
/// coordinate.
pub(crate) fn read_metadata(file: &File) -> Result<SessionMetadata, QueryError> {
    let start = read_attr_str(file, "start")?;
    let start = OffsetDateTime::parse(&start, &Rfc3339)
        .map_err(|e| QueryError::Metadata(format!("start {start:?}: {e}")))?;
    let trigger_mode = read_attr_str(file, "trigger_mode")?
        .parse()
        .map_err(QueryError::Metadata)?;

    Ok(SessionMetadata {
        obsid: read_attr_str(file, "obsid")?,
        start,
        device_id: read_attr_str(file, "device_id")?,
        calibration_id: read_attr_str(file, "calibration_id")?,
        calibration_version: file.attr("calibration_version")?.read_scalar()?,
        channels: file.dataset("channel")?.read_raw::<u8>()?,
        sample_depth: file.attr("sample_depth")?.read_scalar::<u64>()? as usize,
        trigger_mode,
        trigger_interval_ns: file.attr("trigger_interval_ns")?.read_scalar()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        writer::tests::{metadata, synced},
        DatasetWriter, OpenMode, WriterOptions,
    };
    use tempfile::{tempdir, TempDir};

    fn written(n: u64) -> (TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("query.h5");
        let options = WriterOptions {
            mode: OpenMode::Create,
            chunk_events: 8,
            compression_level: 0,
            ..Default::default()
        };
        let mut writer =
            DatasetWriter::open(&path, &metadata(vec![0, 4, 6], 32), options).unwrap();
        for id in 0..n {
            writer.append(&synced(id, &[0, 4, 6], 32)).unwrap();
        }
        writer.close().unwrap();
        (dir, path)
    }

    #[test]
    fn reads_back_session_metadata() {
        let (_dir, path) = written(3);
        let reader = DatasetReader::open(&path).unwrap();
        assert_eq!(reader.metadata(), &metadata(vec![0, 4, 6], 32));
        assert_eq!(reader.len(), 3);
        assert_eq!(
            reader.sessions(),
            &[SessionSpan {
                obsid: "20260101T000000Z".to_string(),
                events: 0..3,
            }]
        );
    }

    #[test]
    fn reader_sees_only_committed_chunks_of_a_live_writer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("live.h5");
        let options = WriterOptions {
            mode: OpenMode::Create,
            chunk_events: 8,
            compression_level: 0,
            ..Default::default()
        };
        let mut writer = DatasetWriter::open(&path, &metadata(vec![0, 4], 16), options).unwrap();
        for id in 0..13 {
            writer.append(&synced(id, &[0, 4], 16)).unwrap();
        }
        assert_eq!(writer.pending(), 5);

        let reader = DatasetReader::open(&path).unwrap();
        assert_eq!(reader.len(), 8);
        let ids: Vec<_> = reader
            .select(TimeRange::all(), &[])
            .unwrap()
            .map(|r| r.unwrap().record.event_id)
            .collect();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());
        drop(reader);

        writer.close().unwrap();
        assert_eq!(DatasetReader::open(&path).unwrap().len(), 13);
    }

    #[test]
    fn selects_time_window_and_channels() {
        let (_dir, path) = written(30);
        let reader = DatasetReader::open(&path).unwrap();
        // timestamps are id * 1000 ns
        let records: Vec<_> = reader
            .select(TimeRange::new(5_000, 21_000), &[6, 0])
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        let ids: Vec<_> = records.iter().map(|r| r.record.event_id).collect();
        assert_eq!(ids, (5..21).collect::<Vec<_>>());

        let full = synced(7, &[0, 4, 6], 32).record;
        let seven = &records[2].record;
        assert_eq!(seven.channels, vec![6, 0]);
        assert_eq!(seven.amplitude_mv.row(0), full.amplitude_mv.row(2));
        assert_eq!(seven.amplitude_mv.row(1), full.amplitude_mv.row(0));
    }

    #[test]
    fn selection_is_restartable() {
        let (_dir, path) = written(20);
        let reader = DatasetReader::open(&path).unwrap();
        let first: Vec<_> = reader
            .select(TimeRange::all(), &[])
            .unwrap()
            .map(|r| r.unwrap().timestamp_ns)
            .collect();
        let second: Vec<_> = reader
            .select(TimeRange::all(), &[])
            .unwrap()
            .map(|r| r.unwrap().timestamp_ns)
            .collect();
        assert_eq!(first.len(), 20);
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_channel_is_an_error() {
        let (_dir, path) = written(1);
        let reader = DatasetReader::open(&path).unwrap();
        assert!(matches!(
            reader.select(TimeRange::all(), &[0, 5]),
            Err(QueryError::UnknownChannel(5))
        ));
    }

    #[test]
    fn time_range_from_datetimes() {
        use time::macros::datetime;
        let range = TimeRange::between(
            datetime!(1970-01-01 00:00:01 UTC),
            datetime!(1970-01-01 00:00:02 UTC),
        );
        assert_eq!(range, TimeRange::new(1_000_000_000, 2_000_000_000));
        assert!(range.contains(1_000_000_000));
        assert!(!range.contains(2_000_000_000));
        assert!(TimeRange::all().contains(i64::MAX));
    }
}
