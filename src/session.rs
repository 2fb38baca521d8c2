use crate::{
    obsid, output_path, AcquisitionBuffer, BackpressurePolicy, BufferStats, CalibrationTable,
    Counter, DatasetWriter, Decoder, Digitizer, Instrument, LinkConfig, LinkError, Pop,
    PushOutcome, RetryPolicy, SessionError, SessionMetadata, SyncSettings, SyncStats,
    SyncedRecord, Synchronizer, WriteError, WriterOptions,
};
use crossbeam_channel::{bounded, select, tick, unbounded, Sender};
use log::{debug, error, info, warn};
use std::{
    fmt, fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use time::OffsetDateTime;

/// How long the writer thread waits on an empty buffer before checking
/// again.
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Everything one acquisition run needs besides the backend and the
/// calibration table.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub link: LinkConfig,
    pub retry: RetryPolicy,
    pub sync: SyncSettings,
    pub buffer_capacity: usize,
    pub policy: BackpressurePolicy,
    pub writer: WriterOptions,
    pub output_dir: PathBuf,
    /// Overrides the `drs4-<obsid>.h5` name in `output_dir`.
    pub output_file: Option<PathBuf>,
    pub read_timeout: Duration,
    pub run_duration: Option<Duration>,
    pub max_frames: Option<u64>,
    pub progress_interval: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopReason {
    /// The shutdown flag was raised from outside.
    #[default]
    Shutdown,
    RunDuration,
    FrameLimit,
    /// The board ended the acquisition.
    DeviceStopped,
    Fatal,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            StopReason::Shutdown => "shutdown requested",
            StopReason::RunDuration => "run duration elapsed",
            StopReason::FrameLimit => "frame limit reached",
            StopReason::DeviceStopped => "stopped by device",
            StopReason::Fatal => "fatal error",
        };
        f.write_str(reason)
    }
}

/// What happened during one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSummary {
    pub obsid: String,
    pub output: PathBuf,
    pub frames_received: u64,
    pub records_decoded: u64,
    pub malformed: u64,
    pub timeouts: u64,
    pub buffer: BufferStats,
    pub sync: SyncStats,
    pub records_written: u64,
    pub chunks_written: u64,
    pub stop: StopReason,
    pub fatal: Option<String>,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Session {} ({})", self.obsid, self.stop)?;
        writeln!(f, "  output:          {}", self.output.display())?;
        writeln!(f, "  frames received: {}", self.frames_received)?;
        writeln!(f, "  records decoded: {}", self.records_decoded)?;
        writeln!(f, "  malformed:       {}", self.malformed)?;
        writeln!(f, "  read timeouts:   {}", self.timeouts)?;
        for (reason, n) in self.buffer.by_reason() {
            if n > 0 {
                writeln!(f, "  dropped ({reason}): {n}")?;
            }
        }
        writeln!(f, "  buffer peak:     {}", self.buffer.high_water)?;
        writeln!(f, "  re-anchors:      {}", self.sync.re_anchors)?;
        writeln!(f, "  out of order:    {}", self.sync.out_of_order)?;
        writeln!(f, "  max drift:       {} ns", self.sync.max_drift_ns)?;
        writeln!(f, "  records written: {}", self.records_written)?;
        write!(f, "  chunks written:  {}", self.chunks_written)?;
        if let Some(fatal) = &self.fatal {
            write!(f, "\n  fatal:           {fatal}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ProducerReport {
    frames: u64,
    decoded: u64,
    malformed: u64,
    timeouts: u64,
    sync: SyncStats,
    stop: StopReason,
    fatal: Option<LinkError>,
}

#[derive(Debug, Default)]
struct ConsumerReport {
    records_written: u64,
    chunks_written: u64,
    fatal: Option<WriteError>,
}

/// One acquisition run: link → decoder → synchronizer → buffer → writer.
pub struct Session {
    settings: SessionSettings,
    decoder: Decoder,
}

impl Session {
    /// Fails if the link configuration is invalid or the table cannot
    /// calibrate it.
    pub fn new(
        settings: SessionSettings,
        calibration: Arc<CalibrationTable>,
    ) -> Result<Self, SessionError> {
        settings.link.validate()?;
        let decoder = Decoder::new(settings.link, calibration)?;
        Ok(Self { settings, decoder })
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Run until `shutdown` is raised, the run duration or frame limit is
    /// reached, the board stops, or a fatal error occurs.
    ///
    /// Errors are returned only when the run cannot start. Faults after
    /// that end the run and are reported in the summary.
    pub fn run<D: Digitizer + 'static>(
        &self,
        backend: D,
        shutdown: Arc<AtomicBool>,
    ) -> Result<SessionSummary, SessionError> {
        let settings = &self.settings;
        let start = OffsetDateTime::now_utc();
        let obsid = obsid(start).map_err(|e| WriteError::Metadata(e.to_string()))?;

        let mut link = Instrument::open(backend, settings.link, settings.retry)?;
        let calibration = self.decoder.calibration();
        let metadata = SessionMetadata {
            obsid: obsid.clone(),
            start,
            device_id: link.identity().to_string(),
            calibration_id: calibration.id().to_string(),
            calibration_version: calibration.version(),
            channels: settings.link.channel_mask.channels(),
            sample_depth: settings.link.sample_depth,
            trigger_mode: settings.link.trigger_mode,
            trigger_interval_ns: settings.sync.trigger_interval.as_nanos() as u64,
        };
        let output = match &settings.output_file {
            Some(file) => file.clone(),
            None => {
                fs::create_dir_all(&settings.output_dir)?;
                output_path(&settings.output_dir, &obsid)
            }
        };

        let buffer = Arc::new(AcquisitionBuffer::new(
            settings.buffer_capacity,
            settings.policy,
        ));

        // The writer lives on its own thread; wait for it to open the file
        // before arming.
        let (tx_ready, rx_ready) = bounded(1);
        let consumer = {
            let buffer = Arc::clone(&buffer);
            let shutdown = Arc::clone(&shutdown);
            let output = output.clone();
            let options = settings.writer;
            thread::Builder::new()
                .name("writer".to_string())
                .spawn(move || {
                    writing_thread(output, metadata, options, buffer, shutdown, tx_ready)
                })?
        };
        let opened = rx_ready
            .recv()
            .unwrap_or_else(|_| Err(WriteError::Metadata("writer thread exited".to_string())));
        if let Err(e) = opened {
            close_link(&mut link);
            join(consumer, "writer")?;
            return Err(e.into());
        }

        if let Err(e) = link.arm() {
            close_link(&mut link);
            buffer.close();
            join(consumer, "writer")?;
            return Err(e.into());
        }
        info!("Session {} writing to {}", obsid, output.display());

        let (tx_stats, rx_stats) = unbounded();
        let producer = {
            let decoder = self.decoder.clone();
            let synchronizer = Synchronizer::new(settings.sync);
            let buffer = Arc::clone(&buffer);
            let shutdown = Arc::clone(&shutdown);
            let read_timeout = settings.read_timeout;
            let max_frames = settings.max_frames;
            thread::Builder::new()
                .name("acquisition".to_string())
                .spawn(move || {
                    data_taking_thread(
                        link,
                        decoder,
                        synchronizer,
                        buffer,
                        shutdown,
                        tx_stats,
                        read_timeout,
                        max_frames,
                    )
                })?
        };

        // Progress until the producer hangs up its stats sender.
        let ticker = tick(settings.progress_interval);
        let t_begin = Instant::now();
        let mut counter = Counter::new();
        let mut timed_out = false;
        loop {
            select! {
                recv(rx_stats) -> msg => match msg {
                    Ok(size) => counter.increment(size),
                    Err(_) => break,
                },
                recv(ticker) -> _ => {
                    info!(
                        "{} events, {:.1} ev/s, {:.2} MB/s ({:.2} MB/s average), buffer {}/{}",
                        counter.n_events,
                        counter.event_rate(),
                        counter.rate(),
                        counter.average_rate(),
                        buffer.len(),
                        buffer.capacity()
                    );
                    if let Some(limit) = settings.run_duration {
                        if !timed_out && t_begin.elapsed() >= limit {
                            info!("Run duration of {:?} reached", limit);
                            timed_out = true;
                            shutdown.store(true, Ordering::SeqCst);
                        }
                    }
                },
            }
        }

        let produced = join(producer, "acquisition")?;
        let consumed = join(consumer, "writer")?;

        let mut fatal = Vec::new();
        if let Some(e) = &produced.fatal {
            fatal.push(e.to_string());
        }
        if let Some(e) = &consumed.fatal {
            fatal.push(e.to_string());
        }
        let stop = if !fatal.is_empty() {
            StopReason::Fatal
        } else if timed_out {
            StopReason::RunDuration
        } else {
            produced.stop
        };

        let summary = SessionSummary {
            obsid,
            output,
            frames_received: produced.frames,
            records_decoded: produced.decoded,
            malformed: produced.malformed,
            timeouts: produced.timeouts,
            buffer: buffer.stats(),
            sync: produced.sync,
            records_written: consumed.records_written,
            chunks_written: consumed.chunks_written,
            stop,
            fatal: (!fatal.is_empty()).then(|| fatal.join("; ")),
        };
        info!("{}", summary);
        Ok(summary)
    }
}

fn join<T>(handle: JoinHandle<T>, name: &'static str) -> Result<T, SessionError> {
    handle.join().map_err(|_| SessionError::Panicked(name))
}

fn close_link<D: Digitizer>(link: &mut Instrument<D>) {
    if let Err(e) = link.close() {
        warn!("Closing link: {}", e);
    }
}

/// Read, decode, synchronize and queue frames until told to stop.
#[allow(clippy::too_many_arguments)]
fn data_taking_thread<D: Digitizer>(
    mut link: Instrument<D>,
    decoder: Decoder,
    mut synchronizer: Synchronizer,
    buffer: Arc<AcquisitionBuffer<SyncedRecord>>,
    shutdown: Arc<AtomicBool>,
    tx_stats: Sender<usize>,
    read_timeout: Duration,
    max_frames: Option<u64>,
) -> ProducerReport {
    let mut report = ProducerReport::default();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            report.stop = StopReason::Shutdown;
            break;
        }
        if max_frames.is_some_and(|n| report.frames >= n) {
            report.stop = StopReason::FrameLimit;
            break;
        }

        let frame = match link.read_frame(read_timeout) {
            Ok(frame) => frame,
            Err(LinkError::Timeout(_)) => {
                report.timeouts += 1;
                continue;
            }
            Err(LinkError::Stopped) => {
                info!("Stop received");
                report.stop = StopReason::DeviceStopped;
                break;
            }
            Err(e) => {
                error!("Acquisition failed: {}", e);
                report.stop = StopReason::Fatal;
                report.fatal = Some(e);
                break;
            }
        };
        report.frames += 1;
        let size = frame.payload.len();

        match decoder.decode(&frame) {
            Ok(record) => {
                report.decoded += 1;
                let synced = synchronizer.synchronize(record);
                if let PushOutcome::Dropped(reason) = buffer.push(synced) {
                    debug!("Buffer full, dropped a record ({})", reason);
                }
            }
            Err(e) => {
                report.malformed += 1;
                warn!("{}", e);
            }
        }
        if tx_stats.send(size).is_err() {
            break;
        }
    }

    close_link(&mut link);
    buffer.close();
    report.sync = synchronizer.stats();
    report
}

/// Drain the buffer into the dataset until it is closed and empty.
fn writing_thread(
    output: PathBuf,
    metadata: SessionMetadata,
    options: WriterOptions,
    buffer: Arc<AcquisitionBuffer<SyncedRecord>>,
    shutdown: Arc<AtomicBool>,
    tx_ready: Sender<Result<(), WriteError>>,
) -> ConsumerReport {
    let mut report = ConsumerReport::default();
    let mut writer = match DatasetWriter::open(&output, &metadata, options) {
        Ok(writer) => {
            let _ = tx_ready.send(Ok(()));
            writer
        }
        Err(e) => {
            let _ = tx_ready.send(Err(e));
            return report;
        }
    };

    let result = loop {
        match buffer.pop_timeout(DRAIN_POLL) {
            Pop::Record(record) => {
                if let Err(e) = writer.append(&record) {
                    break Err(e);
                }
            }
            Pop::Empty => continue,
            Pop::Closed => break writer.close(),
        }
    };

    if let Err(e) = result {
        error!("Writing {} failed: {}", output.display(), e);
        shutdown.store(true, Ordering::SeqCst);
        buffer.close();
        let abandoned = buffer.abandon();
        if abandoned > 0 {
            warn!("Abandoned {} buffered records", abandoned);
        }
        report.fatal = Some(e);
    }
    report.records_written = writer.records_written() as u64;
    report.chunks_written = writer.chunks_written();
    report
}
