use log::LevelFilter;
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::{
    collections::VecDeque,
    fs::OpenOptions,
    io,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use time::{macros::format_description, OffsetDateTime};

/// Tracks records and bytes, both since the start and over a sliding
/// one second window.
#[derive(Debug, Clone)]
pub struct Counter {
    pub total_bytes: usize,
    pub n_events: usize,
    pub t_begin: Instant,

    window: Duration,
    events: VecDeque<(Instant, usize)>,
    bytes_in_window: usize,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            total_bytes: 0,
            n_events: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            events: VecDeque::new(),
            bytes_in_window: 0,
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Average rate since `t_begin`, in MB/s.
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        (self.total_bytes as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Rate over the last window, in MB/s.
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        (self.bytes_in_window as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Events per second over the last window.
    pub fn event_rate(&self) -> f64 {
        self.events.len() as f64 / self.window.as_secs_f64().max(1e-6)
    }

    pub fn increment(&mut self, size: usize) {
        self.increment_at(Instant::now(), size);
    }

    fn increment_at(&mut self, now: Instant, size: usize) {
        self.total_bytes += size;
        self.n_events += 1;

        self.events.push_back((now, size));
        self.bytes_in_window += size;

        while let Some(&(ts, sz)) = self.events.front() {
            if now.duration_since(ts) > self.window {
                self.events.pop_front();
                self.bytes_in_window -= sz;
            } else {
                break;
            }
        }
    }
}

/// Host wall-clock time, ns since the Unix epoch.
pub fn now_ns() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as i64
}

/// Observation id: the UTC start time as `YYYYmmddTHHMMSSZ`.
pub fn obsid(at: OffsetDateTime) -> Result<String, time::error::Format> {
    at.to_offset(time::UtcOffset::UTC)
        .format(format_description!("[year][month][day]T[hour][minute][second]Z"))
}

/// `<dir>/drs4-<obsid>.h5`
pub fn output_path<P: AsRef<Path>>(dir: P, obsid: &str) -> PathBuf {
    dir.as_ref().join(format!("drs4-{obsid}.h5"))
}

/// Log to `file` (appending) and, when `stderr` is set, to the terminal.
pub fn set_logger<P: AsRef<Path>>(file: P, level: LevelFilter, stderr: bool) -> io::Result<()> {
    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_thread_level(LevelFilter::Debug)
        .build();
    let file = OpenOptions::new().create(true).append(true).open(file)?;

    let mut loggers: Vec<Box<dyn SharedLogger>> =
        vec![WriteLogger::new(level, config.clone(), file)];
    if stderr {
        loggers.push(TermLogger::new(
            level,
            config,
            TerminalMode::Stderr,
            ColorChoice::Auto,
        ));
    }
    CombinedLogger::init(loggers).map_err(io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn window_forgets_old_events() {
        let mut counter = Counter::new();
        let t0 = Instant::now();
        counter.increment_at(t0, 1024);
        counter.increment_at(t0 + Duration::from_millis(500), 1024);
        assert_eq!(counter.bytes_in_window, 2048);
        counter.increment_at(t0 + Duration::from_millis(1600), 512);
        assert_eq!(counter.bytes_in_window, 512);
        assert_eq!(counter.total_bytes, 2560);
        assert_eq!(counter.n_events, 3);
        assert_eq!(counter.event_rate(), 1.0);
        assert!(counter.average_rate() > 0.0);
    }

    #[test]
    fn obsid_is_utc_compact() {
        let at = datetime!(2026-03-04 05:06:07 +02:00);
        assert_eq!(obsid(at).unwrap(), "20260304T030607Z");
        assert_eq!(
            output_path("/data", "20260304T030607Z"),
            PathBuf::from("/data/drs4-20260304T030607Z.h5")
        );
    }
}
