use crate::{ChannelMask, LinkError, RawFrame, N_CELLS};
use log::{debug, info, warn};
use serde::Deserialize;
use std::{fmt, str::FromStr, thread, time::Duration};

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    Software,
    External,
    #[serde(rename = "self")]
    SelfTrigger,
}

impl TriggerMode {
    /// Argument of the `TRIG:MODE` control command.
    pub fn scpi_name(self) -> &'static str {
        match self {
            TriggerMode::Software => "SOFT",
            TriggerMode::External => "EXT",
            TriggerMode::SelfTrigger => "SELF",
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerMode::Software => "software",
            TriggerMode::External => "external",
            TriggerMode::SelfTrigger => "self",
        };
        f.write_str(name)
    }
}

impl FromStr for TriggerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "software" => Ok(TriggerMode::Software),
            "external" => Ok(TriggerMode::External),
            "self" => Ok(TriggerMode::SelfTrigger),
            other => Err(format!("unknown trigger mode {other:?}")),
        }
    }
}

/// What the board is asked to acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    pub channel_mask: ChannelMask,
    pub trigger_mode: TriggerMode,
    /// Samples per channel per event.
    pub sample_depth: usize,
}

impl LinkConfig {
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.channel_mask.is_empty() {
            return Err(LinkError::InvalidConfig(
                "no channels enabled".to_string(),
            ));
        }
        if self.sample_depth == 0 || self.sample_depth > N_CELLS {
            return Err(LinkError::InvalidConfig(format!(
                "sample depth {} outside 1..={N_CELLS}",
                self.sample_depth
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Sleep before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_backoff
            .saturating_mul(1u32.checked_shl(retry).unwrap_or(u32::MAX))
            .min(self.max_backoff)
    }
}

/// Bytes read from a backend and the host time they arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub payload: Vec<u8>,
    pub host_time_ns: i64,
}

/// The operations a digitizer backend has to provide.
pub trait Digitizer: Send {
    fn open(&mut self) -> Result<(), LinkError>;
    fn identity(&mut self) -> Result<String, LinkError>;
    fn configure(&mut self, config: &LinkConfig) -> Result<(), LinkError>;
    fn arm(&mut self) -> Result<(), LinkError>;
    fn disarm(&mut self) -> Result<(), LinkError>;
    /// Block up to `timeout` for the next frame.
    fn read_frame(&mut self, timeout: Duration) -> Result<Capture, LinkError>;
    fn close(&mut self) -> Result<(), LinkError>;
}

impl<D: Digitizer + ?Sized> Digitizer for Box<D> {
    fn open(&mut self) -> Result<(), LinkError> {
        (**self).open()
    }

    fn identity(&mut self) -> Result<String, LinkError> {
        (**self).identity()
    }

    fn configure(&mut self, config: &LinkConfig) -> Result<(), LinkError> {
        (**self).configure(config)
    }

    fn arm(&mut self) -> Result<(), LinkError> {
        (**self).arm()
    }

    fn disarm(&mut self) -> Result<(), LinkError> {
        (**self).disarm()
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Capture, LinkError> {
        (**self).read_frame(timeout)
    }

    fn close(&mut self) -> Result<(), LinkError> {
        (**self).close()
    }
}

/// An open, configured connection to one digitizer.
///
/// Wraps a backend with the behaviour every backend shares: validation
/// before the first hardware command, idempotent arm/disarm, arrival
/// sequence numbers, and retries of transient faults.
pub struct Instrument<D: Digitizer> {
    backend: D,
    config: LinkConfig,
    retry: RetryPolicy,
    identity: String,
    armed: bool,
    closed: bool,
    next_sequence: u64,
}

impl<D: Digitizer> Instrument<D> {
    pub fn open(mut backend: D, config: LinkConfig, retry: RetryPolicy) -> Result<Self, LinkError> {
        config.validate()?;

        backend.open().map_err(|e| match e {
            LinkError::Connection(_) => e,
            other => LinkError::Connection(other.to_string()),
        })?;
        let identity = match backend
            .identity()
            .and_then(|identity| backend.configure(&config).map(|_| identity))
        {
            Ok(identity) => identity,
            Err(e) => {
                if let Err(close) = backend.close() {
                    warn!("Closing after failed setup: {}", close);
                }
                return Err(e);
            }
        };
        info!("Connected to {}", identity);
        debug!(
            "Configured channels {:?}, depth {}, trigger {}",
            config.channel_mask.channels(),
            config.sample_depth,
            config.trigger_mode
        );

        Ok(Self {
            backend,
            config,
            retry,
            identity,
            armed: false,
            closed: false,
            next_sequence: 0,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn arm(&mut self) -> Result<(), LinkError> {
        if self.closed {
            return Err(LinkError::Closed);
        }
        if self.armed {
            return Ok(());
        }
        self.with_retry("arm", |b| b.arm())?;
        self.armed = true;
        info!("Acquisition armed");
        Ok(())
    }

    pub fn disarm(&mut self) -> Result<(), LinkError> {
        if self.closed {
            return Err(LinkError::Closed);
        }
        if !self.armed {
            return Ok(());
        }
        self.with_retry("disarm", |b| b.disarm())?;
        self.armed = false;
        info!("Acquisition disarmed");
        Ok(())
    }

    /// Next frame, stamped with the next arrival sequence number.
    ///
    /// Timeouts are returned as is; the caller decides whether to poll
    /// again.
    pub fn read_frame(&mut self, timeout: Duration) -> Result<RawFrame, LinkError> {
        if self.closed {
            return Err(LinkError::Closed);
        }
        let capture = self.with_retry("read", |b| b.read_frame(timeout))?;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Ok(RawFrame {
            sequence,
            host_time_ns: capture.host_time_ns,
            payload: capture.payload,
        })
    }

    /// Disarm if needed and release the backend. Safe to call twice.
    pub fn close(&mut self) -> Result<(), LinkError> {
        if self.closed {
            return Ok(());
        }
        if self.armed {
            if let Err(e) = self.disarm() {
                warn!("Disarm before close failed: {}", e);
            }
        }
        self.closed = true;
        self.backend.close()
    }

    fn with_retry<T>(
        &mut self,
        what: &str,
        mut op: impl FnMut(&mut D) -> Result<T, LinkError>,
    ) -> Result<T, LinkError> {
        let mut retry = 0;
        loop {
            match op(&mut self.backend) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retry < self.retry.max_retries => {
                    let wait = self.retry.backoff(retry);
                    warn!("{} failed ({}), retrying in {:?}", what, e, wait);
                    thread::sleep(wait);
                    retry += 1;
                }
                Err(LinkError::Device {
                    message,
                    transient: true,
                }) => {
                    return Err(LinkError::RetriesExhausted {
                        attempts: retry + 1,
                        message,
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    #[derive(Default)]
    struct Script {
        commands: Vec<&'static str>,
        reads: VecDeque<Result<Capture, LinkError>>,
        reject_config: bool,
    }

    struct Scripted(Arc<Mutex<Script>>);

    impl Scripted {
        fn log(&self, cmd: &'static str) {
            self.0.lock().unwrap().commands.push(cmd);
        }
    }

    impl Digitizer for Scripted {
        fn open(&mut self) -> Result<(), LinkError> {
            self.log("open");
            Ok(())
        }

        fn identity(&mut self) -> Result<String, LinkError> {
            Ok("scripted".to_string())
        }

        fn configure(&mut self, _config: &LinkConfig) -> Result<(), LinkError> {
            self.log("configure");
            if self.0.lock().unwrap().reject_config {
                return Err(LinkError::fault("-221,\"Settings conflict\""));
            }
            Ok(())
        }

        fn arm(&mut self) -> Result<(), LinkError> {
            self.log("arm");
            Ok(())
        }

        fn disarm(&mut self) -> Result<(), LinkError> {
            self.log("disarm");
            Ok(())
        }

        fn read_frame(&mut self, timeout: Duration) -> Result<Capture, LinkError> {
            self.log("read");
            self.0
                .lock()
                .unwrap()
                .reads
                .pop_front()
                .unwrap_or(Err(LinkError::Timeout(timeout)))
        }

        fn close(&mut self) -> Result<(), LinkError> {
            self.log("close");
            Ok(())
        }
    }

    fn config() -> LinkConfig {
        LinkConfig {
            channel_mask: ChannelMask(0b1),
            trigger_mode: TriggerMode::Software,
            sample_depth: 1024,
        }
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    fn capture(byte: u8) -> Result<Capture, LinkError> {
        Ok(Capture {
            payload: vec![byte],
            host_time_ns: byte as i64,
        })
    }

    fn open(reads: Vec<Result<Capture, LinkError>>) -> (Instrument<Scripted>, Arc<Mutex<Script>>) {
        let script = Arc::new(Mutex::new(Script {
            reads: reads.into(),
            ..Default::default()
        }));
        let link = Instrument::open(Scripted(Arc::clone(&script)), config(), retry()).unwrap();
        (link, script)
    }

    #[test]
    fn invalid_config_never_reaches_backend() {
        let script = Arc::new(Mutex::new(Script::default()));
        for bad in [
            LinkConfig {
                channel_mask: ChannelMask(0),
                ..config()
            },
            LinkConfig {
                sample_depth: 0,
                ..config()
            },
            LinkConfig {
                sample_depth: N_CELLS + 1,
                ..config()
            },
        ] {
            let result = Instrument::open(Scripted(Arc::clone(&script)), bad, retry());
            assert!(matches!(result, Err(LinkError::InvalidConfig(_))));
        }
        assert!(script.lock().unwrap().commands.is_empty());
    }

    #[test]
    fn failed_setup_releases_backend() {
        let script = Arc::new(Mutex::new(Script {
            reject_config: true,
            ..Default::default()
        }));
        let result = Instrument::open(Scripted(Arc::clone(&script)), config(), retry());
        assert!(matches!(result, Err(LinkError::Device { .. })));
        assert_eq!(
            script.lock().unwrap().commands,
            vec!["open", "configure", "close"]
        );
    }

    #[test]
    fn arm_and_disarm_are_idempotent() {
        let (mut link, script) = open(vec![]);
        link.arm().unwrap();
        link.arm().unwrap();
        link.disarm().unwrap();
        link.disarm().unwrap();
        link.close().unwrap();
        link.close().unwrap();
        assert_eq!(
            script.lock().unwrap().commands,
            vec!["open", "configure", "arm", "disarm", "close"]
        );
    }

    #[test]
    fn transient_faults_are_retried_and_sequence_continues() {
        let (mut link, _) = open(vec![
            capture(1),
            Err(LinkError::transient("crc")),
            Err(LinkError::transient("crc")),
            capture(2),
        ]);
        let a = link.read_frame(Duration::from_millis(5)).unwrap();
        let b = link.read_frame(Duration::from_millis(5)).unwrap();
        assert_eq!((a.sequence, a.payload), (0, vec![1]));
        assert_eq!((b.sequence, b.payload), (1, vec![2]));
    }

    #[test]
    fn persistent_fault_exhausts_retries() {
        let (mut link, script) = open(vec![
            Err(LinkError::transient("crc")),
            Err(LinkError::transient("crc")),
            Err(LinkError::transient("crc")),
            capture(9),
        ]);
        let err = link.read_frame(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, LinkError::RetriesExhausted { attempts: 3, .. }));
        let reads = script
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|c| **c == "read")
            .count();
        assert_eq!(reads, 3);
    }

    #[test]
    fn timeout_is_not_retried() {
        let (mut link, script) = open(vec![]);
        let err = link.read_frame(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, LinkError::Timeout(_)));
        assert_eq!(script.lock().unwrap().commands.last(), Some(&"read"));
        assert_eq!(script.lock().unwrap().commands.len(), 3);
    }

    #[test]
    fn closing_disarms_and_rejects_reads() {
        let (mut link, script) = open(vec![capture(1)]);
        link.arm().unwrap();
        link.close().unwrap();
        assert!(matches!(
            link.read_frame(Duration::ZERO),
            Err(LinkError::Closed)
        ));
        assert_eq!(
            script.lock().unwrap().commands[2..],
            ["arm", "disarm", "close"]
        );
    }

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(40));
        assert_eq!(policy.backoff(3), Duration::from_millis(50));
        assert_eq!(policy.backoff(40), Duration::from_millis(50));
    }
}
