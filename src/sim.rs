use crate::{
    encode_frame, now_ns, Capture, ChannelMask, Digitizer, FrameHeader, LinkConfig, LinkError,
    N_CELLS,
};
use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    thread,
    time::{Duration, Instant},
};

const BASELINE: f64 = 2048.0;

/// Knobs of the simulated board.
#[derive(Debug, Clone, PartialEq)]
pub struct SimSettings {
    /// Frames produced before the board reports `Stopped`. `None` runs
    /// until disarmed.
    pub n_frames: Option<u64>,
    pub trigger_interval: Duration,
    /// Host arrival time of frame 0, ns since epoch. `None` uses the
    /// host clock at arm time.
    pub start_ns: Option<i64>,
    pub counter_start: u64,
    /// Upper bound of a uniform delay added to each arrival time.
    pub host_jitter: Duration,
    /// `(frame index, ns)`: from that frame on, arrivals shift by ns.
    pub drifts: Vec<(u64, i64)>,
    /// Frames sent with a channel mask that does not match.
    pub malformed: Vec<u64>,
    /// Frames whose trigger counter jumps backwards.
    pub regressions: Vec<u64>,
    /// Pace frames at the trigger interval instead of as fast as asked.
    pub realtime: bool,
    pub seed: u64,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            n_frames: None,
            trigger_interval: Duration::from_millis(10),
            start_ns: None,
            counter_start: 0,
            host_jitter: Duration::ZERO,
            drifts: Vec::new(),
            malformed: Vec::new(),
            regressions: Vec::new(),
            realtime: false,
            seed: 0,
        }
    }
}

/// Stand-in board producing synthetic, reproducible DRS4 frames: a
/// negative Gaussian pulse on a noisy baseline per channel.
pub struct SimulatedDigitizer {
    settings: SimSettings,
    config: Option<LinkConfig>,
    rng: StdRng,
    armed: bool,
    index: u64,
    start_ns: i64,
    started: Instant,
}

impl SimulatedDigitizer {
    pub fn new(settings: SimSettings) -> Self {
        let rng = StdRng::seed_from_u64(settings.seed);
        Self {
            settings,
            config: None,
            rng,
            armed: false,
            index: 0,
            start_ns: 0,
            started: Instant::now(),
        }
    }

    fn interval_ns(&self) -> i64 {
        self.settings.trigger_interval.as_nanos() as i64
    }

    fn host_time(&mut self, index: u64) -> i64 {
        let drift: i64 = self
            .settings
            .drifts
            .iter()
            .filter(|(from, _)| *from <= index)
            .map(|(_, ns)| ns)
            .sum();
        let jitter = match self.settings.host_jitter.as_nanos() as i64 {
            0 => 0,
            max => self.rng.random_range(0..=max),
        };
        self.start_ns + index as i64 * self.interval_ns() + drift + jitter
    }

    fn frame(&mut self, config: &LinkConfig, index: u64) -> Vec<u8> {
        let depth = config.sample_depth;
        let channels = config.channel_mask.count();
        let mut samples = Vec::with_capacity(channels * depth);
        let center = self.rng.random_range(0.2..0.6) * depth as f64;
        for _ in 0..channels {
            let height = self.rng.random_range(100.0..1500.0);
            let sigma = self.rng.random_range(2.0..8.0);
            for i in 0..depth {
                let x = (i as f64 - center) / sigma;
                let noise = self.rng.random_range(-4.0..4.0);
                let v = BASELINE - height * (-0.5 * x * x).exp() + noise;
                samples.push(v.clamp(0.0, 4095.0) as u16);
            }
        }

        let mut counter = self.settings.counter_start + index;
        if self.settings.regressions.contains(&index) {
            counter = counter.saturating_sub(10);
        }
        let mut channel_mask = config.channel_mask;
        if self.settings.malformed.contains(&index) {
            channel_mask = ChannelMask(!channel_mask.0);
        }
        let header = FrameHeader {
            channel_mask,
            sample_depth: depth as u16,
            trigger_counter: counter,
            device_time_ns: index * self.interval_ns() as u64,
            stop_cell: self.rng.random_range(0..N_CELLS as u16),
            payload_len: 0,
        };
        encode_frame(header, &samples)
    }
}

impl Digitizer for SimulatedDigitizer {
    fn open(&mut self) -> Result<(), LinkError> {
        Ok(())
    }

    fn identity(&mut self) -> Result<String, LinkError> {
        Ok(format!("simulated-drs4-{}", self.settings.seed))
    }

    fn configure(&mut self, config: &LinkConfig) -> Result<(), LinkError> {
        self.config = Some(*config);
        Ok(())
    }

    fn arm(&mut self) -> Result<(), LinkError> {
        self.armed = true;
        self.started = Instant::now();
        self.start_ns = self.settings.start_ns.unwrap_or_else(now_ns);
        debug!("Simulation armed at {} ns", self.start_ns);
        Ok(())
    }

    fn disarm(&mut self) -> Result<(), LinkError> {
        self.armed = false;
        Ok(())
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Capture, LinkError> {
        let config = self
            .config
            .ok_or_else(|| LinkError::fault("read before configure"))?;
        if !self.armed {
            return Err(LinkError::fault("read while disarmed"));
        }
        if self.settings.n_frames.is_some_and(|n| self.index >= n) {
            return Err(LinkError::Stopped);
        }

        let index = self.index;
        if self.settings.realtime {
            let due = self.started + self.settings.trigger_interval * index as u32;
            let wait = due.saturating_duration_since(Instant::now());
            if wait > timeout {
                thread::sleep(timeout);
                return Err(LinkError::Timeout(timeout));
            }
            thread::sleep(wait);
        }

        let host_time_ns = self.host_time(index);
        let payload = self.frame(&config, index);
        self.index += 1;
        Ok(Capture {
            payload,
            host_time_ns,
        })
    }

    fn close(&mut self) -> Result<(), LinkError> {
        self.armed = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode, CalibrationTable, DecodeError, Malformed, RawFrame, TriggerMode};

    fn config() -> LinkConfig {
        LinkConfig {
            channel_mask: ChannelMask(0b11),
            trigger_mode: TriggerMode::Software,
            sample_depth: 128,
        }
    }

    fn armed(settings: SimSettings) -> SimulatedDigitizer {
        let mut sim = SimulatedDigitizer::new(settings);
        sim.open().unwrap();
        sim.configure(&config()).unwrap();
        sim.arm().unwrap();
        sim
    }

    fn read(sim: &mut SimulatedDigitizer, sequence: u64) -> RawFrame {
        let capture = sim.read_frame(Duration::from_millis(100)).unwrap();
        RawFrame {
            sequence,
            host_time_ns: capture.host_time_ns,
            payload: capture.payload,
        }
    }

    #[test]
    fn frames_decode_against_configuration() {
        let mut sim = armed(SimSettings {
            n_frames: Some(3),
            ..Default::default()
        });
        let table = CalibrationTable::ideal(&[0, 1]);
        for seq in 0..3 {
            let record = decode(&read(&mut sim, seq), &config(), &table).unwrap();
            assert_eq!(record.channels, vec![0, 1]);
            assert_eq!(record.trigger_counter, seq);
            // the pulse goes negative from the baseline
            let min = record.amplitude_mv.iter().cloned().fold(f32::MAX, f32::min);
            assert!(min < 490.0);
        }
        assert!(matches!(
            sim.read_frame(Duration::ZERO),
            Err(LinkError::Stopped)
        ));
    }

    #[test]
    fn same_seed_same_frames() {
        let settings = SimSettings {
            start_ns: Some(0),
            host_jitter: Duration::from_micros(50),
            seed: 42,
            ..Default::default()
        };
        let mut a = armed(settings.clone());
        let mut b = armed(settings);
        for seq in 0..5 {
            assert_eq!(read(&mut a, seq), read(&mut b, seq));
        }
    }

    #[test]
    fn injected_faults_show_up() {
        let mut sim = armed(SimSettings {
            start_ns: Some(1_000),
            drifts: vec![(2, 50_000_000)],
            malformed: vec![1],
            regressions: vec![3],
            counter_start: 100,
            ..Default::default()
        });
        let table = CalibrationTable::ideal(&[0, 1]);
        let frames: Vec<_> = (0..4).map(|seq| read(&mut sim, seq)).collect();

        assert_eq!(frames[0].host_time_ns, 1_000);
        assert_eq!(frames[2].host_time_ns, 1_000 + 20_000_000 + 50_000_000);
        assert!(matches!(
            decode(&frames[1], &config(), &table),
            Err(DecodeError::Malformed {
                reason: Malformed::ChannelMask { .. },
                ..
            })
        ));
        let regressed = decode(&frames[3], &config(), &table).unwrap();
        assert_eq!(regressed.trigger_counter, 93);
    }

    #[test]
    fn disarmed_board_does_not_read() {
        let mut sim = armed(SimSettings::default());
        sim.disarm().unwrap();
        assert!(sim.read_frame(Duration::ZERO).is_err());
    }
}
