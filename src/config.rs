use crate::{
    BackpressurePolicy, ChannelMask, ConfigError, LinkConfig, OpenMode, RetryPolicy,
    SessionSettings, SimSettings, SyncSettings, TriggerMode, UdpSettings, WriterOptions,
    DEFAULT_GROUP,
};
use confique::Config;
use serde::Deserialize;
use std::{
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
    path::PathBuf,
    time::Duration,
};

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub run_settings: RunSettings,
    #[config(nested)]
    pub link_settings: LinkSettings,
    #[config(nested)]
    pub board_settings: BoardSettings,
    #[config(nested)]
    pub sync_settings: ClockSettings,
    #[config(nested)]
    pub buffer_settings: BufferSettings,
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    /// Seconds; 0 runs until interrupted.
    #[config(default = 0)]
    pub run_duration: u64,
    pub max_frames: Option<u64>,
    #[config(default = ".")]
    pub output_dir: String,
    pub output_file: Option<String>,
    #[config(default = "create")]
    pub mode: WriteMode,
    #[config(default = 64)]
    pub chunk_events: usize,
    pub chunk_span_ms: Option<u64>,
    #[config(default = 5)]
    pub blosc_threads: u8,
    #[config(default = 2)]
    pub compression_level: u8,
    /// HDF5 calibration table; an ideal table is used when unset.
    pub calibration_file: Option<String>,
    #[config(default = "drs4.log")]
    pub log_file: String,
    #[config(default = 1000)]
    pub progress_interval_ms: u64,
}

#[derive(Config, Debug, Clone)]
pub struct LinkSettings {
    #[config(default = "udp")]
    pub backend: Backend,
    #[config(env = "DRS4_DEST_ADDR", default = "0.0.0.0")]
    pub dest_addr: String,
    #[config(env = "DRS4_DEST_PORT", default = 11111)]
    pub dest_port: u16,
    /// Multicast group to join, e.g. 239.0.0.1.
    pub multicast_group: Option<Ipv4Addr>,
    /// SCPI control port as `host:port`. Receive-only when unset.
    #[config(env = "DRS4_CTRL_ADDR")]
    pub ctrl_addr: Option<String>,
    /// Extra SCPI commands sent after the acquisition setup.
    pub commands_file: Option<String>,
    #[config(default = 65536)]
    pub max_datagram: usize,
    #[config(default = 100)]
    pub read_timeout_ms: u64,
    #[config(default = 5)]
    pub max_retries: u32,
    #[config(default = 10)]
    pub base_backoff_ms: u64,
    #[config(default = 1000)]
    pub max_backoff_ms: u64,
    #[config(default = 0)]
    pub sim_seed: u64,
    pub sim_frames: Option<u64>,
}

#[derive(Config, Debug, Clone)]
pub struct BoardSettings {
    #[config(default = true)]
    pub en_chans: ChannelConfig,
    #[config(default = 1024)]
    pub sample_depth: usize,
    #[config(default = "external")]
    pub trigger_mode: TriggerMode,
}

#[derive(Config, Debug, Clone)]
pub struct ClockSettings {
    /// Nominal time between triggers.
    #[config(default = 10000000)]
    pub trigger_interval_ns: u64,
    #[config(default = 5000000)]
    pub drift_tolerance_ns: u64,
}

#[derive(Config, Debug, Clone)]
pub struct BufferSettings {
    #[config(default = 4096)]
    pub capacity: usize,
    #[config(default = "block")]
    pub policy: PolicyKind,
    #[config(default = 100)]
    pub block_timeout_ms: u64,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum ChannelConfig {
    All(bool),
    List(Vec<u32>),
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Udp,
    Sim,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    Create,
    Overwrite,
    Append,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Block,
    DropOldest,
    DropNewest,
}

impl Conf {
    pub fn channel_mask(&self) -> Result<ChannelMask, ConfigError> {
        match &self.board_settings.en_chans {
            ChannelConfig::All(true) => Ok(ChannelMask(0xff)),
            ChannelConfig::All(false) => {
                Err(ConfigError::invalid("en_chans", "no channels enabled"))
            }
            ChannelConfig::List(channels) => {
                let channels = channels
                    .iter()
                    .map(|&ch| u8::try_from(ch).unwrap_or(u8::MAX))
                    .collect::<Vec<_>>();
                ChannelMask::from_channels(&channels)
                    .filter(|mask| !mask.is_empty())
                    .ok_or_else(|| {
                        ConfigError::invalid("en_chans", format!("{channels:?} is not a subset of 0..8"))
                    })
            }
        }
    }

    pub fn link_config(&self) -> Result<LinkConfig, ConfigError> {
        let config = LinkConfig {
            channel_mask: self.channel_mask()?,
            trigger_mode: self.board_settings.trigger_mode,
            sample_depth: self.board_settings.sample_depth,
        };
        config
            .validate()
            .map_err(|e| ConfigError::invalid("board_settings", e.to_string()))?;
        Ok(config)
    }

    pub fn session_settings(&self) -> Result<SessionSettings, ConfigError> {
        let run = &self.run_settings;
        let link = &self.link_settings;
        let clock = &self.sync_settings;
        let buffer = &self.buffer_settings;

        if run.chunk_events == 0 {
            return Err(ConfigError::invalid("chunk_events", "must be at least 1"));
        }
        if clock.trigger_interval_ns == 0 {
            return Err(ConfigError::invalid("trigger_interval_ns", "must be positive"));
        }
        if buffer.capacity == 0 {
            return Err(ConfigError::invalid("capacity", "must be at least 1"));
        }

        let policy = match buffer.policy {
            PolicyKind::Block => {
                BackpressurePolicy::Block(Duration::from_millis(buffer.block_timeout_ms))
            }
            PolicyKind::DropOldest => BackpressurePolicy::DropOldest,
            PolicyKind::DropNewest => BackpressurePolicy::DropNewest,
        };
        let mode = match run.mode {
            WriteMode::Create => OpenMode::Create,
            WriteMode::Overwrite => OpenMode::Overwrite,
            WriteMode::Append => OpenMode::Append,
        };

        Ok(SessionSettings {
            link: self.link_config()?,
            retry: RetryPolicy {
                max_retries: link.max_retries,
                base_backoff: Duration::from_millis(link.base_backoff_ms),
                max_backoff: Duration::from_millis(link.max_backoff_ms),
            },
            sync: SyncSettings {
                trigger_interval: Duration::from_nanos(clock.trigger_interval_ns),
                drift_tolerance: Duration::from_nanos(clock.drift_tolerance_ns),
            },
            buffer_capacity: buffer.capacity,
            policy,
            writer: WriterOptions {
                mode,
                chunk_events: run.chunk_events,
                chunk_span: run.chunk_span_ms.map(Duration::from_millis),
                compression_level: run.compression_level,
                blosc_threads: run.blosc_threads,
            },
            output_dir: PathBuf::from(&run.output_dir),
            output_file: run.output_file.as_ref().map(PathBuf::from),
            read_timeout: Duration::from_millis(link.read_timeout_ms),
            run_duration: (run.run_duration > 0).then(|| Duration::from_secs(run.run_duration)),
            max_frames: run.max_frames,
            progress_interval: Duration::from_millis(run.progress_interval_ms.max(1)),
        })
    }

    pub fn udp_settings(&self) -> Result<UdpSettings, ConfigError> {
        let link = &self.link_settings;
        let bind = resolve(&format!("{}:{}", link.dest_addr, link.dest_port), "dest_addr")?;
        let control = link
            .ctrl_addr
            .as_deref()
            .map(|addr| resolve(addr, "ctrl_addr"))
            .transpose()?;
        if let Some(group) = link.multicast_group {
            if !group.is_multicast() {
                return Err(ConfigError::invalid(
                    "multicast_group",
                    format!("{group} is not a multicast address (e.g. {DEFAULT_GROUP})"),
                ));
            }
        }

        let mut settings = UdpSettings::new(bind);
        settings.group = link.multicast_group;
        settings.control = control;
        settings.commands = link.commands_file.as_ref().map(PathBuf::from);
        settings.max_datagram = link.max_datagram;
        Ok(settings)
    }

    pub fn sim_settings(&self) -> SimSettings {
        SimSettings {
            n_frames: self.link_settings.sim_frames,
            trigger_interval: Duration::from_nanos(self.sync_settings.trigger_interval_ns),
            realtime: true,
            seed: self.link_settings.sim_seed,
            ..Default::default()
        }
    }
}

fn resolve(addr: &str, field: &'static str) -> Result<SocketAddr, ConfigError> {
    addr.to_socket_addrs()
        .map_err(|e| ConfigError::invalid(field, format!("{addr}: {e}")))?
        .next()
        .ok_or_else(|| ConfigError::invalid(field, format!("{addr} did not resolve")))
}
