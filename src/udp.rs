use crate::{now_ns, Capture, Digitizer, LinkConfig, LinkError, ScpiControl};
use log::{info, warn};
use std::{
    io,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    path::PathBuf,
    time::Duration,
};

/// Multicast group the boards send to by default.
pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(239, 0, 0, 1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpSettings {
    /// Local address frames are received on. The socket is bound without
    /// `SO_REUSEADDR`, so only one receiver per host can use a port, even
    /// when listening to a multicast group.
    pub bind: SocketAddr,
    /// IPv4 multicast group to join, if the board sends to one.
    pub group: Option<Ipv4Addr>,
    pub interface: Ipv4Addr,
    /// SCPI control port. Without it the link only receives.
    pub control: Option<SocketAddr>,
    pub control_timeout: Duration,
    /// SCPI script sent after the acquisition setup.
    pub commands: Option<PathBuf>,
    /// Receive buffer; a datagram filling it completely is reported as
    /// truncated.
    pub max_datagram: usize,
}

impl UdpSettings {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            group: None,
            interface: Ipv4Addr::UNSPECIFIED,
            control: None,
            control_timeout: Duration::from_secs(2),
            commands: None,
            max_datagram: 65_536,
        }
    }
}

/// Receives DRS4 frames as UDP datagrams, one frame per datagram.
pub struct UdpDigitizer {
    settings: UdpSettings,
    socket: Option<UdpSocket>,
    control: Option<ScpiControl>,
    buf: Vec<u8>,
    truncated: u64,
}

impl UdpDigitizer {
    pub fn new(settings: UdpSettings) -> Self {
        let buf = vec![0; settings.max_datagram.max(1)];
        Self {
            settings,
            socket: None,
            control: None,
            buf,
            truncated: 0,
        }
    }

    /// Bound address once open; useful when binding to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn truncated(&self) -> u64 {
        self.truncated
    }

    fn control(&mut self) -> Option<&mut ScpiControl> {
        self.control.as_mut()
    }
}

impl Digitizer for UdpDigitizer {
    fn open(&mut self) -> Result<(), LinkError> {
        let bind = self.settings.bind;
        let socket = UdpSocket::bind(bind)
            .map_err(|e| {
                LinkError::Connection(format!("bind {bind}: {e} (is another receiver using it?)"))
            })?;
        if let Some(group) = self.settings.group {
            socket
                .join_multicast_v4(&group, &self.settings.interface)
                .map_err(|e| LinkError::Connection(format!("join {group}: {e}")))?;
            info!("Joined multicast group {} on {}", group, bind);
        }
        self.socket = Some(socket);

        if let Some(peer) = self.settings.control {
            self.control = Some(ScpiControl::connect(
                peer,
                self.settings.control_timeout,
            )?);
        } else {
            info!("No control address, receiving only");
        }
        Ok(())
    }

    fn identity(&mut self) -> Result<String, LinkError> {
        let fallback = format!("udp:{}", self.settings.bind);
        match self.control() {
            Some(ctrl) => ctrl.query("*IDN?"),
            None => Ok(fallback),
        }
    }

    fn configure(&mut self, config: &LinkConfig) -> Result<(), LinkError> {
        let commands = self.settings.commands.clone();
        let Some(ctrl) = self.control() else {
            return Ok(());
        };
        ctrl.send("*CLS")?;
        ctrl.send(&format!("ACQ:CHAN {}", config.channel_mask.0))?;
        ctrl.send(&format!("ACQ:DEPTH {}", config.sample_depth))?;
        ctrl.send(&format!("TRIG:MODE {}", config.trigger_mode.scpi_name()))?;
        if let Some(path) = commands {
            ctrl.send_commands_in(path)?;
        }
        ctrl.check_error()
    }

    fn arm(&mut self) -> Result<(), LinkError> {
        if let Some(ctrl) = self.control() {
            ctrl.send("ACQ:ARM")?;
            ctrl.check_error()?;
        }
        Ok(())
    }

    fn disarm(&mut self) -> Result<(), LinkError> {
        if let Some(ctrl) = self.control() {
            ctrl.send("ACQ:DISARM")?;
        }
        Ok(())
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Capture, LinkError> {
        let socket = self.socket.as_ref().ok_or(LinkError::Closed)?;
        // a zero read timeout means "block forever" to the OS
        socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))
            .map_err(|e| LinkError::fault(e.to_string()))?;

        match socket.recv_from(&mut self.buf) {
            Ok((n, from)) => {
                let host_time_ns = now_ns();
                if n == self.buf.len() {
                    self.truncated += 1;
                    warn!(
                        "Datagram from {} filled the {} byte buffer and is probably truncated",
                        from, n
                    );
                }
                Ok(Capture {
                    payload: self.buf[..n].to_vec(),
                    host_time_ns,
                })
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Err(LinkError::Timeout(timeout))
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                Err(LinkError::transient(e.to_string()))
            }
            Err(e) => Err(LinkError::fault(e.to_string())),
        }
    }

    fn close(&mut self) -> Result<(), LinkError> {
        self.control = None;
        if let (Some(socket), Some(group)) = (self.socket.take(), self.settings.group) {
            if let Err(e) = socket.leave_multicast_v4(&group, &self.settings.interface) {
                warn!("Leaving {} failed: {}", group, e);
            }
        }
        Ok(())
    }
}
