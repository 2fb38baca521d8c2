use crate::LinkError;
use log::{debug, info};
use std::{
    fs,
    io::{self, BufRead, BufReader, Read, Write},
    net::{SocketAddr, TcpStream},
    path::Path,
    time::Duration,
};

/// Line-oriented SCPI session with the board's control port.
///
/// Commands are newline-terminated ASCII. A command ending in `?` is a
/// query and gets exactly one reply line.
pub struct ScpiControl {
    peer: SocketAddr,
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl ScpiControl {
    pub fn connect(peer: SocketAddr, timeout: Duration) -> Result<Self, LinkError> {
        let stream = TcpStream::connect_timeout(&peer, timeout)
            .map_err(|e| LinkError::Connection(format!("control {peer}: {e}")))?;
        stream
            .set_read_timeout(Some(timeout))
            .and_then(|_| stream.set_write_timeout(Some(timeout)))
            .map_err(|e| LinkError::Connection(format!("control {peer}: {e}")))?;
        let reader = stream
            .try_clone()
            .map_err(|e| LinkError::Connection(format!("control {peer}: {e}")))?;
        info!("Control channel open to {}", peer);
        Ok(Self {
            peer,
            writer: stream,
            reader: BufReader::new(reader),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send one command; for queries, return the reply.
    ///
    /// Control-channel failures are never transient: the board may already
    /// have acted on the command, so it must not be sent again blindly.
    pub fn send(&mut self, command: &str) -> Result<Option<String>, LinkError> {
        let command = command.trim();
        let query = command.ends_with('?');
        if query {
            self.flush_input()?;
        }
        debug!("{} <- {}", self.peer, command);
        self.writer
            .write_all(format!("{command}\n").as_bytes())
            .map_err(io_error)?;
        if !query {
            return Ok(None);
        }

        let mut reply = String::new();
        let n = self.reader.read_line(&mut reply).map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                LinkError::fault(format!("no reply to {command} from {}", self.peer))
            }
            _ => io_error(e),
        })?;
        if n == 0 {
            return Err(LinkError::fault(format!(
                "{} closed the control channel",
                self.peer
            )));
        }
        let reply = reply.trim_end().to_string();
        debug!("{} -> {}", self.peer, reply);
        Ok(Some(reply))
    }

    pub fn query(&mut self, command: &str) -> Result<String, LinkError> {
        let command = if command.ends_with('?') {
            command.to_string()
        } else {
            format!("{command}?")
        };
        self.send(&command)?
            .ok_or_else(|| LinkError::fault(format!("no reply to {command}")))
    }

    /// Send each non-empty line that is not a `#` comment.
    /// Returns the replies of the queries in order.
    pub fn send_commands(&mut self, script: &str) -> Result<Vec<String>, LinkError> {
        let mut replies = Vec::new();
        for line in script.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(reply) = self.send(line)? {
                replies.push(reply);
            }
        }
        Ok(replies)
    }

    pub fn send_commands_in<P: AsRef<Path>>(&mut self, path: P) -> Result<Vec<String>, LinkError> {
        let path = path.as_ref();
        let script = fs::read_to_string(path)
            .map_err(|e| LinkError::fault(format!("{}: {e}", path.display())))?;
        info!("Sending commands from {}", path.display());
        self.send_commands(&script)
    }

    /// Query the error queue; a reply starting with `0` means no error.
    pub fn check_error(&mut self) -> Result<(), LinkError> {
        let reply = self.query("SYST:ERR?")?;
        if reply.starts_with('0') {
            Ok(())
        } else {
            Err(LinkError::fault(format!("device reported {reply}")))
        }
    }

    /// Throw away replies that arrived after their query timed out, so the
    /// next reply read belongs to the next query.
    fn flush_input(&mut self) -> Result<(), LinkError> {
        let buffered = self.reader.buffer().len();
        if buffered > 0 {
            debug!("{} discarding {} buffered bytes", self.peer, buffered);
            self.reader.consume(buffered);
        }

        let stream = self.reader.get_mut();
        stream.set_nonblocking(true).map_err(io_error)?;
        let mut scratch = [0u8; 512];
        let drained = loop {
            match stream.read(&mut scratch) {
                Ok(0) => break Ok(()),
                Ok(n) => debug!("{} discarding {} stale bytes", self.peer, n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(io_error(e)),
            }
        };
        stream.set_nonblocking(false).map_err(io_error)?;
        drained
    }
}

fn io_error(e: io::Error) -> LinkError {
    LinkError::fault(e.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{
        io::BufRead,
        net::TcpListener,
        sync::{Arc, Mutex},
        thread,
    };

    pub(crate) const IDN: &str = "PSI,DRS4 Evaluation Board,2817,5.0";

    /// A fake control port that records commands and answers queries.
    pub(crate) fn fake_board(error_reply: &'static str) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
        slow_board(error_reply, usize::MAX, Duration::ZERO)
    }

    /// Like [`fake_board`], but the `slow`-th `SYST:ERR?` (0-based) is
    /// answered late, with an execution error.
    pub(crate) fn slow_board(
        error_reply: &'static str,
        slow: usize,
        delay: Duration,
    ) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut out = stream.try_clone().unwrap();
            let mut error_queries = 0;
            for line in BufReader::new(stream).lines() {
                let Ok(line) = line else { break };
                let reply = match line.as_str() {
                    "*IDN?" => Some(IDN),
                    "SYST:ERR?" => {
                        error_queries += 1;
                        if error_queries - 1 == slow {
                            thread::sleep(delay);
                            Some("-200,\"Execution error\"")
                        } else {
                            Some(error_reply)
                        }
                    }
                    q if q.ends_with('?') => Some("1"),
                    _ => None,
                };
                log.lock().unwrap().push(line.clone());
                if let Some(reply) = reply {
                    if writeln!(out, "{reply}").is_err() {
                        break;
                    }
                }
            }
        });
        (addr, seen)
    }

    #[test]
    fn queries_get_replies_and_commands_do_not() {
        let (addr, seen) = fake_board("0,\"No error\"");
        let mut ctrl = ScpiControl::connect(addr, Duration::from_secs(2)).unwrap();
        assert_eq!(ctrl.send("*CLS").unwrap(), None);
        assert_eq!(ctrl.query("*IDN").unwrap(), IDN);
        ctrl.check_error().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["*CLS", "*IDN?", "SYST:ERR?"]);
    }

    #[test]
    fn command_scripts_skip_comments_and_blanks() {
        let (addr, seen) = fake_board("0");
        let mut ctrl = ScpiControl::connect(addr, Duration::from_secs(2)).unwrap();
        let replies = ctrl
            .send_commands("# setup\n\nACQ:DEPTH 256\n   \n*IDN?\n  # done\nACQ:ARM\n")
            .unwrap();
        assert_eq!(replies, vec![IDN]);
        // the fake board has seen ACQ:ARM once the next reply arrives
        ctrl.query("SYST:ERR").unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["ACQ:DEPTH 256", "*IDN?", "ACQ:ARM", "SYST:ERR?"]
        );
    }

    #[test]
    fn device_error_is_reported() {
        let (addr, _) = fake_board("-113,\"Undefined header\"");
        let mut ctrl = ScpiControl::connect(addr, Duration::from_secs(2)).unwrap();
        let err = ctrl.check_error().unwrap_err();
        assert!(err.to_string().contains("Undefined header"));
        assert!(!err.is_transient());
    }

    #[test]
    fn late_reply_is_a_fault_and_does_not_shift_later_replies() {
        let (addr, seen) = slow_board("0,\"No error\"", 0, Duration::from_millis(300));
        let mut ctrl = ScpiControl::connect(addr, Duration::from_millis(100)).unwrap();

        ctrl.send("ACQ:ARM").unwrap();
        let err = ctrl.check_error().unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("no reply to SYST:ERR?"));

        // let the stale "-200" reply land in the socket
        thread::sleep(Duration::from_millis(400));
        assert_eq!(ctrl.query("*IDN?").unwrap(), IDN);
        ctrl.check_error().unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["ACQ:ARM", "SYST:ERR?", "*IDN?", "SYST:ERR?"]
        );
    }
}
