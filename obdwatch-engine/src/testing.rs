//! In-memory channel adapter and byte stream for tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::channel::{ChannelAdapter, Command, ConnectionStatus, DeviceStatus, Reply, TransportError};

type Handler = Box<dyn FnMut(&Command) -> Result<Reply, TransportError> + Send>;

/// Adapter answering from a closure, recording every transaction and
/// counting any that overlap
pub struct ScriptedAdapter {
    handler: Handler,
    status: ConnectionStatus,
    delay: Duration,
    log: Arc<Mutex<Vec<Command>>>,
    in_flight: Arc<AtomicUsize>,
    overlaps: Arc<AtomicUsize>,
    reconnects: Arc<AtomicUsize>,
}

impl ScriptedAdapter {
    pub fn new<F>(handler: F) -> Self
    where
        F: FnMut(&Command) -> Result<Reply, TransportError> + Send + 'static,
    {
        Self {
            handler: Box::new(handler),
            status: ConnectionStatus::VehicleActive,
            delay: Duration::ZERO,
            log: Arc::default(),
            in_flight: Arc::default(),
            overlaps: Arc::default(),
            reconnects: Arc::default(),
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: ConnectionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn log(&self) -> Arc<Mutex<Vec<Command>>> {
        self.log.clone()
    }

    pub fn overlaps(&self) -> Arc<AtomicUsize> {
        self.overlaps.clone()
    }

    pub fn reconnects(&self) -> Arc<AtomicUsize> {
        self.reconnects.clone()
    }
}

impl ChannelAdapter for ScriptedAdapter {
    fn execute(&mut self, command: &Command) -> Result<Reply, TransportError> {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.log.lock().unwrap().push(*command);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let result = (self.handler)(command);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn device_status(&mut self) -> DeviceStatus {
        DeviceStatus {
            status: self.status,
            address: Some("scripted".to_string()),
            protocol: None,
        }
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Byte stream that answers each `\r`-terminated command from a script
///
/// Unscripted AT commands answer `OK`, anything else `NO DATA`. A command
/// listed as late has its first reply held back past one read, the way a
/// slow ECU answers after the adapter's read timeout.
pub struct MockStream {
    replies: HashMap<String, String>,
    late: HashSet<String>,
    line: Vec<u8>,
    pending: VecDeque<u8>,
    held: Option<String>,
    sent: Arc<Mutex<Vec<String>>>,
    pub closed: bool,
}

impl MockStream {
    pub fn new(replies: &[(&str, &str)]) -> Self {
        Self {
            replies: replies
                .iter()
                .map(|(cmd, reply)| ((*cmd).to_string(), (*reply).to_string()))
                .collect(),
            late: HashSet::new(),
            line: Vec::new(),
            pending: VecDeque::new(),
            held: None,
            sent: Arc::default(),
            closed: false,
        }
    }

    #[must_use]
    pub fn with_late(mut self, commands: &[&str]) -> Self {
        self.late = commands.iter().map(|cmd| (*cmd).to_string()).collect();
        self
    }

    #[must_use]
    pub fn with_log(mut self, sent: Arc<Mutex<Vec<String>>>) -> Self {
        self.sent = sent;
        self
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &b in buf {
            if b != b'\r' {
                self.line.push(b);
                continue;
            }
            let command = String::from_utf8_lossy(&self.line).to_string();
            self.line.clear();
            let reply = match self.replies.get(&command) {
                Some(reply) => reply.clone(),
                None if command.starts_with("AT") => "OK\r\r>".to_string(),
                None => "NO DATA\r\r>".to_string(),
            };
            if self.late.remove(&command) {
                self.held = Some(reply);
            } else {
                self.pending.extend(reply.bytes());
            }
            self.sent.lock().unwrap().push(command);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        if self.pending.is_empty() {
            // The held reply lands right after this read gives up
            if let Some(reply) = self.held.take() {
                self.pending.extend(reply.bytes());
            }
            return Err(io::ErrorKind::TimedOut.into());
        }
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}
