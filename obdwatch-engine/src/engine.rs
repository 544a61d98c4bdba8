use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use crate::cache::{Snapshot, ValueCache};
use crate::channel::{ChannelAdapter, Command, ConnectionStatus, DeviceStatus, Reply};
use crate::config::{EngineConfig, COMMAND_WAIT_MARGIN};
use crate::diagnostics::{
    decode_dtc_list, decode_freeze_dtc, decode_supported_pids, Answer, Dtc, FuelStatus,
    MonitorStatus,
};
use crate::error::EngineError;
use crate::health::{AtomicConnectionHealth, ConnectionHealth, HealthTracker};
use crate::registry::ParameterRegistry;
use crate::thread_util::spawn_named;
use crate::worker::{AtomicTicket, ChannelTask, Request, RequestSender, Ticket};

/// Telemetry acquisition engine
///
/// Owns the channel task and exposes the value snapshot and the on-demand
/// command port. All methods take `&self`, so an engine can be shared
/// between a display poller and command callers.
pub struct Engine {
    tx: RequestSender,
    cache: Arc<ValueCache>,
    health: Arc<AtomicConnectionHealth>,
    running: Arc<AtomicBool>,
    config: EngineConfig,
    task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Engine {
    /// Check the adapter connection and spawn the channel task
    ///
    /// Acquisition does not begin until [`Engine::start`]. Fails before
    /// anything is spawned when the adapter reports no connection.
    pub fn connect<A: ChannelAdapter>(
        mut adapter: A,
        registry: ParameterRegistry,
        mut config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config.validate();
        if registry.is_empty() {
            return Err(EngineError::Configuration(
                "no parameters registered".to_string(),
            ));
        }

        let device = adapter.device_status();
        let address = device.address.as_deref().unwrap_or("unknown address");
        let protocol = device
            .protocol
            .as_ref()
            .map_or("unknown protocol", |p| p.name.as_str());
        match device.status {
            ConnectionStatus::NotConnected => {
                error!("Not connected to adapter at {address}");
                return Err(EngineError::NotConnected {
                    address: device.address,
                });
            }
            ConnectionStatus::AdapterConnected => {
                warn!("Adapter connected at {address}, but no vehicle bus detected");
            }
            ConnectionStatus::BusConnected => {
                warn!("Vehicle bus connected at {address} ({protocol}), but the ECU does not answer; is the ignition on?");
            }
            ConnectionStatus::VehicleActive => {
                info!("Connected to vehicle at {address} using {protocol}");
            }
        }

        let cache = Arc::new(ValueCache::new(registry.ids()));
        let health = HealthTracker::new(
            config.degraded_after_failures,
            config.backoff_initial(),
            config.backoff_max(),
        );
        let health_view = health.shared();
        let running = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let task = ChannelTask::new(
            adapter,
            registry,
            cache.clone(),
            health,
            running.clone(),
            rx,
            config.cycle_pause(),
        );
        let handle = spawn_named("obd_channel", move || task.run())?;

        Ok(Self {
            tx,
            cache,
            health: health_view,
            running,
            config,
            task: Mutex::new(Some(handle)),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Begin (or resume) acquisition at the first registered parameter
    pub fn start(&self) -> Result<(), EngineError> {
        self.set_running(true)
    }

    /// Pause acquisition. Returns once the in-flight transaction has finished.
    pub fn stop(&self) -> Result<(), EngineError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Ok(());
        }
        self.set_running(false)
    }

    fn set_running(&self, running: bool) -> Result<(), EngineError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(Request::SetRunning { running, ack_tx })?;
        ack_rx
            .recv_timeout(self.config.command_wait())
            .map_err(map_wait_error)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Latest known value of every parameter
    pub fn current_values(&self) -> Snapshot {
        self.cache.snapshot()
    }

    pub fn completed_cycles(&self) -> u64 {
        self.cache.cycles()
    }

    pub fn health(&self) -> ConnectionHealth {
        self.health.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn send(&self, request: Request) -> Result<(), EngineError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(EngineError::ShutDown);
        }
        self.tx.send(request).map_err(|_| EngineError::ShutDown)
    }

    /// Run one command on the channel, waiting for any in-flight transaction
    ///
    /// A command still queued when the wait runs out is withdrawn and never
    /// reaches the vehicle. One the task has already started is waited for,
    /// so `Timeout` always means the command did not run.
    pub fn execute(&self, command: Command) -> Result<Reply, EngineError> {
        let ticket = Arc::new(AtomicTicket::new(Ticket::Queued));
        let (response_tx, response_rx) = oneshot::channel();
        self.send(Request::Command {
            command,
            ticket: ticket.clone(),
            response_tx,
        })?;

        let wait = self.config.command_wait();
        let result = match response_rx.recv_timeout(wait) {
            Err(oneshot::RecvTimeoutError::Timeout) => {
                if ticket.settle(Ticket::Withdrawn) {
                    warn!("{command} still queued after {}ms, withdrawn", wait.as_millis());
                    return Err(EngineError::Timeout);
                }
                // Claimed by the task: one transaction, bounded by the adapter timeout
                response_rx.recv_timeout(wait).map_err(map_wait_error)?
            }
            other => other.map_err(map_wait_error)?,
        };
        Ok(result?)
    }

    fn query<T>(
        &self,
        command: Command,
        decode: impl FnOnce(&[u8]) -> Option<T>,
    ) -> Result<Answer<T>, EngineError> {
        Ok(match self.execute(command)? {
            Reply::Data(payload) => decode(&payload).into(),
            Reply::NoData => Answer::NoData,
        })
    }

    /// MIL state, stored DTC count and readiness monitors
    pub fn get_status(&self) -> Result<Answer<MonitorStatus>, EngineError> {
        self.query(Command::STATUS, MonitorStatus::decode)
    }

    /// The DTC that triggered the stored freeze frame
    pub fn get_freeze_frame(&self) -> Result<Answer<Dtc>, EngineError> {
        self.query(Command::FREEZE_DTC, |data| decode_freeze_dtc(data).value())
    }

    pub fn get_fuel_status(&self) -> Result<Answer<FuelStatus>, EngineError> {
        self.query(Command::FUEL_STATUS, FuelStatus::decode)
    }

    /// Stored DTCs; an empty list means the vehicle reports none
    pub fn read_fault_codes(&self) -> Result<Answer<Vec<Dtc>>, EngineError> {
        self.query(Command::GET_DTC, |data| Some(decode_dtc_list(data)))
    }

    /// Clear stored DTCs. `true` only when the vehicle acknowledges.
    pub fn clear_fault_codes(&self) -> bool {
        match self.execute(Command::CLEAR_DTC) {
            Ok(Reply::Data(_)) => {
                info!("Fault codes cleared");
                true
            }
            Ok(Reply::NoData) => {
                warn!("Clearing fault codes was not acknowledged");
                false
            }
            Err(e) => {
                warn!("Clearing fault codes failed: {e}");
                false
            }
        }
    }

    /// Mode 01 PIDs the vehicle reports as supported
    ///
    /// Each bitmap block is its own command, so acquisition may run between
    /// them.
    pub fn supported_pids(&self) -> Result<Vec<u8>, EngineError> {
        let mut supported = Vec::new();
        let mut base = 0x00u8;
        loop {
            let Reply::Data(bitmap) = self.execute(Command::pids_supported(base))? else {
                break;
            };
            let block = decode_supported_pids(base, &bitmap);
            supported.extend(block.iter().copied().filter(|pid| pid % 0x20 != 0));
            match base.checked_add(0x20) {
                Some(next) if block.contains(&next) => base = next,
                _ => break,
            }
        }
        Ok(supported)
    }

    /// Adapter connection status, queried through the channel task
    pub fn device_status(&self) -> Result<DeviceStatus, EngineError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(Request::DeviceStatus { response_tx })?;
        // A status probe runs several transactions
        let wait = self.config.transaction_timeout() * 4 + COMMAND_WAIT_MARGIN;
        response_rx.recv_timeout(wait).map_err(map_wait_error)
    }

    /// Stop the channel task and wait for it to exit
    ///
    /// Snapshots keep working afterwards; commands return
    /// [`EngineError::ShutDown`].
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(Request::Shutdown);
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Channel task panicked");
            }
        }
        self.running.store(false, Ordering::Release);
        info!("Engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn map_wait_error(e: oneshot::RecvTimeoutError) -> EngineError {
    match e {
        oneshot::RecvTimeoutError::Timeout => EngineError::Timeout,
        oneshot::RecvTimeoutError::Disconnected => EngineError::ShutDown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::TransportError;
    use crate::elm327::Elm327Channel;
    use crate::registry::ParameterId;
    use crate::testing::{wait_for, MockStream, ScriptedAdapter};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const TEST_WAIT: Duration = Duration::from_secs(5);

    fn fast_config() -> EngineConfig {
        EngineConfig {
            transaction_timeout_ms: 200,
            cycle_pause_ms: 5,
            degraded_after_failures: 3,
            backoff_initial_ms: 5,
            backoff_max_ms: 20,
        }
    }

    fn rpm_only(command: &Command) -> Result<Reply, TransportError> {
        match *command {
            Command::RPM => Ok(Reply::data(&[0x17, 0x70])),
            Command::CLEAR_DTC => Ok(Reply::data(&[])),
            _ => Ok(Reply::NoData),
        }
    }

    fn engine(adapter: ScriptedAdapter) -> Engine {
        Engine::connect(adapter, ParameterRegistry::standard(), fast_config()).unwrap()
    }

    #[test]
    fn test_rpm_only_scenario() {
        let engine = engine(ScriptedAdapter::new(rpm_only));
        engine.start().unwrap();
        assert!(wait_for(TEST_WAIT, || engine.completed_cycles() >= 1));

        let snapshot = engine.current_values();
        assert_eq!(snapshot.get(ParameterId::Rpm), Some(1500.0));
        for (id, value) in snapshot.iter() {
            if id != ParameterId::Rpm {
                assert_eq!(value, None, "{id} should have no data");
            }
        }
    }

    #[test]
    fn test_values_absent_before_start() {
        let engine = engine(ScriptedAdapter::new(rpm_only));
        let snapshot = engine.current_values();
        assert_eq!(snapshot.values.len(), 16);
        assert!(snapshot.iter().all(|(_, value)| value.is_none()));
        assert!(!engine.is_running());
    }

    #[test]
    fn test_stale_value_retained() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let adapter = ScriptedAdapter::new(move |command: &Command| match *command {
            Command::RPM if counter.fetch_add(1, Ordering::SeqCst) == 0 => {
                Ok(Reply::data(&[0x17, 0x70]))
            }
            Command::SPEED => Err(TransportError::Timeout),
            _ => Ok(Reply::NoData),
        });
        let engine = engine(adapter);
        engine.start().unwrap();
        assert!(wait_for(TEST_WAIT, || engine.completed_cycles() >= 3));

        assert!(calls.load(Ordering::SeqCst) >= 3);
        assert_eq!(engine.current_values().get(ParameterId::Rpm), Some(1500.0));
        assert_eq!(engine.current_values().get(ParameterId::Speed), None);
    }

    #[test]
    fn test_coolant_published_in_fahrenheit() {
        let adapter = ScriptedAdapter::new(|command: &Command| match *command {
            Command::COOLANT_TEMP => Ok(Reply::data(&[0x28])),
            _ => Ok(Reply::NoData),
        });
        let engine = engine(adapter);
        engine.start().unwrap();
        assert!(wait_for(TEST_WAIT, || engine.completed_cycles() >= 1));
        assert_eq!(
            engine.current_values().get(ParameterId::CoolantTemp),
            Some(32.0)
        );
    }

    #[test]
    fn test_clear_waits_for_in_flight_transaction() {
        let adapter = ScriptedAdapter::new(rpm_only).with_delay(Duration::from_millis(20));
        let log = adapter.log();
        let overlaps = adapter.overlaps();
        let engine = engine(adapter);
        engine.start().unwrap();
        assert!(wait_for(TEST_WAIT, || log.lock().unwrap().len() >= 3));

        assert!(engine.clear_fault_codes());
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(log.lock().unwrap().contains(&Command::CLEAR_DTC));
    }

    #[test]
    fn test_command_runs_before_next_parameter() {
        let registry = ParameterRegistry::standard();
        let order: Vec<Command> = registry.iter().map(|p| p.command).collect();
        let adapter = ScriptedAdapter::new(rpm_only).with_delay(Duration::from_millis(10));
        let log = adapter.log();
        let engine = engine(adapter);
        engine.start().unwrap();
        assert!(wait_for(TEST_WAIT, || log.lock().unwrap().len() >= 5));

        assert!(engine.clear_fault_codes());
        let clear_at = {
            let log = log.lock().unwrap();
            log.iter().position(|c| *c == Command::CLEAR_DTC).unwrap()
        };
        assert!(wait_for(TEST_WAIT, || log.lock().unwrap().len() > clear_at + 1));

        let log = log.lock().unwrap();
        let before = order.iter().position(|c| *c == log[clear_at - 1]).unwrap();
        assert_eq!(log[clear_at + 1], order[(before + 1) % order.len()]);
    }

    #[test]
    fn test_degraded_and_recovery() {
        let failing = Arc::new(AtomicBool::new(true));
        let flag = failing.clone();
        let adapter = ScriptedAdapter::new(move |command: &Command| {
            if flag.load(Ordering::SeqCst) {
                Err(TransportError::Timeout)
            } else {
                rpm_only(command)
            }
        });
        let reconnects = adapter.reconnects();
        let engine = engine(adapter);
        engine.start().unwrap();

        assert!(wait_for(TEST_WAIT, || engine.health() == ConnectionHealth::Degraded));
        assert!(wait_for(TEST_WAIT, || reconnects.load(Ordering::SeqCst) >= 1));
        assert!(engine.is_running());

        failing.store(false, Ordering::SeqCst);
        assert!(wait_for(TEST_WAIT, || engine.health() == ConnectionHealth::Healthy));
        let cycles = engine.completed_cycles();
        assert!(wait_for(TEST_WAIT, || engine.completed_cycles() > cycles));
        assert!(wait_for(TEST_WAIT, || {
            engine.current_values().get(ParameterId::Rpm) == Some(1500.0)
        }));
    }

    #[test]
    fn test_not_connected_is_configuration_error() {
        let adapter =
            ScriptedAdapter::new(rpm_only).with_status(ConnectionStatus::NotConnected);
        let log = adapter.log();
        let result = Engine::connect(adapter, ParameterRegistry::standard(), fast_config());
        assert!(matches!(result, Err(EngineError::NotConnected { .. })));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_adapter_only_still_connects() {
        let adapter =
            ScriptedAdapter::new(rpm_only).with_status(ConnectionStatus::AdapterConnected);
        let engine = engine(adapter);
        assert_eq!(
            engine.device_status().unwrap().status,
            ConnectionStatus::AdapterConnected
        );
    }

    #[test]
    fn test_stop_is_idempotent_and_restart_begins_at_first_parameter() {
        let adapter = ScriptedAdapter::new(rpm_only).with_delay(Duration::from_millis(2));
        let log = adapter.log();
        let engine = engine(adapter);
        engine.start().unwrap();
        engine.start().unwrap();
        assert!(wait_for(TEST_WAIT, || log.lock().unwrap().len() >= 4));

        engine.stop().unwrap();
        engine.stop().unwrap();
        assert!(!engine.is_running());
        let stopped_at = log.lock().unwrap().len();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(log.lock().unwrap().len(), stopped_at);

        engine.start().unwrap();
        assert!(wait_for(TEST_WAIT, || log.lock().unwrap().len() > stopped_at));
        assert_eq!(log.lock().unwrap()[stopped_at], Command::RPM);
    }

    #[test]
    fn test_commands_while_stopped() {
        let adapter = ScriptedAdapter::new(|command: &Command| match *command {
            Command::STATUS => Ok(Reply::data(&[0x81, 0x07, 0xFF, 0x00])),
            Command::FREEZE_DTC => Ok(Reply::data(&[0x00, 0x00])),
            Command::FUEL_STATUS => Err(TransportError::Adapter("CAN ERROR".into())),
            Command::GET_DTC => Ok(Reply::data(&[0x01, 0x33, 0x00, 0x00])),
            Command::CLEAR_DTC => Ok(Reply::NoData),
            _ => Ok(Reply::NoData),
        });
        let engine = engine(adapter);

        let status = engine.get_status().unwrap().value().unwrap();
        assert!(status.mil);
        assert_eq!(status.dtc_count, 1);

        assert_eq!(engine.get_freeze_frame().unwrap(), Answer::NoData);

        let fuel = engine.get_fuel_status();
        assert!(matches!(fuel, Err(ref e) if e.is_transport()));

        let codes = engine.read_fault_codes().unwrap().value().unwrap();
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].to_string(), "P0133");

        assert!(!engine.clear_fault_codes());
    }

    #[test]
    fn test_supported_pids_walks_blocks() {
        let adapter = ScriptedAdapter::new(|command: &Command| match command.pid {
            Some(0x00) => Ok(Reply::data(&[0xBE, 0x1F, 0xA8, 0x13])),
            Some(0x20) => Ok(Reply::data(&[0x80, 0x00, 0x00, 0x00])),
            _ => Ok(Reply::NoData),
        });
        let engine = engine(adapter);
        let pids = engine.supported_pids().unwrap();
        assert!(pids.contains(&0x0C));
        assert!(pids.contains(&0x21));
        assert!(!pids.contains(&0x20));
    }

    #[test]
    fn test_snapshot_survives_shutdown() {
        let engine = engine(ScriptedAdapter::new(rpm_only));
        engine.start().unwrap();
        assert!(wait_for(TEST_WAIT, || engine.completed_cycles() >= 1));

        engine.shutdown();
        engine.shutdown();
        assert!(!engine.is_running());
        assert_eq!(engine.current_values().get(ParameterId::Rpm), Some(1500.0));
        assert!(matches!(engine.get_status(), Err(EngineError::ShutDown)));
        assert!(matches!(engine.start(), Err(EngineError::ShutDown)));
        assert!(engine.stop().is_ok());
        assert!(!engine.clear_fault_codes());
    }

    #[test]
    fn test_elm327_values_recover_after_late_reply() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = sent.clone();
        let adapter = Elm327Channel::with_connector(
            Some("mock:35000".to_string()),
            Duration::from_millis(50),
            move || {
                Ok(MockStream::new(&[
                    ("ATRV", "12.4V\r\r>"),
                    ("0100", "4100BE1FA813\r\r>"),
                    ("ATDPN", "A6\r\r>"),
                    ("010C", "410C1770\r\r>"),
                    ("010D", "410D28\r\r>"),
                ])
                .with_late(&["010C"])
                .with_log(log.clone()))
            },
        );
        let engine =
            Engine::connect(adapter, ParameterRegistry::standard(), fast_config()).unwrap();
        engine.start().unwrap();
        assert!(wait_for(TEST_WAIT, || engine.completed_cycles() >= 2));

        let snapshot = engine.current_values();
        assert_eq!(snapshot.get(ParameterId::Rpm), Some(1500.0));
        assert_eq!(snapshot.get(ParameterId::Speed), Some(40.0));
        assert_eq!(engine.health(), ConnectionHealth::Healthy);
        let rpm_requests = sent
            .lock()
            .unwrap()
            .iter()
            .filter(|command| command.as_str() == "010C")
            .count();
        assert!(rpm_requests >= 2);
    }

    #[test]
    fn test_clear_reports_true_exactly_when_it_ran() {
        let cleared = Arc::new(AtomicUsize::new(0));
        let counter = cleared.clone();
        let adapter = ScriptedAdapter::new(move |command: &Command| {
            if *command == Command::CLEAR_DTC {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            rpm_only(command)
        })
        .with_delay(Duration::from_millis(150));
        let engine = Arc::new(engine(adapter));

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                std::thread::spawn(move || engine.clear_fault_codes())
            })
            .collect();
        let acknowledged = callers
            .into_iter()
            .map(|caller| caller.join().unwrap())
            .filter(|ok| *ok)
            .count();
        engine.shutdown();

        assert!(acknowledged >= 1);
        assert_eq!(cleared.load(Ordering::SeqCst), acknowledged);
    }

    #[test]
    fn test_concurrent_commands_never_overlap() {
        let adapter = ScriptedAdapter::new(rpm_only).with_delay(Duration::from_millis(1));
        let overlaps = adapter.overlaps();
        let engine = Arc::new(engine(adapter));
        engine.start().unwrap();

        let callers: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        assert!(engine.clear_fault_codes());
                        let _ = engine.current_values();
                    }
                })
            })
            .collect();
        for (i, caller) in callers.into_iter().enumerate() {
            if i % 2 == 0 {
                engine.stop().unwrap();
            } else {
                engine.start().unwrap();
            }
            caller.join().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }
}
