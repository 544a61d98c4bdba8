//! The channel task: sole owner of the adapter.
//!
//! Architecture:
//! - Acquisition loop: walks the registry one transaction at a time and
//!   publishes decoded values into the cache
//! - Request queue: on-demand commands, status queries and lifecycle control
//!   arrive over an mpsc channel and are served between transactions, so a
//!   queued command runs before the next scheduled parameter

use atomic_enum::atomic_enum;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::ValueCache;
use crate::channel::{ChannelAdapter, Command, DeviceStatus, Reply, TransportError};
use crate::health::HealthTracker;
use crate::registry::ParameterRegistry;

/// Where a queued command stands. Exactly one side wins the move out of
/// `Queued`: the task claims it to run, or the caller withdraws it on timeout.
#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum Ticket {
    Queued,
    Claimed,
    Withdrawn,
}

impl AtomicTicket {
    /// Move `Queued` to `to`; false if the other side got there first
    pub fn settle(&self, to: Ticket) -> bool {
        self.compare_exchange(Ticket::Queued, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Request to the channel task
pub enum Request {
    /// Run one on-demand transaction
    Command {
        command: Command,
        ticket: Arc<AtomicTicket>,
        response_tx: oneshot::Sender<Result<Reply, TransportError>>,
    },
    DeviceStatus {
        response_tx: oneshot::Sender<DeviceStatus>,
    },
    /// Start or stop the acquisition loop; acknowledged once applied
    SetRunning {
        running: bool,
        ack_tx: oneshot::Sender<()>,
    },
    Shutdown,
}

pub type RequestSender = Sender<Request>;
pub type RequestReceiver = Receiver<Request>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

pub struct ChannelTask<A> {
    adapter: A,
    registry: ParameterRegistry,
    cache: Arc<ValueCache>,
    health: HealthTracker,
    running: Arc<AtomicBool>,
    rx: RequestReceiver,
    cycle_pause: Duration,
    /// Registry index of the next parameter to poll
    next: usize,
    /// A reconnect succeeded and the next transaction decides the health state
    probing: bool,
}

impl<A: ChannelAdapter> ChannelTask<A> {
    pub fn new(
        adapter: A,
        registry: ParameterRegistry,
        cache: Arc<ValueCache>,
        health: HealthTracker,
        running: Arc<AtomicBool>,
        rx: RequestReceiver,
        cycle_pause: Duration,
    ) -> Self {
        Self {
            adapter,
            registry,
            cache,
            health,
            running,
            rx,
            cycle_pause,
            next: 0,
            probing: false,
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run the channel task until shutdown or until every sender is gone
    pub fn run(mut self) {
        info!("Channel task started ({} parameters)", self.registry.len());

        loop {
            if self.drain_requests() == Flow::Shutdown {
                break;
            }

            if !self.is_running() {
                // Idle: block until something arrives
                match self.rx.recv() {
                    Ok(request) => {
                        if self.handle(request) == Flow::Shutdown {
                            break;
                        }
                    }
                    Err(mpsc::RecvError) => break,
                }
                continue;
            }

            if self.health.is_degraded() && !self.probing {
                if self.back_off() == Flow::Shutdown {
                    break;
                }
                continue;
            }

            self.poll_next();

            if self.next == 0 {
                let cycles = self.cache.complete_cycle();
                debug!("Acquisition cycle {cycles} complete");
                if self.pause(self.cycle_pause) == Flow::Shutdown {
                    break;
                }
            }
        }

        self.running.store(false, Ordering::Release);
        info!("Channel task stopped");
    }

    /// Serve every request already queued
    fn drain_requests(&mut self) -> Flow {
        loop {
            match self.rx.try_recv() {
                Ok(request) => {
                    if self.handle(request) == Flow::Shutdown {
                        return Flow::Shutdown;
                    }
                }
                Err(mpsc::TryRecvError::Empty) => return Flow::Continue,
                Err(mpsc::TryRecvError::Disconnected) => {
                    info!("Request channel closed, shutting down");
                    return Flow::Shutdown;
                }
            }
        }
    }

    fn handle(&mut self, request: Request) -> Flow {
        match request {
            Request::Command {
                command,
                ticket,
                response_tx,
            } => {
                if !ticket.settle(Ticket::Claimed) {
                    debug!("Skipping {command}, withdrawn by caller");
                    return Flow::Continue;
                }
                debug!("On-demand command: {command}");
                let result = self.adapter.execute(&command);
                self.record(&result);
                if let Err(e) = &result {
                    warn!("{command} failed: {e}");
                }
                let _ = response_tx.send(result);
            }
            Request::DeviceStatus { response_tx } => {
                let status = self.adapter.device_status();
                debug!("Device status: {}", status.status);
                let _ = response_tx.send(status);
            }
            Request::SetRunning { running, ack_tx } => {
                if running && !self.is_running() {
                    info!("Acquisition started");
                    self.next = 0;
                } else if !running && self.is_running() {
                    info!("Acquisition stopped");
                }
                self.running.store(running, Ordering::Release);
                let _ = ack_tx.send(());
            }
            Request::Shutdown => {
                info!("Channel task shutting down");
                return Flow::Shutdown;
            }
        }
        Flow::Continue
    }

    fn record(&mut self, result: &Result<Reply, TransportError>) {
        match result {
            Ok(_) => self.health.record_success(),
            Err(e) => self.health.record_failure(e),
        }
        self.probing = false;
    }

    /// Poll the next registered parameter and publish its value
    fn poll_next(&mut self) {
        let Some(parameter) = self.registry.get(self.next).copied() else {
            self.next = 0;
            return;
        };
        self.next = (self.next + 1) % self.registry.len();

        let result = self.adapter.execute(&parameter.command);
        self.record(&result);

        match result {
            Ok(reply) => match parameter.evaluate(&reply) {
                Some(value) => {
                    debug!("{} = {value:.2}", parameter.id);
                    self.cache.publish(parameter.id, value);
                }
                None => debug!("{}: no data", parameter.id),
            },
            Err(e) => warn!("{} failed: {e}", parameter.command),
        }
    }

    /// Wait out the reconnect backoff, then ask the adapter to reconnect
    fn back_off(&mut self) -> Flow {
        let delay = self.health.next_backoff();
        debug!("Channel degraded, retrying in {}ms", delay.as_millis());
        if self.pause(delay) == Flow::Shutdown {
            return Flow::Shutdown;
        }
        if !self.is_running() || !self.health.is_degraded() {
            // Stopped, or an on-demand command already restored the channel
            return Flow::Continue;
        }

        match self.adapter.reconnect() {
            Ok(()) => {
                info!("Reconnected to adapter");
                self.probing = true;
            }
            Err(e) => {
                warn!("Reconnect failed: {e}");
                self.health.record_failure(&e);
            }
        }
        Flow::Continue
    }

    /// Sleep cooperatively while still serving requests
    ///
    /// Returns early when acquisition is stopped.
    fn pause(&mut self, duration: Duration) -> Flow {
        if duration.is_zero() {
            std::thread::yield_now();
            return Flow::Continue;
        }

        let deadline = Instant::now() + duration;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.is_running() {
                return Flow::Continue;
            }
            match self.rx.recv_timeout(remaining) {
                Ok(request) => {
                    if self.handle(request) == Flow::Shutdown {
                        return Flow::Shutdown;
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => return Flow::Continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    info!("Request channel closed, shutting down");
                    return Flow::Shutdown;
                }
            }
        }
    }
}
