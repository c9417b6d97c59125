//! In-memory implementations of the platform traits
//!
//! These mocks stand in for the Wintun driver, the `netsh` process runner and
//! the host routing table so that session handling, interface configuration
//! and route selection can be tested on any host without privileges.
//!
//! # Example
//!
//! ```
//! use hop_tun::mock::MemoryDriver;
//! use hop_tun::TunnelAdapter;
//!
//! let driver = MemoryDriver::new();
//! let adapter = TunnelAdapter::create(&driver, "ruhop", "Ruhop", None).unwrap();
//! adapter.start_session(hop_tun::DEFAULT_RING_CAPACITY).unwrap();
//!
//! // Simulate the OS routing a packet into the tunnel
//! let ring = adapter.handle().ring().unwrap();
//! ring.inject(vec![0x45; 20]);
//! assert_eq!(adapter.receive_packet().unwrap().len(), 20);
//!
//! // Packets sent by the VPN are captured on the ring
//! adapter.send_packet(&[0x45; 28]).unwrap();
//! assert_eq!(ring.take_sent().len(), 1);
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::adapter::{AdapterHandle, PacketSession, TunDriver, WaitStatus};
use crate::error::{Error, Result};
use crate::netcfg::{CommandOutput, CommandRunner};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Default)]
struct DriverState {
    adapters: HashSet<String>,
    fail_create: bool,
}

/// In-memory adapter driver
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    state: Arc<Mutex<DriverState>>,
    next_luid: Arc<AtomicU64>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DriverState::default())),
            next_luid: Arc::new(AtomicU64::new(0x0047_0000_0100_0000)),
        }
    }

    /// Make `name` openable as if it had been created by an earlier run
    pub fn install(&self, name: &str) {
        lock(&self.state).adapters.insert(name.to_string());
    }

    /// Make every following `create_adapter` fail
    pub fn fail_create(&self, fail: bool) {
        lock(&self.state).fail_create = fail;
    }

    fn new_adapter(&self) -> MemoryAdapter {
        MemoryAdapter::new(self.next_luid.fetch_add(1, Ordering::Relaxed))
    }
}

impl TunDriver for MemoryDriver {
    type Adapter = MemoryAdapter;

    fn create_adapter(&self, name: &str, _tunnel_type: &str, _guid: Option<Uuid>) -> Result<MemoryAdapter> {
        let mut state = lock(&self.state);
        if state.fail_create {
            return Err(Error::DeviceCreation(format!("{}: driver refused", name)));
        }
        state.adapters.insert(name.to_string());
        drop(state);
        Ok(self.new_adapter())
    }

    fn open_adapter(&self, name: &str) -> Result<MemoryAdapter> {
        if !lock(&self.state).adapters.contains(name) {
            return Err(Error::DeviceNotFound(name.to_string()));
        }
        Ok(self.new_adapter())
    }
}

/// In-memory adapter; remembers the ring of the last session it started
#[derive(Debug)]
pub struct MemoryAdapter {
    luid: u64,
    ring: Mutex<Option<Arc<MemoryRing>>>,
    fail_start: AtomicBool,
    sessions_started: AtomicU64,
}

impl MemoryAdapter {
    fn new(luid: u64) -> Self {
        Self {
            luid,
            ring: Mutex::new(None),
            fail_start: AtomicBool::new(false),
            sessions_started: AtomicU64::new(0),
        }
    }

    /// Ring of the most recently started session
    pub fn ring(&self) -> Option<Arc<MemoryRing>> {
        lock(&self.ring).clone()
    }

    /// Make every following `start_session` fail
    pub fn fail_session_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Number of sessions started on this adapter
    pub fn sessions_started(&self) -> u64 {
        self.sessions_started.load(Ordering::SeqCst)
    }
}

impl AdapterHandle for MemoryAdapter {
    type Session = MemorySession;

    fn luid(&self) -> u64 {
        self.luid
    }

    fn start_session(&self, capacity: u32) -> Result<MemorySession> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::Session("ring allocation failed".into()));
        }
        let ring = Arc::new(MemoryRing::new(capacity));
        *lock(&self.ring) = Some(Arc::clone(&ring));
        self.sessions_started.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySession { ring })
    }
}

#[derive(Debug, Default)]
struct RingState {
    inbound: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    closed: bool,
    fail_receive: bool,
}

/// Shared packet ring behind a [`MemorySession`]
#[derive(Debug)]
pub struct MemoryRing {
    capacity: u32,
    state: Mutex<RingState>,
    readable: Condvar,
}

impl MemoryRing {
    fn new(capacity: u32) -> Self {
        Self {
            capacity,
            state: Mutex::new(RingState::default()),
            readable: Condvar::new(),
        }
    }

    /// Capacity the session was started with
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Queue a packet as if the OS had routed it into the adapter
    pub fn inject(&self, packet: Vec<u8>) {
        lock(&self.state).inbound.push_back(packet);
        self.readable.notify_all();
    }

    /// Drain the packets published by the session
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut lock(&self.state).sent)
    }

    /// Make every following receive report lost access
    pub fn fail_receive(&self) {
        lock(&self.state).fail_receive = true;
    }

    /// Whether the session owning this ring was shut down
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

/// In-memory packet session
#[derive(Debug)]
pub struct MemorySession {
    ring: Arc<MemoryRing>,
}

impl PacketSession for MemorySession {
    fn try_receive(&self) -> Result<Option<Vec<u8>>> {
        let mut state = lock(&self.ring.state);
        if state.fail_receive {
            return Err(Error::AccessLost("ring end of file".into()));
        }
        Ok(state.inbound.pop_front())
    }

    fn send(&self, packet: &[u8]) -> Result<()> {
        let mut state = lock(&self.ring.state);
        if state.closed {
            return Err(Error::Session("session closed".into()));
        }
        state.sent.push(packet.to_vec());
        Ok(())
    }

    fn wait_readable(&self, timeout: Option<Duration>) -> Result<WaitStatus> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = lock(&self.ring.state);
        loop {
            if state.closed {
                return Ok(WaitStatus::Closed);
            }
            if !state.inbound.is_empty() {
                return Ok(WaitStatus::Ready);
            }
            state = match deadline {
                None => self
                    .ring
                    .readable
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(WaitStatus::TimedOut);
                    }
                    self.ring
                        .readable
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    fn shutdown(&self) {
        lock(&self.ring.state).closed = true;
        self.ring.readable.notify_all();
    }
}

/// A command seen by [`RecordingRunner`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl RecordedCommand {
    /// Program and arguments joined by spaces
    pub fn line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Default)]
struct RunnerState {
    commands: Vec<RecordedCommand>,
    queued: VecDeque<CommandOutput>,
    rules: Vec<(String, CommandOutput)>,
    timeouts: Vec<String>,
}

/// [`CommandRunner`] that records invocations and replays scripted results
///
/// Resolution order for each call: a matching timeout pattern, a matching
/// output rule, the next queued output, then plain success.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    state: Mutex<RunnerState>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the output for the next call not matched by a rule
    pub fn push_output(&self, output: CommandOutput) {
        lock(&self.state).queued.push_back(output);
    }

    /// Return `output` for every command line containing `pattern`
    pub fn respond_when(&self, pattern: &str, output: CommandOutput) {
        lock(&self.state).rules.push((pattern.to_string(), output));
    }

    /// Time out every command line containing `pattern`
    pub fn time_out_when(&self, pattern: &str) {
        lock(&self.state).timeouts.push(pattern.to_string());
    }

    /// All recorded commands in call order
    pub fn commands(&self) -> Vec<RecordedCommand> {
        lock(&self.state).commands.clone()
    }

    /// Recorded command lines in call order
    pub fn command_lines(&self) -> Vec<String> {
        lock(&self.state).commands.iter().map(RecordedCommand::line).collect()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput> {
        let command = RecordedCommand {
            program: program.to_string(),
            args: args.to_vec(),
            timeout,
        };
        let line = command.line();

        let mut state = lock(&self.state);
        state.commands.push(command);

        if state.timeouts.iter().any(|p| line.contains(p.as_str())) {
            return Err(Error::Timeout {
                command: line,
                timeout,
            });
        }

        if let Some((_, output)) = state.rules.iter().find(|(p, _)| line.contains(p.as_str())) {
            return Ok(output.clone());
        }

        Ok(state.queued.pop_front().unwrap_or_else(CommandOutput::ok))
    }
}
