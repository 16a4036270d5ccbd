//! Session worker: owns the device link on a dedicated thread.
//!
//! The consumer submits intents through a [`SessionHandle`] and reads
//! results from the [`EventReceiver`]; neither side ever waits on the other.
//! All protocol state (ack tracker, block flow, streaming flag) lives on the
//! worker thread and is only written there.

use crate::acks::{AlreadyPending, CommandTracker};
use crate::bridge::{self, EventReceiver, EventSender};
use crate::config::Config;
use crate::flow::BlockFlow;
use crate::model::{Event, SessionStatus, Status, StatusKind};
use crate::protocol::{classify, ClassifyContext, Command, CommandKind};
use crate::sink::{Recorder, TelemetrySink};
use crate::transport::{Notifications, Transport, TransportError, WriteMode};
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

#[cfg(not(test))]
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);
#[cfg(test)]
const SWEEP_INTERVAL: Duration = Duration::from_millis(20);

// Extra time granted to a transport whose scan overruns its own timeout.
#[cfg(not(test))]
const SCAN_GRACE: Duration = Duration::from_secs(5);
#[cfg(test)]
const SCAN_GRACE: Duration = Duration::from_millis(50);

pub type SessionDebugHandle = Arc<Mutex<SessionDebugStatus>>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub address: String,
    pub scan_timeout: Duration,
    pub ack_timeout: Duration,
    pub record_size: u64,
    pub block_ack_mode: WriteMode,
    pub bridge_capacity: usize,
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            address: config.device.address.trim().to_string(),
            scan_timeout: Duration::from_millis(config.device.scan_timeout_ms),
            ack_timeout: Duration::from_millis(config.protocol.ack_timeout_ms),
            record_size: config.protocol.record_size_bytes,
            block_ack_mode: if config.protocol.block_ack_with_response {
                WriteMode::WithResponse
            } else {
                WriteMode::WithoutResponse
            },
            bridge_capacity: config.bridge.capacity,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SessionDebugStatus {
    pub status: SessionStatus,
    pub session_id: Option<String>,
    pub address: String,
    pub pending: Vec<CommandKind>,
    pub transfer_active: bool,
    pub blocks_acked: u64,
    pub records_appended: u64,
    pub records_dropped: u64,
    pub events_overflowed: u64,
    pub last_notice: Option<String>,
    pub updated_ts_unix_ms: Option<u64>,
}

#[derive(Debug)]
enum Intent {
    Connect,
    Send(Command),
    Close,
    Shutdown,
}

/// Consumer-side handle. Every method returns immediately; outcomes arrive
/// on the event bridge.
#[derive(Debug)]
pub struct SessionHandle {
    intents: mpsc::UnboundedSender<Intent>,
    debug: SessionDebugHandle,
    overflow: Arc<AtomicU64>,
    connect_queued: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SessionHandle {
    /// Starts discovery and connection. Ignored while an earlier connect is
    /// still queued or running.
    pub fn connect(&self) {
        if self.connect_queued.swap(true, Ordering::AcqRel) {
            tracing::debug!("connect already in progress");
            return;
        }
        if !self.submit(Intent::Connect) {
            self.connect_queued.store(false, Ordering::Release);
        }
    }

    pub fn send(&self, command: Command) {
        self.submit(Intent::Send(command));
    }

    pub fn close(&self) {
        self.submit(Intent::Close);
    }

    /// Closes the session and waits for the worker thread to exit.
    pub fn shutdown(mut self) {
        self.submit(Intent::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("session worker panicked");
            }
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.debug
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == SessionStatus::Connected
    }

    pub fn debug_status(&self) -> SessionDebugStatus {
        let mut snapshot = self
            .debug
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        snapshot.events_overflowed = self.overflow.load(Ordering::Relaxed);
        snapshot
    }

    fn submit(&self, intent: Intent) -> bool {
        match self.intents.send(intent) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(intent = ?err.0, "session worker is gone");
                false
            }
        }
    }
}

/// Starts the session worker on its own thread.
pub fn spawn_session<T, S>(
    transport: T,
    sink: S,
    config: SessionConfig,
) -> io::Result<(SessionHandle, EventReceiver)>
where
    T: Transport,
    S: TelemetrySink,
{
    let (events, receiver) = bridge::channel(config.bridge_capacity);
    let (intent_tx, intent_rx) = mpsc::unbounded_channel();
    let debug = Arc::new(Mutex::new(SessionDebugStatus {
        address: config.address.clone(),
        ..Default::default()
    }));
    let connect_queued = Arc::new(AtomicBool::new(false));
    let overflow = events.overflow_handle();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let worker = Worker {
        transport,
        tracker: CommandTracker::new(config.ack_timeout),
        config,
        events,
        debug: debug.clone(),
        connect_queued: connect_queued.clone(),
        notifications: None,
        flow: BlockFlow::new(),
        recorder: Recorder::new(sink),
        status: SessionStatus::Disconnected,
        session_id: None,
        records_dropped: 0,
    };
    let join = thread::Builder::new()
        .name("ble-session".to_string())
        .spawn(move || runtime.block_on(worker.run(intent_rx)))?;

    Ok((
        SessionHandle {
            intents: intent_tx,
            debug,
            overflow,
            connect_queued,
            worker: Some(join),
        },
        receiver,
    ))
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn update_debug_status<F>(debug: &SessionDebugHandle, f: F)
where
    F: FnOnce(&mut SessionDebugStatus),
{
    let mut s = debug.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut s);
    s.updated_ts_unix_ms = Some(now_unix_ms());
}

enum Step {
    Intent(Option<Intent>),
    Notification(Option<Vec<u8>>),
    Sweep,
}

async fn next_notification(notifications: &mut Option<Notifications>) -> Option<Vec<u8>> {
    match notifications {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

struct Worker<T, S> {
    transport: T,
    config: SessionConfig,
    events: EventSender,
    debug: SessionDebugHandle,
    connect_queued: Arc<AtomicBool>,
    notifications: Option<Notifications>,
    tracker: CommandTracker,
    flow: BlockFlow,
    recorder: Recorder<S>,
    status: SessionStatus,
    session_id: Option<Uuid>,
    records_dropped: u64,
}

impl<T: Transport, S: TelemetrySink> Worker<T, S> {
    async fn run(mut self, mut intents: mpsc::UnboundedReceiver<Intent>) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                intent = intents.recv() => Step::Intent(intent),
                payload = next_notification(&mut self.notifications) => Step::Notification(payload),
                _ = sweep.tick() => Step::Sweep,
            };
            match step {
                Step::Intent(Some(Intent::Connect)) => self.connect().await,
                Step::Intent(Some(Intent::Send(command))) => self.send(command).await,
                Step::Intent(Some(Intent::Close)) => self.close().await,
                Step::Intent(Some(Intent::Shutdown)) | Step::Intent(None) => break,
                Step::Notification(Some(payload)) => self.on_notification(&payload).await,
                Step::Notification(None) => self.on_link_lost().await,
                Step::Sweep => self.expire_pending(),
            }
        }

        self.close().await;
        tracing::debug!("session worker stopped");
    }

    async fn connect(&mut self) {
        let outcome = self.establish().await;
        // Cleared before the outcome is reported.
        self.connect_queued.store(false, Ordering::Release);
        match outcome {
            Ok(true) => {
                self.set_status(SessionStatus::Connected);
                tracing::info!(session_id = ?self.session_id, address = %self.config.address, "connected");
                self.emit(Event::status(
                    StatusKind::Connected,
                    format!("connected to {}", self.config.address),
                ));
            }
            Ok(false) => self.emit(Event::status(StatusKind::Info, "already connected")),
            Err((kind, message)) => {
                tracing::warn!(address = %self.config.address, reason = %message, "connect attempt failed");
                self.set_status(SessionStatus::Failed);
                self.emit(Event::status(kind, message));
            }
        }
    }

    /// Scans, connects and subscribes. `Ok(false)` when already connected.
    async fn establish(&mut self) -> Result<bool, (StatusKind, String)> {
        if self.status == SessionStatus::Connected {
            return Ok(false);
        }

        let session_id = Uuid::new_v4();
        self.session_id = Some(session_id);
        self.set_status(SessionStatus::Connecting);
        let address = self.config.address.clone();
        tracing::info!(%session_id, address = %address, "connecting");
        self.emit(Event::status(
            StatusKind::Searching,
            format!("searching for {address}"),
        ));

        let scan_timeout = self.config.scan_timeout;
        let scan_deadline = scan_timeout + SCAN_GRACE;
        let devices = tokio::time::timeout(scan_deadline, self.transport.discover(scan_timeout))
            .await
            .unwrap_or(Err(TransportError::Timeout(scan_deadline)))
            .map_err(|err| (StatusKind::Error, format!("scan failed: {err}")))?;

        let target = devices
            .into_iter()
            .find(|d| d.address.eq_ignore_ascii_case(&address))
            .ok_or_else(|| (StatusKind::NotFound, format!("device {address} not found")))?;

        tracing::debug!(name = ?target.name, rssi = ?target.rssi, "device found");
        self.emit(Event::status(
            StatusKind::Connecting,
            format!("connecting to {}", target.address),
        ));
        self.transport
            .connect(&target.address)
            .await
            .map_err(|err| (StatusKind::Error, format!("connect failed: {err}")))?;

        match self.transport.subscribe().await {
            Ok(notifications) => self.notifications = Some(notifications),
            Err(err) => {
                if let Err(err) = self.transport.disconnect().await {
                    tracing::debug!(error = %err, "disconnect after failed subscribe");
                }
                return Err((StatusKind::Error, format!("subscribe failed: {err}")));
            }
        }
        Ok(true)
    }

    async fn send(&mut self, command: Command) {
        let kind = command.kind();
        if self.status != SessionStatus::Connected {
            self.emit(Event::status(
                StatusKind::NotConnected,
                format!("not connected, {kind} not sent; connect first"),
            ));
            return;
        }
        if let Err(AlreadyPending(kind)) = self.tracker.reserve(kind, Instant::now()) {
            self.emit(Event::status(
                StatusKind::Busy,
                format!("{kind} is still waiting for its acknowledgment"),
            ));
            return;
        }

        match kind {
            CommandKind::Fetch => {
                if let Err(err) = self.recorder.start() {
                    self.tracker.release(kind);
                    tracing::warn!(error = %err, "could not open telemetry sink");
                    self.emit(Event::status(
                        StatusKind::Error,
                        format!("cannot start transfer: {err}"),
                    ));
                    self.sync_debug();
                    return;
                }
                self.flow.begin_transfer();
                let target = self
                    .recorder
                    .location()
                    .map(|path| format!(" into {}", path.display()))
                    .unwrap_or_default();
                self.emit(Event::status(
                    StatusKind::Info,
                    format!("telemetry transfer started{target}"),
                ));
            }
            CommandKind::Reset => self.abort_transfer("device reset requested"),
            _ => {}
        }

        let payload = command.encode();
        match self
            .transport
            .write(payload.as_bytes(), WriteMode::WithResponse)
            .await
        {
            Ok(()) => {
                tracing::debug!(command = %payload, "command sent");
                self.emit(Event::status(StatusKind::Debug, format!("sent {payload}")));
            }
            Err(err) => {
                self.tracker.release(kind);
                tracing::warn!(command = %payload, error = %err, "command write failed");
                self.emit(Event::status(
                    StatusKind::Error,
                    format!("failed to send {payload}: {err}"),
                ));
                if kind == CommandKind::Fetch {
                    self.abort_transfer("FETCH was not delivered");
                }
            }
        }
        self.sync_debug();
    }

    async fn close(&mut self) {
        self.abort_transfer("session closed");
        if self.status != SessionStatus::Connected && self.notifications.is_none() {
            return;
        }

        self.notifications = None;
        if let Err(err) = self.transport.disconnect().await {
            tracing::warn!(error = %err, "disconnect failed");
        }
        self.tracker.clear();
        self.set_status(SessionStatus::Disconnected);
        tracing::info!(address = %self.config.address, "disconnected");
        self.emit(Event::status(StatusKind::Disconnected, "disconnected"));
    }

    async fn on_link_lost(&mut self) {
        tracing::warn!(address = %self.config.address, "connection lost");
        self.notifications = None;
        self.abort_transfer("connection lost");
        self.tracker.clear();
        if let Err(err) = self.transport.disconnect().await {
            tracing::debug!(error = %err, "disconnect after link loss");
        }
        self.set_status(SessionStatus::Disconnected);
        self.emit(Event::status(StatusKind::Disconnected, "connection lost"));
    }

    async fn on_notification(&mut self, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            self.on_line(line).await;
        }
        self.sync_debug();
    }

    async fn on_line(&mut self, line: &str) {
        let ctx = ClassifyContext {
            streaming: self.recorder.is_active(),
            record_size: self.config.record_size,
        };
        let now = Instant::now();

        match classify(line, &ctx) {
            Event::BlockWait { block } => {
                self.emit(Event::BlockWait {
                    block: block.clone(),
                });
                let ack = self.flow.on_block_wait(block);
                self.write_protocol(&ack).await;
                self.flow.ack_issued(self.recorder.is_active());
            }
            Event::EndOfStream => {
                self.emit(Event::EndOfStream);
                let ack = self.flow.on_end_of_stream();
                self.write_protocol(&ack).await;
                self.tracker.resolve_end_of_stream(now);
                self.finish_transfer();
            }
            Event::Ack { kind } => {
                match self.tracker.resolve_ack(&kind, now) {
                    Some((command, elapsed)) => {
                        tracing::debug!(%command, elapsed_ms = elapsed.as_millis() as u64, "acknowledged");
                    }
                    None => tracing::debug!(ack = %kind, "acknowledgment with nothing outstanding"),
                }
                self.emit(Event::Ack { kind });
            }
            Event::MemoryReport(report) => {
                self.tracker.resolve_memory_report(now);
                self.emit(Event::MemoryReport(report));
            }
            Event::DataRecord { fields } => {
                if let Err(err) = self.recorder.append(&fields) {
                    tracing::warn!(error = %err, "telemetry sink write failed");
                    self.emit(Event::status(
                        StatusKind::Error,
                        format!("telemetry sink failed: {err}"),
                    ));
                    self.abort_transfer("sink write failed");
                }
                self.emit(Event::DataRecord { fields });
            }
            Event::Status(Status {
                kind: StatusKind::MalformedRecord,
                message,
            }) => {
                self.records_dropped += 1;
                tracing::trace!(line = %message, "discarding malformed record");
            }
            other => self.emit(other),
        }
    }

    /// Block acknowledgments go out in the configured mode; the device
    /// paces the transfer, so a failure is reported but not retried.
    async fn write_protocol(&mut self, command: &Command) {
        let payload = command.encode();
        match self
            .transport
            .write(payload.as_bytes(), self.config.block_ack_mode)
            .await
        {
            Ok(()) => tracing::debug!(command = %payload, "block acknowledged"),
            Err(err) => {
                tracing::warn!(command = %payload, error = %err, "block acknowledgment failed");
                self.emit(Event::status(
                    StatusKind::Error,
                    format!("failed to send {payload}: {err}"),
                ));
            }
        }
    }

    fn finish_transfer(&mut self) {
        let records = self.recorder.records_appended();
        match self.recorder.finish() {
            Ok(false) => {}
            Ok(true) => {
                tracing::info!(records, dropped = self.records_dropped, "telemetry transfer complete");
                self.emit(Event::status(
                    StatusKind::Info,
                    format!("telemetry transfer complete ({records} records)"),
                ));
            }
            Err(err) => {
                tracing::warn!(error = %err, "closing telemetry sink failed");
                self.emit(Event::status(
                    StatusKind::Error,
                    format!("closing telemetry sink failed: {err}"),
                ));
            }
        }
        self.sync_debug();
    }

    fn abort_transfer(&mut self, reason: &str) {
        match self.recorder.finish() {
            Ok(false) => return,
            Ok(true) => {
                tracing::info!(reason, records = self.recorder.records_appended(), "telemetry transfer aborted");
                self.emit(Event::status(
                    StatusKind::Info,
                    format!("telemetry transfer aborted: {reason}"),
                ));
            }
            Err(err) => {
                tracing::warn!(reason, error = %err, "telemetry transfer aborted, sink close failed");
                self.emit(Event::status(
                    StatusKind::Error,
                    format!("telemetry transfer aborted ({reason}), closing sink failed: {err}"),
                ));
            }
        }
        self.flow.abort();
        self.sync_debug();
    }

    fn expire_pending(&mut self) {
        let expired = self.tracker.expire(Instant::now());
        if expired.is_empty() {
            return;
        }
        for kind in expired {
            tracing::warn!(command = %kind, "acknowledgment timed out");
            self.emit(Event::status(
                StatusKind::Error,
                format!(
                    "no acknowledgment for {kind} within {} ms",
                    self.config.ack_timeout.as_millis()
                ),
            ));
        }
        self.sync_debug();
    }

    fn emit(&self, event: Event) {
        if let Event::Status(status) = &event {
            if status.kind != StatusKind::Debug {
                let notice = status.message.clone();
                update_debug_status(&self.debug, |s| s.last_notice = Some(notice));
            }
        }
        self.events.push(event);
    }

    fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.sync_debug();
    }

    fn sync_debug(&self) {
        let pending = self.tracker.pending_kinds();
        update_debug_status(&self.debug, |s| {
            s.status = self.status;
            s.session_id = self.session_id.map(|id| id.to_string());
            s.pending = pending;
            s.transfer_active = self.recorder.is_active();
            s.blocks_acked = self.flow.blocks_acked();
            s.records_appended = self.recorder.records_appended();
            s.records_dropped = self.records_dropped;
        });
    }
}
