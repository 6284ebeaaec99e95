use btleplug::{
    api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter},
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use futures::stream::StreamExt;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::{Duration, Instant, SystemTime},
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    ble::{
        advertisement_matches, merge_scanned_device, scanned_device_from, CharacteristicTarget,
        DefaultPlatformHooks, PeripheralTransport, PlatformHooks, Transport,
    },
    codec::{self, CommandAck, RxFrame},
    error::{KinetraError, Result},
    polling::{EngineCommand, EngineOutputs, PollingEngine},
    queue::OperationQueue,
    types::{
        ConnectionConfig, ConnectionState, DetectorConfig, DiagnosticPacket, HandleActivityState,
        MonitorSource, PollingConfig, ReconnectionRequest, RepNotification, SafetyEvent,
        ScannedDevice, WorkoutMetric,
    },
};

/// Telemetry ring-buffer depth. Broadcast channels drop the *oldest* entry
/// for a lagging consumer, so a slow subscriber loses stale samples rather
/// than current ones.
const METRIC_STREAM_CAPACITY: usize = 256;
const REP_STREAM_CAPACITY: usize = 64;
const SAFETY_STREAM_CAPACITY: usize = 64;
const DIAGNOSTIC_STREAM_CAPACITY: usize = 32;
const RECONNECT_STREAM_CAPACITY: usize = 16;

/// All per-connection mutable state, built fresh on each connect and
/// discarded whole on disconnect
///
/// Holding it as one replaceable value (instead of a pile of individually
/// reset fields) means a new session can never inherit half-cleared state
/// from the previous one.
pub(crate) struct Session {
    pub(crate) transport: Arc<PeripheralTransport>,
    pub(crate) engine: PollingEngine,
    pub(crate) tasks: Vec<JoinHandle<()>>,
    pub(crate) device_name: String,
    pub(crate) device_address: String,
    pub(crate) last_ack: Arc<StdMutex<Option<CommandAck>>>,
    pub(crate) disco: Option<JoinHandle<()>>,
    pub(crate) started: Instant,
}

/// Decides whether an observed transport disconnect warrants a
/// [`ReconnectionRequest`]
///
/// A freshly created transport reports an idle/disconnected state before any
/// connect; `was_ever_connected` filters that out so it cannot masquerade as
/// a dropped connection. At most one request is ever emitted per gate.
#[derive(Debug, Default)]
pub(crate) struct ReconnectGate {
    was_ever_connected: bool,
    emitted: bool,
}

impl ReconnectGate {
    pub(crate) const fn new() -> Self {
        Self {
            was_ever_connected: false,
            emitted: false,
        }
    }

    /// The transport reached the connected state
    pub(crate) fn on_connected(&mut self) {
        self.was_ever_connected = true;
    }

    /// The transport reported a disconnect; returns true when a reconnection
    /// request should be emitted
    ///
    /// The first disconnect after a real connection closes the gate whether
    /// or not it was explicit; an idle report before any connection leaves it
    /// open.
    pub(crate) fn on_disconnected(&mut self, explicit: bool) -> bool {
        if !self.was_ever_connected || self.emitted {
            return false;
        }
        self.emitted = true;
        !explicit
    }
}

/// Retry a connect attempt a fixed number of times
///
/// Each attempt runs under a hard timeout so a wedged low-level connect
/// cannot hang the state machine; a timeout counts exactly like a connection
/// failure for retry purposes.
pub(crate) async fn connect_with_retry<F, Fut>(
    attempts: u32,
    retry_delay: Duration,
    attempt_timeout: Duration,
    mut attempt: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let attempts = attempts.max(1);
    let mut last_error = KinetraError::Timeout {
        timeout_ms: attempt_timeout.as_millis() as u64,
    };

    for n in 1..=attempts {
        match timeout(attempt_timeout, attempt()).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => {
                warn!("Connect attempt {n}/{attempts} failed: {e}");
                last_error = e;
            }
            Err(_) => {
                warn!(
                    "Connect attempt {n}/{attempts} timed out after {}ms",
                    attempt_timeout.as_millis()
                );
                last_error = KinetraError::Timeout {
                    timeout_ms: attempt_timeout.as_millis() as u64,
                };
            }
        }
        if n < attempts {
            sleep(retry_delay).await;
        }
    }

    Err(KinetraError::ConnectionFailed(format!(
        "{attempts} attempts exhausted, last error: {last_error}"
    )))
}

/// Main interface to a Kinetra resistance trainer
///
/// `KinetraDevice` owns the connection lifecycle (scan, connect with retry,
/// disconnect, reconnect signaling), the operation queue serializing all BLE
/// traffic, and the polling engine that turns raw characteristic reads into
/// the typed streams the rest of an application consumes.
///
/// All outputs are one-way streams: a connection-state watch, a live
/// scanned-device list, a handle-activity watch, and bounded broadcast
/// channels for metrics, reps, safety events, diagnostics and reconnection
/// requests. Nothing hands out the peripheral itself.
///
/// # Examples
///
/// ```no_run
/// use kinetra::KinetraDevice;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let device = KinetraDevice::new().await?;
///
///     let found = device.scan().await?;
///     let target = found.first().ok_or("no trainer in range")?;
///     device.connect(target).await?;
///
///     let mut metrics = device.metrics();
///     while let Ok(metric) = metrics.recv().await {
///         println!("pos A: {:.1} mm @ {:.1} kg", metric.position_a, metric.load_a);
///     }
///     Ok(())
/// }
/// ```
pub struct KinetraDevice {
    adapter: Adapter,
    connection_config: ConnectionConfig,
    polling_config: PollingConfig,
    detector_config: DetectorConfig,
    hooks: Arc<dyn PlatformHooks>,
    pub(crate) queue: Arc<OperationQueue>,
    pub(crate) session: Arc<Mutex<Option<Session>>>,
    explicit_disconnect: Arc<AtomicBool>,
    scan_stop: Arc<AtomicBool>,
    state_tx: watch::Sender<ConnectionState>,
    scanned_tx: watch::Sender<Vec<ScannedDevice>>,
    handle_state_tx: watch::Sender<HandleActivityState>,
    metrics_tx: broadcast::Sender<WorkoutMetric>,
    reps_tx: broadcast::Sender<RepNotification>,
    safety_tx: broadcast::Sender<SafetyEvent>,
    diagnostics_tx: broadcast::Sender<DiagnosticPacket>,
    reconnect_tx: broadcast::Sender<ReconnectionRequest>,
}

impl KinetraDevice {
    /// Create a device handle on the first Bluetooth adapter, with default
    /// configuration and no-op platform hooks
    ///
    /// # Errors
    ///
    /// Returns [`KinetraError::DeviceNotFound`] when no Bluetooth adapter is
    /// available, or [`KinetraError::Ble`] if the adapter cannot be
    /// initialized.
    pub async fn new() -> Result<Self> {
        Self::with_config(
            ConnectionConfig::default(),
            PollingConfig::default(),
            DetectorConfig::default(),
        )
        .await
    }

    /// Create a device handle with custom configuration
    ///
    /// # Errors
    ///
    /// Returns [`KinetraError::DeviceNotFound`] when no Bluetooth adapter is
    /// available.
    pub async fn with_config(
        connection_config: ConnectionConfig,
        polling_config: PollingConfig,
        detector_config: DetectorConfig,
    ) -> Result<Self> {
        Self::with_config_and_hooks(
            connection_config,
            polling_config,
            detector_config,
            Arc::new(DefaultPlatformHooks),
        )
        .await
    }

    /// Create a device handle with custom configuration and platform hooks
    ///
    /// Hooks carry the platform-specific link tuning (MTU negotiation,
    /// connection priority) that has no portable BLE surface; the defaults do
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns [`KinetraError::DeviceNotFound`] when no Bluetooth adapter is
    /// available.
    pub async fn with_config_and_hooks(
        connection_config: ConnectionConfig,
        polling_config: PollingConfig,
        detector_config: DetectorConfig,
        hooks: Arc<dyn PlatformHooks>,
    ) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters.into_iter().next().ok_or(KinetraError::DeviceNotFound)?;

        Ok(Self {
            adapter,
            connection_config,
            polling_config,
            detector_config,
            hooks,
            queue: Arc::new(OperationQueue::new()),
            session: Arc::new(Mutex::new(None)),
            explicit_disconnect: Arc::new(AtomicBool::new(false)),
            scan_stop: Arc::new(AtomicBool::new(false)),
            state_tx: watch::channel(ConnectionState::Disconnected).0,
            scanned_tx: watch::channel(Vec::new()).0,
            handle_state_tx: watch::channel(HandleActivityState::WaitingForRest).0,
            metrics_tx: broadcast::channel(METRIC_STREAM_CAPACITY).0,
            reps_tx: broadcast::channel(REP_STREAM_CAPACITY).0,
            safety_tx: broadcast::channel(SAFETY_STREAM_CAPACITY).0,
            diagnostics_tx: broadcast::channel(DIAGNOSTIC_STREAM_CAPACITY).0,
            reconnect_tx: broadcast::channel(RECONNECT_STREAM_CAPACITY).0,
        })
    }

    // --- observables ------------------------------------------------------

    /// Watch the connection state
    #[must_use]
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Current connection state
    #[must_use]
    pub fn current_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Watch the live scanned-device list, ordered by signal strength
    #[must_use]
    pub fn scanned_devices(&self) -> watch::Receiver<Vec<ScannedDevice>> {
        self.scanned_tx.subscribe()
    }

    /// Watch the handle-activity state
    #[must_use]
    pub fn handle_activity(&self) -> watch::Receiver<HandleActivityState> {
        self.handle_state_tx.subscribe()
    }

    /// Subscribe to the telemetry stream
    #[must_use]
    pub fn metrics(&self) -> broadcast::Receiver<WorkoutMetric> {
        self.metrics_tx.subscribe()
    }

    /// Subscribe to rep-completion notifications
    #[must_use]
    pub fn reps(&self) -> broadcast::Receiver<RepNotification> {
        self.reps_tx.subscribe()
    }

    /// Subscribe to one-shot deload and range-of-motion safety events
    #[must_use]
    pub fn safety_events(&self) -> broadcast::Receiver<SafetyEvent> {
        self.safety_tx.subscribe()
    }

    /// Subscribe to diagnostic packets
    #[must_use]
    pub fn diagnostics(&self) -> broadcast::Receiver<DiagnosticPacket> {
        self.diagnostics_tx.subscribe()
    }

    /// Subscribe to reconnection requests
    ///
    /// One request is emitted per unexpected disconnect; explicit
    /// [`disconnect`](Self::disconnect) never produces one. The crate never
    /// reconnects on its own.
    #[must_use]
    pub fn reconnection_requests(&self) -> broadcast::Receiver<ReconnectionRequest> {
        self.reconnect_tx.subscribe()
    }

    /// Whether the link is currently up
    pub async fn is_connected(&self) -> bool {
        match self.session.lock().await.as_ref() {
            Some(session) => session.transport.is_connected().await,
            None => false,
        }
    }

    // --- scanning ---------------------------------------------------------

    /// Scan for Kinetra trainers
    ///
    /// Filters advertisements by the known name prefix or by service
    /// UUID/service-data match, deduplicates by address (named devices
    /// supersede placeholders), and publishes the RSSI-ordered list live on
    /// the [`scanned_devices`](Self::scanned_devices) watch while the scan
    /// runs. The scan ends after the configured timeout.
    ///
    /// A failed scan lands back in `Disconnected` like a successful one, so
    /// the action is always retryable from the same caller affordance.
    ///
    /// # Errors
    ///
    /// Returns [`KinetraError::NotReady`] when called while connected, or
    /// [`KinetraError::ScanFailed`] when discovery cannot be started.
    pub async fn scan(&self) -> Result<Vec<ScannedDevice>> {
        if self.session.lock().await.is_some() {
            return Err(KinetraError::NotReady {
                reason: "Disconnect before scanning".to_string(),
            });
        }

        info!("Starting scan for Kinetra trainers...");
        self.scan_stop.store(false, Ordering::SeqCst);
        self.state_tx.send_replace(ConnectionState::Scanning);
        self.scanned_tx.send_replace(Vec::new());

        let result = self.scan_inner().await;

        let _ = self.adapter.stop_scan().await;
        self.state_tx.send_replace(ConnectionState::Disconnected);

        match result {
            Ok(devices) => {
                info!("Scan completed. Found {} trainer(s)", devices.len());
                Ok(devices)
            }
            Err(e) => {
                warn!("Scan failed: {e}");
                Err(e)
            }
        }
    }

    async fn scan_inner(&self) -> Result<Vec<ScannedDevice>> {
        let mut events = self.adapter.events().await?;

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| KinetraError::ScanFailed(e.to_string()))?;

        let deadline =
            Instant::now() + Duration::from_millis(self.connection_config.scan_timeout_ms);
        let mut devices: Vec<ScannedDevice> = Vec::new();

        loop {
            if self.scan_stop.load(Ordering::SeqCst) {
                info!("Scan stopped on request");
                break;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            // Wait in short slices so an explicit stop stays responsive even
            // when no advertisements arrive.
            let slice = remaining.min(Duration::from_millis(250));
            match timeout(slice, events.next()).await {
                Ok(Some(
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id),
                )) => {
                    let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                        continue;
                    };
                    let Ok(Some(properties)) = peripheral.properties().await else {
                        continue;
                    };
                    if !advertisement_matches(&properties) {
                        continue;
                    }

                    let device =
                        scanned_device_from(peripheral.address().to_string(), &properties);
                    debug!("Discovered {} ({} dBm)", device.display_name(), device.rssi);
                    merge_scanned_device(&mut devices, device);
                    self.scanned_tx.send_replace(devices.clone());
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {} // slice elapsed, loop re-checks stop flag and deadline
            }
        }

        Ok(devices)
    }

    /// Stop an in-flight scan early
    ///
    /// The running [`scan`](Self::scan) call returns the devices found so
    /// far. A no-op when no scan is running.
    pub fn stop_scan(&self) {
        self.scan_stop.store(true, Ordering::SeqCst);
    }

    // --- connecting -------------------------------------------------------

    /// Connect to a scanned device
    ///
    /// Any existing connection is torn down first (polling cancelled, link
    /// dropped, session cleared), which also makes overlapping connect calls
    /// safe. The underlying connect attempt is retried up to the configured
    /// count, each attempt under its own hard timeout; exhausting the retries
    /// restores `Disconnected` and surfaces the failure.
    ///
    /// On success the session reads the firmware string best-effort, applies
    /// the platform hooks, subscribes to notifications, starts polling and
    /// transitions to `Connected`.
    ///
    /// # Errors
    ///
    /// Returns [`KinetraError::DeviceNotFound`] when the address is unknown
    /// to the adapter, or [`KinetraError::ConnectionFailed`] when every
    /// attempt failed.
    pub async fn connect(&self, device: &ScannedDevice) -> Result<()> {
        // Idempotent cleanup so a half-open previous link can never leak an
        // orphaned hardware connection.
        self.teardown().await;
        self.explicit_disconnect.store(false, Ordering::SeqCst);

        info!("Connecting to {}", device.display_name());
        self.state_tx.send_replace(ConnectionState::Connecting);

        match self.connect_inner(device).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.teardown().await;
                self.state_tx.send_replace(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn connect_inner(&self, device: &ScannedDevice) -> Result<()> {
        let peripheral = self.find_peripheral(&device.address).await?;

        connect_with_retry(
            self.connection_config.connect_attempts,
            Duration::from_millis(self.connection_config.connect_retry_delay_ms),
            Duration::from_millis(self.connection_config.connect_timeout_ms),
            || async {
                peripheral.connect().await?;
                Ok(())
            },
        )
        .await?;

        // From here the link is up; a failed setup step must not leave an
        // orphaned hardware connection behind.
        match self.setup_session(device, &peripheral).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = peripheral.disconnect().await;
                Err(e)
            }
        }
    }

    async fn setup_session(&self, device: &ScannedDevice, peripheral: &Peripheral) -> Result<()> {
        peripheral.discover_services().await?;
        let transport = Arc::new(PeripheralTransport::resolve(peripheral.clone())?);

        let (_firmware, model) = self.read_device_strings(transport.as_ref()).await;

        if let Err(e) = self.hooks.negotiate_mtu(peripheral).await {
            debug!("MTU negotiation unavailable: {e}");
        }
        if let Err(e) = self.hooks.request_connection_priority(peripheral).await {
            debug!("Connection priority request unavailable: {e}");
        }

        transport.subscribe(CharacteristicTarget::Reps).await?;
        transport.subscribe(CharacteristicTarget::Rx).await?;

        let engine = PollingEngine::start(
            transport.clone(),
            self.queue.clone(),
            self.polling_config.clone(),
            self.detector_config.clone(),
            EngineOutputs {
                metrics: self.metrics_tx.clone(),
                safety: self.safety_tx.clone(),
                diagnostics: self.diagnostics_tx.clone(),
                handle_state: self.handle_state_tx.clone(),
            },
        );

        let device_name = device.display_name().to_string();
        let last_ack = Arc::new(StdMutex::new(None));

        let mut tasks = Vec::new();
        tasks.push(Self::spawn_notification_task(
            transport.clone(),
            engine.intake(),
            self.reps_tx.clone(),
            last_ack.clone(),
        ));
        tasks.push(Self::spawn_lifecycle_observer(
            self.adapter.clone(),
            peripheral.id(),
            device_name.clone(),
            device.address.clone(),
            self.explicit_disconnect.clone(),
            self.state_tx.clone(),
            self.reconnect_tx.clone(),
        ));

        *self.session.lock().await = Some(Session {
            transport,
            engine,
            tasks,
            device_name: device_name.clone(),
            device_address: device.address.clone(),
            last_ack,
            disco: None,
            started: Instant::now(),
        });

        self.state_tx.send_replace(ConnectionState::Connected {
            name: device_name.clone(),
            address: device.address.clone(),
            model,
        });

        info!("Successfully connected to {device_name}");
        Ok(())
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral> {
        let peripherals = self.adapter.peripherals().await?;
        peripherals
            .into_iter()
            .find(|p| p.address().to_string() == address)
            .ok_or(KinetraError::DeviceNotFound)
    }

    /// Best-effort reads of the firmware and version strings; failures are
    /// logged and ignored.
    async fn read_device_strings(
        &self,
        transport: &PeripheralTransport,
    ) -> (Option<String>, Option<String>) {
        let firmware = match self
            .queue
            .read(transport, CharacteristicTarget::Firmware)
            .await
        {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes).trim().to_string();
                if text.is_empty() {
                    None
                } else {
                    info!("Device firmware: {text}");
                    Some(text)
                }
            }
            Err(e) => {
                debug!("Firmware string unavailable: {e}");
                None
            }
        };

        let model = match self
            .queue
            .read(transport, CharacteristicTarget::Version)
            .await
        {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes).trim().to_string();
                if text.is_empty() {
                    None
                } else {
                    debug!("Device version info: {text}");
                    Some(text)
                }
            }
            Err(e) => {
                debug!("Version info unavailable: {e}");
                None
            }
        };

        match self.queue.read(transport, CharacteristicTarget::Mode).await {
            Ok(bytes) => debug!("Device mode bytes: {bytes:02X?}"),
            Err(e) => debug!("Mode info unavailable: {e}"),
        }

        (firmware, model)
    }

    fn spawn_notification_task(
        transport: Arc<PeripheralTransport>,
        intake: tokio::sync::mpsc::Sender<EngineCommand>,
        reps_tx: broadcast::Sender<RepNotification>,
        last_ack: Arc<StdMutex<Option<CommandAck>>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut stream = match transport.peripheral().notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Notification stream unavailable: {e}");
                    return;
                }
            };

            let reps_uuid = CharacteristicTarget::Reps.uuid();
            let rx_uuid = CharacteristicTarget::Rx.uuid();

            while let Some(notification) = stream.next().await {
                if notification.uuid == reps_uuid {
                    match codec::decode_rep_notification(&notification.value, false) {
                        Some(rep) => {
                            let _ = reps_tx.send(rep);
                        }
                        None => debug!(
                            "Dropped short rep payload ({} bytes)",
                            notification.value.len()
                        ),
                    }
                } else if notification.uuid == rx_uuid {
                    match codec::parse_rx_frame(&notification.value) {
                        Some(RxFrame::Metric(packet)) => {
                            let _ = intake.try_send(EngineCommand::Sample {
                                packet,
                                source: MonitorSource::RxNotification,
                            });
                        }
                        Some(RxFrame::Rep(rep)) => {
                            let _ = reps_tx.send(rep);
                        }
                        Some(RxFrame::Ack(ack)) => {
                            debug!("Command ack: opcode {:02X}", ack.opcode);
                            if let Ok(mut guard) = last_ack.lock() {
                                *guard = Some(ack);
                            }
                        }
                        None => {}
                    }
                }
            }
        })
    }

    fn spawn_lifecycle_observer(
        adapter: Adapter,
        peripheral_id: PeripheralId,
        device_name: String,
        device_address: String,
        explicit: Arc<AtomicBool>,
        state_tx: watch::Sender<ConnectionState>,
        reconnect_tx: broadcast::Sender<ReconnectionRequest>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut gate = ReconnectGate::new();
            // The link was already up when this observer started.
            gate.on_connected();

            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Lifecycle event stream unavailable: {e}");
                    return;
                }
            };

            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceConnected(id) if id == peripheral_id => {
                        gate.on_connected();
                    }
                    CentralEvent::DeviceDisconnected(id) if id == peripheral_id => {
                        let explicit_now = explicit.load(Ordering::SeqCst);
                        if gate.on_disconnected(explicit_now) {
                            warn!("Unexpected disconnect from {device_name}");
                            let _ = reconnect_tx.send(ReconnectionRequest {
                                device_name: device_name.clone(),
                                device_address: device_address.clone(),
                                reason: "transport reported disconnect".to_string(),
                                timestamp: SystemTime::now(),
                            });
                        } else {
                            info!("Disconnect from {device_name} (explicit), no reconnect signal");
                        }
                        state_tx.send_replace(ConnectionState::Disconnected);
                        break;
                    }
                    _ => {}
                }
            }
        })
    }

    // --- disconnecting ----------------------------------------------------

    /// Disconnect explicitly
    ///
    /// Sets the explicit flag (suppressing any reconnection request), cancels
    /// polling before releasing the transport handle, and always lands in
    /// `Disconnected`. Teardown failures are logged, never surfaced: there is
    /// nothing a caller could do with them.
    pub async fn disconnect(&self) {
        info!("Disconnecting (explicit)");
        self.explicit_disconnect.store(true, Ordering::SeqCst);
        self.teardown().await;
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Idempotent session teardown: stop polling first, then drop the link.
    async fn teardown(&self) {
        let session = self.session.lock().await.take();
        if let Some(mut session) = session {
            session.engine.stop();
            if let Some(disco) = session.disco.take() {
                disco.abort();
            }
            for task in session.tasks.drain(..) {
                task.abort();
            }
            if let Err(e) = session.transport.disconnect().await {
                debug!("Disconnect during teardown: {e}");
            }
            self.handle_state_tx
                .send_replace(HandleActivityState::WaitingForRest);
            debug!(
                "Session for {} torn down after {:?}",
                session.device_name,
                session.started.elapsed()
            );
        }
    }
}

impl Drop for KinetraDevice {
    fn drop(&mut self) {
        let session = self.session.clone();
        tokio::spawn(async move {
            if let Some(mut session) = session.lock().await.take() {
                session.engine.stop();
                if let Some(disco) = session.disco.take() {
                    disco.abort();
                }
                for task in session.tasks.drain(..) {
                    task.abort();
                }
                let _ = session.transport.disconnect().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_initial_idle_state_never_signals_reconnect() {
        // A transport reports disconnected before any connect; the gate must
        // filter that out.
        let mut gate = ReconnectGate::new();
        assert!(!gate.on_disconnected(false));
    }

    #[test]
    fn test_explicit_disconnect_never_signals_reconnect() {
        let mut gate = ReconnectGate::new();
        gate.on_connected();
        assert!(!gate.on_disconnected(true));
        // The explicit disconnect closed the gate for good.
        assert!(!gate.on_disconnected(false));
    }

    #[test]
    fn test_unexpected_disconnect_signals_exactly_once() {
        let mut gate = ReconnectGate::new();
        gate.on_connected();
        assert!(gate.on_disconnected(false));
        assert!(!gate.on_disconnected(false));
    }

    #[tokio::test]
    async fn test_connect_retry_exhaustion() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        // An attempt that never completes: every try must hit its own hard
        // timeout and count as a failure.
        let result = connect_with_retry(
            3,
            Duration::from_millis(10),
            Duration::from_millis(30),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { std::future::pending::<Result<()>>().await }
            },
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(matches!(result, Err(KinetraError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_connect_retry_succeeds_midway() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = connect_with_retry(
            3,
            Duration::from_millis(10),
            Duration::from_millis(30),
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(KinetraError::Timeout { timeout_ms: 1 })
                    } else {
                        Ok(())
                    }
                }
            },
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
