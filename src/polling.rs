//! Adaptive polling engine.
//!
//! Owns the periodic reads against the monitor, diagnostic and heuristic
//! characteristics plus the single task that mutates the handle-activity
//! detector. Every read goes through the operation queue; a tick that cannot
//! acquire the queue within the configured window is skipped rather than
//! queued, so a congested link sheds poll load instead of building a backlog.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant, SystemTime};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    ble::{CharacteristicTarget, Transport},
    codec,
    error::KinetraError,
    handle_state::{HandleSample, HandleStateDetector, VelocityTracker},
    queue::OperationQueue,
    types::{
        DetectorConfig, DiagnosticPacket, HandleActivityState, MonitorPacket, MonitorSource,
        PollingConfig, SafetyEvent, WorkoutMetric,
    },
};

/// Capacity of the intake channel between poll/notify producers and the
/// sample processor. Overflow drops the incoming sample; the next poll tick
/// is at most 10 ms away.
const INTAKE_CAPACITY: usize = 64;

/// Work accepted by the sample-processor task
#[derive(Debug)]
pub(crate) enum EngineCommand {
    /// A decoded monitor packet from either wire path
    Sample {
        /// The decoded packet
        packet: MonitorPacket,
        /// Which characteristic produced it
        source: MonitorSource,
    },
    /// Re-arm set detection at a set boundary
    ResetDetector,
}

/// Outbound channels the engine publishes on
pub(crate) struct EngineOutputs {
    pub metrics: broadcast::Sender<WorkoutMetric>,
    pub safety: broadcast::Sender<SafetyEvent>,
    pub diagnostics: broadcast::Sender<DiagnosticPacket>,
    pub handle_state: watch::Sender<HandleActivityState>,
}

/// Turns validated monitor packets into metrics, state updates and safety
/// events
///
/// Owned by exactly one task: this is the sole mutator of the handle-activity
/// detector.
pub(crate) struct SampleProcessor {
    detector: HandleStateDetector,
    velocity_a: VelocityTracker,
    velocity_b: VelocityTracker,
    outputs: EngineOutputs,
}

impl SampleProcessor {
    pub(crate) fn new(config: DetectorConfig, outputs: EngineOutputs) -> Self {
        let alpha = config.ema_alpha;
        Self {
            detector: HandleStateDetector::new(config),
            velocity_a: VelocityTracker::new(alpha),
            velocity_b: VelocityTracker::new(alpha),
            outputs,
        }
    }

    /// Process one packet stamped `now_ms` milliseconds into the session
    pub(crate) fn process(&mut self, packet: &MonitorPacket, now_ms: u64) {
        // The detector watches the dominant cable; a single-handle movement
        // must arm detection just like a two-handle lift.
        let sample = HandleSample {
            timestamp_ms: now_ms,
            position_mm: packet.pos_a_mm.max(packet.pos_b_mm),
            load_kg: packet.load_a_kg + packet.load_b_kg,
        };

        let update = self.detector.process(&sample);
        if !update.accepted {
            return;
        }

        let velocity_a = self.velocity_a.update(now_ms, packet.pos_a_mm);
        let velocity_b = self.velocity_b.update(now_ms, packet.pos_b_mm);

        let _ = self.outputs.metrics.send(WorkoutMetric {
            timestamp: SystemTime::now(),
            load_a: packet.load_a_kg,
            load_b: packet.load_b_kg,
            position_a: packet.pos_a_mm,
            position_b: packet.pos_b_mm,
            velocity_a,
            velocity_b,
        });

        if let Some(state) = update.transition {
            self.outputs.handle_state.send_replace(state);
        }

        for event in update.events {
            let _ = self.outputs.safety.send(event);
        }
    }

    pub(crate) fn reset(&mut self) {
        self.detector.reset();
        self.outputs
            .handle_state
            .send_replace(HandleActivityState::WaitingForRest);
    }
}

/// The per-session poll loops and the sample-processor task
///
/// Built fresh on every connect and stopped (then dropped) on disconnect;
/// no polling state survives a session.
pub(crate) struct PollingEngine {
    intake: mpsc::Sender<EngineCommand>,
    running: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PollingEngine {
    /// Spawn the processor task and the three poll loops
    pub(crate) fn start(
        transport: Arc<dyn Transport>,
        queue: Arc<OperationQueue>,
        config: PollingConfig,
        detector_config: DetectorConfig,
        outputs: EngineOutputs,
    ) -> Self {
        let (intake, mut intake_rx) = mpsc::channel::<EngineCommand>(INTAKE_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));
        let started = Instant::now();
        let mut tasks = Vec::new();

        let diagnostics = outputs.diagnostics.clone();
        let mut processor = SampleProcessor::new(detector_config, outputs);
        tasks.push(tokio::spawn(async move {
            while let Some(command) = intake_rx.recv().await {
                match command {
                    EngineCommand::Sample { packet, .. } => {
                        let now_ms = started.elapsed().as_millis() as u64;
                        processor.process(&packet, now_ms);
                    }
                    EngineCommand::ResetDetector => processor.reset(),
                }
            }
        }));

        tasks.push(Self::spawn_monitor_loop(
            transport.clone(),
            queue.clone(),
            &config,
            running.clone(),
            intake.clone(),
        ));
        tasks.push(Self::spawn_diagnostic_loop(
            transport.clone(),
            queue.clone(),
            &config,
            running.clone(),
            diagnostics,
        ));
        tasks.push(Self::spawn_heuristic_loop(
            transport,
            queue,
            &config,
            running.clone(),
        ));

        Self {
            intake,
            running,
            tasks,
        }
    }

    /// Sender feeding the sample processor; the notification path uses this
    /// to route RX metric frames through the same single mutator.
    pub(crate) fn intake(&self) -> mpsc::Sender<EngineCommand> {
        self.intake.clone()
    }

    /// Stop all poll loops
    ///
    /// The running flag is the cooperative signal checked between iterations;
    /// the aborts behind it only matter if a transport call is wedged.
    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn spawn_monitor_loop(
        transport: Arc<dyn Transport>,
        queue: Arc<OperationQueue>,
        config: &PollingConfig,
        running: Arc<AtomicBool>,
        intake: mpsc::Sender<EngineCommand>,
    ) -> JoinHandle<()> {
        let period = Duration::from_millis(config.monitor_interval_ms);
        let window = Duration::from_millis(config.queue_acquire_window_ms);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                match queue
                    .read_within(window, transport.as_ref(), CharacteristicTarget::Monitor)
                    .await
                {
                    Ok(Some(data)) => {
                        let Some(packet) = codec::decode_monitor_packet(&data) else {
                            debug!("Dropped malformed monitor packet ({} bytes)", data.len());
                            continue;
                        };
                        let _ = intake.try_send(EngineCommand::Sample {
                            packet,
                            source: MonitorSource::MonitorCharacteristic,
                        });
                    }
                    Ok(None) => {} // queue busy past the window: tick skipped
                    Err(e) if should_stop_loop(&e) => {
                        info!("Monitor polling stopped: {e}");
                        break;
                    }
                    Err(e) => debug!("Monitor read failed: {e}"),
                }
            }
        })
    }

    fn spawn_diagnostic_loop(
        transport: Arc<dyn Transport>,
        queue: Arc<OperationQueue>,
        config: &PollingConfig,
        running: Arc<AtomicBool>,
        diagnostics: broadcast::Sender<DiagnosticPacket>,
    ) -> JoinHandle<()> {
        let period = Duration::from_millis(config.diagnostic_interval_ms);
        let window = Duration::from_millis(config.queue_acquire_window_ms);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                match queue
                    .read_within(window, transport.as_ref(), CharacteristicTarget::Diagnostic)
                    .await
                {
                    Ok(Some(data)) => {
                        let Some(packet) = codec::decode_diagnostic_packet(&data) else {
                            debug!("Dropped malformed diagnostic packet ({} bytes)", data.len());
                            continue;
                        };
                        if packet.has_faults {
                            warn!("Device reports fault codes: {:04X?}", packet.faults);
                        }
                        let _ = diagnostics.send(packet);
                    }
                    Ok(None) => {}
                    Err(e) if should_stop_loop(&e) => {
                        info!("Diagnostic polling stopped: {e}");
                        break;
                    }
                    Err(e) => debug!("Diagnostic read failed: {e}"),
                }
            }
        })
    }

    fn spawn_heuristic_loop(
        transport: Arc<dyn Transport>,
        queue: Arc<OperationQueue>,
        config: &PollingConfig,
        running: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let period = Duration::from_millis(config.heuristic_interval_ms);
        let window = Duration::from_millis(config.queue_acquire_window_ms);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                match queue
                    .read_within(window, transport.as_ref(), CharacteristicTarget::Heuristic)
                    .await
                {
                    Ok(Some(data)) => {
                        if let Some(sample) = codec::decode_heuristic_sample(&data) {
                            debug!(
                                "Heuristic: {:.1}/{:.1} kg, phase {}",
                                sample.force_a_kg, sample.force_b_kg, sample.phase
                            );
                        }
                    }
                    Ok(None) => {}
                    Err(e) if should_stop_loop(&e) => {
                        info!("Heuristic polling stopped: {e}");
                        break;
                    }
                    Err(e) => debug!("Heuristic read failed: {e}"),
                }
            }
        })
    }
}

impl Drop for PollingEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A poll loop gives up when the link is gone or the characteristic does not
/// exist on this firmware; everything else is a transient to log and retry.
fn should_stop_loop(error: &KinetraError) -> bool {
    error.is_connection_error() || matches!(error, KinetraError::CharacteristicNotFound(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs() -> (
        EngineOutputs,
        broadcast::Receiver<WorkoutMetric>,
        broadcast::Receiver<SafetyEvent>,
        watch::Receiver<HandleActivityState>,
    ) {
        let (metrics, metrics_rx) = broadcast::channel(16);
        let (safety, safety_rx) = broadcast::channel(16);
        let (diagnostics, _) = broadcast::channel(16);
        let (handle_state, handle_rx) = watch::channel(HandleActivityState::WaitingForRest);
        (
            EngineOutputs {
                metrics,
                safety,
                diagnostics,
                handle_state,
            },
            metrics_rx,
            safety_rx,
            handle_rx,
        )
    }

    fn packet(pos_mm: f32, load_kg: f32) -> MonitorPacket {
        MonitorPacket {
            ticks: 0,
            pos_a_mm: pos_mm,
            pos_b_mm: 0.0,
            load_a_kg: load_kg,
            load_b_kg: 0.0,
            status: 0,
        }
    }

    #[test]
    fn test_processor_emits_metrics_for_accepted_samples() {
        let (outputs, mut metrics_rx, _safety_rx, _handle_rx) = outputs();
        let mut processor = SampleProcessor::new(DetectorConfig::default(), outputs);

        processor.process(&packet(10.0, 5.0), 0);
        let metric = metrics_rx.try_recv().unwrap();
        assert!((metric.position_a - 10.0).abs() < f32::EPSILON);
        assert!((metric.load_a - 5.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_processor_drops_invalid_samples_silently() {
        let (outputs, mut metrics_rx, _safety_rx, handle_rx) = outputs();
        let mut processor = SampleProcessor::new(DetectorConfig::default(), outputs);

        processor.process(&packet(10.0, 5.0), 0);
        let _ = metrics_rx.try_recv().unwrap();

        // A corrupt packet produces no metric and no state movement.
        processor.process(&packet(5000.0, 5.0), 10);
        assert!(metrics_rx.try_recv().is_err());
        assert_eq!(*handle_rx.borrow(), HandleActivityState::WaitingForRest);
    }

    #[test]
    fn test_processor_reset_publishes_waiting_state() {
        let (outputs, _metrics_rx, _safety_rx, handle_rx) = outputs();
        let mut processor = SampleProcessor::new(DetectorConfig::default(), outputs);

        processor.reset();
        assert_eq!(*handle_rx.borrow(), HandleActivityState::WaitingForRest);
    }
}
