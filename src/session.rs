//! Command and session helpers built atop the operation queue.
//!
//! Everything here is a thin sequence over the write characteristic: encode
//! a frame with the codec, route it through the queue, update what needs
//! updating. None of these helpers talk to the transport directly.

use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::{
    ble::{CharacteristicTarget, PeripheralTransport},
    codec::{self, CommandAck, EchoConfig, ProgramConfig, RegularConfig},
    device::KinetraDevice,
    error::{KinetraError, Result},
    polling::EngineCommand,
    queue::DEFAULT_WRITE_RETRIES,
    types::{ColorScheme, WorkoutMode},
};

/// Pause after the init frame before the device accepts configuration
const INIT_SETTLE_MS: u64 = 50;
/// Dwell per color while disco mode cycles
const DISCO_STEP_MS: u64 = 400;

impl KinetraDevice {
    async fn session_transport(&self) -> Result<Arc<PeripheralTransport>> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.transport.clone())
            .ok_or(KinetraError::NotReady {
                reason: "Not connected".to_string(),
            })
    }

    async fn send_frame(&self, frame: &[u8]) -> Result<()> {
        let transport = self.session_transport().await?;
        self.queue
            .write(
                transport.as_ref(),
                CharacteristicTarget::Command,
                frame,
                DEFAULT_WRITE_RETRIES,
            )
            .await
    }

    /// Send the init sequence for a fresh session
    ///
    /// # Errors
    ///
    /// Returns [`KinetraError::NotReady`] when not connected, or the queue's
    /// write error.
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing device session");
        self.send_frame(&codec::encode_init()).await?;
        sleep(Duration::from_millis(INIT_SETTLE_MS)).await;
        Ok(())
    }

    /// Start a workout at the given mode and weight
    ///
    /// Does not touch set detection: auto-start flows call this from the
    /// `Active` transition, where resetting would erase the state that
    /// triggered it. Call [`reset_set_detection`](Self::reset_set_detection)
    /// at set boundaries instead.
    ///
    /// # Errors
    ///
    /// Returns [`KinetraError::InvalidParameters`] for an out-of-range
    /// weight, [`KinetraError::NotReady`] when not connected, or the queue's
    /// write error.
    pub async fn start_workout(&self, mode: WorkoutMode, weight_kg: f32) -> Result<()> {
        info!("Starting {mode} workout at {weight_kg:.1} kg");
        let frame = codec::encode_start_workout(mode, weight_kg)?;
        self.send_frame(&frame).await
    }

    /// Stop the workout and reset the machine
    ///
    /// # Errors
    ///
    /// Returns [`KinetraError::NotReady`] when not connected, or the queue's
    /// write error.
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping workout (reset)");
        self.send_frame(&codec::encode_stop()).await?;
        self.reset_set_detection().await
    }

    /// Release tension without ending the session
    ///
    /// Unlike [`stop`](Self::stop) this leaves polling and session state
    /// intact; set detection re-arms so grabbing the handles starts the next
    /// set automatically.
    ///
    /// # Errors
    ///
    /// Returns [`KinetraError::NotReady`] when not connected, or the queue's
    /// write error.
    pub async fn soft_stop(&self) -> Result<()> {
        info!("Soft stop: releasing tension, auto-start stays armed");
        self.send_frame(&codec::encode_soft_stop()).await?;
        self.reset_set_detection().await
    }

    /// Select a color scheme for the light strip
    ///
    /// # Errors
    ///
    /// Returns [`KinetraError::NotReady`] when not connected, or the queue's
    /// write error.
    pub async fn set_color_scheme(&self, scheme: ColorScheme) -> Result<()> {
        debug!("Setting color scheme to {scheme}");
        self.send_frame(&codec::encode_color_scheme(scheme)).await
    }

    /// Start cycling color schemes in the background
    ///
    /// The cycling task routes every write through the operation queue like
    /// any other command, so it cannot interleave with workout traffic. A
    /// second call while disco mode is already running does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`KinetraError::NotReady`] when not connected.
    pub async fn start_disco_mode(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let Some(session) = session.as_mut() else {
            return Err(KinetraError::NotReady {
                reason: "Not connected".to_string(),
            });
        };
        if session.disco.is_some() {
            return Ok(());
        }

        info!("Disco mode on");
        let transport = session.transport.clone();
        let queue = self.queue.clone();
        session.disco = Some(tokio::spawn(async move {
            loop {
                for scheme in ColorScheme::ALL {
                    let frame = codec::encode_color_scheme(scheme);
                    let written = queue
                        .write(
                            transport.as_ref(),
                            CharacteristicTarget::Command,
                            &frame,
                            DEFAULT_WRITE_RETRIES,
                        )
                        .await;
                    if written.is_err() {
                        return;
                    }
                    sleep(Duration::from_millis(DISCO_STEP_MS)).await;
                }
            }
        }));
        Ok(())
    }

    /// Stop disco mode and restore the default color scheme
    ///
    /// # Errors
    ///
    /// Returns [`KinetraError::NotReady`] when not connected, or the queue's
    /// write error while restoring the default scheme.
    pub async fn stop_disco_mode(&self) -> Result<()> {
        {
            let mut session = self.session.lock().await;
            let Some(session) = session.as_mut() else {
                return Err(KinetraError::NotReady {
                    reason: "Not connected".to_string(),
                });
            };
            match session.disco.take() {
                Some(task) => task.abort(),
                None => return Ok(()),
            }
        }
        info!("Disco mode off");
        self.set_color_scheme(ColorScheme::Classic).await
    }

    /// Send the compact echo configuration frame
    ///
    /// # Errors
    ///
    /// Returns [`KinetraError::InvalidParameters`] for a bad configuration,
    /// [`KinetraError::NotReady`] when not connected, or the queue's write
    /// error.
    pub async fn send_echo_config(&self, config: &EchoConfig) -> Result<()> {
        let frame = codec::encode_echo_config(config)?;
        debug!("Sending echo configuration ({} bytes)", frame.len());
        self.send_frame(&frame).await
    }

    /// Send the full program configuration frame
    ///
    /// # Errors
    ///
    /// Returns [`KinetraError::InvalidParameters`] for a bad configuration,
    /// [`KinetraError::NotReady`] when not connected, or the queue's write
    /// error.
    pub async fn send_program_config(&self, config: &ProgramConfig) -> Result<()> {
        let frame = codec::encode_program_config(config)?;
        debug!(
            "Sending program configuration ({} segments)",
            config.segments.len()
        );
        self.send_frame(&frame).await
    }

    /// Send the regular per-set configuration frame
    ///
    /// # Errors
    ///
    /// Returns [`KinetraError::InvalidParameters`] for a bad configuration,
    /// [`KinetraError::NotReady`] when not connected, or the queue's write
    /// error.
    pub async fn send_regular_config(&self, config: &RegularConfig) -> Result<()> {
        let frame = codec::encode_regular_config(config)?;
        debug!("Sending regular configuration");
        self.send_frame(&frame).await
    }

    /// Re-arm set detection at a set boundary
    ///
    /// # Errors
    ///
    /// Returns [`KinetraError::NotReady`] when not connected.
    pub async fn reset_set_detection(&self) -> Result<()> {
        let intake = self
            .session
            .lock()
            .await
            .as_ref()
            .map(|session| session.engine.intake())
            .ok_or(KinetraError::NotReady {
                reason: "Not connected".to_string(),
            })?;
        let _ = intake.send(EngineCommand::ResetDetector).await;
        Ok(())
    }

    /// The most recent command acknowledgment seen on the RX channel
    pub async fn last_command_ack(&self) -> Option<CommandAck> {
        let session = self.session.lock().await;
        session
            .as_ref()
            .and_then(|s| s.last_ack.lock().ok().and_then(|guard| *guard))
    }
}
