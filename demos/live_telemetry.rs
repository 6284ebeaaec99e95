use kinetra::{KinetraDevice, Result, WorkoutMode};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📊 Kinetra Live Telemetry Example");
    info!("Scanning for Kinetra trainers...");

    let device = KinetraDevice::new().await?;

    let found = device.scan().await?;
    let Some(target) = found.first() else {
        error!("❌ No Kinetra trainer in range");
        return Ok(());
    };

    info!(
        "✅ Found {} ({} dBm), connecting...",
        target.display_name(),
        target.rssi
    );
    device.connect(target).await?;

    device.initialize().await?;
    device.start_workout(WorkoutMode::Standard, 20.0).await?;

    let mut metrics = device.metrics();
    let mut reps = device.reps();
    let mut safety = device.safety_events();

    info!("🔍 Streaming telemetry. Press Ctrl+C to stop");

    let mut samples: u64 = 0;
    loop {
        tokio::select! {
            metric = metrics.recv() => {
                match metric {
                    Ok(metric) => {
                        samples += 1;
                        // The metric stream runs at ~100 Hz; print every 50th.
                        if samples % 50 == 0 {
                            println!(
                                "pos {:7.1}/{:7.1} mm  load {:5.1}/{:5.1} kg  vel {:7.1}/{:7.1} mm/s",
                                metric.position_a,
                                metric.position_b,
                                metric.load_a,
                                metric.load_b,
                                metric.velocity_a,
                                metric.velocity_b,
                            );
                        }
                    }
                    Err(e) => {
                        warn!("Metric stream lagged: {e}");
                    }
                }
            }
            rep = reps.recv() => {
                if let Ok(rep) = rep {
                    println!(
                        "🔁 rep {}/{} complete (top counter {}, legacy: {})",
                        rep.reps_set_count, rep.reps_set_total, rep.top_counter, rep.is_legacy_format
                    );
                }
            }
            event = safety.recv() => {
                if let Ok(event) = event {
                    println!("⚠️  safety event: {event:?}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    info!("Stopping workout and disconnecting...");
    if let Err(e) = device.soft_stop().await {
        warn!("Soft stop failed: {e}");
    }
    device.disconnect().await;

    Ok(())
}
