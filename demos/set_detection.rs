use kinetra::{HandleActivityState, KinetraDevice, Result, WorkoutMode};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🏋️ Kinetra Set Detection Example");

    let device = KinetraDevice::new().await?;

    let found = device.scan().await?;
    let Some(target) = found.first() else {
        error!("❌ No Kinetra trainer in range");
        return Ok(());
    };
    device.connect(target).await?;
    device.initialize().await?;

    let mut activity = device.handle_activity();
    let mut sets: u32 = 0;

    info!("Grab the handles to start a set. Press Ctrl+C to stop");

    loop {
        tokio::select! {
            changed = activity.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *activity.borrow_and_update();
                match state {
                    HandleActivityState::WaitingForRest => {
                        info!("Waiting for the handles to settle...");
                    }
                    HandleActivityState::Moving => {
                        info!("Handles grabbed");
                    }
                    HandleActivityState::Active => {
                        info!("Set started — applying resistance");
                        device.start_workout(WorkoutMode::Standard, 25.0).await?;
                    }
                    HandleActivityState::SetComplete => {
                        sets += 1;
                        info!("Set {sets} complete — releasing tension");
                        device.soft_stop().await?;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    info!("Finished after {sets} set(s)");
    device.disconnect().await;

    Ok(())
}
