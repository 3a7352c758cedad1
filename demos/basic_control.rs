use lionchief::{
    Announcement, BleTransport, Direction, LionChiefError, LocomotiveSession, Result,
    SessionConfig,
};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚂 LionChief Basic Control Example");

    let transport = Arc::new(BleTransport::new(5_000).await?);

    // Use LIONCHIEF_MAC if set, otherwise the strongest locomotive in range
    let config = match std::env::var("LIONCHIEF_MAC") {
        Ok(mac) => SessionConfig::new(mac),
        Err(_) => {
            info!("Searching for LionChief locomotives...");
            let found = transport.scan_for_locomotives(Duration::from_secs(5)).await?;
            let Some(locomotive) = found.first() else {
                error!("❌ No locomotive found");
                return Err(LionChiefError::ConnectFailed("no locomotive in range".to_string()));
            };
            info!("Found {} ({})", locomotive.name, locomotive.address);
            locomotive.session_config()
        }
    };

    let session = LocomotiveSession::spawn(config, transport)?;
    if let Err(e) = session.connect().await {
        error!("❌ Failed to connect: {}", e);
        return Err(e);
    }

    let status = session.snapshot();
    info!("✅ Connected to: {}", status.identity.model_or_default());
    info!("  Manufacturer: {}", status.identity.manufacturer_or_default());
    if let Some(firmware) = &status.identity.firmware_revision {
        info!("  Firmware: {}", firmware);
    }

    info!("🔔 Ringing the bell...");
    session.set_bell(true).await?;
    sleep(Duration::from_secs(2)).await;
    session.set_bell(false).await?;

    info!("➡️ Forward at 30%...");
    session.set_direction(Direction::Forward).await?;
    session.set_speed(30).await?;
    sleep(Duration::from_secs(5)).await;

    info!("📢 {}", Announcement::ReadyToRoll);
    session.play_announcement(Announcement::ReadyToRoll).await?;

    info!("📉 Slowing down...");
    for percent in [20, 10, 0] {
        session.set_speed(percent).await?;
        sleep(Duration::from_secs(1)).await;
    }

    info!("⬅️ Reverse at 20%...");
    session.set_direction(Direction::Reverse).await?;
    session.set_speed(20).await?;
    sleep(Duration::from_secs(3)).await;
    session.set_speed(0).await?;

    let status = session.snapshot();
    info!("📊 Final Status:");
    info!("  Speed: {}%", status.locomotive.speed_percent);
    info!("  Direction: {}", status.locomotive.direction);
    info!(
        "  Lights: {}",
        if status.locomotive.lights_on { "ON" } else { "OFF" }
    );

    session.disconnect().await?;
    info!("👋 Disconnected");
    Ok(())
}
