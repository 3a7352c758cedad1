use lionchief::{BleTransport, Command, Direction, LocomotiveSession, Result, SessionConfig};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚨 LionChief Emergency Stop Example");
    info!("Queues several commands, then stops ahead of all of them");

    let mac = std::env::var("LIONCHIEF_MAC").unwrap_or_else(|_| "FC:1F:C3:9F:A5:4A".to_string());
    let config = SessionConfig::new(mac);
    let transport = Arc::new(BleTransport::new(config.scan_timeout_ms).await?);
    let session = LocomotiveSession::spawn(config, transport)?;

    if let Err(e) = session.connect().await {
        error!("❌ Failed to connect: {}", e);
        return Err(e);
    }
    info!("✅ Connected to: {}", session.snapshot().identity.model_or_default());

    session.set_direction(Direction::Forward).await?;
    session.set_speed(40).await?;
    info!("⏳ Running at 40%...");
    sleep(Duration::from_secs(3)).await;

    // queued without waiting; the stop is written before any of them
    let queued = vec![
        session.submit(Command::SetSpeed(60))?,
        session.submit(Command::SetHorn(true))?,
        session.submit(Command::SetSpeed(80))?,
    ];

    warn!("🛑 EMERGENCY STOP");
    match session.emergency_stop().await {
        Ok(()) => info!("✅ Emergency stop written"),
        Err(e) => {
            error!("❌ Emergency stop failed: {}", e);
            return Err(e);
        }
    }

    for pending in queued {
        let command = pending.command();
        if let Err(e) = pending.await {
            warn!("{} failed: {}", command, e);
        }
    }

    // the queued commands ran after the stop; stop again and silence the horn
    session.emergency_stop().await?;
    session.set_horn(false).await?;

    let status = session.snapshot();
    info!("📊 Speed after stop: {}%", status.locomotive.speed_percent);

    session.issue_command(Command::Disconnect).await?;
    info!("👋 Locomotive released");
    Ok(())
}
