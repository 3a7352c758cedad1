use lionchief::{
    BleTransport, LocomotiveSession, Result, SessionConfig, SessionFault, StatusEvent,
    StatusSnapshot,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

fn print_status(status: &StatusSnapshot) {
    println!("\n📊 {} ({:?})", status.connection, status.phase);
    println!("┌─────────────────────────────────────────┐");
    println!(
        "│ Speed: {:3}%  Direction: {:8}        │",
        status.locomotive.speed_percent,
        status.locomotive.direction.to_string()
    );
    println!(
        "│ Lights: {:3}  Bell: {:3}  Horn: {:3}       │",
        if status.locomotive.lights_on { "ON" } else { "OFF" },
        if status.locomotive.bell_on { "ON" } else { "OFF" },
        if status.locomotive.horn_on { "ON" } else { "OFF" },
    );
    if let Some(battery) = status.telemetry.battery_percent {
        println!("│ Battery: {battery:3}%                          │");
    }
    if let Some(temperature) = status.telemetry.temperature_celsius {
        println!("│ Temperature: {temperature:4}°C                    │");
    }
    if let Some(voltage) = status.telemetry.voltage {
        println!("│ Voltage: {voltage:5.2} V                       │");
    }
    if let Some(fault) = status.last_fault {
        println!("│ Last fault: {:27} │", fault.to_string());
    }
    println!("└─────────────────────────────────────────┘");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📊 LionChief Status Monitor Example");

    let mac = std::env::var("LIONCHIEF_MAC").unwrap_or_else(|_| "FC:1F:C3:9F:A5:4A".to_string());
    let config = SessionConfig::new(mac);
    let transport = Arc::new(BleTransport::new(config.scan_timeout_ms).await?);
    let session = LocomotiveSession::spawn(config, transport)?;

    let mut events = session.events();
    session.connect().await?;
    print_status(&session.snapshot());

    info!("🔍 Monitoring, press Ctrl+C to stop");

    let mut last_fault = session.snapshot().last_fault;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(StatusEvent::StatusChanged(status)) => {
                    print_status(&status);
                    let exhausted = Some(SessionFault::ReconnectExhausted);
                    let gave_up = status.last_fault == exhausted && last_fault != exhausted;
                    last_fault = status.last_fault;
                    if gave_up {
                        warn!("⚠️ Locomotive lost and not coming back, reconnecting once...");
                        if let Err(e) = session.connect().await {
                            warn!("Reconnect failed: {}", e);
                        }
                    }
                }
                Ok(StatusEvent::IdentityUpdated(identity)) => {
                    info!(
                        "🪪 {} by {}",
                        identity.model_or_default(),
                        identity.manufacturer_or_default()
                    );
                }
                Err(RecvError::Lagged(missed)) => warn!("Missed {} status update(s)", missed),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Stopping monitor");
                break;
            }
        }
    }

    session.disconnect().await?;
    Ok(())
}
