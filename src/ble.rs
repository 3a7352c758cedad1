use async_trait::async_trait;
use btleplug::{
    api::{
        BDAddr, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _,
        Peripheral as _, ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{sleep, Instant},
};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    error::{LionChiefError, Result},
    transport::{ConnectionHandle, DisconnectCallback, NotificationSink, ServiceMap, Transport},
    types::{DeviceAddress, SessionConfig},
    LIONCHIEF_SERVICE_UUID,
};

/// How often the adapter's peripheral list is checked while looking for an address
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

type CallbackSlot = Arc<Mutex<Option<DisconnectCallback>>>;

/// A locomotive seen during a discovery scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredLocomotive {
    /// Advertised name
    pub name: String,
    /// MAC address, `XX:XX:XX:XX:XX:XX`
    pub address: String,
    /// Signal strength at discovery time
    pub rssi: Option<i16>,
}

impl DiscoveredLocomotive {
    /// Default session configuration for this locomotive
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new(self.address.clone())
    }
}

struct LinkEntry {
    peripheral: Peripheral,
    tasks: Vec<JoinHandle<()>>,
    on_disconnect: CallbackSlot,
}

/// [`Transport`] backed by the host Bluetooth adapter through btleplug
pub struct BleTransport {
    adapter: Adapter,
    scan_timeout: Duration,
    links: Mutex<HashMap<u64, LinkEntry>>,
    next_id: AtomicU64,
}

impl BleTransport {
    /// Open the first Bluetooth adapter
    ///
    /// `scan_timeout_ms` bounds how long `connect` scans for an address the
    /// adapter has not seen yet.
    ///
    /// # Errors
    ///
    /// Returns [`LionChiefError::Ble`] if the Bluetooth stack cannot be initialized,
    /// or [`LionChiefError::ConnectFailed`] if no adapter is available.
    pub async fn new(scan_timeout_ms: u64) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                LionChiefError::ConnectFailed("No Bluetooth adapter found".to_string())
            })?;

        Ok(Self {
            adapter,
            scan_timeout: Duration::from_millis(scan_timeout_ms),
            links: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    /// Scan for locomotives advertising the LionChief service
    ///
    /// Results are ordered by signal strength, strongest first.
    ///
    /// # Errors
    ///
    /// Returns [`LionChiefError::Ble`] for Bluetooth-related errors.
    pub async fn scan_for_locomotives(
        &self,
        duration: Duration,
    ) -> Result<Vec<DiscoveredLocomotive>> {
        info!("Starting scan for LionChief locomotives...");

        self.adapter
            .start_scan(ScanFilter {
                services: vec![LIONCHIEF_SERVICE_UUID],
            })
            .await?;
        sleep(duration).await;
        self.adapter.stop_scan().await?;

        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let Some(properties) = peripheral.properties().await? else {
                continue;
            };
            // not every platform applies the scan filter
            if !properties.services.contains(&LIONCHIEF_SERVICE_UUID) {
                continue;
            }

            let locomotive = DiscoveredLocomotive {
                name: properties
                    .local_name
                    .unwrap_or_else(|| "LionChief Locomotive".to_string()),
                address: properties.address.to_string(),
                rssi: properties.rssi,
            };
            info!(
                "Found locomotive: {} ({})",
                locomotive.name, locomotive.address
            );
            found.push(locomotive);
        }

        found.sort_by_key(|locomotive| std::cmp::Reverse(locomotive.rssi));
        info!("Scan completed. Found {} locomotive(s)", found.len());
        Ok(found)
    }

    fn lock_links(&self) -> MutexGuard<'_, HashMap<u64, LinkEntry>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peripheral(&self, handle: ConnectionHandle) -> Result<Peripheral> {
        self.lock_links()
            .get(&handle.id())
            .map(|entry| entry.peripheral.clone())
            .ok_or(LionChiefError::Ble(btleplug::Error::NotConnected))
    }

    async fn known_peripheral(&self, target: BDAddr) -> Result<Option<Peripheral>> {
        Ok(self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address() == target))
    }

    async fn find_peripheral(&self, target: BDAddr) -> Result<Peripheral> {
        if let Some(peripheral) = self.known_peripheral(target).await? {
            return Ok(peripheral);
        }

        debug!("Scanning up to {:?} for {target}", self.scan_timeout);
        self.adapter.start_scan(ScanFilter::default()).await?;

        let deadline = Instant::now() + self.scan_timeout;
        let found = loop {
            if let Some(peripheral) = self.known_peripheral(target).await? {
                break Some(peripheral);
            }
            if Instant::now() >= deadline {
                break None;
            }
            sleep(SCAN_POLL_INTERVAL).await;
        };

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {e}");
        }

        found.ok_or_else(|| LionChiefError::ConnectFailed(format!("Locomotive {target} not found")))
    }

    fn track_task(&self, handle: ConnectionHandle, task: JoinHandle<()>) {
        match self.lock_links().get_mut(&handle.id()) {
            Some(entry) => entry.tasks.push(task),
            None => task.abort(),
        }
    }
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
}

fn fire(slot: &CallbackSlot) {
    let callback = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(callback) = callback {
        callback();
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(&self, address: &DeviceAddress) -> Result<ConnectionHandle> {
        info!("Connecting to locomotive {address}");
        let peripheral = self.find_peripheral(BDAddr::from(address.octets())).await?;

        peripheral
            .connect()
            .await
            .map_err(|e| LionChiefError::ConnectFailed(e.to_string()))?;

        let handle = ConnectionHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.lock_links().insert(
            handle.id(),
            LinkEntry {
                peripheral,
                tasks: Vec::new(),
                on_disconnect: CallbackSlot::default(),
            },
        );

        info!("Connected to {address} as {handle}");
        Ok(handle)
    }

    async fn discover_services(&self, handle: ConnectionHandle) -> Result<ServiceMap> {
        let peripheral = self
            .peripheral(handle)
            .map_err(|e| LionChiefError::ServiceDiscoveryFailed(e.to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| LionChiefError::ServiceDiscoveryFailed(e.to_string()))?;

        let services: ServiceMap = peripheral
            .services()
            .into_iter()
            .map(|service| {
                let characteristics = service.characteristics.iter().map(|c| c.uuid).collect();
                (service.uuid, characteristics)
            })
            .collect();

        debug!("Discovered {} service(s) on {handle}", services.len());
        Ok(services)
    }

    async fn write_characteristic(
        &self,
        handle: ConnectionHandle,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<()> {
        let peripheral = self.peripheral(handle).map_err(|e| LionChiefError::WriteFailed {
            reason: e.to_string(),
            link_lost: true,
        })?;
        let target = find_characteristic(&peripheral, characteristic).ok_or_else(|| {
            LionChiefError::WriteFailed {
                reason: format!("Characteristic {characteristic} not found"),
                link_lost: false,
            }
        })?;

        let write_type = if target.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        trace!("Writing {:02X?} to {characteristic}", data);
        match peripheral.write(&target, data, write_type).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let link_lost = matches!(e, btleplug::Error::NotConnected)
                    || !peripheral.is_connected().await.unwrap_or(false);
                Err(LionChiefError::WriteFailed {
                    reason: e.to_string(),
                    link_lost,
                })
            }
        }
    }

    async fn subscribe_notify(
        &self,
        handle: ConnectionHandle,
        characteristic: Uuid,
        sink: NotificationSink,
    ) -> Result<()> {
        let peripheral = self
            .peripheral(handle)
            .map_err(|e| LionChiefError::SubscribeFailed(e.to_string()))?;
        let target = find_characteristic(&peripheral, characteristic).ok_or_else(|| {
            LionChiefError::SubscribeFailed(format!("Characteristic {characteristic} not found"))
        })?;

        // open the stream first so nothing sent right after subscribing is missed
        let mut stream = peripheral
            .notifications()
            .await
            .map_err(|e| LionChiefError::SubscribeFailed(e.to_string()))?;
        peripheral
            .subscribe(&target)
            .await
            .map_err(|e| LionChiefError::SubscribeFailed(e.to_string()))?;

        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid != characteristic {
                    continue;
                }
                trace!("Notification: {:02X?}", notification.value);
                if sink.send(Bytes::from(notification.value)).is_err() {
                    break;
                }
            }
            debug!("Notification stream for {characteristic} ended");
        });
        self.track_task(handle, task);

        debug!("Subscribed to {characteristic} on {handle}");
        Ok(())
    }

    async fn read_characteristic(
        &self,
        handle: ConnectionHandle,
        characteristic: Uuid,
    ) -> Result<Vec<u8>> {
        let peripheral = self.peripheral(handle)?;
        let target = find_characteristic(&peripheral, characteristic).ok_or_else(|| {
            LionChiefError::ReadFailed(format!("Characteristic {characteristic} not found"))
        })?;

        peripheral
            .read(&target)
            .await
            .map_err(|e| LionChiefError::ReadFailed(e.to_string()))
    }

    async fn disconnect(&self, handle: ConnectionHandle) {
        let entry = self.lock_links().remove(&handle.id());
        let Some(entry) = entry else {
            return;
        };

        for task in &entry.tasks {
            task.abort();
        }

        match entry.peripheral.disconnect().await {
            Ok(()) => info!("Disconnected {handle}"),
            Err(e) => warn!("Disconnect of {handle} failed: {e}"),
        }
        fire(&entry.on_disconnect);
    }

    fn on_disconnected(&self, handle: ConnectionHandle, callback: DisconnectCallback) {
        let (peripheral, slot) = {
            let links = self.lock_links();
            match links.get(&handle.id()) {
                Some(entry) => (entry.peripheral.clone(), Arc::clone(&entry.on_disconnect)),
                None => {
                    drop(links);
                    callback();
                    return;
                }
            }
        };

        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);

        let adapter = self.adapter.clone();
        let peripheral_id = peripheral.id();
        let task = tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Cannot watch adapter events, link loss will go unnoticed: {e}");
                    return;
                }
            };

            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        warn!("Locomotive {:?} disconnected", id);
                        fire(&slot);
                        break;
                    }
                }
            }
        });
        self.track_task(handle, task);
    }
}

impl fmt::Debug for BleTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleTransport")
            .field("scan_timeout", &self.scan_timeout)
            .field("links", &self.lock_links().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_maps_to_bdaddr() {
        let address = DeviceAddress::parse("fc:1f:c3:9f:a5:4a").unwrap();
        let bdaddr = BDAddr::from(address.octets());
        assert_eq!(bdaddr.to_string(), "FC:1F:C3:9F:A5:4A");
    }

    #[test]
    fn test_discovered_locomotive_config() {
        let locomotive = DiscoveredLocomotive {
            name: "LC-2-8-0".to_string(),
            address: "FC:1F:C3:9F:A5:4A".to_string(),
            rssi: Some(-60),
        };

        let config = locomotive.session_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.mac_address, "FC:1F:C3:9F:A5:4A");
    }

    #[test]
    fn test_callback_slot_fires_once() {
        let slot = CallbackSlot::default();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        *slot.lock().unwrap() = Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        fire(&slot);
        fire(&slot);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
