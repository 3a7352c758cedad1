use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::{HashMap, HashSet},
    fmt,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{error::Result, types::DeviceAddress};

/// Opaque identifier of one open link, issued by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    /// Wrap a transport-assigned link id
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Transport-assigned link id
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Discovered GATT layout: service UUID to its characteristic UUIDs
pub type ServiceMap = HashMap<Uuid, HashSet<Uuid>>;

/// Ordered channel that receives raw notification payloads
pub type NotificationSink = mpsc::UnboundedSender<Bytes>;

/// Invoked exactly once when a link drops, whichever side closed it
pub type DisconnectCallback = Box<dyn FnOnce() + Send + 'static>;

/// BLE capabilities the session needs from the host stack
///
/// The session is the only caller and keeps at most one write outstanding per
/// handle.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link to the locomotive
    ///
    /// # Errors
    ///
    /// Returns [`crate::LionChiefError::ConnectFailed`] when the device cannot be
    /// found, does not answer or requires pairing.
    async fn connect(&self, address: &DeviceAddress) -> Result<ConnectionHandle>;

    /// Enumerate services and their characteristics
    ///
    /// # Errors
    ///
    /// Returns [`crate::LionChiefError::ServiceDiscoveryFailed`] if GATT discovery fails.
    async fn discover_services(&self, handle: ConnectionHandle) -> Result<ServiceMap>;

    /// Write one frame
    ///
    /// # Errors
    ///
    /// Returns [`crate::LionChiefError::WriteFailed`], with `link_lost` set when the
    /// link dropped during the write.
    async fn write_characteristic(
        &self,
        handle: ConnectionHandle,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<()>;

    /// Enable notifications and forward every payload into `sink`, in order
    ///
    /// # Errors
    ///
    /// Returns [`crate::LionChiefError::SubscribeFailed`] if notifications cannot be enabled.
    async fn subscribe_notify(
        &self,
        handle: ConnectionHandle,
        characteristic: Uuid,
        sink: NotificationSink,
    ) -> Result<()>;

    /// Read a characteristic value
    ///
    /// # Errors
    ///
    /// Returns an error if the characteristic is missing or the read fails.
    async fn read_characteristic(
        &self,
        handle: ConnectionHandle,
        characteristic: Uuid,
    ) -> Result<Vec<u8>>;

    /// Close the link; best effort
    async fn disconnect(&self, handle: ConnectionHandle);

    /// Register the link-loss callback for `handle`
    fn on_disconnected(&self, handle: ConnectionHandle, callback: DisconnectCallback);
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scriptable in-memory transport.

    use super::*;
    use crate::{
        error::LionChiefError, DEVICE_INFO_SERVICE_UUID, LIONCHIEF_NOTIFY_CHAR_UUID,
        LIONCHIEF_SERVICE_UUID, LIONCHIEF_WRITE_CHAR_UUID,
    };
    use std::{
        future::pending,
        sync::{Arc, Mutex, MutexGuard},
        time::Duration,
    };
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct MockState {
        next_id: u64,
        connected: Option<ConnectionHandle>,
        services: ServiceMap,
        values: HashMap<Uuid, Vec<u8>>,
        writes: Vec<Vec<u8>>,
        connect_calls: u32,
        disconnect_calls: u32,
        fail_connect: bool,
        fail_subscribe: bool,
        hang_connect: bool,
        hang_discovery: bool,
        hang_disconnect: bool,
        fail_next_write: Option<bool>,
        sink: Option<NotificationSink>,
        on_disconnect: Option<DisconnectCallback>,
        gate: Option<Arc<Semaphore>>,
    }

    pub(crate) struct MockTransport {
        state: Mutex<MockState>,
    }

    impl MockTransport {
        /// A locomotive exposing the default LionChief layout and a Device Information Service
        pub(crate) fn locomotive() -> Arc<Self> {
            let mut services = ServiceMap::new();
            services.insert(
                LIONCHIEF_SERVICE_UUID,
                [LIONCHIEF_WRITE_CHAR_UUID, LIONCHIEF_NOTIFY_CHAR_UUID]
                    .into_iter()
                    .collect(),
            );
            services.insert(
                DEVICE_INFO_SERVICE_UUID,
                crate::identity::IDENTITY_CHARACTERISTICS
                    .iter()
                    .map(|(uuid, _)| *uuid)
                    .collect(),
            );

            let mut values = HashMap::new();
            values.insert(crate::identity::MODEL_NUMBER_CHAR_UUID, b"LC-2-8-0\0".to_vec());
            values.insert(crate::identity::MANUFACTURER_NAME_CHAR_UUID, b"Lionel ".to_vec());
            values.insert(crate::identity::FIRMWARE_REVISION_CHAR_UUID, b"1.4".to_vec());

            Arc::new(Self {
                state: Mutex::new(MockState {
                    services,
                    values,
                    ..MockState::default()
                }),
            })
        }

        fn lock(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap()
        }

        pub(crate) fn set_services(&self, services: ServiceMap) {
            self.lock().services = services;
        }

        pub(crate) fn set_value(&self, characteristic: Uuid, value: &[u8]) {
            self.lock().values.insert(characteristic, value.to_vec());
        }

        pub(crate) fn set_fail_connect(&self, fail: bool) {
            self.lock().fail_connect = fail;
        }

        pub(crate) fn set_fail_subscribe(&self, fail: bool) {
            self.lock().fail_subscribe = fail;
        }

        /// Make `connect` never resolve
        pub(crate) fn hang_connect(&self) {
            self.lock().hang_connect = true;
        }

        /// Make `discover_services` never resolve once the link is open
        pub(crate) fn hang_discovery(&self) {
            self.lock().hang_discovery = true;
        }

        /// Make `disconnect` release the link but never return
        pub(crate) fn hang_disconnect(&self) {
            self.lock().hang_disconnect = true;
        }

        pub(crate) fn fail_next_write(&self, link_lost: bool) {
            self.lock().fail_next_write = Some(link_lost);
        }

        /// Block every write until [`Self::release_writes`] grants permits
        pub(crate) fn hold_writes(&self) {
            self.lock().gate = Some(Arc::new(Semaphore::new(0)));
        }

        pub(crate) fn release_writes(&self, permits: usize) {
            if let Some(gate) = self.lock().gate.as_ref() {
                gate.add_permits(permits);
            }
        }

        pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
            self.lock().writes.clone()
        }

        pub(crate) fn connect_calls(&self) -> u32 {
            self.lock().connect_calls
        }

        pub(crate) fn disconnect_calls(&self) -> u32 {
            self.lock().disconnect_calls
        }

        pub(crate) fn is_connected(&self) -> bool {
            self.lock().connected.is_some()
        }

        /// Push a notification as if the locomotive sent it
        pub(crate) fn notify(&self, payload: &[u8]) {
            if let Some(sink) = self.lock().sink.as_ref() {
                let _ = sink.send(Bytes::copy_from_slice(payload));
            }
        }

        /// Drop the link from the locomotive's side
        pub(crate) fn drop_link(&self) {
            let callback = {
                let mut state = self.lock();
                state.connected = None;
                state.sink = None;
                state.on_disconnect.take()
            };
            if let Some(callback) = callback {
                callback();
            }
        }

        fn check_link(&self, handle: ConnectionHandle) -> Result<()> {
            if self.lock().connected == Some(handle) {
                Ok(())
            } else {
                Err(LionChiefError::Ble(btleplug::Error::NotConnected))
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&self, _address: &DeviceAddress) -> Result<ConnectionHandle> {
            let hang = {
                let mut state = self.lock();
                state.connect_calls += 1;
                if state.fail_connect {
                    return Err(LionChiefError::ConnectFailed("device not found".to_string()));
                }
                state.hang_connect
            };
            if hang {
                pending::<()>().await;
            }

            let mut state = self.lock();
            state.next_id += 1;
            let handle = ConnectionHandle::new(state.next_id);
            state.connected = Some(handle);
            Ok(handle)
        }

        async fn discover_services(&self, handle: ConnectionHandle) -> Result<ServiceMap> {
            self.check_link(handle)
                .map_err(|e| LionChiefError::ServiceDiscoveryFailed(e.to_string()))?;
            let (hang, services) = {
                let state = self.lock();
                (state.hang_discovery, state.services.clone())
            };
            if hang {
                pending::<()>().await;
            }
            Ok(services)
        }

        async fn write_characteristic(
            &self,
            handle: ConnectionHandle,
            _characteristic: Uuid,
            data: &[u8],
        ) -> Result<()> {
            let gate = {
                let mut state = self.lock();
                state.writes.push(data.to_vec());
                state.gate.clone()
            };

            if let Some(gate) = gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }

            if let Some(link_lost) = self.lock().fail_next_write.take() {
                return Err(LionChiefError::WriteFailed {
                    reason: "scripted failure".to_string(),
                    link_lost,
                });
            }

            self.check_link(handle).map_err(|e| LionChiefError::WriteFailed {
                reason: e.to_string(),
                link_lost: true,
            })
        }

        async fn subscribe_notify(
            &self,
            handle: ConnectionHandle,
            _characteristic: Uuid,
            sink: NotificationSink,
        ) -> Result<()> {
            self.check_link(handle)
                .map_err(|e| LionChiefError::SubscribeFailed(e.to_string()))?;
            let mut state = self.lock();
            if state.fail_subscribe {
                return Err(LionChiefError::SubscribeFailed("CCCD write rejected".to_string()));
            }
            state.sink = Some(sink);
            Ok(())
        }

        async fn read_characteristic(
            &self,
            handle: ConnectionHandle,
            characteristic: Uuid,
        ) -> Result<Vec<u8>> {
            self.check_link(handle)?;
            self.lock()
                .values
                .get(&characteristic)
                .cloned()
                .ok_or_else(|| LionChiefError::ReadFailed(format!("{characteristic} not readable")))
        }

        async fn disconnect(&self, handle: ConnectionHandle) {
            let (hang, callback) = {
                let mut state = self.lock();
                state.disconnect_calls += 1;
                let callback = if state.connected == Some(handle) {
                    state.connected = None;
                    state.sink = None;
                    state.on_disconnect.take()
                } else {
                    None
                };
                (state.hang_disconnect, callback)
            };
            if let Some(callback) = callback {
                callback();
            }
            if hang {
                pending::<()>().await;
            }
        }

        fn on_disconnected(&self, _handle: ConnectionHandle, callback: DisconnectCallback) {
            self.lock().on_disconnect = Some(callback);
        }
    }

    /// Poll `condition` until it holds, failing the test after a second
    pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;
    use crate::LIONCHIEF_WRITE_CHAR_UUID;

    #[test]
    fn test_connection_handle_display() {
        let handle = ConnectionHandle::new(7);
        assert_eq!(handle.id(), 7);
        assert_eq!(handle.to_string(), "link#7");
    }

    #[tokio::test]
    async fn test_disconnect_callback_fires_once() {
        let transport = MockTransport::locomotive();
        let address = DeviceAddress::parse("FC:1F:C3:9F:A5:4A").unwrap();
        let handle = transport.connect(&address).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.on_disconnected(
            handle,
            Box::new(move || {
                let _ = tx.send(());
            }),
        );

        transport.disconnect(handle).await;
        transport.drop_link();

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_write_after_drop_reports_link_loss() {
        let transport = MockTransport::locomotive();
        let address = DeviceAddress::parse("FC:1F:C3:9F:A5:4A").unwrap();
        let handle = transport.connect(&address).await.unwrap();
        transport.drop_link();

        let err = transport
            .write_characteristic(handle, LIONCHIEF_WRITE_CHAR_UUID, &[0x00, 0x45, 0x00, 0x00])
            .await
            .unwrap_err();
        assert!(err.is_link_level());
    }
}
