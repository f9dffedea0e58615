use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Opaque identifier of a peripheral, as handed out by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralHandle(String);

impl PeripheralHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Invoked with the raw payload of every notification on a subscribed characteristic.
pub type NotificationCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Invoked when the transport observes that a peripheral dropped the link.
pub type DisconnectCallback = Arc<dyn Fn(&PeripheralHandle) + Send + Sync>;

/// BLE central capability consumed by the provisioning session.
///
/// Implementations own the radio stack. The session only ever talks to one
/// peripheral through one service, one write characteristic and one notify
/// characteristic. Callbacks may be invoked from any task.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Prepares the radio stack. Called once by `ProvisioningSession::initialize`.
    async fn initialize(&self) -> crate::Result<()>;

    /// Lets the user (or a scan policy) pick a peripheral advertising `service`.
    ///
    /// Returns `Ok(None)` when the selection was declined or nothing matched.
    async fn scan_for_peripheral(&self, service: Uuid) -> crate::Result<Option<PeripheralHandle>>;

    /// Opens the link to `handle` and installs the disconnect callback.
    async fn open_connection(
        &self,
        handle: &PeripheralHandle,
        on_disconnect: DisconnectCallback,
    ) -> crate::Result<()>;

    /// Writes one packet to `characteristic` and waits for the acknowledgement.
    async fn write_characteristic(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
        bytes: &[u8],
    ) -> crate::Result<()>;

    /// Enables notifications on `characteristic` and routes every payload to `on_data`.
    async fn subscribe_notifications(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
        on_data: NotificationCallback,
    ) -> crate::Result<()>;

    /// Lists peripherals that are currently connected and expose `service`.
    async fn list_connected_peripherals(
        &self,
        service: Uuid,
    ) -> crate::Result<Vec<PeripheralHandle>>;

    /// Tears the link down.
    async fn disconnect(&self, handle: &PeripheralHandle) -> crate::Result<()>;
}
