use crate::config::SelectionConfig;
use crate::traits::{BleTransport, DisconnectCallback, NotificationCallback, PeripheralHandle};
use crate::{Error, Result, lock};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// BLE central backed by the platform's Bluetooth stack.
///
/// Peripheral selection is a scan policy: listen for `selection.window`,
/// then take the first advertiser of the service whose local name matches
/// `selection.name_filter` (any name when unset).
pub struct BtleplugTransport {
    selection: SelectionConfig,
    adapter: Mutex<Option<Adapter>>,
    peripherals: Arc<Mutex<HashMap<PeripheralHandle, Peripheral>>>,
    links: Arc<Links>,
}

/// Background tasks owned by one connected peripheral.
#[derive(Default)]
struct LinkTasks {
    watcher: Option<JoinHandle<()>>,
    pumps: Vec<JoinHandle<()>>,
}

/// Disconnect watcher and notification pumps per peripheral.
#[derive(Default)]
struct Links {
    tasks: Mutex<HashMap<PeripheralHandle, LinkTasks>>,
}

impl Links {
    fn set_watcher(&self, handle: &PeripheralHandle, watcher: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        let link = tasks.entry(handle.clone()).or_default();
        if let Some(previous) = link.watcher.replace(watcher) {
            previous.abort();
        }
    }

    fn add_pump(&self, handle: &PeripheralHandle, pump: JoinHandle<()>) {
        lock(&self.tasks).entry(handle.clone()).or_default().pumps.push(pump);
    }

    /// Stops every task of `handle`. The watcher is left running when the
    /// release comes from the watcher itself.
    fn release(&self, handle: &PeripheralHandle, stop_watcher: bool) {
        let Some(link) = lock(&self.tasks).remove(handle) else {
            return;
        };
        for pump in link.pumps {
            pump.abort();
        }
        if let (true, Some(watcher)) = (stop_watcher, link.watcher) {
            watcher.abort();
        }
    }

    fn len(&self) -> usize {
        lock(&self.tasks).len()
    }
}

impl BtleplugTransport {
    pub fn new(selection: SelectionConfig) -> Self {
        Self {
            selection,
            adapter: Mutex::new(None),
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            links: Arc::new(Links::default()),
        }
    }

    fn adapter(&self) -> Result<Adapter> {
        lock(&self.adapter).clone().ok_or(Error::NotInitialized)
    }

    fn peripheral(&self, handle: &PeripheralHandle) -> Result<Peripheral> {
        lock(&self.peripherals)
            .get(handle)
            .cloned()
            .ok_or(Error::NotConnected)
    }

    fn matches_name(&self, local_name: Option<&str>) -> bool {
        match (&self.selection.name_filter, local_name) {
            (None, _) => true,
            (Some(filter), Some(name)) => name.contains(filter.as_str()),
            (Some(_), None) => false,
        }
    }
}

fn handle_for(peripheral: &Peripheral) -> PeripheralHandle {
    PeripheralHandle::new(format!("{:?}", peripheral.id()))
}

fn find_characteristic(
    peripheral: &Peripheral,
    service: Uuid,
    characteristic: Uuid,
) -> Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.service_uuid == service && c.uuid == characteristic)
        .ok_or_else(|| {
            Error::TransportFailure(format!(
                "characteristic {characteristic} not found in service {service}"
            ))
        })
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn initialize(&self) -> Result<()> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::TransportFailure("no Bluetooth adapter found".into()))?;

        let info = adapter.adapter_info().await.unwrap_or_else(|_| "unknown".into());
        tracing::info!(adapter = %info, "Bluetooth adapter ready");
        *lock(&self.adapter) = Some(adapter);
        Ok(())
    }

    async fn scan_for_peripheral(&self, service: Uuid) -> Result<Option<PeripheralHandle>> {
        let adapter = self.adapter()?;

        tracing::info!(
            %service,
            window = ?self.selection.window,
            "Scanning for provisioning peripherals"
        );
        adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await?;
        tokio::time::sleep(self.selection.window).await;
        let peripherals = adapter.peripherals().await;
        adapter.stop_scan().await?;

        for peripheral in peripherals? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            // Some stacks ignore the scan filter.
            if !props.services.contains(&service) {
                continue;
            }
            if !self.matches_name(props.local_name.as_deref()) {
                continue;
            }

            let handle = handle_for(&peripheral);
            tracing::info!(
                peripheral = %handle,
                name = props.local_name.as_deref().unwrap_or("unknown"),
                rssi = ?props.rssi,
                "Peripheral selected"
            );
            lock(&self.peripherals).insert(handle.clone(), peripheral);
            return Ok(Some(handle));
        }

        tracing::info!("No matching peripheral found");
        Ok(None)
    }

    async fn open_connection(
        &self,
        handle: &PeripheralHandle,
        on_disconnect: DisconnectCallback,
    ) -> Result<()> {
        let adapter = self.adapter()?;
        let peripheral = self.peripheral(handle)?;

        // Subscribe to adapter events first so a drop during setup is seen.
        let mut events = adapter.events().await?;

        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        peripheral.discover_services().await?;

        let id = peripheral.id();
        let watched = handle.clone();
        let peripherals = self.peripherals.clone();
        let links = self.links.clone();
        let watcher = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        tracing::debug!(peripheral = %watched, "Disconnect event received");
                        lock(&peripherals).remove(&watched);
                        links.release(&watched, false);
                        on_disconnect(&watched);
                        return;
                    }
                }
            }
        });
        self.links.set_watcher(handle, watcher);

        tracing::debug!(peripheral = %handle, "Link established and services discovered");
        Ok(())
    }

    async fn write_characteristic(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
        bytes: &[u8],
    ) -> Result<()> {
        let peripheral = self.peripheral(handle)?;
        let target = find_characteristic(&peripheral, service, characteristic)?;
        peripheral.write(&target, bytes, WriteType::WithResponse).await?;
        Ok(())
    }

    async fn subscribe_notifications(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
        on_data: NotificationCallback,
    ) -> Result<()> {
        let peripheral = self.peripheral(handle)?;
        let target = find_characteristic(&peripheral, service, characteristic)?;

        let mut notifications = peripheral.notifications().await?;
        peripheral.subscribe(&target).await?;

        let pump = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == characteristic {
                    on_data(&notification.value);
                }
            }
        });
        self.links.add_pump(handle, pump);
        Ok(())
    }

    async fn list_connected_peripherals(&self, service: Uuid) -> Result<Vec<PeripheralHandle>> {
        let known: Vec<(PeripheralHandle, Peripheral)> = lock(&self.peripherals)
            .iter()
            .map(|(handle, peripheral)| (handle.clone(), peripheral.clone()))
            .collect();

        let mut connected = Vec::new();
        for (handle, peripheral) in known {
            if !peripheral.is_connected().await? {
                continue;
            }
            if peripheral.services().iter().any(|s| s.uuid == service) {
                connected.push(handle);
            }
        }
        Ok(connected)
    }

    async fn disconnect(&self, handle: &PeripheralHandle) -> Result<()> {
        self.links.release(handle, true);
        let peripheral = lock(&self.peripherals).remove(handle);
        if let Some(peripheral) = peripheral {
            if peripheral.is_connected().await? {
                peripheral.disconnect().await?;
            }
            tracing::debug!(peripheral = %handle, "Link closed");
        }
        Ok(())
    }
}
