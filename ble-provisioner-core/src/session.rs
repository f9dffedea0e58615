//! Connection lifecycle and operation orchestration.
//!
//! A `ProvisioningSession` owns the handle of the one connected peripheral and
//! the notification router for that connection. Each public operation makes
//! sure a connection and a subscription exist, registers its state machine as
//! a router listener, arms a deadline timer and writes its request frames.
//! The listener, the timer and link loss all resolve the same `Settle`;
//! whichever fires first wins, and the loser is cancelled before returning.

use crate::config::SessionConfig;
use crate::operations::{
    AddressRetrieval, Exchange, OperationKind, OperationOutcome, Settle, WifiConfiguration,
    WifiScan,
};
use crate::protocol::{self, WifiNetwork};
use crate::router::{NotificationRouter, RouterEvent};
use crate::traits::{BleTransport, DisconnectCallback, PeripheralHandle};
use crate::{Error, Result, codec, lock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Provisioning session for a single peripheral.
///
/// Cloning is cheap and yields another handle onto the same session.
#[derive(Clone)]
pub struct ProvisioningSession {
    shared: Arc<Shared>,
}

struct Shared {
    transport: Arc<dyn BleTransport>,
    config: SessionConfig,
    router: Arc<NotificationRouter>,
    peripheral: Mutex<Option<PeripheralHandle>>,
    // Handle whose `open_connection` is still in progress.
    connecting: Mutex<Option<PeripheralHandle>>,
    initialized: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
    connect_lock: tokio::sync::Mutex<()>,
    in_flight: Mutex<HashSet<OperationKind>>,
}

impl Shared {
    /// Disconnect callback target. Ignores callbacks for a peripheral that is
    /// no longer the current one.
    fn on_link_lost(&self, handle: &PeripheralHandle) {
        {
            let mut connecting = lock(&self.connecting);
            if connecting.as_ref() == Some(handle) {
                tracing::info!(peripheral = %handle, "Peripheral disconnected while connecting");
                *connecting = None;
                return;
            }
        }
        {
            let mut current = lock(&self.peripheral);
            if current.as_ref() != Some(handle) {
                tracing::debug!(peripheral = %handle, "Ignoring disconnect of a stale peripheral");
                return;
            }
            *current = None;
        }
        tracing::info!(peripheral = %handle, "Peripheral disconnected");
        self.router.reset();
    }
}

/// Marks one operation kind as running until dropped.
struct InFlight<'a> {
    running: &'a Mutex<HashSet<OperationKind>>,
    kind: OperationKind,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.running).remove(&self.kind);
    }
}

impl ProvisioningSession {
    pub fn new(transport: Arc<dyn BleTransport>, config: SessionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                router: NotificationRouter::new(),
                peripheral: Mutex::new(None),
                connecting: Mutex::new(None),
                initialized: AtomicBool::new(false),
                init_lock: tokio::sync::Mutex::new(()),
                connect_lock: tokio::sync::Mutex::new(()),
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared.peripheral).is_some()
    }

    /// Handle of the connected peripheral, if any.
    pub fn peripheral(&self) -> Option<PeripheralHandle> {
        lock(&self.shared.peripheral).clone()
    }

    /// Number of notification listeners currently registered.
    pub fn active_listeners(&self) -> usize {
        self.shared.router.listener_count()
    }

    /// Prepares the transport. Must complete before any other operation;
    /// calling it again is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }

        let _guard = self.shared.init_lock.lock().await;
        if self.is_initialized() {
            return Ok(());
        }

        self.shared
            .transport
            .initialize()
            .await
            .map_err(|e| Error::TransportFailure(format!("initialize failed: {e}")))?;
        self.shared.initialized.store(true, Ordering::Release);
        tracing::info!("BLE initialized");
        Ok(())
    }

    /// Connects to a peripheral exposing the provisioning service.
    ///
    /// Returns `Ok(true)` right away if the remembered peripheral is still
    /// connected. A declined selection or a failed connection is a normal
    /// negative outcome (`Ok(false)`); only a missing `initialize()` is an error.
    pub async fn connect(&self) -> Result<bool> {
        self.ensure_initialized()?;
        let _guard = self.shared.connect_lock.lock().await;

        let transport = &self.shared.transport;
        let service = self.shared.config.service_uuid;

        if let Some(current) = self.peripheral() {
            match transport.list_connected_peripherals(service).await {
                Ok(devices) if devices.contains(&current) => {
                    tracing::debug!(peripheral = %current, "Already connected");
                    return Ok(true);
                }
                Ok(_) => {
                    tracing::debug!(
                        peripheral = %current,
                        "Remembered peripheral is gone, reconnecting"
                    );
                }
                Err(e) => {
                    tracing::debug!("Could not list connected peripherals, reconnecting: {}", e);
                }
            }
            self.shared.on_link_lost(&current);
            // Release whatever the transport still holds for the old link.
            if let Err(e) = transport.disconnect(&current).await {
                tracing::debug!(peripheral = %current, "Releasing stale peripheral failed: {}", e);
            }
        }

        let handle = match transport.scan_for_peripheral(service).await {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                tracing::info!("No peripheral selected");
                return Ok(false);
            }
            Err(e) => {
                tracing::error!("Peripheral selection failed: {}", e);
                return Ok(false);
            }
        };

        let shared = Arc::downgrade(&self.shared);
        let on_disconnect: DisconnectCallback = Arc::new(move |handle: &PeripheralHandle| {
            if let Some(shared) = shared.upgrade() {
                shared.on_link_lost(handle);
            }
        });

        // The disconnect callback may fire before `open_connection` returns.
        *lock(&self.shared.connecting) = Some(handle.clone());
        let opened = transport.open_connection(&handle, on_disconnect).await;
        let still_up = lock(&self.shared.connecting).take().as_ref() == Some(&handle);

        if let Err(e) = opened {
            tracing::error!(peripheral = %handle, "Connection failed: {}", e);
            return Ok(false);
        }
        if !still_up {
            tracing::warn!(peripheral = %handle, "Link dropped during connection setup");
            return Ok(false);
        }

        *lock(&self.shared.peripheral) = Some(handle.clone());
        tracing::info!(peripheral = %handle, "Connected");
        Ok(true)
    }

    /// Drops the connection. In-flight operations resolve as failed.
    pub async fn disconnect(&self) -> Result<()> {
        let Some(handle) = lock(&self.shared.peripheral).take() else {
            return Ok(());
        };
        self.shared.router.reset();
        tracing::info!(peripheral = %handle, "Disconnecting");

        self.shared
            .transport
            .disconnect(&handle)
            .await
            .map_err(|e| Error::TransportFailure(format!("disconnect failed: {e}")))
    }

    /// Asks the peripheral for its hardware address.
    ///
    /// Resolves to `None` if no `MAC:` line arrives before the deadline
    /// (`timeout`, or the configured default) or the link drops.
    pub async fn retrieve_address(&self, timeout: Option<Duration>) -> Result<Option<String>> {
        let _running = self.begin(OperationKind::AddressRetrieval)?;
        let handle = self.prepare().await?;
        let timeout = timeout.unwrap_or(self.shared.config.address_timeout);

        let machine = Arc::new(Mutex::new(AddressRetrieval::new()));
        match self.run_exchange(&handle, machine, timeout).await? {
            OperationOutcome::Success(address) if !address.is_empty() => {
                tracing::info!(%address, "Peripheral address retrieved");
                Ok(Some(address))
            }
            OperationOutcome::Success(_) => {
                tracing::warn!("Peripheral reported an empty address");
                Ok(None)
            }
            OperationOutcome::TimedOut => Ok(None),
            OperationOutcome::Failed(reason) => {
                tracing::warn!(%reason, "Address retrieval failed");
                Ok(None)
            }
        }
    }

    /// Has the peripheral scan for WiFi networks.
    ///
    /// Returns the networks reported between `Begin Wifi` and `End Wifi` in
    /// arrival order. If the deadline passes or the link drops first, whatever
    /// was collected so far is returned.
    pub async fn scan_wifi_networks(&self, timeout: Option<Duration>) -> Result<Vec<WifiNetwork>> {
        let _running = self.begin(OperationKind::WifiScan)?;
        let handle = self.prepare().await?;
        let timeout = timeout.unwrap_or(self.shared.config.scan_timeout);

        let machine = Arc::new(Mutex::new(WifiScan::new()));
        let networks = match self.run_exchange(&handle, machine.clone(), timeout).await? {
            OperationOutcome::Success(networks) => networks,
            OperationOutcome::TimedOut => {
                let partial = lock(&machine).take_networks();
                tracing::debug!(collected = partial.len(), "Returning partial scan results");
                partial
            }
            OperationOutcome::Failed(reason) => {
                let partial = lock(&machine).take_networks();
                tracing::warn!(%reason, collected = partial.len(), "WiFi scan aborted");
                partial
            }
        };

        tracing::info!(count = networks.len(), "WiFi scan finished");
        Ok(networks)
    }

    /// Pushes WiFi credentials and waits for the peripheral's verdict.
    ///
    /// Empty `ssid` or `password` fail with `InvalidArgument` before anything
    /// is written. Resolves to `true` only on `SUCCESS`; `FAILED`, the deadline
    /// and link loss all yield `false`.
    pub async fn configure_wifi(
        &self,
        ssid: &str,
        password: &str,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let machine = WifiConfiguration::new(ssid, password)?;
        let _running = self.begin(OperationKind::WifiConfiguration)?;
        let handle = self.prepare().await?;
        let timeout = timeout.unwrap_or(self.shared.config.configure_timeout);

        tracing::info!(%ssid, "Sending WiFi credentials");
        let machine = Arc::new(Mutex::new(machine));
        match self.run_exchange(&handle, machine, timeout).await? {
            OperationOutcome::Success(()) => {
                tracing::info!(%ssid, "Peripheral accepted the WiFi credentials");
                Ok(true)
            }
            OperationOutcome::TimedOut => Ok(false),
            OperationOutcome::Failed(reason) => {
                tracing::warn!(%ssid, %reason, "WiFi configuration failed");
                Ok(false)
            }
        }
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    fn begin(&self, kind: OperationKind) -> Result<InFlight<'_>> {
        if !lock(&self.shared.in_flight).insert(kind) {
            tracing::warn!(operation = %kind, "Rejecting concurrent request");
            return Err(Error::Busy(kind));
        }
        Ok(InFlight {
            running: &self.shared.in_flight,
            kind,
        })
    }

    /// Connects if needed and makes sure notifications flow.
    async fn prepare(&self) -> Result<PeripheralHandle> {
        let handle = self.ensure_connected().await?;
        self.shared
            .router
            .ensure_subscribed(
                self.shared.transport.as_ref(),
                &handle,
                self.shared.config.service_uuid,
                self.shared.config.characteristic_uuid,
            )
            .await?;
        Ok(handle)
    }

    async fn ensure_connected(&self) -> Result<PeripheralHandle> {
        self.ensure_initialized()?;
        if let Some(handle) = self.peripheral() {
            return Ok(handle);
        }
        if self.connect().await? {
            self.peripheral().ok_or(Error::NotConnected)
        } else {
            Err(Error::NotConnected)
        }
    }

    async fn run_exchange<E: Exchange>(
        &self,
        handle: &PeripheralHandle,
        machine: Arc<Mutex<E>>,
        timeout: Duration,
    ) -> Result<OperationOutcome<E::Output>> {
        let (settle, settled) = Settle::new();
        let settle = Arc::new(settle);

        let requests = {
            let mut machine = lock(&machine);
            machine.start();
            machine.requests()
        };

        // Registered before the first write so nothing the peripheral sends is missed.
        let listener = {
            let machine = machine.clone();
            let settle = settle.clone();
            self.shared.router.add_listener(move |event| {
                let outcome = {
                    let mut machine = lock(&machine);
                    match event {
                        RouterEvent::Line(line) => machine.on_line(line),
                        RouterEvent::LinkLost => machine.on_link_lost(),
                    }
                };
                if let Some(outcome) = outcome {
                    settle.resolve(outcome);
                }
            })
        };

        let timer = {
            let machine = machine.clone();
            let settle = settle.clone();
            let kind = E::KIND;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let outcome = lock(&machine).on_deadline();
                if let Some(outcome) = outcome {
                    if settle.resolve(outcome) {
                        tracing::warn!(operation = %kind, ?timeout, "Operation timed out");
                    }
                }
            })
        };

        let sent = async {
            for (index, frame) in requests.iter().enumerate() {
                if index > 0 {
                    tokio::select! {
                        _ = tokio::time::sleep(self.shared.config.settle_interval) => {}
                        _ = settle.settled() => break,
                    }
                }
                if settle.is_settled() {
                    break;
                }
                self.write_frame(handle, frame).await?;
            }
            Ok::<(), Error>(())
        }
        .await;

        if let Err(e) = sent {
            timer.abort();
            listener.dispose();
            return Err(e);
        }
        lock(&machine).on_sent();

        let outcome = settled
            .await
            .unwrap_or_else(|_| OperationOutcome::Failed("operation abandoned".into()));

        timer.abort();
        listener.dispose();
        Ok(outcome)
    }

    async fn write_frame(&self, handle: &PeripheralHandle, frame: &str) -> Result<()> {
        if frame.starts_with(protocol::PASSWORD_FRAME_PREFIX) {
            tracing::debug!(peripheral = %handle, "Write P<redacted>");
        } else {
            tracing::debug!(peripheral = %handle, %frame, "Write");
        }

        self.shared
            .transport
            .write_characteristic(
                handle,
                self.shared.config.service_uuid,
                self.shared.config.characteristic_uuid,
                &codec::encode(frame),
            )
            .await
            .map_err(|e| Error::TransportFailure(format!("write failed: {e}")))
    }
}
