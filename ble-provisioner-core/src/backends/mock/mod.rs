use crate::protocol::{self, WifiNetwork};
use crate::traits::{BleTransport, DisconnectCallback, NotificationCallback, PeripheralHandle};
use crate::{Error, Result, lock};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use uuid::Uuid;

/// How the simulated peripheral answers.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Identifier handed out by `scan_for_peripheral`.
    pub device_id: String,
    /// Reply to `GET_MAC`. `None` keeps the peripheral silent.
    pub mac_address: Option<String>,
    /// Lines emitted in reply to `SCAN_WIFI`.
    pub scan_lines: Vec<String>,
    /// Reply to a complete credential triple. `None` keeps the peripheral silent.
    pub credential_reply: Option<String>,
    /// The selection prompt is dismissed without picking anything.
    pub decline_selection: bool,
    /// Delay before each emitted line.
    pub reply_delay: Duration,
    pub reject_writes: bool,
    pub reject_subscribe: bool,
    /// This many connection attempts lose the link before `open_connection` returns.
    pub drops_during_connect: usize,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            device_id: "mock-peripheral".to_string(),
            mac_address: Some("24:6F:28:AA:BB:CC".to_string()),
            scan_lines: scan_burst(&[("MyHomeWiFi", -42), ("CafeGuest", -67), ("MyHomeWiFi", -71)]),
            credential_reply: Some(protocol::ACK_SUCCESS.to_string()),
            decline_selection: false,
            reply_delay: Duration::from_millis(50),
            reject_writes: false,
            reject_subscribe: false,
            drops_during_connect: 0,
        }
    }
}

/// A complete `Begin Wifi` .. `End Wifi` burst for the given networks.
pub fn scan_burst(networks: &[(&str, i32)]) -> Vec<String> {
    let mut lines = vec![protocol::SCAN_BEGIN.to_string()];
    lines.extend(networks.iter().map(|(ssid, signal_strength)| {
        protocol::network_line(&WifiNetwork {
            ssid: ssid.to_string(),
            signal_strength: *signal_strength,
        })
    }));
    lines.push(protocol::SCAN_END.to_string());
    lines
}

/// One packet the session wrote, with the (tokio) time it arrived.
#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub frame: String,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CredentialStep {
    Idle,
    AwaitingSsid,
    AwaitingPassword,
}

struct State {
    initialized: bool,
    connected: Option<PeripheralHandle>,
    on_disconnect: Option<DisconnectCallback>,
    on_data: Option<NotificationCallback>,
    writes: Vec<RecordedWrite>,
    credentials: CredentialStep,
    subscribe_calls: usize,
    selection_prompts: usize,
    connect_attempts: usize,
}

/// In-memory peripheral speaking the provisioning line protocol.
///
/// Records everything the session writes and answers from a spawned task,
/// so replies arrive asynchronously the way notifications do on real hardware.
pub struct MockTransport {
    behavior: MockBehavior,
    state: Arc<Mutex<State>>,
}

impl MockTransport {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            state: Arc::new(Mutex::new(State {
                initialized: false,
                connected: None,
                on_disconnect: None,
                on_data: None,
                writes: Vec::new(),
                credentials: CredentialStep::Idle,
                subscribe_calls: 0,
                selection_prompts: 0,
                connect_attempts: 0,
            })),
        }
    }

    /// Frames written so far, in order.
    pub fn writes(&self) -> Vec<String> {
        lock(&self.state).writes.iter().map(|w| w.frame.clone()).collect()
    }

    pub fn write_log(&self) -> Vec<RecordedWrite> {
        lock(&self.state).writes.clone()
    }

    pub fn subscribe_calls(&self) -> usize {
        lock(&self.state).subscribe_calls
    }

    pub fn selection_prompts(&self) -> usize {
        lock(&self.state).selection_prompts
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected.is_some()
    }

    /// Delivers one text line to the subscriber right away.
    pub fn inject_line(&self, line: &str) {
        self.inject_raw(line.as_bytes());
    }

    /// Delivers an arbitrary payload to the subscriber right away.
    pub fn inject_raw(&self, bytes: &[u8]) {
        let on_data = lock(&self.state).on_data.clone();
        match on_data {
            Some(on_data) => on_data(bytes),
            None => tracing::debug!("[MockTransport] No subscriber, dropping injected payload"),
        }
    }

    /// Drops the link from the peripheral side and fires the disconnect callback.
    pub fn trigger_disconnect(&self) {
        let (handle, on_disconnect) = {
            let mut state = lock(&self.state);
            state.on_data = None;
            state.credentials = CredentialStep::Idle;
            (state.connected.take(), state.on_disconnect.take())
        };

        if let (Some(handle), Some(on_disconnect)) = (handle, on_disconnect) {
            tracing::debug!(peripheral = %handle, "[MockTransport] Simulating link loss");
            on_disconnect(&handle);
        }
    }

    fn connected_to(&self, handle: &PeripheralHandle) -> Result<()> {
        if lock(&self.state).connected.as_ref() == Some(handle) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Works out what the peripheral says back to `frame`.
    fn replies_to(&self, frame: &str) -> Vec<String> {
        let mut state = lock(&self.state);
        match (state.credentials, frame) {
            (_, protocol::CON_WIFI) => {
                state.credentials = CredentialStep::AwaitingSsid;
                Vec::new()
            }
            (_, protocol::GET_MAC) => self
                .behavior
                .mac_address
                .iter()
                .map(|mac| format!("{}{}", protocol::MAC_PREFIX, mac))
                .collect(),
            (_, protocol::SCAN_WIFI) => self.behavior.scan_lines.clone(),
            (CredentialStep::AwaitingSsid, f) if f.starts_with(protocol::SSID_FRAME_PREFIX) => {
                state.credentials = CredentialStep::AwaitingPassword;
                Vec::new()
            }
            (CredentialStep::AwaitingPassword, f)
                if f.starts_with(protocol::PASSWORD_FRAME_PREFIX) =>
            {
                state.credentials = CredentialStep::Idle;
                self.behavior.credential_reply.iter().cloned().collect()
            }
            _ => {
                tracing::debug!(%frame, "[MockTransport] Ignoring unexpected frame");
                Vec::new()
            }
        }
    }

    fn emit(&self, lines: Vec<String>) {
        if lines.is_empty() {
            return;
        }
        let state = self.state.clone();
        let delay = self.behavior.reply_delay;
        tokio::spawn(async move {
            for line in lines {
                sleep(delay).await;
                // Never call out while holding the lock.
                let on_data = lock(&state).on_data.clone();
                let Some(on_data) = on_data else {
                    tracing::debug!("[MockTransport] Link gone, stopping replies");
                    return;
                };
                on_data(line.as_bytes());
            }
        });
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn initialize(&self) -> Result<()> {
        tracing::debug!("[MockTransport] Initialized (simulated)");
        lock(&self.state).initialized = true;
        Ok(())
    }

    async fn scan_for_peripheral(&self, service: Uuid) -> Result<Option<PeripheralHandle>> {
        {
            let mut state = lock(&self.state);
            if !state.initialized {
                return Err(Error::NotInitialized);
            }
            state.selection_prompts += 1;
        }

        if self.behavior.decline_selection {
            tracing::debug!(%service, "[MockTransport] Selection declined");
            return Ok(None);
        }
        tracing::debug!(
            %service,
            device = %self.behavior.device_id,
            "[MockTransport] Peripheral selected"
        );
        Ok(Some(PeripheralHandle::new(self.behavior.device_id.clone())))
    }

    async fn open_connection(
        &self,
        handle: &PeripheralHandle,
        on_disconnect: DisconnectCallback,
    ) -> Result<()> {
        let drop_now = {
            let mut state = lock(&self.state);
            state.connect_attempts += 1;
            state.credentials = CredentialStep::Idle;
            if state.connect_attempts <= self.behavior.drops_during_connect {
                state.connected = None;
                true
            } else {
                state.connected = Some(handle.clone());
                state.on_disconnect = Some(on_disconnect.clone());
                false
            }
        };

        if drop_now {
            tracing::debug!(
                peripheral = %handle,
                "[MockTransport] Link lost during connection setup"
            );
            on_disconnect(handle);
        } else {
            tracing::debug!(peripheral = %handle, "[MockTransport] Connected");
        }
        Ok(())
    }

    async fn write_characteristic(
        &self,
        handle: &PeripheralHandle,
        _service: Uuid,
        _characteristic: Uuid,
        bytes: &[u8],
    ) -> Result<()> {
        if self.behavior.reject_writes {
            return Err(Error::TransportFailure("simulated write rejection".into()));
        }
        self.connected_to(handle)?;

        let frame = String::from_utf8_lossy(bytes).into_owned();
        lock(&self.state).writes.push(RecordedWrite {
            frame: frame.clone(),
            at: Instant::now(),
        });

        let replies = self.replies_to(&frame);
        self.emit(replies);
        Ok(())
    }

    async fn subscribe_notifications(
        &self,
        handle: &PeripheralHandle,
        _service: Uuid,
        _characteristic: Uuid,
        on_data: NotificationCallback,
    ) -> Result<()> {
        if self.behavior.reject_subscribe {
            return Err(Error::TransportFailure("simulated subscription rejection".into()));
        }
        self.connected_to(handle)?;

        let mut state = lock(&self.state);
        state.subscribe_calls += 1;
        state.on_data = Some(on_data);
        tracing::debug!(peripheral = %handle, "[MockTransport] Notifications enabled");
        Ok(())
    }

    async fn list_connected_peripherals(&self, _service: Uuid) -> Result<Vec<PeripheralHandle>> {
        Ok(lock(&self.state).connected.iter().cloned().collect())
    }

    async fn disconnect(&self, handle: &PeripheralHandle) -> Result<()> {
        let mut state = lock(&self.state);
        if state.connected.as_ref() == Some(handle) {
            state.connected = None;
            state.on_data = None;
            state.on_disconnect = None;
            state.credentials = CredentialStep::Idle;
            tracing::debug!(peripheral = %handle, "[MockTransport] Disconnected");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_burst_is_framed_by_sentinels() {
        assert_eq!(
            scan_burst(&[("Home", -40)]),
            vec!["Begin Wifi", "SSID:Home,RSSI:-40", "End Wifi"]
        );
    }

    #[tokio::test]
    async fn writes_require_a_connection() {
        let mock = MockTransport::new(MockBehavior::default());
        let service = Uuid::nil();
        let err = mock
            .write_characteristic(
                &PeripheralHandle::new("mock-peripheral"),
                service,
                service,
                b"GET_MAC",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn selection_requires_initialize() {
        let mock = MockTransport::new(MockBehavior::default());
        assert!(matches!(
            mock.scan_for_peripheral(Uuid::nil()).await,
            Err(Error::NotInitialized)
        ));
    }
}
