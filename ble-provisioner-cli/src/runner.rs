use anyhow::{Context, bail};
use ble_provisioner_core::{ProvisioningSession, WifiNetwork};
use std::collections::HashSet;
use std::time::Duration;

/// What a full provisioning run found out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionReport {
    pub address: String,
    pub ssids: Vec<String>,
    pub configured: bool,
}

/// Keeps the first occurrence of every ssid, in arrival order.
pub fn dedup_by_ssid(networks: &[WifiNetwork]) -> Vec<String> {
    let mut seen = HashSet::new();
    networks
        .iter()
        .filter(|n| seen.insert(n.ssid.as_str()))
        .map(|n| n.ssid.clone())
        .collect()
}

/// Initializes the session and connects, failing if nothing was selected.
pub async fn connect(session: &ProvisioningSession) -> anyhow::Result<()> {
    session.initialize().await.context("BLE initialization failed")?;
    if !session.connect().await? {
        bail!("no peripheral connected");
    }
    Ok(())
}

/// Connect, identify the peripheral, scan and push the credentials.
pub async fn provision(
    session: &ProvisioningSession,
    ssid: &str,
    password: &str,
) -> anyhow::Result<ProvisionReport> {
    connect(session).await?;

    // Give the link a moment before the first request.
    let delay = session.config().post_connect_delay;
    if delay > Duration::ZERO {
        tokio::time::sleep(delay).await;
    }

    let Some(address) = session.retrieve_address(None).await? else {
        bail!("could not retrieve the peripheral address");
    };
    tracing::info!("🔗 Connected to peripheral {}", address);

    let networks = session.scan_wifi_networks(None).await?;
    let ssids = dedup_by_ssid(&networks);
    if !ssids.iter().any(|s| s == ssid) {
        tracing::warn!(%ssid, "Network not seen in scan, configuring anyway");
    }

    let configured = session.configure_wifi(ssid, password, None).await?;
    Ok(ProvisionReport {
        address,
        ssids,
        configured,
    })
}

pub async fn address(session: &ProvisioningSession) -> anyhow::Result<String> {
    connect(session).await?;
    session
        .retrieve_address(None)
        .await?
        .context("peripheral did not report an address")
}

pub async fn scan(session: &ProvisioningSession) -> anyhow::Result<Vec<WifiNetwork>> {
    connect(session).await?;
    Ok(session.scan_wifi_networks(None).await?)
}

pub async fn configure(
    session: &ProvisioningSession,
    ssid: &str,
    password: &str,
) -> anyhow::Result<bool> {
    connect(session).await?;
    Ok(session.configure_wifi(ssid, password, None).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(ssid: &str, signal_strength: i32) -> WifiNetwork {
        WifiNetwork {
            ssid: ssid.to_string(),
            signal_strength,
        }
    }

    #[test]
    fn dedup_keeps_first_occurrence_order() {
        let networks = [
            net("Home", -40),
            net("Cafe", -70),
            net("Home", -30),
            net("Office", -55),
            net("Cafe", -60),
        ];
        assert_eq!(dedup_by_ssid(&networks), vec!["Home", "Cafe", "Office"]);
        assert!(dedup_by_ssid(&[]).is_empty());
    }

    #[cfg(feature = "backend_mock")]
    mod flows {
        use super::super::*;
        use ble_provisioner_core::backends::mock::{MockBehavior, MockTransport};
        use ble_provisioner_core::{BleTransport, SessionConfig};
        use std::sync::Arc;

        fn session_with(behavior: MockBehavior) -> (ProvisioningSession, Arc<MockTransport>) {
            let mock = Arc::new(MockTransport::new(behavior));
            let transport: Arc<dyn BleTransport> = mock.clone();
            (ProvisioningSession::new(transport, SessionConfig::default()), mock)
        }

        #[tokio::test(start_paused = true)]
        async fn provision_runs_the_whole_flow() {
            let (session, mock) = session_with(MockBehavior::default());

            let report = provision(&session, "MyHomeWiFi", "secret").await.unwrap();

            assert_eq!(
                report,
                ProvisionReport {
                    address: "24:6F:28:AA:BB:CC".to_string(),
                    ssids: vec!["MyHomeWiFi".to_string(), "CafeGuest".to_string()],
                    configured: true,
                }
            );
            assert_eq!(
                mock.writes(),
                vec!["GET_MAC", "SCAN_WIFI", "CON_WIFI", "SMyHomeWiFi", "Psecret"]
            );
        }

        #[tokio::test(start_paused = true)]
        async fn provision_stops_without_an_address() {
            let (session, mock) = session_with(MockBehavior {
                mac_address: None,
                ..MockBehavior::default()
            });

            assert!(provision(&session, "MyHomeWiFi", "secret").await.is_err());
            assert_eq!(mock.writes(), vec!["GET_MAC"]);
        }

        #[tokio::test(start_paused = true)]
        async fn declined_selection_is_an_error() {
            let (session, _mock) = session_with(MockBehavior {
                decline_selection: true,
                ..MockBehavior::default()
            });

            assert!(scan(&session).await.is_err());
        }
    }
}
