use super::{Exchange, LINK_LOST_REASON, OperationKind, OperationOutcome};
use crate::protocol;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureState {
    Idle,
    Sending,
    AwaitingAck,
    Success,
    Failed,
    TimedOut,
}

/// `CON_WIFI`, `S<ssid>`, `P<password>` -> `SUCCESS` or `FAILED`.
pub struct WifiConfiguration {
    state: ConfigureState,
    ssid: String,
    password: String,
}

// Keeps the password out of logs and panic messages.
impl std::fmt::Debug for WifiConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WifiConfiguration")
            .field("state", &self.state)
            .field("ssid", &self.ssid)
            .finish_non_exhaustive()
    }
}

impl WifiConfiguration {
    /// Both values must be non-empty.
    pub fn new(ssid: &str, password: &str) -> Result<Self> {
        if ssid.is_empty() {
            return Err(Error::InvalidArgument("ssid must not be empty".into()));
        }
        if password.is_empty() {
            return Err(Error::InvalidArgument("password must not be empty".into()));
        }
        Ok(Self {
            state: ConfigureState::Idle,
            ssid: ssid.to_string(),
            password: password.to_string(),
        })
    }

    pub fn state(&self) -> ConfigureState {
        self.state
    }
}

impl Exchange for WifiConfiguration {
    type Output = ();

    const KIND: OperationKind = OperationKind::WifiConfiguration;

    fn requests(&self) -> Vec<String> {
        vec![
            protocol::CON_WIFI.to_string(),
            protocol::ssid_frame(&self.ssid),
            protocol::password_frame(&self.password),
        ]
    }

    fn start(&mut self) {
        if self.state == ConfigureState::Idle {
            self.state = ConfigureState::Sending;
        }
    }

    fn on_sent(&mut self) {
        if self.state == ConfigureState::Sending {
            self.state = ConfigureState::AwaitingAck;
        }
    }

    fn on_line(&mut self, line: &str) -> Option<OperationOutcome<()>> {
        if self.is_finished() {
            return None;
        }
        match line {
            protocol::ACK_SUCCESS => {
                self.state = ConfigureState::Success;
                Some(OperationOutcome::Success(()))
            }
            protocol::ACK_FAILED => {
                self.state = ConfigureState::Failed;
                Some(OperationOutcome::Failed("peripheral rejected the credentials".into()))
            }
            _ => None,
        }
    }

    fn on_deadline(&mut self) -> Option<OperationOutcome<()>> {
        if self.is_finished() {
            return None;
        }
        self.state = ConfigureState::TimedOut;
        Some(OperationOutcome::TimedOut)
    }

    fn on_link_lost(&mut self) -> Option<OperationOutcome<()>> {
        if self.is_finished() {
            return None;
        }
        self.state = ConfigureState::Failed;
        Some(OperationOutcome::Failed(LINK_LOST_REASON.to_string()))
    }

    fn is_finished(&self) -> bool {
        matches!(
            self.state,
            ConfigureState::Success | ConfigureState::Failed | ConfigureState::TimedOut
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_credentials_are_rejected() {
        assert!(matches!(
            WifiConfiguration::new("", "secret"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            WifiConfiguration::new("home", ""),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn frames_go_out_as_three_separate_writes() {
        let op = WifiConfiguration::new("home", "secret").unwrap();
        assert_eq!(op.requests(), vec!["CON_WIFI", "Shome", "Psecret"]);
    }

    #[test]
    fn walks_sending_then_awaiting_ack_then_success() {
        let mut op = WifiConfiguration::new("home", "secret").unwrap();
        assert_eq!(op.state(), ConfigureState::Idle);
        op.start();
        assert_eq!(op.state(), ConfigureState::Sending);
        op.on_sent();
        assert_eq!(op.state(), ConfigureState::AwaitingAck);

        assert_eq!(op.on_line("MAC:24:6F:28:AA:BB:CC"), None);
        assert_eq!(op.on_line("SUCCESS"), Some(OperationOutcome::Success(())));
        assert_eq!(op.on_line("FAILED"), None);
        assert_eq!(op.on_deadline(), None);
    }

    #[test]
    fn failed_ack_and_deadline_are_negative_outcomes() {
        let mut rejected = WifiConfiguration::new("home", "secret").unwrap();
        rejected.start();
        rejected.on_sent();
        assert!(matches!(rejected.on_line("FAILED"), Some(OperationOutcome::Failed(_))));

        let mut silent = WifiConfiguration::new("home", "secret").unwrap();
        silent.start();
        silent.on_sent();
        assert_eq!(silent.on_deadline(), Some(OperationOutcome::TimedOut));
        assert_eq!(silent.on_line("SUCCESS"), None);
    }

    #[test]
    fn debug_output_hides_the_password() {
        let op = WifiConfiguration::new("home", "hunter2").unwrap();
        assert!(!format!("{op:?}").contains("hunter2"));
    }
}
