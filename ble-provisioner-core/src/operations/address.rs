use super::{Exchange, LINK_LOST_REASON, OperationKind, OperationOutcome};
use crate::protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressState {
    Idle,
    AwaitingAddress,
    Resolved,
    TimedOut,
    Failed,
}

/// `GET_MAC` -> first `MAC:<address>` line.
#[derive(Debug)]
pub struct AddressRetrieval {
    state: AddressState,
}

impl Default for AddressRetrieval {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressRetrieval {
    pub fn new() -> Self {
        Self {
            state: AddressState::Idle,
        }
    }

    pub fn state(&self) -> AddressState {
        self.state
    }
}

impl Exchange for AddressRetrieval {
    type Output = String;

    const KIND: OperationKind = OperationKind::AddressRetrieval;

    fn requests(&self) -> Vec<String> {
        vec![protocol::GET_MAC.to_string()]
    }

    fn start(&mut self) {
        if self.state == AddressState::Idle {
            self.state = AddressState::AwaitingAddress;
        }
    }

    fn on_line(&mut self, line: &str) -> Option<OperationOutcome<String>> {
        if self.is_finished() {
            return None;
        }
        let address = protocol::parse_mac_line(line)?;
        self.state = AddressState::Resolved;
        Some(OperationOutcome::Success(address.to_string()))
    }

    fn on_deadline(&mut self) -> Option<OperationOutcome<String>> {
        if self.is_finished() {
            return None;
        }
        self.state = AddressState::TimedOut;
        Some(OperationOutcome::TimedOut)
    }

    fn on_link_lost(&mut self) -> Option<OperationOutcome<String>> {
        if self.is_finished() {
            return None;
        }
        self.state = AddressState::Failed;
        Some(OperationOutcome::Failed(LINK_LOST_REASON.to_string()))
    }

    fn is_finished(&self) -> bool {
        matches!(
            self.state,
            AddressState::Resolved | AddressState::TimedOut | AddressState::Failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_mac_line_resolves_and_strips_prefix() {
        let mut op = AddressRetrieval::new();
        op.start();
        assert_eq!(op.requests(), vec!["GET_MAC"]);

        assert_eq!(op.on_line("SSID:Home,RSSI:-40"), None);
        assert_eq!(op.on_line("Begin Wifi"), None);
        assert_eq!(
            op.on_line("MAC: 24:6F:28:AA:BB:CC"),
            Some(OperationOutcome::Success("24:6F:28:AA:BB:CC".to_string()))
        );
        assert_eq!(op.state(), AddressState::Resolved);

        // Later inputs never produce a second resolution.
        assert_eq!(op.on_line("MAC:11:22:33:44:55:66"), None);
        assert_eq!(op.on_deadline(), None);
        assert_eq!(op.on_link_lost(), None);
    }

    #[test]
    fn deadline_before_any_address_times_out() {
        let mut op = AddressRetrieval::new();
        op.start();

        assert_eq!(op.on_deadline(), Some(OperationOutcome::TimedOut));
        assert_eq!(op.on_line("MAC:24:6F:28:AA:BB:CC"), None);
        assert_eq!(op.state(), AddressState::TimedOut);
    }

    #[test]
    fn link_loss_fails_the_exchange() {
        let mut op = AddressRetrieval::new();
        op.start();

        assert_eq!(
            op.on_link_lost(),
            Some(OperationOutcome::Failed(LINK_LOST_REASON.to_string()))
        );
        assert!(op.is_finished());
    }
}
