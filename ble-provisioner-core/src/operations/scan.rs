use super::{Exchange, LINK_LOST_REASON, OperationKind, OperationOutcome};
use crate::protocol::{self, WifiNetwork};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    AwaitingStart,
    Collecting,
    Completed,
    TimedOut,
    Failed,
}

/// `SCAN_WIFI` -> everything between `Begin Wifi` and `End Wifi`.
///
/// Results keep arrival order and duplicates; deduplication is the caller's job.
#[derive(Debug)]
pub struct WifiScan {
    state: ScanState,
    networks: Vec<WifiNetwork>,
}

impl Default for WifiScan {
    fn default() -> Self {
        Self::new()
    }
}

impl WifiScan {
    pub fn new() -> Self {
        Self {
            state: ScanState::Idle,
            networks: Vec::new(),
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Networks collected so far. After a timeout or link loss these are the
    /// partial results.
    pub fn take_networks(&mut self) -> Vec<WifiNetwork> {
        std::mem::take(&mut self.networks)
    }
}

impl Exchange for WifiScan {
    type Output = Vec<WifiNetwork>;

    const KIND: OperationKind = OperationKind::WifiScan;

    fn requests(&self) -> Vec<String> {
        vec![protocol::SCAN_WIFI.to_string()]
    }

    fn start(&mut self) {
        if self.state == ScanState::Idle {
            self.state = ScanState::AwaitingStart;
        }
    }

    fn on_line(&mut self, line: &str) -> Option<OperationOutcome<Vec<WifiNetwork>>> {
        if self.is_finished() {
            return None;
        }

        if line == protocol::SCAN_BEGIN {
            // A repeated sentinel restarts the burst.
            if !self.networks.is_empty() {
                tracing::debug!(dropped = self.networks.len(), "Scan restarted by peripheral");
            }
            self.networks.clear();
            self.state = ScanState::Collecting;
            return None;
        }

        if line == protocol::SCAN_END {
            self.state = ScanState::Completed;
            return Some(OperationOutcome::Success(std::mem::take(&mut self.networks)));
        }

        if self.state != ScanState::Collecting || !line.starts_with(protocol::NETWORK_PREFIX) {
            return None;
        }

        match protocol::parse_network_line(line) {
            Some(network) => self.networks.push(network),
            None => tracing::warn!(%line, "Skipping malformed network line"),
        }
        None
    }

    fn on_deadline(&mut self) -> Option<OperationOutcome<Vec<WifiNetwork>>> {
        if self.is_finished() {
            return None;
        }
        self.state = ScanState::TimedOut;
        Some(OperationOutcome::TimedOut)
    }

    fn on_link_lost(&mut self) -> Option<OperationOutcome<Vec<WifiNetwork>>> {
        if self.is_finished() {
            return None;
        }
        self.state = ScanState::Failed;
        Some(OperationOutcome::Failed(LINK_LOST_REASON.to_string()))
    }

    fn is_finished(&self) -> bool {
        matches!(
            self.state,
            ScanState::Completed | ScanState::TimedOut | ScanState::Failed
        )
    }
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

    fn started() -> WifiScan {
        let mut op = WifiScan::new();
        op.start();
        op
    }

    #[test]
    fn collects_lines_between_sentinels_in_arrival_order() {
        let mut op = started();
        assert_eq!(op.requests(), vec!["SCAN_WIFI"]);

        for line in [
            "SSID:Early,RSSI:-10",
            "Begin Wifi",
            "SSID:Home,RSSI:-40",
            "MAC:24:6F:28:AA:BB:CC",
            "SSID:Guest,RSSI:-70",
            "SSID:Home,RSSI:-41",
        ] {
            assert_eq!(op.on_line(line), None);
        }
        assert_eq!(op.state(), ScanState::Collecting);

        assert_eq!(
            op.on_line("End Wifi"),
            Some(OperationOutcome::Success(vec![
                net("Home", -40),
                net("Guest", -70),
                net("Home", -41),
            ]))
        );
        assert_eq!(op.state(), ScanState::Completed);
        assert_eq!(op.on_deadline(), None);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let mut op = started();
        op.on_line("Begin Wifi");
        op.on_line("SSID:NoSignal");
        op.on_line("SSID:Bad,RSSI:loud");
        op.on_line("SSID:Good,RSSI:-55");

        assert_eq!(
            op.on_line("End Wifi"),
            Some(OperationOutcome::Success(vec![net("Good", -55)]))
        );
    }

    #[test]
    fn second_begin_sentinel_resets_the_burst() {
        let mut op = started();
        op.on_line("Begin Wifi");
        op.on_line("SSID:Stale,RSSI:-90");
        op.on_line("Begin Wifi");
        op.on_line("SSID:Fresh,RSSI:-30");

        assert_eq!(
            op.on_line("End Wifi"),
            Some(OperationOutcome::Success(vec![net("Fresh", -30)]))
        );
    }

    #[test]
    fn end_before_begin_completes_empty() {
        let mut op = started();
        op.on_line("SSID:Early,RSSI:-10");

        assert_eq!(op.on_line("End Wifi"), Some(OperationOutcome::Success(Vec::new())));
    }

    #[test]
    fn deadline_keeps_partial_results() {
        let mut op = started();
        op.on_line("Begin Wifi");
        op.on_line("SSID:Home,RSSI:-40");

        assert_eq!(op.on_deadline(), Some(OperationOutcome::TimedOut));
        assert_eq!(op.on_line("End Wifi"), None);
        assert_eq!(op.take_networks(), vec![net("Home", -40)]);
    }

    #[test]
    fn link_loss_keeps_partial_results() {
        let mut op = started();
        op.on_line("Begin Wifi");
        op.on_line("SSID:Home,RSSI:-40");

        assert!(matches!(op.on_link_lost(), Some(OperationOutcome::Failed(_))));
        assert_eq!(op.state(), ScanState::Failed);
        assert_eq!(op.take_networks(), vec![net("Home", -40)]);
    }
}
