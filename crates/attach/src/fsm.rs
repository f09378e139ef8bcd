//! Attachment state machine
//!
//! Owned by a single task; HTTP handlers only deliver events to it.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use tracing::{debug, info};
use wgmesh_common::{Error, Result};

/// Text the bootstrap script reports as its last line
pub const COMPLETION_MARKER: &str = "Node configuration script finished";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachState {
    /// Not serving anybody
    #[default]
    Inactive,
    /// Recording devices that ask for a configuration
    Gathering,
    /// Waiting for the selected device to fetch its script
    Offering,
    /// Script delivered; waiting for its completion report
    Observing,
    Attached,
}

impl fmt::Display for AttachState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inactive => "inactive",
            Self::Gathering => "gathering",
            Self::Offering => "offering",
            Self::Observing => "observing",
            Self::Attached => "attached",
        };
        f.write_str(name)
    }
}

/// Form fields a device sent to `/bootstrap/`, keyed by source address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    pub address: IpAddr,
    pub fields: BTreeMap<String, String>,
}

impl DeviceReport {
    pub fn new(address: IpAddr, fields: BTreeMap<String, String>) -> Self {
        Self {
            address: address.to_canonical(),
            fields,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn hostname(&self) -> Option<&str> {
        self.get("hostname")
    }

    pub fn mac(&self) -> Option<&str> {
        self.get("mac")
    }
}

/// The device an attachment is offered to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub address: IpAddr,
    pub mac: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryReply {
    /// Answer 204
    Ignored,
    /// Answer with the bootstrap script
    Bootstrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseReply {
    /// Sender is not the target; answered 204, nothing recorded
    NotObserved,
    /// Target is not in a phase that expects output; answered 204
    OutOfPhase,
    /// Output accepted; `attached` is set when it was the completion marker
    Accepted { attached: bool },
}

#[derive(Debug, Default)]
pub struct AttachFsm {
    state: AttachState,
    gathered: BTreeMap<IpAddr, DeviceReport>,
    target: Option<Target>,
    reported: Option<DeviceReport>,
}

impl AttachFsm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AttachState {
        self.state
    }

    /// Devices seen while gathering, ordered by address
    pub fn gathered(&self) -> Vec<&DeviceReport> {
        self.gathered.values().collect()
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    /// Fields the target sent when it fetched its script
    pub fn reported(&self) -> Option<&DeviceReport> {
        self.reported.as_ref()
    }

    fn transition(&mut self, to: AttachState) {
        debug!("Attach state {} -> {}", self.state(), to);
        self.state = to;
    }

    fn unexpected(&self, detail: impl Into<String>) -> Error {
        Error::ProtocolState {
            state: self.state().to_string(),
            detail: detail.into(),
        }
    }

    pub fn start_gathering(&mut self) -> Result<()> {
        if self.state() != AttachState::Inactive {
            return Err(self.unexpected("gathering can only start from inactive"));
        }
        self.gathered.clear();
        self.transition(AttachState::Gathering);
        Ok(())
    }

    /// Offer the bootstrap script to one device
    pub fn offer(&mut self, target: Target) -> Result<()> {
        match self.state() {
            AttachState::Inactive | AttachState::Gathering => {
                info!(
                    "Offering configuration to [{}] (MAC {})",
                    target.address,
                    target.mac.as_deref().unwrap_or("unknown")
                );
                self.target = Some(Target {
                    address: target.address.to_canonical(),
                    mac: target.mac,
                });
                self.transition(AttachState::Offering);
                Ok(())
            }
            _ => Err(self.unexpected("a target can only be selected before offering")),
        }
    }

    /// `POST /bootstrap/`
    pub fn on_discovery(&mut self, report: DeviceReport) -> DiscoveryReply {
        match self.state() {
            AttachState::Gathering => {
                debug!("Received in gathering state: {:?}", report);
                self.gathered.insert(report.address, report);
                DiscoveryReply::Ignored
            }
            AttachState::Offering if self.is_target(report.address) => {
                debug!("Received in offering state: {:?}", report);
                self.reported = Some(report);
                self.transition(AttachState::Observing);
                DiscoveryReply::Bootstrap
            }
            _ => {
                debug!(
                    "Ignoring discovery from [{}] in state {}",
                    report.address,
                    self.state()
                );
                DiscoveryReply::Ignored
            }
        }
    }

    /// `POST /bootstrap/response/`
    pub fn on_response(&mut self, from: IpAddr, text: &str) -> ResponseReply {
        if !self.is_target(from) {
            return ResponseReply::NotObserved;
        }
        match self.state() {
            AttachState::Offering | AttachState::Observing => {
                info!("Received from node: [{}]", text);
                let attached = text == COMPLETION_MARKER;
                if attached {
                    self.transition(AttachState::Attached);
                }
                ResponseReply::Accepted { attached }
            }
            _ => {
                debug!("Received output in state {}: [{}]", self.state(), text);
                ResponseReply::OutOfPhase
            }
        }
    }

    fn is_target(&self, address: IpAddr) -> bool {
        self.target
            .as_ref()
            .is_some_and(|t| t.address == address.to_canonical())
    }

    /// Return to `Inactive`, dropping everything gathered or reported
    pub fn reset(&mut self) {
        self.gathered.clear();
        self.target = None;
        self.reported = None;
        self.transition(AttachState::Inactive);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn report(address: &str, hostname: &str) -> DeviceReport {
        DeviceReport::new(
            addr(address),
            BTreeMap::from([
                ("hostname".to_string(), hostname.to_string()),
                ("mac".to_string(), "02:00:00:00:00:01".to_string()),
            ]),
        )
    }

    fn offering(target: &str) -> AttachFsm {
        let mut fsm = AttachFsm::new();
        fsm.offer(Target {
            address: addr(target),
            mac: None,
        })
        .unwrap();
        fsm
    }

    #[test]
    fn test_inactive_ignores_discovery() {
        let mut fsm = AttachFsm::new();
        assert_eq!(fsm.on_discovery(report("10.0.0.5", "a")), DiscoveryReply::Ignored);
        assert!(fsm.gathered().is_empty());
        assert_eq!(fsm.state(), AttachState::Inactive);
    }

    #[test]
    fn test_gathering_last_write_wins() {
        let mut fsm = AttachFsm::new();
        fsm.start_gathering().unwrap();
        fsm.on_discovery(report("10.0.0.7", "first"));
        fsm.on_discovery(report("10.0.0.5", "other"));
        fsm.on_discovery(report("10.0.0.7", "second"));

        let gathered = fsm.gathered();
        assert_eq!(gathered.len(), 2);
        assert_eq!(gathered[0].address, addr("10.0.0.5"));
        assert_eq!(gathered[1].hostname(), Some("second"));
    }

    #[test]
    fn test_offer_only_to_target() {
        let mut fsm = offering("10.0.0.5");
        assert_eq!(fsm.on_discovery(report("10.0.0.6", "x")), DiscoveryReply::Ignored);
        assert_eq!(fsm.state(), AttachState::Offering);

        assert_eq!(fsm.on_discovery(report("10.0.0.5", "n")), DiscoveryReply::Bootstrap);
        assert_eq!(fsm.state(), AttachState::Observing);
        assert_eq!(fsm.reported().and_then(|r| r.hostname()), Some("n"));

        // a second fetch is not served again
        assert_eq!(fsm.on_discovery(report("10.0.0.5", "n")), DiscoveryReply::Ignored);
    }

    #[test]
    fn test_completion_only_from_target() {
        let mut fsm = offering("10.0.0.5");
        fsm.on_discovery(report("10.0.0.5", "n"));

        assert_eq!(
            fsm.on_response(addr("10.0.0.9"), COMPLETION_MARKER),
            ResponseReply::NotObserved
        );
        assert_eq!(fsm.state(), AttachState::Observing);

        assert_eq!(
            fsm.on_response(addr("10.0.0.5"), "Installing ssh keys..."),
            ResponseReply::Accepted { attached: false }
        );
        assert_eq!(
            fsm.on_response(addr("10.0.0.5"), COMPLETION_MARKER),
            ResponseReply::Accepted { attached: true }
        );
        assert_eq!(fsm.state(), AttachState::Attached);
        assert_eq!(
            fsm.on_response(addr("10.0.0.5"), COMPLETION_MARKER),
            ResponseReply::OutOfPhase
        );
    }

    #[test]
    fn test_mapped_ipv4_matches_target() {
        let mut fsm = offering("10.0.0.5");
        assert_eq!(
            fsm.on_discovery(report("::ffff:10.0.0.5", "n")),
            DiscoveryReply::Bootstrap
        );
    }

    #[test]
    fn test_invalid_transitions() {
        let mut fsm = offering("10.0.0.5");
        assert!(matches!(
            fsm.start_gathering(),
            Err(Error::ProtocolState { .. })
        ));
        assert!(fsm
            .offer(Target {
                address: addr("10.0.0.6"),
                mac: None
            })
            .is_err());

        fsm.reset();
        assert_eq!(fsm.state(), AttachState::Inactive);
        assert!(fsm.target().is_none());
        fsm.start_gathering().unwrap();
    }
}
