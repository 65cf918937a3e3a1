use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No transport open
    Disconnected,
    /// Transport open in progress
    Connecting,
    /// Transport open, not yet authorized
    Connected,
    /// Authorization request in flight
    Authenticating,
    /// Authorized, all requests allowed
    Ready,
    /// Shutdown requested, draining
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Authenticating => "AUTHENTICATING",
            ConnectionState::Ready => "READY",
            ConnectionState::Closing => "CLOSING",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, target) {
            // Any state may drop to Disconnected (transport closed/errored)
            (_, Disconnected) => true,

            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Authenticating) => true,
            (Authenticating, Ready) => true,

            // Shutdown
            (Ready, Closing) => true,
            (Connected, Closing) => true,

            _ => false,
        }
    }

    /// Transport is open (whether or not authorized)
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Authenticating | ConnectionState::Ready
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Contract lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractState {
    /// Proposal requested
    Quoting,
    /// Buy request in flight
    Buying,
    /// Position open on the server
    Open,
    /// Take-profit/stop-loss update in flight
    Modifying,
    /// Sell-to-close in flight
    Closing,
    /// Sell-to-cancel in flight
    Cancelling,
    /// Terminal
    Settled,
}

impl ContractState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractState::Quoting => "QUOTING",
            ContractState::Buying => "BUYING",
            ContractState::Open => "OPEN",
            ContractState::Modifying => "MODIFYING",
            ContractState::Closing => "CLOSING",
            ContractState::Cancelling => "CANCELLING",
            ContractState::Settled => "SETTLED",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: ContractState) -> bool {
        use ContractState::*;

        match (self, target) {
            (Quoting, Buying) => true,
            (Buying, Open) => true,

            // Modify round-trip; failure also lands back in Open
            (Open, Modifying) => true,
            (Modifying, Open) => true,

            (Open, Closing) => true,
            (Open, Cancelling) => true,
            (Closing, Settled) => true,
            (Cancelling, Settled) => true,

            // A failed close/cancel leaves the position open
            (Closing, Open) => true,
            (Cancelling, Open) => true,

            _ => false,
        }
    }

    /// Get valid next states from current state
    pub fn valid_transitions(&self) -> Vec<ContractState> {
        use ContractState::*;

        match self {
            Quoting => vec![Buying],
            Buying => vec![Open],
            Open => vec![Modifying, Closing, Cancelling],
            Modifying => vec![Open],
            Closing => vec![Settled, Open],
            Cancelling => vec![Settled, Open],
            Settled => vec![],
        }
    }

    /// States at or past `Open` carry a server-assigned contract id
    pub fn has_server_id(&self) -> bool {
        !matches!(self, ContractState::Quoting | ContractState::Buying)
    }

    /// An operation is in flight against the server
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ContractState::Quoting
                | ContractState::Buying
                | ContractState::Modifying
                | ContractState::Closing
                | ContractState::Cancelling
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ContractState::Settled)
    }
}

impl fmt::Display for ContractState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ContractState {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "QUOTING" => Ok(ContractState::Quoting),
            "BUYING" => Ok(ContractState::Buying),
            "OPEN" => Ok(ContractState::Open),
            "MODIFYING" => Ok(ContractState::Modifying),
            "CLOSING" => Ok(ContractState::Closing),
            "CANCELLING" => Ok(ContractState::Cancelling),
            "SETTLED" => Ok(ContractState::Settled),
            _ => Err(format!("Unknown contract state: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_transitions() {
        use ConnectionState::*;

        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Authenticating));
        assert!(Authenticating.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Closing));
        assert!(Ready.can_transition_to(Disconnected));
        assert!(Authenticating.can_transition_to(Disconnected));

        assert!(!Disconnected.can_transition_to(Ready));
        assert!(!Connecting.can_transition_to(Ready));
        assert!(!Closing.can_transition_to(Ready));
    }

    #[test]
    fn test_contract_transitions() {
        use ContractState::*;

        assert!(Quoting.can_transition_to(Buying));
        assert!(Buying.can_transition_to(Open));
        assert!(Open.can_transition_to(Modifying));
        assert!(Modifying.can_transition_to(Open));
        assert!(Open.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Settled));
        assert!(Cancelling.can_transition_to(Settled));

        assert!(!Quoting.can_transition_to(Open));
        assert!(!Modifying.can_transition_to(Closing));
        assert!(!Settled.can_transition_to(Open));
        assert!(Settled.valid_transitions().is_empty());
    }

    #[test]
    fn test_valid_transitions_agree_with_predicate() {
        use ContractState::*;

        for from in [Quoting, Buying, Open, Modifying, Closing, Cancelling, Settled] {
            for to in from.valid_transitions() {
                assert!(from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_server_id_states() {
        assert!(!ContractState::Quoting.has_server_id());
        assert!(!ContractState::Buying.has_server_id());
        assert!(ContractState::Open.has_server_id());
        assert!(ContractState::Settled.has_server_id());
    }

    #[test]
    fn test_state_from_str() {
        assert_eq!(ContractState::try_from("open").unwrap(), ContractState::Open);
        assert!(ContractState::try_from("PENDING").is_err());
    }
}
