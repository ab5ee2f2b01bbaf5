//! Peer lifecycle: logical state and ICE restart budget

use crate::primitive::IceConnectionState;

/// Logical peer state layered over the primitive's own state machines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// Created, no negotiation yet
    #[default]
    New,
    /// Offer/answer in progress or ICE checking
    Negotiating,
    /// ICE connected or completed
    Connected,
    /// Lost connectivity after having been connected
    Reconnecting,
    /// Ended (terminal)
    Closed,
}

impl PeerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Closed)
    }

    /// State after the primitive reported a new ICE connection state
    pub fn on_ice_state(self, ice: IceConnectionState) -> PeerState {
        match (self, ice) {
            (PeerState::Closed, _) => PeerState::Closed,
            (_, IceConnectionState::Connected | IceConnectionState::Completed) => {
                PeerState::Connected
            }
            (
                PeerState::Connected | PeerState::Reconnecting,
                IceConnectionState::Disconnected | IceConnectionState::Failed,
            ) => PeerState::Reconnecting,
            (PeerState::New, IceConnectionState::Checking) => PeerState::Negotiating,
            (state, _) => state,
        }
    }
}

/// Bounds how many ICE restarts a peer may issue before it reconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IceRestartBudget {
    max: u32,
    used: u32,
}

impl IceRestartBudget {
    pub fn new(max: u32) -> Self {
        Self { max, used: 0 }
    }

    pub fn remaining(&self) -> u32 {
        self.max.saturating_sub(self.used)
    }

    pub fn can_restart(&self) -> bool {
        self.used < self.max
    }

    pub fn record(&mut self) {
        self.used = self.used.saturating_add(1);
    }

    /// Called once connectivity is restored
    pub fn reset(&mut self) {
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_and_drop() {
        let state = PeerState::Negotiating.on_ice_state(IceConnectionState::Connected);
        assert_eq!(state, PeerState::Connected);

        let state = state.on_ice_state(IceConnectionState::Disconnected);
        assert_eq!(state, PeerState::Reconnecting);

        let state = state.on_ice_state(IceConnectionState::Checking);
        assert_eq!(state, PeerState::Reconnecting);

        let state = state.on_ice_state(IceConnectionState::Completed);
        assert_eq!(state, PeerState::Connected);
    }

    #[test]
    fn test_failure_while_negotiating_stays_negotiating() {
        let state = PeerState::Negotiating.on_ice_state(IceConnectionState::Failed);
        assert_eq!(state, PeerState::Negotiating);
    }

    #[test]
    fn test_closed_is_terminal() {
        let state = PeerState::Closed.on_ice_state(IceConnectionState::Connected);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_restart_budget() {
        let mut budget = IceRestartBudget::new(2);
        assert!(budget.can_restart());
        budget.record();
        budget.record();
        assert!(!budget.can_restart());
        assert_eq!(budget.remaining(), 0);

        budget.reset();
        assert_eq!(budget.remaining(), 2);
    }

    #[test]
    fn test_zero_budget_never_restarts() {
        assert!(!IceRestartBudget::new(0).can_restart());
    }
}
