//! The feed session state machine.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FeedStatus {
    Disconnected,
    Connecting,
    Live,
    Resetting,
    #[serde(rename = "CLOSED")]
    MarketClosed,
    Unavailable,
}

/// Events that drive a state transition. Anything not listed here for a
/// given current state is a no-op (logged, not an error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedTransitionEvent {
    SwitchRequested,
    BrokerConnected,
    SubscriptionSettled,
    AtmRebuildTriggered,
    MarketClosedNotice,
    HeartbeatSilenceOutsideMarketHours,
    AuthInvalid,
    EntitlementDenied,
}

impl FeedStatus {
    /// Pure transition function: `None` means the event doesn't apply to
    /// the current state and should be ignored.
    pub fn next(self, event: FeedTransitionEvent) -> Option<FeedStatus> {
        use FeedStatus::*;
        use FeedTransitionEvent::*;

        // Terminal states only escape via explicit external action, not
        // the ordinary event stream.
        if matches!(self, Unavailable) {
            return None;
        }

        match event {
            AuthInvalid | EntitlementDenied => Some(Unavailable),
            SwitchRequested => match self {
                Disconnected => Some(Connecting),
                Live | MarketClosed => Some(Resetting),
                other => Some(other),
            },
            BrokerConnected => match self {
                Connecting => None, // needs SubscriptionSettled too; see FS ingest loop
                other => Some(other),
            },
            SubscriptionSettled => match self {
                Connecting | Resetting => Some(Live),
                other => Some(other),
            },
            AtmRebuildTriggered => match self {
                Live => Some(Resetting),
                other => Some(other),
            },
            MarketClosedNotice | HeartbeatSilenceOutsideMarketHours => match self {
                Live | Resetting => Some(MarketClosed),
                other => Some(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use FeedStatus::*;
    use FeedTransitionEvent::*;

    #[test]
    fn disconnected_to_connecting_on_switch() {
        assert_eq!(Disconnected.next(SwitchRequested), Some(Connecting));
    }

    #[test]
    fn connecting_to_live_needs_subscription_settled() {
        assert_eq!(Connecting.next(BrokerConnected), None);
        assert_eq!(Connecting.next(SubscriptionSettled), Some(Live));
    }

    #[test]
    fn live_to_resetting_on_atm_rebuild() {
        assert_eq!(Live.next(AtmRebuildTriggered), Some(Resetting));
    }

    #[test]
    fn resetting_back_to_live_on_settle() {
        assert_eq!(Resetting.next(SubscriptionSettled), Some(Live));
    }

    #[test]
    fn live_to_market_closed_on_notice() {
        assert_eq!(Live.next(MarketClosedNotice), Some(MarketClosed));
    }

    #[test]
    fn any_state_to_unavailable_on_auth_invalid() {
        for s in [Disconnected, Connecting, Live, Resetting, MarketClosed] {
            assert_eq!(s.next(AuthInvalid), Some(Unavailable));
        }
    }

    #[test]
    fn unavailable_is_terminal_to_the_event_stream() {
        assert_eq!(Unavailable.next(SwitchRequested), None);
        assert_eq!(Unavailable.next(SubscriptionSettled), None);
    }

    #[test]
    fn market_closed_serializes_to_the_wire_vocabulary() {
        assert_eq!(serde_json::to_string(&MarketClosed).unwrap(), "\"CLOSED\"");
        assert_eq!(serde_json::to_string(&Live).unwrap(), "\"LIVE\"");
    }
}
