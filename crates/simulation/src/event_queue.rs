//! Deterministic ordering key for the global event queue.

use concord_core::EventPriority;
use std::time::Duration;

/// Orders events by time, then priority (internal before external), then
/// insertion sequence. The sequence makes ordering total, so a BTreeMap
/// keyed by `EventKey` pops events in one well-defined order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventKey {
    pub time: Duration,
    pub priority: EventPriority,
    pub sequence: u64,
    pub node: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_time_then_priority_then_sequence() {
        let early = EventKey {
            time: Duration::from_millis(1),
            priority: EventPriority::Network,
            sequence: 9,
            node: 0,
        };
        let later_internal = EventKey {
            time: Duration::from_millis(2),
            priority: EventPriority::Internal,
            sequence: 1,
            node: 0,
        };
        let later_network = EventKey {
            time: Duration::from_millis(2),
            priority: EventPriority::Network,
            sequence: 0,
            node: 0,
        };
        assert!(early < later_internal);
        assert!(later_internal < later_network);
    }
}
