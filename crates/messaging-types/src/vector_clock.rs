//! Vector clocks: per-node counters used for optional causal annotation of
//! messages (spec §3 `Message.vectorClock`).

use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A mapping from node-id to a non-negative counter.
///
/// Merge is element-wise max; entries only ever move forward (spec §3:
/// "monotone-nondecreasing per entry").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorClock {
    counters: BTreeMap<String, u64>,
}

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// `self` strictly dominates `other` componentwise.
    Before,
    /// `other` strictly dominates `self` componentwise.
    After,
    /// Clocks are identical in every component.
    Equal,
    /// Neither dominates: concurrent.
    Concurrent,
}

impl VectorClock {
    /// An empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter for `node`, returning the new value.
    pub fn increment(&mut self, node: &str) -> u64 {
        let counter = self.counters.entry(node.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// The counter recorded for `node`, or 0 if absent.
    pub fn get(&self, node: &str) -> u64 {
        self.counters.get(node).copied().unwrap_or(0)
    }

    /// Merges `other` into `self` by taking the element-wise max.
    pub fn merge(&mut self, other: &VectorClock) {
        for (node, &value) in &other.counters {
            let counter = self.counters.entry(node.clone()).or_insert(0);
            *counter = (*counter).max(value);
        }
    }

    /// Compares `self` against `other` per spec §8 invariant 8: strict
    /// componentwise dominance in one direction is `Before`/`After`; a mix of
    /// strictly-greater and strictly-less components is `Concurrent`.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_greater = false;
        let mut other_greater = false;

        let mut nodes: Vec<&String> = self.counters.keys().chain(other.counters.keys()).collect();
        nodes.sort();
        nodes.dedup();

        for node in nodes {
            match self.get(node).cmp(&other.get(node)) {
                Ordering::Greater => self_greater = true,
                Ordering::Less => other_greater = true,
                Ordering::Equal => {}
            }
        }

        match (self_greater, other_greater) {
            (true, true) => ClockOrdering::Concurrent,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (false, false) => ClockOrdering::Equal,
        }
    }

    /// Serializes as `key:value;key:value...`, empty string for the empty
    /// clock (spec §6 "Vector-clock serialization").
    pub fn serialize(&self) -> String {
        self.counters
            .iter()
            .map(|(node, value)| format!("{node}:{value}"))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Parses the `key:value;key:value...` format. Malformed entries
    /// (missing `:`, non-numeric value) are silently dropped, per spec §6.
    pub fn deserialize(s: &str) -> Self {
        let mut counters = BTreeMap::new();
        if s.is_empty() {
            return Self { counters };
        }
        for entry in s.split(';') {
            let Some((node, value)) = entry.split_once(':') else {
                continue;
            };
            if node.is_empty() {
                continue;
            }
            if let Ok(value) = value.parse::<u64>() {
                counters.insert(node.to_string(), value);
            }
        }
        Self { counters }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_serialize_deserialize() {
        let mut clock = VectorClock::new();
        clock.increment("node-1");
        clock.increment("node-1");
        clock.increment("node-2");

        let parsed = VectorClock::deserialize(&clock.serialize());
        assert_eq!(parsed, clock);
    }

    #[test]
    fn empty_clock_round_trips_through_empty_string() {
        let clock = VectorClock::new();
        assert_eq!(clock.serialize(), "");
        assert_eq!(VectorClock::deserialize(""), clock);
    }

    #[test]
    fn drops_malformed_entries() {
        let parsed = VectorClock::deserialize("node-1:3;garbage;node-2:;:5;node-3:7");
        assert_eq!(parsed.get("node-1"), 3);
        assert_eq!(parsed.get("node-3"), 7);
        assert_eq!(parsed.get("node-2"), 0);
    }

    #[test]
    fn strict_dominance_compares_before_and_after() {
        let mut a = VectorClock::new();
        a.increment("node-1");
        a.increment("node-1");
        let mut b = VectorClock::new();
        b.increment("node-1");

        assert_eq!(a.compare(&b), ClockOrdering::Before);
        assert_eq!(b.compare(&a), ClockOrdering::After);
    }

    #[test]
    fn disjoint_components_are_concurrent() {
        let mut a = VectorClock::new();
        a.increment("node-1");
        let mut b = VectorClock::new();
        b.increment("node-2");

        assert_eq!(a.compare(&b), ClockOrdering::Concurrent);
    }

    proptest::proptest! {
        #[test]
        fn serialize_deserialize_roundtrips_any_entry_set(
            entries in proptest::collection::vec(("[a-z]{1,8}", 0u64..10_000), 0..8)
        ) {
            let mut clock = VectorClock::new();
            for (node, count) in &entries {
                for _ in 0..*count {
                    clock.increment(node);
                }
            }
            let parsed = VectorClock::deserialize(&clock.serialize());
            prop_assert_eq!(parsed, clock);
        }

        #[test]
        fn merge_is_commutative_and_monotone(
            a_entries in proptest::collection::vec(("[a-z]{1,4}", 1u64..50), 0..6),
            b_entries in proptest::collection::vec(("[a-z]{1,4}", 1u64..50), 0..6),
        ) {
            let build = |entries: &[(String, u64)]| {
                let mut clock = VectorClock::new();
                for (node, count) in entries {
                    for _ in 0..*count {
                        clock.increment(node);
                    }
                }
                clock
            };
            let a = build(&a_entries);
            let b = build(&b_entries);

            let mut ab = a.clone();
            ab.merge(&b);
            let mut ba = b.clone();
            ba.merge(&a);
            prop_assert_eq!(&ab, &ba);

            for (node, _) in a_entries.iter().chain(b_entries.iter()) {
                prop_assert!(ab.get(node) >= a.get(node));
                prop_assert!(ab.get(node) >= b.get(node));
            }
        }
    }
}
