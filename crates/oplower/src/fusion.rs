//! Fusion classification.
//!
//! Each registered operator carries an [`OpPattern`]; the graph fusion pass combines the patterns
//! of a producer and its consumer to decide whether both can live in one kernel.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Fusion behaviour of an operator, ordered from most to least fusion-permissive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpPattern {
    /// Pure per-element map.
    Elemwise,
    /// Per-element map with broadcasting between inputs.
    Broadcast,
    /// Index remapping (reshape, pad, layout transforms).
    Injective,
    /// Complex producer (conv, dense, pooling) whose output accepts elementwise epilogues.
    OutElemwiseFusable,
    /// Fusion boundary on both sides.
    Opaque,
}

impl OpPattern {
    pub const ALL: [OpPattern; 5] = [
        OpPattern::Elemwise,
        OpPattern::Broadcast,
        OpPattern::Injective,
        OpPattern::OutElemwiseFusable,
        OpPattern::Opaque,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OpPattern::Elemwise => "ELEMWISE",
            OpPattern::Broadcast => "BROADCAST",
            OpPattern::Injective => "INJECTIVE",
            OpPattern::OutElemwiseFusable => "OUT_ELEMWISE_FUSABLE",
            OpPattern::Opaque => "OPAQUE",
        }
    }

    /// Whether some consumer may be fused onto this operator's output.
    pub fn fusable_as_producer(self) -> bool {
        self != OpPattern::Opaque
    }

    /// Whether this operator may be fused onto some producer's output.
    pub fn fusable_as_consumer(self) -> bool {
        self <= OpPattern::Injective
    }

    fn accepts_consumer(self, consumer: OpPattern) -> bool {
        match self {
            OpPattern::Elemwise | OpPattern::Broadcast => consumer <= OpPattern::Injective,
            OpPattern::Injective => {
                matches!(consumer, OpPattern::Elemwise | OpPattern::Injective)
            }
            OpPattern::OutElemwiseFusable => consumer == OpPattern::Elemwise,
            OpPattern::Opaque => false,
        }
    }
}

impl fmt::Display for OpPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpPattern {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_ascii_uppercase();
        OpPattern::ALL
            .into_iter()
            .find(|pattern| pattern.as_str() == normalized)
            .ok_or_else(|| anyhow!("unknown op pattern: {}", raw.trim()))
    }
}

impl<'de> Deserialize<'de> for OpPattern {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Why a producer/consumer pair stays in separate kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionRejectReason {
    OpaqueProducer,
    OpaqueConsumer,
    /// The consumer is itself a complex op and must anchor its own kernel.
    ConsumerNotFusable(OpPattern),
    /// The producer (or the group it anchors) only admits a narrower class of consumers.
    ProducerRestricts {
        producer: OpPattern,
        consumer: OpPattern,
    },
}

impl fmt::Display for FusionRejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FusionRejectReason::OpaqueProducer => write!(f, "producer is opaque"),
            FusionRejectReason::OpaqueConsumer => write!(f, "consumer is opaque"),
            FusionRejectReason::ConsumerNotFusable(pattern) => {
                write!(f, "{pattern} consumers cannot be fused into a producer")
            }
            FusionRejectReason::ProducerRestricts { producer, consumer } => {
                write!(f, "{producer} producer does not accept {consumer} consumers")
            }
        }
    }
}

/// Decides whether `consumer` may be fused onto the output of `producer`.
pub fn can_fuse(producer: OpPattern, consumer: OpPattern) -> Result<(), FusionRejectReason> {
    if producer == OpPattern::Opaque {
        return Err(FusionRejectReason::OpaqueProducer);
    }
    if consumer == OpPattern::Opaque {
        return Err(FusionRejectReason::OpaqueConsumer);
    }
    if !consumer.fusable_as_consumer() {
        return Err(FusionRejectReason::ConsumerNotFusable(consumer));
    }
    if !producer.accepts_consumer(consumer) {
        return Err(FusionRejectReason::ProducerRestricts { producer, consumer });
    }
    Ok(())
}

/// Greedily groups a linear producer -> consumer chain into fused kernels.
///
/// A group is gated by its most restrictive member: once a convolution anchors a group only
/// elementwise ops may follow it, and an injective member narrows later members the same way.
pub fn partition_chain(patterns: &[OpPattern]) -> Vec<Range<usize>> {
    let mut groups = Vec::new();
    let Some(&first) = patterns.first() else {
        return groups;
    };

    let mut start = 0usize;
    let mut master = first;
    for (idx, &pattern) in patterns.iter().enumerate().skip(1) {
        if can_fuse(master, pattern).is_ok() {
            master = master.max(pattern);
        } else {
            groups.push(start..idx);
            start = idx;
            master = pattern;
        }
    }
    groups.push(start..patterns.len());
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use OpPattern::*;

    #[test]
    fn patterns_are_ordered_by_permissiveness() {
        assert!(Elemwise < Broadcast);
        assert!(Broadcast < Injective);
        assert!(Injective < OutElemwiseFusable);
        assert!(OutElemwiseFusable < Opaque);
    }

    #[test]
    fn opaque_is_a_boundary_on_both_sides() {
        for other in OpPattern::ALL {
            assert_eq!(can_fuse(Opaque, other), Err(FusionRejectReason::OpaqueProducer));
            if other != Opaque {
                assert_eq!(can_fuse(other, Opaque), Err(FusionRejectReason::OpaqueConsumer));
            }
        }
    }

    #[test]
    fn out_elemwise_fusable_takes_only_elemwise_epilogues() {
        assert!(can_fuse(OutElemwiseFusable, Elemwise).is_ok());
        assert!(can_fuse(OutElemwiseFusable, Broadcast).is_err());
        assert!(can_fuse(OutElemwiseFusable, Injective).is_err());
        assert_eq!(
            can_fuse(Elemwise, OutElemwiseFusable),
            Err(FusionRejectReason::ConsumerNotFusable(OutElemwiseFusable))
        );
    }

    #[test]
    fn injective_rules() {
        assert!(can_fuse(Elemwise, Injective).is_ok());
        assert!(can_fuse(Broadcast, Injective).is_ok());
        assert!(can_fuse(Injective, Injective).is_ok());
        assert!(can_fuse(Injective, Elemwise).is_ok());
        assert!(can_fuse(Injective, Broadcast).is_err());
    }

    #[test]
    fn elemwise_and_broadcast_fuse_both_ways() {
        for producer in [Elemwise, Broadcast] {
            for consumer in [Elemwise, Broadcast] {
                assert!(can_fuse(producer, consumer).is_ok());
            }
        }
    }

    #[test]
    fn chain_partition_respects_group_master() {
        // conv -> relu -> flatten -> relu -> softmax -> relu
        let chain = [
            OutElemwiseFusable,
            Elemwise,
            Injective,
            Elemwise,
            Opaque,
            Elemwise,
        ];
        assert_eq!(partition_chain(&chain), vec![0..2, 2..4, 4..5, 5..6]);
        assert!(partition_chain(&[]).is_empty());
    }

    #[test]
    fn parses_any_case() {
        assert_eq!("out_elemwise_fusable".parse::<OpPattern>().unwrap(), OutElemwiseFusable);
        assert_eq!(" Opaque ".parse::<OpPattern>().unwrap(), Opaque);
        assert!("reduce".parse::<OpPattern>().is_err());
    }
}
