//! Flow-graph command nodes.
//!
//! A node owns an ordered list of compute passes and a completion rule: run
//! the passes a fixed number of times, or keep running them until a
//! GPU-computed flag satisfies a comparison. The variant set is closed, so
//! nodes are a tagged sum rather than trait objects.
//!
//! Pinned contracts: an iterable node executes its passes exactly `count`
//! times; a pollable node is complete exactly when its comparison evaluates
//! true against the most recent flag value, and is incomplete before the
//! first readback.

use std::sync::Arc;

use derive_more::Display;
use serde::Deserialize;

/// A named reference to one pipeline plus a 3-D dispatch group count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputePass {
    pub pipeline: String,
    pub group_counts: [u32; 3],
}

/// Loop-termination comparison of a pollable node.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum CompareOp {
    #[display("less")]
    #[serde(rename = "less")]
    Less,
    #[display("lEqual")]
    #[serde(rename = "lEqual")]
    LessEqual,
    #[display("greater")]
    #[serde(rename = "greater")]
    Greater,
    #[display("gEqual")]
    #[serde(rename = "gEqual")]
    GreaterEqual,
    #[display("equal")]
    #[serde(rename = "equal")]
    Equal,
}

impl CompareOp {
    pub fn eval(self, value: f32, threshold: f32) -> bool {
        match self {
            Self::Less => value < threshold,
            Self::LessEqual => value <= threshold,
            Self::Greater => value > threshold,
            Self::GreaterEqual => value >= threshold,
            Self::Equal => value == threshold,
        }
    }
}

/// One 4-byte flag value, viewable as either producer convention.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Flag(pub [u8; 4]);

impl Flag {
    pub fn as_f32(self) -> f32 {
        f32::from_le_bytes(self.0)
    }

    pub fn as_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }
}

/// Where a pollable node reads its flag from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagSource {
    /// The buffer a shader writes the flag into.
    pub buffer: String,
    /// Index of the 32-bit flag slot inside that buffer.
    pub index: u64,
    /// Host-visible staging buffer the flag is copied into before readback.
    /// `None` on unified-memory devices, where the flag buffer itself is
    /// host-readable.
    pub staging: Option<String>,
}

impl FlagSource {
    /// The buffer and byte offset the host actually maps.
    pub fn read_location(&self) -> (&str, u64) {
        match &self.staging {
            Some(staging) => (staging, 0),
            None => (&self.buffer, self.index * 4),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Iterate {
        count: u64,
        done: u64,
    },
    Poll {
        op: CompareOp,
        threshold: f32,
        source: FlagSource,
        latest: Option<f32>,
    },
}

/// One node of the flow graph.
#[derive(Debug, Clone)]
pub struct CommandNode {
    pub name: String,
    pub passes: Vec<Arc<ComputePass>>,
    pub kind: NodeKind,
}

impl CommandNode {
    pub fn iterate(name: impl Into<String>, passes: Vec<Arc<ComputePass>>, count: u64) -> Self {
        Self {
            name: name.into(),
            passes,
            kind: NodeKind::Iterate { count, done: 0 },
        }
    }

    pub fn poll(
        name: impl Into<String>,
        passes: Vec<Arc<ComputePass>>,
        op: CompareOp,
        threshold: f32,
        source: FlagSource,
    ) -> Self {
        Self {
            name: name.into(),
            passes,
            kind: NodeKind::Poll {
                op,
                threshold,
                source,
                latest: None,
            },
        }
    }

    pub fn is_complete(&self) -> bool {
        match &self.kind {
            NodeKind::Iterate { count, done } => done >= count,
            NodeKind::Poll {
                op,
                threshold,
                latest,
                ..
            } => latest.map(|value| op.eval(value, *threshold)).unwrap_or(false),
        }
    }

    /// Records one completed execution of the node's passes. For pollable
    /// nodes, `value` is the flag read back after that execution.
    pub fn observe(&mut self, value: Option<f32>) {
        match &mut self.kind {
            NodeKind::Iterate { done, .. } => *done += 1,
            NodeKind::Poll { latest, .. } => *latest = value,
        }
    }

    /// The flag source of a pollable node.
    pub fn flag_source(&self) -> Option<&FlagSource> {
        match &self.kind {
            NodeKind::Poll { source, .. } => Some(source),
            NodeKind::Iterate { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterable_runs_exactly_count_times() {
        let mut node = CommandNode::iterate("spin", vec![], 3);
        let mut executions = 0;
        while !node.is_complete() {
            executions += 1;
            node.observe(None);
            assert!(executions <= 3, "iterable node overran its count");
        }
        assert_eq!(executions, 3);
    }

    #[test]
    fn zero_count_iterable_never_executes() {
        let node = CommandNode::iterate("noop", vec![], 0);
        assert!(node.is_complete());
    }

    #[test]
    fn pollable_completes_when_comparison_holds() {
        let source = FlagSource {
            buffer: "clock".into(),
            index: 0,
            staging: None,
        };
        let mut node = CommandNode::poll("relax", vec![], CompareOp::GreaterEqual, 5.0, source);

        // flag rises by 1.0 per pass from 0.0: completes after pass 5
        let mut value = 0.0;
        let mut passes = 0;
        while !node.is_complete() {
            value += 1.0;
            passes += 1;
            node.observe(Some(value));
            assert!(passes <= 16, "pollable node failed to terminate");
        }
        assert_eq!(passes, 5);
    }

    #[test]
    fn pollable_with_static_flag_stays_pending() {
        let source = FlagSource {
            buffer: "clock".into(),
            index: 0,
            staging: None,
        };
        let mut node = CommandNode::poll("stuck", vec![], CompareOp::GreaterEqual, 5.0, source);
        for _ in 0..32 {
            assert!(!node.is_complete());
            node.observe(Some(0.0));
        }
        assert!(!node.is_complete());
    }

    #[test]
    fn compare_op_table() {
        use CompareOp::*;
        assert!(Less.eval(1.0, 2.0) && !Less.eval(2.0, 2.0));
        assert!(LessEqual.eval(2.0, 2.0) && !LessEqual.eval(3.0, 2.0));
        assert!(Greater.eval(3.0, 2.0) && !Greater.eval(2.0, 2.0));
        assert!(GreaterEqual.eval(2.0, 2.0) && !GreaterEqual.eval(1.0, 2.0));
        assert!(Equal.eval(2.0, 2.0) && !Equal.eval(2.5, 2.0));
    }

    #[test]
    fn flag_views_share_bits() {
        let flag = Flag(1.5f32.to_le_bytes());
        assert_eq!(flag.as_f32(), 1.5);
        assert_eq!(flag.as_u32(), 1.5f32.to_bits());
    }

    #[test]
    fn flag_read_location_prefers_staging() {
        let staged = FlagSource {
            buffer: "clock".into(),
            index: 3,
            staging: Some("clock-staging".into()),
        };
        assert_eq!(staged.read_location(), ("clock-staging", 0));

        let direct = FlagSource {
            buffer: "clock".into(),
            index: 3,
            staging: None,
        };
        assert_eq!(direct.read_location(), ("clock", 12));
    }
}
