//! Types for representing the terminator branch of a code block.

use serde::{Deserialize, Serialize};
use crate::error::*;
use crate::id::*;

/// Tolerance used when checking that a probability distribution sums to 1.
pub const PROBABILITY_EPSILON: f64 = 1e-9;

/// Representing the different kinds of control-flow that can end a block.
///
/// Each variant corresponds to the machine branch that the lowered code
/// must produce once compiled.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchType {
    /// A direct procedure call. Execution resumes at the next block.
    DirectCall,

    /// A procedure call through a register/memory operand.
    IndirectCall,

    /// A direct conditional branch to a block in the same function.
    /// The not-taken path falls through to the next block.
    ConditionalDirect,

    /// An unconditional jump through a register/memory operand to one of
    /// several blocks in the same function.
    IndirectBranch,

    /// A return instruction.
    Return,

    /// No instruction at all; execution continues into the next block.
    Fallthrough,
}

/// The number of targets a [`BranchType`] requires.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
}
impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match self {
            Self::Exactly(x) => n == *x,
            Self::AtLeast(x) => n >= *x,
        }
    }
}

impl std::fmt::Display for Arity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Exactly(x) => write!(f, "exactly {}", x),
            Self::AtLeast(x) => write!(f, "at least {}", x),
        }
    }
}

impl BranchType {
    /// Returns the number of targets a branch of this type must carry.
    pub fn arity(&self) -> Arity {
        match self {
            Self::DirectCall        => Arity::Exactly(1),
            Self::ConditionalDirect => Arity::Exactly(1),
            Self::IndirectCall      => Arity::AtLeast(2),
            Self::IndirectBranch    => Arity::AtLeast(2),
            Self::Return            => Arity::Exactly(0),
            Self::Fallthrough       => Arity::Exactly(0),
        }
    }

    /// Returns 'true' if the targets of this branch are function ids.
    pub fn is_call(&self) -> bool {
        matches!(self, Self::DirectCall | Self::IndirectCall)
    }

    /// Returns 'true' if the targets of this branch are block ids in the
    /// same function.
    pub fn is_intra_function(&self) -> bool {
        matches!(self, Self::ConditionalDirect | Self::IndirectBranch)
    }

    /// Returns 'true' if this branch selects among several targets at
    /// runtime.
    pub fn is_indirect(&self) -> bool {
        matches!(self, Self::IndirectCall | Self::IndirectBranch)
    }

    /// Returns 'true' if the not-taken path of this branch reaches the next
    /// block by falling through.
    pub fn falls_through(&self) -> bool {
        matches!(self, Self::ConditionalDirect | Self::Fallthrough)
    }
}

/// The terminator of a code block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    #[serde(rename = "type")]
    pub kind: BranchType,

    /// Callee function ids (for calls) or block ids (for intra-function
    /// branches).
    #[serde(default)]
    pub targets: Vec<Id>,

    /// Probability of reaching each target.
    ///
    /// For a conditional branch this holds a single value, the probability
    /// of taking the explicit target; the fallthrough gets the complement.
    #[serde(default)]
    pub taken_probability: Vec<f64>,
}
impl Branch {
    pub fn new(kind: BranchType) -> Self {
        Self { kind, targets: Vec::new(), taken_probability: Vec::new() }
    }

    pub fn ret() -> Self { Self::new(BranchType::Return) }
    pub fn fallthrough() -> Self { Self::new(BranchType::Fallthrough) }

    pub fn direct_call(callee: Id) -> Self {
        Self {
            kind: BranchType::DirectCall,
            targets: vec![callee],
            taken_probability: vec![1.0],
        }
    }

    pub fn conditional(target: Id, probability: f64) -> Self {
        Self {
            kind: BranchType::ConditionalDirect,
            targets: vec![target],
            taken_probability: vec![probability],
        }
    }

    pub fn indirect_call(callees: Vec<Id>, probabilities: Vec<f64>) -> Self {
        Self {
            kind: BranchType::IndirectCall,
            targets: callees,
            taken_probability: probabilities,
        }
    }

    pub fn indirect_branch(blocks: Vec<Id>, probabilities: Vec<f64>) -> Self {
        Self {
            kind: BranchType::IndirectBranch,
            targets: blocks,
            taken_probability: probabilities,
        }
    }

    /// Return the probability that the explicit target of a conditional
    /// branch is taken. An absent value means "always taken".
    pub fn taken(&self) -> f64 {
        self.taken_probability.first().copied().unwrap_or(1.0)
    }

    /// Return the probability of reaching each target, in target order.
    ///
    /// When no probabilities were recorded the targets are treated as
    /// equally likely.
    pub fn distribution(&self) -> Vec<f64> {
        if self.taken_probability.len() == self.targets.len() {
            return self.taken_probability.clone();
        }
        let n = self.targets.len().max(1) as f64;
        vec![1.0 / n; self.targets.len()]
    }

    /// Check the target count and probabilities against the branch type.
    pub fn validate(&self) -> Result<()> {
        let arity = self.kind.arity();
        if !arity.accepts(self.targets.len()) {
            return Err(Error::structural(format!(
                "{:?} branch requires {} target(s), found {}",
                self.kind, arity, self.targets.len()
            )));
        }

        for p in &self.taken_probability {
            if !(0.0..=1.0).contains(p) {
                return Err(Error::structural(format!(
                    "{:?} branch has probability {} outside [0, 1]",
                    self.kind, p
                )));
            }
        }

        let num_probs = self.taken_probability.len();
        match self.kind {
            BranchType::IndirectCall | BranchType::IndirectBranch => {
                if num_probs == 0 {
                    return Ok(());
                }
                if num_probs != self.targets.len() {
                    return Err(Error::structural(format!(
                        "{:?} branch has {} targets but {} probabilities",
                        self.kind, self.targets.len(), num_probs
                    )));
                }
                let sum: f64 = self.taken_probability.iter().sum();
                if (sum - 1.0).abs() > PROBABILITY_EPSILON {
                    return Err(Error::structural(format!(
                        "{:?} branch probabilities sum to {}",
                        self.kind, sum
                    )));
                }
            },
            BranchType::DirectCall | BranchType::ConditionalDirect => {
                if num_probs > 1 {
                    return Err(Error::structural(format!(
                        "{:?} branch carries {} probabilities",
                        self.kind, num_probs
                    )));
                }
            },
            BranchType::Return | BranchType::Fallthrough => {
                if num_probs != 0 {
                    return Err(Error::structural(format!(
                        "{:?} branch carries probabilities", self.kind
                    )));
                }
            },
        }
        Ok(())
    }
}
