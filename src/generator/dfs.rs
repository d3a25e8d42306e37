//! A DFS instruction pointer chase.
//!
//! The benchmark is a full binary tree of functions of depth D. Every
//! internal function runs a fixed body and then calls exactly one of its two
//! children, either through an indirect call or through a conditional branch
//! leading to one of two direct calls. Leaf functions run the body and
//! return.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use crate::branch::*;
use crate::builder::*;
use crate::cfg::*;
use crate::error::*;
use crate::generator::CfgGenerator;
use crate::id::*;

/// The body shared by every call site and every leaf. Each statement is
/// pinned with an empty `asm volatile` so the compiler can't drop it.
pub const FUNCTION_BODY: &str = concat!(
    "int x = 1; asm volatile (\"\" : : \"r\" (x));\n",
    "int y = x*x + 3; asm volatile (\"\" : : \"r\" (y));\n",
    "int z = y*x + 12345; asm volatile (\"\" : : \"r\" (z));\n",
    "int w = z*z + x - y; asm volatile (\"\" : : \"r\"(w));\n",
);

/// Configuration for a [`DfsChaseGenerator`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DfsChaseConfig {
    /// Depth of the function call tree (number of levels).
    pub depth: usize,

    /// Call children through indirect calls instead of a conditional branch
    /// followed by direct calls.
    pub use_indirect_calls: bool,

    /// Probability of calling the left child.
    pub left_path_probability: f64,

    /// Prefetch the code of both children before the call site.
    pub insert_code_prefetches: bool,
}

impl Default for DfsChaseConfig {
    fn default() -> Self {
        Self {
            depth: 20,
            use_indirect_calls: false,
            left_path_probability: 0.5,
            insert_code_prefetches: false,
        }
    }
}

impl DfsChaseConfig {
    pub fn validate(&self) -> Result<()> {
        if self.depth < 1 {
            return Err(Error::configuration(format!(
                "depth must be at least 1, got {}", self.depth
            )));
        }
        // 2^depth - 1 functions must fit in the id space
        if self.depth >= u64::BITS as usize {
            return Err(Error::configuration(format!(
                "depth {} is too large", self.depth
            )));
        }
        if !(0.0..=1.0).contains(&self.left_path_probability) {
            return Err(Error::configuration(format!(
                "left path probability must be in [0, 1], got {}",
                self.left_path_probability
            )));
        }
        Ok(())
    }

    /// Return the number of functions in the generated tree, or `None` if
    /// it doesn't fit in a `usize`.
    pub fn num_functions(&self) -> Option<usize> {
        let depth = u32::try_from(self.depth).ok()?;
        1usize.checked_shl(depth).map(|n| n - 1)
    }

    pub fn strategy(&self) -> CallSiteStrategy {
        if self.use_indirect_calls {
            CallSiteStrategy::Indirect
        } else {
            CallSiteStrategy::Conditional
        }
    }

    /// Use this configuration to create a new [`DfsChaseGenerator`].
    ///
    /// Nothing is allocated unless the configuration is valid.
    pub fn build(self) -> Result<DfsChaseGenerator> {
        self.validate()?;
        let mut builder = CfgBuilder::new();
        let function_body = builder.add_code_block_body(FUNCTION_BODY)?.id;
        Ok(DfsChaseGenerator {
            strategy: self.strategy(),
            cfg: self,
            builder,
            function_tree: Vec::new(),
            leaf_functions: Vec::new(),
            root_func: None,
            function_body,
        })
    }
}

/// How an internal function transfers control to one of its two children.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallSiteStrategy {
    /// A single indirect call with both children as targets.
    Indirect,

    /// A conditional branch selecting between two direct calls.
    Conditional,
}

impl CallSiteStrategy {
    /// Emit the code blocks for a call site choosing between `targets`,
    /// where `targets[0]` is taken with probability `probability`.
    pub fn emit(&self, builder: &mut CfgBuilder, body: Id, targets: [Id; 2],
        probability: f64, insert_code_prefetches: bool)
        -> Result<Vec<CodeBlock>>
    {
        let mut blocks = Vec::new();

        // The branch isn't resolved until after the body runs, so both
        // children are prefetched.
        if insert_code_prefetches {
            for target in targets {
                blocks.push(builder.add_code_prefetch_code_block(target)?);
            }
        }

        match self {
            Self::Indirect => {
                let mut call = builder.add_code_block()?;
                call.terminator_branch = Some(Branch::indirect_call(
                    targets.to_vec(),
                    vec![probability, 1.0 - probability],
                ));
                call.code_block_body_id = Some(body);
                blocks.push(call);
            },
            Self::Conditional => {
                let taken = builder.add_code_block_with_branch(
                    BranchType::DirectCall, Some(targets[0]), Some(1.0))?;
                let taken_ret = builder.add_code_block_with_branch(
                    BranchType::Return, None, None)?;
                let ft = builder.add_code_block_with_branch(
                    BranchType::DirectCall, Some(targets[1]), Some(1.0))?;
                let ft_ret = builder.add_code_block_with_branch(
                    BranchType::Return, None, None)?;
                let mut cond = builder.add_code_block_with_branch(
                    BranchType::ConditionalDirect, Some(taken.id),
                    Some(probability))?;
                cond.code_block_body_id = Some(body);

                // The fallthrough must come right after the conditional.
                blocks.extend([cond, ft, ft_ret, taken, taken_ret]);
            },
        }
        Ok(blocks)
    }
}

/// Generates a DFS instruction pointer chase benchmark.
#[derive(Debug)]
pub struct DfsChaseGenerator {
    cfg: DfsChaseConfig,
    strategy: CallSiteStrategy,
    builder: CfgBuilder,

    /// Each caller with its [left, right] children, in breadth-first order.
    function_tree: Vec<(Id, [Id; 2])>,

    /// Functions that don't call other functions.
    leaf_functions: Vec<Id>,

    /// The function at the root of the tree.
    root_func: Option<Id>,

    /// Id of the body shared by every call site and leaf.
    function_body: Id,
}

impl DfsChaseGenerator {
    pub fn config(&self) -> &DfsChaseConfig { &self.cfg }
    pub fn strategy(&self) -> CallSiteStrategy { self.strategy }

    /// Allocate the ids of every function in the tree, level by level.
    fn generate_function_tree(&mut self) -> Result<Id> {
        let root = self.builder.allocate_function_id()?;
        let mut frontier = vec![root];
        for _ in 1..self.cfg.depth {
            let mut children = Vec::with_capacity(frontier.len() * 2);
            for func in &frontier {
                let left = self.builder.allocate_function_id()?;
                let right = self.builder.allocate_function_id()?;
                self.function_tree.push((*func, [left, right]));
                children.push(left);
                children.push(right);
            }
            frontier = children;
        }
        // The last level of the tree are leaves. With a depth of 1 that is
        // just the root.
        self.leaf_functions = frontier;
        self.root_func = Some(root);
        debug!(callers = self.function_tree.len(),
            leaves = self.leaf_functions.len(), "generated function tree");
        Ok(root)
    }

    /// Fill in the code blocks of every function in the tree.
    fn generate_functions(&mut self, root: Id) -> Result<()> {
        self.builder.add_function_with_id(root)?;
        for (caller, callees) in &self.function_tree {
            for callee in callees {
                self.builder.add_function_with_id(*callee)?;
            }
            let blocks = self.strategy.emit(
                &mut self.builder,
                self.function_body,
                *callees,
                self.cfg.left_path_probability,
                self.cfg.insert_code_prefetches,
            )?;
            self.builder.extend_function(*caller, blocks)?;
        }

        for leaf in &self.leaf_functions {
            let mut block = self.builder.add_code_block()?;
            block.code_block_body_id = Some(self.function_body);
            block.terminator_branch = Some(Branch::ret());
            self.builder.extend_function(*leaf, [block])?;
        }
        Ok(())
    }
}

impl CfgGenerator for DfsChaseGenerator {
    fn name(&self) -> &'static str { "dfs_chase" }

    fn generate_cfg(mut self) -> Result<Cfg> {
        info!(depth = self.cfg.depth, strategy = ?self.strategy,
            probability = self.cfg.left_path_probability,
            prefetch = self.cfg.insert_code_prefetches,
            "generating DFS instruction pointer chase benchmark");
        let root = self.generate_function_tree()?;
        self.generate_functions(root)?;
        self.builder.finish(root)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use super::*;
    use pretty_assertions::assert_eq;

    fn generate(depth: usize, indirect: bool, p: f64, prefetch: bool) -> Cfg {
        DfsChaseConfig {
            depth,
            use_indirect_calls: indirect,
            left_path_probability: p,
            insert_code_prefetches: prefetch,
        }.build().unwrap().generate_cfg().unwrap()
    }

    fn kinds(func: &Function) -> Vec<BranchType> {
        func.instructions.iter().map(|b| b.kind().unwrap()).collect()
    }

    fn internal_functions(cfg: &Cfg) -> Vec<&Function> {
        cfg.functions.values().filter(|f| !f.callees().is_empty()).collect()
    }

    #[test]
    fn default_matches_command_defaults() {
        let cfg = DfsChaseConfig::default();
        assert_eq!(cfg.depth, 20);
        assert_eq!(cfg.left_path_probability, 0.5);
        assert!(!cfg.use_indirect_calls);
        assert!(!cfg.insert_code_prefetches);
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        let bad = [
            DfsChaseConfig { depth: 0, ..Default::default() },
            DfsChaseConfig { left_path_probability: -0.1, ..Default::default() },
            DfsChaseConfig { left_path_probability: 1.5, ..Default::default() },
            DfsChaseConfig { left_path_probability: f64::NAN, ..Default::default() },
            DfsChaseConfig { depth: 64, ..Default::default() },
        ];
        for cfg in bad {
            assert!(matches!(cfg.build(), Err(Error::Configuration { .. })));
        }
    }

    #[test]
    fn num_functions_does_not_overflow() {
        let count = |depth| DfsChaseConfig { depth, ..Default::default() }
            .num_functions();
        assert_eq!(count(0), Some(0));
        assert_eq!(count(3), Some(7));
        assert_eq!(count(usize::BITS as usize), None);
        assert_eq!(count(usize::MAX), None);
    }

    #[test]
    fn depth_one_is_a_single_leaf() {
        let cfg = generate(1, false, 0.5, true);
        assert_eq!(cfg.num_functions(), 1);
        let root = cfg.function(cfg.root()).unwrap();
        assert_eq!(kinds(root), vec![BranchType::Return]);
        assert!(root.instructions[0].code_block_body_id.is_some());
    }

    /// The [left, right] children of every caller, as allocated.
    fn function_tree(depth: usize) -> BTreeMap<Id, [Id; 2]> {
        let mut generator = DfsChaseConfig { depth, ..Default::default() }
            .build().unwrap();
        generator.generate_function_tree().unwrap();
        generator.function_tree.into_iter().collect()
    }

    #[test]
    fn conditional_depth_three() {
        let cfg = generate(3, false, 0.5, false);
        assert_eq!(cfg.num_functions(), 7);
        assert_eq!(cfg.code_block_bodies.len(), 1);
        let body = *cfg.code_block_bodies.keys().next().unwrap();
        assert_eq!(cfg.body(body).unwrap().instructions, FUNCTION_BODY);

        let internal = internal_functions(&cfg);
        assert_eq!(internal.len(), 3);
        for func in internal {
            assert_eq!(kinds(func), vec![
                BranchType::ConditionalDirect,
                BranchType::DirectCall,
                BranchType::Return,
                BranchType::DirectCall,
                BranchType::Return,
            ]);
            let cond = &func.instructions[0];
            assert_eq!(cond.code_block_body_id, Some(body));
            let branch = cond.terminator_branch.as_ref().unwrap();
            assert_eq!(branch.taken_probability, vec![0.5]);
            assert_eq!(branch.targets, vec![func.instructions[3].id]);
        }

        let leaves = cfg.leaf_functions();
        assert_eq!(leaves.len(), 4);
        for leaf in leaves {
            let func = cfg.function(leaf).unwrap();
            assert_eq!(kinds(func), vec![BranchType::Return]);
            assert_eq!(func.instructions[0].code_block_body_id, Some(body));
        }
    }

    #[test]
    fn conditional_takes_the_left_child() {
        let tree = function_tree(4);
        let cfg = generate(4, false, 0.25, false);
        assert_eq!(tree.len(), 7);
        for (caller, [left, right]) in tree {
            assert!(left < right);
            let func = cfg.function(caller).unwrap();
            let terminator = |idx: usize| func.instructions[idx]
                .terminator_branch.clone().unwrap();

            // The explicit target is the taken call to the left child, the
            // block right after the conditional calls the right child.
            let cond = terminator(0);
            assert_eq!(cond.kind, BranchType::ConditionalDirect);
            assert_eq!(cond.targets, vec![func.instructions[3].id]);
            assert_eq!(cond.taken(), 0.25);
            assert_eq!(terminator(1), Branch::direct_call(right));
            assert_eq!(terminator(3), Branch::direct_call(left));
        }
    }

    #[test]
    fn indirect_call_weights_the_left_child() {
        let tree = function_tree(4);
        let cfg = generate(4, true, 0.25, true);
        for (caller, [left, right]) in tree {
            let func = cfg.function(caller).unwrap();
            let prefetched: Vec<Id> = func.instructions[..2].iter()
                .map(|b| b.code_prefetch.unwrap())
                .collect();
            assert_eq!(prefetched, vec![left, right]);

            let call = func.instructions[2].terminator_branch.as_ref()
                .unwrap();
            assert_eq!(call.kind, BranchType::IndirectCall);
            assert_eq!(call.targets, vec![left, right]);
            assert_eq!(call.taken_probability, vec![0.25, 0.75]);
        }
    }

    #[test]
    fn indirect_depth_three() {
        let cfg = generate(3, true, 0.5, false);
        assert_eq!(cfg.num_functions(), 7);
        let internal = internal_functions(&cfg);
        assert_eq!(internal.len(), 3);
        for func in internal {
            assert_eq!(kinds(func), vec![BranchType::IndirectCall]);
            let branch = func.instructions[0].terminator_branch.as_ref()
                .unwrap();
            assert_eq!(branch.targets.len(), 2);
            assert_eq!(branch.taken_probability, vec![0.5, 0.5]);
        }
    }

    #[test]
    fn prefetches_precede_the_call_site() {
        for indirect in [false, true] {
            let cfg = generate(3, indirect, 0.25, true);
            for func in internal_functions(&cfg) {
                let prefetched: Vec<Id> = func.instructions[..2].iter()
                    .map(|b| b.code_prefetch.unwrap())
                    .collect();
                assert_eq!(prefetched, func.callees().into_iter()
                    .collect::<std::collections::BTreeSet<_>>()
                    .into_iter().collect::<Vec<_>>());
                let rest = func.instructions[2..].iter()
                    .filter(|b| b.is_prefetch())
                    .count();
                assert_eq!(rest, 0);
                let expected = if indirect { 3 } else { 7 };
                assert_eq!(func.instructions.len(), expected);
            }
        }
    }

    #[test]
    fn children_ids_are_unique() {
        let mut generator = DfsChaseConfig { depth: 6, ..Default::default() }
            .build().unwrap();
        generator.generate_function_tree().unwrap();
        let mut seen = std::collections::BTreeSet::new();
        seen.insert(generator.root_func.unwrap());
        for (caller, [l, r]) in &generator.function_tree {
            assert!(seen.contains(caller));
            assert_ne!(l, r);
            assert!(seen.insert(*l));
            assert!(seen.insert(*r));
        }
        assert_eq!(Some(seen.len()), generator.config().num_functions());
    }

    #[test]
    fn fresh_generators_produce_identical_documents() {
        let a = generate(5, false, 0.3, true);
        let b = generate(5, false, 0.3, true);
        assert_eq!(a, b);
    }
}
