//! Incremental construction of a [`Cfg`].

use std::collections::*;
use tracing::{debug, info};
use crate::branch::*;
use crate::cfg::*;
use crate::error::*;
use crate::id::*;

/// Used to assemble a [`Cfg`].
///
/// Generators allocate functions up front (so that callers can refer to
/// callees that have no code yet), create code blocks, and append them to
/// functions. [`CfgBuilder::finish`] checks the result and turns it into an
/// immutable document.
#[derive(Debug)]
pub struct CfgBuilder {
    /// Allocator for function ids.
    function_ids: IdAllocator,

    /// Allocator for code block ids.
    block_ids: IdAllocator,

    /// Allocator for code block body ids.
    body_ids: IdAllocator,

    /// Map from function id to function.
    functions: BTreeMap<Id, Function>,

    /// Map from body id to the shared body.
    bodies: BTreeMap<Id, CodeBlockBody>,
}

impl CfgBuilder {
    pub fn new() -> Self {
        Self {
            function_ids: IdAllocator::new(),
            block_ids: IdAllocator::new(),
            body_ids: IdAllocator::new(),
            functions: BTreeMap::new(),
            bodies: BTreeMap::new(),
        }
    }

    /// Allocate an id for a function without registering it.
    pub fn allocate_function_id(&mut self) -> Result<Id> {
        self.function_ids.next()
    }

    /// Register a new body that may be shared by many code blocks.
    pub fn add_code_block_body(&mut self, text: impl Into<String>)
        -> Result<CodeBlockBody>
    {
        let body = CodeBlockBody {
            id: self.body_ids.next()?,
            instructions: text.into(),
        };
        self.bodies.insert(body.id, body.clone());
        Ok(body)
    }

    /// Create an empty code block with a fresh id.
    ///
    /// The caller is responsible for setting a terminator branch.
    pub fn add_code_block(&mut self) -> Result<CodeBlock> {
        Ok(CodeBlock::new(self.block_ids.next()?))
    }

    /// Create a code block terminated by a branch of the given type.
    ///
    /// `target` and `probability` are only recorded when present; a
    /// probability of `Some(0.0)` is kept.
    pub fn add_code_block_with_branch(&mut self,
        kind: BranchType, target: Option<Id>, probability: Option<f64>)
        -> Result<CodeBlock>
    {
        let mut block = self.add_code_block()?;
        let mut branch = Branch::new(kind);
        branch.targets.extend(target);
        branch.taken_probability.extend(probability);
        block.terminator_branch = Some(branch);
        Ok(block)
    }

    /// Create a block that prefetches the code of `function_id` and then
    /// falls through to the next block.
    pub fn add_code_prefetch_code_block(&mut self, function_id: Id)
        -> Result<CodeBlock>
    {
        let mut block = self.add_code_block()?;
        block.code_prefetch = Some(function_id);
        block.terminator_branch = Some(Branch::fallthrough());
        Ok(block)
    }

    /// Register an (empty) function under a previously allocated id.
    pub fn add_function_with_id(&mut self, id: Id) -> Result<&mut Function> {
        match self.functions.entry(id) {
            btree_map::Entry::Occupied(_) => Err(Error::structural(format!(
                "function {} is already defined", id
            ))),
            btree_map::Entry::Vacant(e) => Ok(e.insert(Function::new(id))),
        }
    }

    pub fn function(&self, id: Id) -> Option<&Function> {
        self.functions.get(&id)
    }

    pub fn function_mut(&mut self, id: Id) -> Result<&mut Function> {
        self.functions.get_mut(&id).ok_or_else(|| Error::structural(format!(
            "function {} is not defined", id
        )))
    }

    /// Append blocks to the instruction sequence of a function.
    pub fn extend_function(&mut self, id: Id,
        blocks: impl IntoIterator<Item = CodeBlock>) -> Result<()>
    {
        let func = self.function_mut(id)?;
        let before = func.instructions.len();
        func.instructions.extend(blocks);
        debug!(function = %id, added = func.instructions.len() - before,
            "extended function");
        Ok(())
    }

    pub fn num_functions(&self) -> usize { self.functions.len() }

    /// Consume the builder and produce a validated [`Cfg`] rooted at `root`.
    pub fn finish(self, root: Id) -> Result<Cfg> {
        let cfg = Cfg {
            root,
            functions: self.functions,
            code_block_bodies: self.bodies,
        };
        cfg.validate()?;
        info!(functions = cfg.num_functions(), blocks = cfg.num_blocks(),
            bodies = cfg.code_block_bodies.len(), "finished CFG");
        Ok(cfg)
    }
}

impl Default for CfgBuilder {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entities_get_unique_ids() {
        let mut b = CfgBuilder::new();
        let x = b.add_code_block().unwrap();
        let y = b.add_code_block_with_branch(BranchType::Return, None, None)
            .unwrap();
        let z = b.add_code_prefetch_code_block(Id::new(1)).unwrap();
        assert_ne!(x.id, y.id);
        assert_ne!(y.id, z.id);
        assert_ne!(x.id, z.id);

        let p = b.add_code_block_body("a").unwrap();
        let q = b.add_code_block_body("b").unwrap();
        assert_ne!(p.id, q.id);
    }

    #[test]
    fn zero_probability_is_kept() {
        let mut b = CfgBuilder::new();
        let blk = b.add_code_block_with_branch(
            BranchType::ConditionalDirect, Some(Id::new(3)), Some(0.0)
        ).unwrap();
        let br = blk.terminator_branch.unwrap();
        assert_eq!(br.targets, vec![Id::new(3)]);
        assert_eq!(br.taken_probability, vec![0.0]);
    }

    #[test]
    fn absent_target_and_probability_are_not_recorded() {
        let mut b = CfgBuilder::new();
        let blk = b.add_code_block_with_branch(BranchType::Return, None, None)
            .unwrap();
        let br = blk.terminator_branch.unwrap();
        assert!(br.targets.is_empty());
        assert!(br.taken_probability.is_empty());
    }

    #[test]
    fn prefetch_block_falls_through() {
        let mut b = CfgBuilder::new();
        let blk = b.add_code_prefetch_code_block(Id::new(8)).unwrap();
        assert_eq!(blk.code_prefetch, Some(Id::new(8)));
        assert_eq!(blk.kind(), Some(BranchType::Fallthrough));
        assert!(blk.code_block_body_id.is_none());
    }

    #[test]
    fn duplicate_function_is_rejected() {
        let mut b = CfgBuilder::new();
        let id = b.allocate_function_id().unwrap();
        b.add_function_with_id(id).unwrap();
        assert!(matches!(b.add_function_with_id(id),
            Err(Error::Structural { .. })));
    }

    #[test]
    fn forward_reference_to_callee() {
        let mut b = CfgBuilder::new();
        let caller = b.allocate_function_id().unwrap();
        let callee = b.allocate_function_id().unwrap();
        b.add_function_with_id(caller).unwrap();
        let call = b.add_code_block_with_branch(
            BranchType::DirectCall, Some(callee), Some(1.0)
        ).unwrap();
        let ret = b.add_code_block_with_branch(BranchType::Return, None, None)
            .unwrap();
        b.extend_function(caller, [call, ret]).unwrap();

        // The callee is registered after the caller already refers to it.
        b.add_function_with_id(callee).unwrap();
        let leaf = b.add_code_block_with_branch(BranchType::Return, None, None)
            .unwrap();
        b.extend_function(callee, [leaf]).unwrap();

        let cfg = b.finish(caller).unwrap();
        assert_eq!(cfg.num_functions(), 2);
        assert_eq!(cfg.callees(caller), vec![callee]);
    }

    #[test]
    fn finish_rejects_unterminated_blocks() {
        let mut b = CfgBuilder::new();
        let f = b.allocate_function_id().unwrap();
        b.add_function_with_id(f).unwrap();
        let blk = b.add_code_block().unwrap();
        b.extend_function(f, [blk]).unwrap();
        assert!(matches!(b.finish(f), Err(Error::Structural { .. })));
    }
}
