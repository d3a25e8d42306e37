//! The control-flow graph (CFG) document: functions made of ordered code
//! blocks, each ending in a single terminator [`Branch`].

use std::collections::*;
use serde::{Deserialize, Serialize};
use tracing::debug;
use crate::branch::*;
use crate::error::*;
use crate::id::*;

/// A reusable payload of computational work.
///
/// Several code blocks may refer to the same body by id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlockBody {
    pub id: Id,
    pub instructions: String,
}

/// A straight-line sequence of code ending in exactly one terminator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub id: Id,

    /// The body executed before the terminator (if any).
    #[serde(default)]
    pub code_block_body_id: Option<Id>,

    /// A function whose code should be prefetched by this block.
    #[serde(default)]
    pub code_prefetch: Option<Id>,

    /// Must be set before the enclosing document is finished.
    #[serde(default)]
    pub terminator_branch: Option<Branch>,
}
impl CodeBlock {
    pub fn new(id: Id) -> Self {
        Self {
            id,
            code_block_body_id: None,
            code_prefetch: None,
            terminator_branch: None,
        }
    }

    /// Return the terminator type, if one has been assigned.
    pub fn kind(&self) -> Option<BranchType> {
        self.terminator_branch.as_ref().map(|b| b.kind)
    }

    /// Returns 'true' if this block only exists to prefetch code.
    pub fn is_prefetch(&self) -> bool {
        self.code_prefetch.is_some()
    }
}

/// A function: an ordered list of code blocks.
///
/// Block order is significant: the block physically following a
/// conditional branch is its not-taken successor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub id: Id,
    #[serde(default)]
    pub instructions: Vec<CodeBlock>,
}
impl Function {
    pub fn new(id: Id) -> Self {
        Self { id, instructions: Vec::new() }
    }

    /// Return the position of the block with the given id.
    pub fn position(&self, block: Id) -> Option<usize> {
        self.instructions.iter().position(|b| b.id == block)
    }

    /// Return the ids of all functions called from this function, in the
    /// order they first appear.
    pub fn callees(&self) -> Vec<Id> {
        let mut seen = BTreeSet::new();
        let mut res = Vec::new();
        let calls = self.instructions.iter()
            .filter_map(|b| b.terminator_branch.as_ref())
            .filter(|br| br.kind.is_call());
        for branch in calls {
            for tgt in &branch.targets {
                if seen.insert(*tgt) {
                    res.push(*tgt);
                }
            }
        }
        res
    }
}

/// A complete CFG document.
///
/// Produced by [`CfgBuilder::finish`](crate::CfgBuilder::finish) (or by
/// loading a saved document) and treated as read-only afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cfg {
    /// The function called by the program entry point.
    pub root: Id,
    pub functions: BTreeMap<Id, Function>,
    pub code_block_bodies: BTreeMap<Id, CodeBlockBody>,
}
impl Cfg {
    pub fn root(&self) -> Id { self.root }
    pub fn num_functions(&self) -> usize { self.functions.len() }

    pub fn function(&self, id: Id) -> Option<&Function> {
        self.functions.get(&id)
    }

    pub fn body(&self, id: Id) -> Option<&CodeBlockBody> {
        self.code_block_bodies.get(&id)
    }

    /// Return the total number of code blocks in the document.
    pub fn num_blocks(&self) -> usize {
        self.functions.values().map(|f| f.instructions.len()).sum()
    }

    /// Return the ids of all functions called from `id`.
    pub fn callees(&self, id: Id) -> Vec<Id> {
        self.function(id).map(|f| f.callees()).unwrap_or_default()
    }

    /// Return the ids of all functions that don't call other functions.
    pub fn leaf_functions(&self) -> Vec<Id> {
        self.functions.values()
            .filter(|f| f.callees().is_empty())
            .map(|f| f.id)
            .collect()
    }

    /// Check every invariant of the CFG model.
    pub fn validate(&self) -> Result<()> {
        if !self.functions.contains_key(&self.root) {
            return Err(Error::structural(format!(
                "root function {} is not defined", self.root
            )));
        }

        for (id, body) in &self.code_block_bodies {
            if *id != body.id {
                return Err(Error::structural(format!(
                    "code block body {} is registered under id {}", body.id, id
                )));
            }
        }

        // Map from block id to the function that owns it
        let mut owners: HashMap<Id, Id> = HashMap::new();
        for (id, func) in &self.functions {
            if *id != func.id {
                return Err(Error::structural(format!(
                    "function {} is registered under id {}", func.id, id
                )));
            }
            for block in &func.instructions {
                if let Some(prev) = owners.insert(block.id, func.id) {
                    return Err(Error::structural(format!(
                        "code block {} appears in functions {} and {}",
                        block.id, prev, func.id
                    )));
                }
            }
        }

        for func in self.functions.values() {
            self.validate_function(func, &owners)?;
        }
        debug!(functions = self.functions.len(), blocks = owners.len(),
            "validated CFG");
        Ok(())
    }

    fn validate_function(&self, func: &Function, owners: &HashMap<Id, Id>)
        -> Result<()>
    {
        let last = func.instructions.len().saturating_sub(1);
        for (idx, block) in func.instructions.iter().enumerate() {
            let branch = block.terminator_branch.as_ref().ok_or_else(|| {
                Error::structural(format!(
                    "code block {} in function {} has no terminator",
                    block.id, func.id
                ))
            })?;
            branch.validate().map_err(|e| match e {
                Error::Structural { message } => Error::structural(format!(
                    "code block {} in function {}: {}",
                    block.id, func.id, message
                )),
                e => e,
            })?;

            if let Some(body) = block.code_block_body_id {
                if !self.code_block_bodies.contains_key(&body) {
                    return Err(Error::structural(format!(
                        "code block {} refers to undefined body {}",
                        block.id, body
                    )));
                }
            }
            if let Some(tgt) = block.code_prefetch {
                if !self.functions.contains_key(&tgt) {
                    return Err(Error::structural(format!(
                        "code block {} prefetches undefined function {}",
                        block.id, tgt
                    )));
                }
            }

            if branch.kind.is_call() {
                if let Some(t) = branch.targets.iter()
                    .find(|t| !self.functions.contains_key(*t))
                {
                    return Err(Error::structural(format!(
                        "code block {} calls undefined function {}",
                        block.id, t
                    )));
                }
            }
            if branch.kind.is_intra_function() {
                if let Some(t) = branch.targets.iter()
                    .find(|t| owners.get(*t) != Some(&func.id))
                {
                    return Err(Error::structural(format!(
                        "code block {} branches to {}, which is not a block \
                         of function {}", block.id, t, func.id
                    )));
                }
            }
            if branch.kind.falls_through() && idx == last {
                return Err(Error::structural(format!(
                    "code block {} falls through past the end of function {}",
                    block.id, func.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(id: u64, branch: Branch) -> CodeBlock {
        let mut b = CodeBlock::new(Id::new(id));
        b.terminator_branch = Some(branch);
        b
    }

    fn two_function_cfg() -> Cfg {
        let mut caller = Function::new(Id::new(1));
        caller.instructions.push(block(10, Branch::conditional(Id::new(12), 0.3)));
        caller.instructions.push(block(11, Branch::ret()));
        caller.instructions.push(block(12, Branch::direct_call(Id::new(2))));
        caller.instructions.push(block(13, Branch::ret()));
        let mut callee = Function::new(Id::new(2));
        callee.instructions.push(block(20, Branch::ret()));

        Cfg {
            root: Id::new(1),
            functions: [(caller.id, caller), (callee.id, callee)].into(),
            code_block_bodies: BTreeMap::new(),
        }
    }

    #[test]
    fn well_formed_cfg_validates() {
        let cfg = two_function_cfg();
        cfg.validate().unwrap();
        assert_eq!(cfg.num_blocks(), 5);
        assert_eq!(cfg.callees(Id::new(1)), vec![Id::new(2)]);
        assert_eq!(cfg.leaf_functions(), vec![Id::new(2)]);
    }

    #[test]
    fn missing_root_is_structural() {
        let mut cfg = two_function_cfg();
        cfg.root = Id::new(99);
        assert!(matches!(cfg.validate(), Err(Error::Structural { .. })));
    }

    #[test]
    fn missing_terminator_is_structural() {
        let mut cfg = two_function_cfg();
        let f = cfg.functions.get_mut(&Id::new(2)).unwrap();
        f.instructions[0].terminator_branch = None;
        assert!(matches!(cfg.validate(), Err(Error::Structural { .. })));
    }

    #[test]
    fn branch_into_another_function_is_structural() {
        let mut cfg = two_function_cfg();
        let f = cfg.functions.get_mut(&Id::new(1)).unwrap();
        f.instructions[0].terminator_branch =
            Some(Branch::conditional(Id::new(20), 0.5));
        assert!(matches!(cfg.validate(), Err(Error::Structural { .. })));
    }

    #[test]
    fn call_to_undefined_function_is_structural() {
        let mut cfg = two_function_cfg();
        let f = cfg.functions.get_mut(&Id::new(1)).unwrap();
        f.instructions[2].terminator_branch =
            Some(Branch::direct_call(Id::new(7)));
        assert!(matches!(cfg.validate(), Err(Error::Structural { .. })));
    }

    #[test]
    fn trailing_conditional_is_structural() {
        let mut cfg = two_function_cfg();
        let f = cfg.functions.get_mut(&Id::new(2)).unwrap();
        f.instructions[0].terminator_branch =
            Some(Branch::conditional(Id::new(20), 0.5));
        assert!(matches!(cfg.validate(), Err(Error::Structural { .. })));
    }

    #[test]
    fn duplicate_block_ids_are_structural() {
        let mut cfg = two_function_cfg();
        let f = cfg.functions.get_mut(&Id::new(2)).unwrap();
        f.instructions[0].id = Id::new(10);
        assert!(matches!(cfg.validate(), Err(Error::Structural { .. })));
    }
}
