//! Lowering of individual functions into C.
//!
//! Every terminator maps onto a construct that a compiler turns into the
//! matching machine branch, even at `-O0`:
//!
//! | Terminator           | C                                         |
//! |----------------------|-------------------------------------------|
//! | `DirectCall`         | `function_N();`                           |
//! | `IndirectCall`       | call through a table of function pointers |
//! | `ConditionalDirect`  | `if (...) goto block_N;`                  |
//! | `IndirectBranch`     | `goto *labels[idx];` (labels-as-values)   |
//! | `Return`             | `return;`                                 |
//! | `Fallthrough`        | nothing                                   |

use bitvec::prelude::*;
use itertools::*;
use crate::branch::*;
use crate::cfg::*;
use crate::error::*;
use crate::id::*;

/// Name of the pseudo-random source used to realise branch probabilities.
pub const RANDOM_FN: &str = "ipchase_random";

/// Number of distinct values produced by [`RANDOM_FN`].
const RANDOM_RANGE: f64 = 4294967296.0;

/// Return the C symbol for a function.
pub fn function_name(id: Id) -> String {
    format!("function_{}", id)
}

/// Return the C label for a code block.
pub fn block_label(id: Id) -> String {
    format!("block_{}", id)
}

/// Return the value `x` such that `random() < x` holds with probability `p`.
pub fn threshold(p: f64) -> u64 {
    (p.clamp(0.0, 1.0) * RANDOM_RANGE).round() as u64
}

/// Build an expression selecting a target index according to `dist`.
///
/// The last target absorbs any rounding error.
pub fn selector(dist: &[f64]) -> String {
    let mut cumulative = 0.0;
    let mut expr = String::new();
    for (idx, p) in dist.iter().enumerate().take(dist.len().saturating_sub(1)) {
        cumulative += p;
        expr.push_str(&format!("r < {}ull ? {} : ", threshold(cumulative), idx));
    }
    expr.push_str(&format!("{}", dist.len().saturating_sub(1)));
    expr
}

/// A line-oriented buffer for C source.
#[derive(Debug, Default)]
pub struct CWriter {
    buf: String,
    indent: usize,
}
impl CWriter {
    pub fn new() -> Self { Self::default() }

    pub fn line(&mut self, s: impl AsRef<str>) {
        let s = s.as_ref();
        if !s.is_empty() {
            for _ in 0..self.indent {
                self.buf.push_str("  ");
            }
            self.buf.push_str(s);
        }
        self.buf.push('\n');
    }

    /// Emit a label at column zero.
    pub fn label(&mut self, name: &str) {
        self.buf.push_str(name);
        self.buf.push_str(":;\n");
    }

    pub fn open(&mut self, s: impl AsRef<str>) {
        self.line(s);
        self.indent += 1;
    }

    pub fn close(&mut self, s: impl AsRef<str>) {
        self.indent = self.indent.saturating_sub(1);
        self.line(s);
    }

    pub fn finish(self) -> String { self.buf }
}

/// Return a mask with a bit set for every block of `func` that is the target
/// of an intra-function branch (and so needs a label).
pub fn branch_targets(func: &Function) -> BitVec {
    let mut mask = bitvec![0; func.instructions.len()];
    let targets = func.instructions.iter()
        .filter_map(|b| b.terminator_branch.as_ref())
        .filter(|br| br.kind.is_intra_function())
        .flat_map(|br| br.targets.iter());
    for tgt in targets {
        if let Some(idx) = func.position(*tgt) {
            mask.set(idx, true);
        }
    }
    mask
}

/// Emit the definition of a single function.
///
/// Every terminator is checked before it is lowered, so a function taken
/// from an unvalidated document fails with [`Error::Structural`] instead of
/// producing broken C.
pub fn lower_function(cfg: &Cfg, func: &Function, w: &mut CWriter)
    -> Result<()>
{
    let labels = branch_targets(func);
    w.open(format!("void {}(void) {{", function_name(func.id)));
    for (idx, block) in func.instructions.iter().enumerate() {
        if labels[idx] {
            w.label(&block_label(block.id));
        }
        lower_block(cfg, block, w)?;
    }
    w.close("}");
    Ok(())
}

fn lower_block(cfg: &Cfg, block: &CodeBlock, w: &mut CWriter) -> Result<()> {
    if let Some(tgt) = block.code_prefetch {
        w.line(format!("CODE_PREFETCH({});", function_name(tgt)));
    }

    if let Some(body) = block.code_block_body_id.and_then(|id| cfg.body(id)) {
        // Braces keep declarations in the body local to this block.
        w.open("{");
        for stmt in body.instructions.lines().filter(|l| !l.trim().is_empty()) {
            w.line(stmt.trim());
        }
        w.close("}");
    }

    let branch = block.terminator_branch.as_ref().ok_or_else(|| {
        Error::structural(format!("code block {} has no terminator", block.id))
    })?;
    branch.validate().map_err(|e| match e {
        Error::Structural { message } => Error::structural(format!(
            "code block {}: {}", block.id, message
        )),
        e => e,
    })?;
    match branch.kind {
        BranchType::DirectCall => {
            w.line(format!("{}();", function_name(branch.targets[0])));
        },
        BranchType::IndirectCall => {
            let table = branch.targets.iter()
                .map(|t| function_name(*t))
                .join(", ");
            w.open("{");
            w.line(format!("static void (*const targets[])(void) = {{ {} }};",
                table));
            w.line(format!("uint64_t r = {}();", RANDOM_FN));
            w.line(format!("unsigned idx = {};", selector(&branch.distribution())));
            w.line("targets[idx]();");
            w.close("}");
        },
        BranchType::ConditionalDirect => {
            // Loaded through a volatile so the comparison survives even when
            // the threshold is 0 or 2^32.
            w.open("{");
            w.line(format!("volatile uint64_t t = {}ull;",
                threshold(branch.taken())));
            w.line(format!("if ((uint64_t){}() < t) goto {};",
                RANDOM_FN, block_label(branch.targets[0])));
            w.close("}");
        },
        BranchType::IndirectBranch => {
            let table = branch.targets.iter()
                .map(|t| format!("&&{}", block_label(*t)))
                .join(", ");
            w.open("{");
            w.line(format!("static void *const labels[] = {{ {} }};", table));
            w.line(format!("uint64_t r = {}();", RANDOM_FN));
            w.line(format!("unsigned idx = {};", selector(&branch.distribution())));
            w.line("goto *labels[idx];");
            w.close("}");
        },
        BranchType::Return => w.line("return;"),
        BranchType::Fallthrough => {},
    }
    Ok(())
}
