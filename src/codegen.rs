//! Lowering a [`Cfg`] into C source code.
//!
//! The output is a directory holding one declarations header, the function
//! definitions spread over a number of `.c` files, and `main.c`. Spreading
//! functions over several translation units controls where the compiled
//! code ends up in the binary.

pub mod lower;

pub use lower::*;

use std::fs;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use crate::cfg::*;
use crate::error::*;
use crate::id::*;

/// Name of the shared declarations header.
pub const HEADER_FILE: &str = "functions.h";

/// Name of the file holding the program entry point.
pub const MAIN_FILE: &str = "main.c";

/// Configuration for a [`SourceGenerator`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Number of files to spread function definitions across.
    pub num_files: usize,

    /// Default number of times `main` calls the root function. Can be
    /// overridden by the first argument of the compiled program.
    pub iterations: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self { num_files: 1, iterations: 1 }
    }
}

impl SourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_files < 1 {
            return Err(Error::configuration(
                "number of output files must be at least 1"
            ));
        }
        Ok(())
    }
}

/// A generated file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub contents: String,
}

/// Generates C source for a validated [`Cfg`].
#[derive(Debug)]
pub struct SourceGenerator<'a> {
    cfg: &'a Cfg,
    config: SourceConfig,
}

impl<'a> SourceGenerator<'a> {
    /// Fails if either the configuration or the document is malformed.
    pub fn new(cfg: &'a Cfg, config: SourceConfig) -> Result<Self> {
        config.validate()?;
        cfg.validate()?;
        Ok(Self { cfg, config })
    }

    pub fn config(&self) -> &SourceConfig { &self.config }

    /// The line that includes the declarations header. Appears exactly once
    /// in every generated `.c` file.
    pub fn header_import_string() -> String {
        format!("#include \"{}\"", HEADER_FILE)
    }

    /// Split the functions (in ascending id order) into contiguous groups,
    /// one group per output file.
    pub fn partition(&self) -> Vec<Vec<Id>> {
        let ids: Vec<Id> = self.cfg.functions.keys().copied().collect();
        let per_file = ids.len().div_ceil(self.config.num_files).max(1);
        ids.chunks(per_file).map(|c| c.to_vec()).collect()
    }

    /// Generate every file in memory.
    pub fn generate(&self) -> Result<Vec<SourceFile>> {
        let mut files = vec![self.generate_header()];
        for (idx, group) in self.partition().iter().enumerate() {
            files.push(self.generate_functions_file(idx, group)?);
        }
        files.push(self.generate_main());
        Ok(files)
    }

    /// Generate every file and write it into `dir`.
    pub fn write_files(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        let mut paths = Vec::new();
        for file in self.generate()? {
            let path = dir.join(&file.name);
            fs::write(&path, &file.contents).map_err(|e| Error::io(&path, e))?;
            debug!(path = %path.display(), bytes = file.contents.len(),
                "wrote source file");
            paths.push(path);
        }
        info!(dir = %dir.display(), files = paths.len(),
            functions = self.cfg.num_functions(), "wrote benchmark source");
        Ok(paths)
    }

    fn generate_header(&self) -> SourceFile {
        let mut w = CWriter::new();
        w.line("#ifndef IPCHASE_FUNCTIONS_H");
        w.line("#define IPCHASE_FUNCTIONS_H");
        w.line("");
        w.line("#include <stdint.h>");
        w.line("#include <stdlib.h>");
        w.line("");
        w.line("#define CODE_PREFETCH(fn) __builtin_prefetch((const void *)(fn), 0, 3)");
        w.line("");
        w.line(format!("uint32_t {}(void);", RANDOM_FN));
        w.line("");
        for id in self.cfg.functions.keys() {
            w.line(format!("void {}(void);", function_name(*id)));
        }
        w.line("");
        w.line("#endif");
        SourceFile { name: HEADER_FILE.to_string(), contents: w.finish() }
    }

    fn generate_functions_file(&self, idx: usize, group: &[Id])
        -> Result<SourceFile>
    {
        let mut w = CWriter::new();
        w.line(Self::header_import_string());
        for id in group {
            if let Some(func) = self.cfg.function(*id) {
                w.line("");
                lower_function(self.cfg, func, &mut w)?;
            }
        }
        Ok(SourceFile {
            name: format!("functions_{}.c", idx),
            contents: w.finish(),
        })
    }

    fn generate_main(&self) -> SourceFile {
        let mut w = CWriter::new();
        w.line(Self::header_import_string());
        w.line("");
        w.line("static uint32_t ipchase_state = 0x9e3779b9u;");
        w.line("");
        w.open(format!("uint32_t {}(void) {{", RANDOM_FN));
        w.line("uint32_t x = ipchase_state;");
        w.line("x ^= x << 13;");
        w.line("x ^= x >> 17;");
        w.line("x ^= x << 5;");
        w.line("ipchase_state = x;");
        w.line("return x;");
        w.close("}");
        w.line("");
        w.open("int main(int argc, char **argv) {");
        w.line(format!("long iterations = {};", self.config.iterations));
        w.open("if (argc > 1) {");
        w.line("iterations = atol(argv[1]);");
        w.close("}");
        w.open("for (long i = 0; i < iterations; i++) {");
        w.line(format!("{}();", function_name(self.cfg.root())));
        w.close("}");
        w.line("return 0;");
        w.close("}");
        SourceFile { name: MAIN_FILE.to_string(), contents: w.finish() }
    }
}
