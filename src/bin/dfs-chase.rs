//! Generate the CFG of a DFS instruction pointer chase benchmark.

use std::path::PathBuf;
use std::process::ExitCode;
use clap::Parser;
use ipchase::{CfgGenerator, DfsChaseConfig, Result, SourceConfig, SourceGenerator};

#[derive(Parser)]
#[command(name = "dfs-chase")]
#[command(about = "Generate a DFS tree-based instruction pointer chase CFG", long_about = None)]
struct Cli {
    /// Depth of the function call tree
    #[arg(long, default_value = "20")]
    depth: usize,

    /// Use indirect calls to call functions
    #[arg(long)]
    use_indirect_calls: bool,

    /// Branch taken probability (of the left path)
    #[arg(long, default_value = "0.5")]
    branch_probability: f64,

    /// Insert code prefetches into the callchains. Not available on all
    /// platforms.
    #[arg(long)]
    insert_code_prefetches: bool,

    /// Where to write the CFG (`.json` for text, anything else for binary)
    #[arg(short, long)]
    output: PathBuf,

    /// Also lower the CFG into C source in this directory
    #[arg(long)]
    source_dir: Option<PathBuf>,

    /// Number of files to spread functions across when lowering
    #[arg(long, default_value = "1")]
    num_files: usize,
}

fn run(cli: Cli) -> Result<()> {
    let generator = DfsChaseConfig {
        depth: cli.depth,
        use_indirect_calls: cli.use_indirect_calls,
        left_path_probability: cli.branch_probability,
        insert_code_prefetches: cli.insert_code_prefetches,
    }.build()?;
    let cfg = generator.generate_cfg()?;
    cfg.save(&cli.output)?;

    if let Some(dir) = cli.source_dir {
        let config = SourceConfig { num_files: cli.num_files, ..Default::default() };
        SourceGenerator::new(&cfg, config)?.write_files(dir)?;
    }
    Ok(())
}

fn main() -> ExitCode {
    ipchase::log::init_tracing();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        },
    }
}
