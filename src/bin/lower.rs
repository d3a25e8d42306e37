//! Lower a saved CFG into C source.

use std::path::PathBuf;
use std::process::ExitCode;
use clap::Parser;
use ipchase::{Cfg, Result, SourceConfig, SourceGenerator};

#[derive(Parser)]
#[command(name = "lower")]
#[command(about = "Lower a CFG into compilable C source", long_about = None)]
struct Cli {
    /// The CFG to lower (`.json` for text, anything else for binary)
    #[arg(short, long)]
    input: PathBuf,

    /// Directory receiving the generated files
    #[arg(short, long)]
    output_dir: PathBuf,

    /// Number of files to spread functions across
    #[arg(long, default_value = "1")]
    num_files: usize,

    /// Default number of times `main` calls the root function
    #[arg(long, default_value = "1")]
    iterations: u64,
}

fn run(cli: Cli) -> Result<()> {
    let cfg = Cfg::load(&cli.input)?;
    let config = SourceConfig {
        num_files: cli.num_files,
        iterations: cli.iterations,
    };
    let paths = SourceGenerator::new(&cfg, config)?.write_files(&cli.output_dir)?;
    for path in paths {
        println!("{}", path.display());
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
