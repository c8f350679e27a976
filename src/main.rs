//! Command-line interface for luavm-protect.

use anyhow::{bail, Context, Result};
use clap::Parser;
use luavm_protect::{check_balance, compiler, parser, ProtectConfig, Protector};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "luavm-protect", author, version)]
#[command(about = "Compile Lua scripts into encrypted bytecode behind a generated VM")]
struct Cli {
    /// Lua file or directory of Lua files
    input: PathBuf,

    /// Output file (single input) or directory (directory input); stdout if omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run the block-balance check and fail on imbalance
    #[arg(long)]
    check: bool,

    /// Print the compiled bytecode listing instead of protecting
    #[arg(long)]
    disassemble: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => ProtectConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ProtectConfig::default(),
    };
    if cli.check {
        config = config.check_balance(true);
    }

    if cli.input.is_dir() {
        return protect_directory(cli, config);
    }

    let source = fs::read_to_string(&cli.input)
        .with_context(|| format!("failed to read {}", cli.input.display()))?;

    if cli.disassemble {
        let block = parser::parse(&source)?;
        let chunk = compiler::compile(&block)?;
        print!("{}", chunk.disassemble());
        return Ok(ExitCode::SUCCESS);
    }

    let check = config.check_balance;
    let program = Protector::new(config)
        .obfuscate(&source)
        .with_context(|| format!("failed to protect {}", cli.input.display()))?;

    match &cli.output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, &program)
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!(
                "Protected: {} -> {} ({} -> {} bytes)",
                cli.input.display(),
                path.display(),
                source.len(),
                program.len()
            );
        }
        None => print!("{program}"),
    }

    if check {
        let report = check_balance(&program);
        if !report.is_balanced() {
            eprintln!("balance check failed: {report}");
            return Ok(ExitCode::FAILURE);
        }
        tracing::info!("Balance check passed: {}", report);
    }

    Ok(ExitCode::SUCCESS)
}

fn protect_directory(cli: &Cli, config: ProtectConfig) -> Result<ExitCode> {
    if cli.disassemble {
        bail!("--disassemble takes a single file");
    }
    let Some(output_dir) = &cli.output else {
        bail!("directory input requires --output <DIR>");
    };

    let summary = Protector::new(config)
        .protect_directory(&cli.input, output_dir)
        .with_context(|| format!("failed to protect {}", cli.input.display()))?;

    tracing::info!(
        "Protected {} files, skipped {} ({} -> {} bytes)",
        summary.protected.len(),
        summary.skipped.len(),
        summary.total_original_size,
        summary.total_protected_size
    );

    let unbalanced: Vec<_> = summary.unbalanced().collect();
    if !unbalanced.is_empty() {
        for output in &unbalanced {
            eprintln!("balance check failed: {}", output.source.display());
        }
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
