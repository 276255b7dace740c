use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use casegen::database;
use casegen::generate::{self, GenerateOptions};

#[derive(Parser)]
#[command(name = "casegen")]
#[command(about = "Interpreter cases generator (instruction bodies -> C dispatch code).", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Expand every instruction body in the database into dispatch code.
    Emit {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        /// Emit storage-state comments alongside the generated code.
        #[arg(long)]
        trace_stacks: bool,
    },
    /// Print each instruction's flag bitmask expression.
    Flags {
        #[arg(long)]
        input: PathBuf,
    },
}

fn main() -> std::process::ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::ExitCode::from(2)
        }
    }
}

fn load_bundle(input: &PathBuf) -> Result<database::Bundle> {
    let src = std::fs::read_to_string(input).with_context(|| format!("read {}", input.display()))?;
    database::parse_bundle(&src).map_err(|e| anyhow::anyhow!("{}: {e}", input.display()))
}

fn try_main() -> Result<std::process::ExitCode> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Emit {
            input,
            out,
            trace_stacks,
        } => {
            let bundle = load_bundle(&input)?;
            match generate::generate(&bundle, &GenerateOptions { trace_stacks }) {
                Ok(text) => {
                    match out {
                        Some(path) => std::fs::write(&path, text)
                            .with_context(|| format!("write {}", path.display()))?,
                        None => print!("{text}"),
                    }
                    Ok(std::process::ExitCode::SUCCESS)
                }
                Err(err) => {
                    eprintln!("{}: {err}", input.display());
                    Ok(std::process::ExitCode::from(1))
                }
            }
        }
        Cmd::Flags { input } => {
            let bundle = load_bundle(&input)?;
            for def in &bundle.instructions {
                println!("{} {}", def.name, def.properties.flags());
            }
            Ok(std::process::ExitCode::SUCCESS)
        }
    }
}
