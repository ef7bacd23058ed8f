//
// main.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! jupexec
//!
//! Runs code snippets on locally installed Jupyter kernels.

use clap::{Parser, Subcommand};
use jupclient::{ExecutionStatus, SessionRegistry};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Subcommands
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the kernels installed on this machine
    List,

    /// Run a code snippet on a kernel for the given language
    Run {
        /// The language to run the code in (e.g. 'python' or 'jupyter-julia')
        language: String,

        /// The code to run
        code: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let registry = SessionRegistry::with_discovered_kernels().await;

    let result = match args.command {
        Commands::List => list_kernels(&registry),
        Commands::Run { language, code } => run_code(&registry, &language, &code).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// List the installed kernels, one per line.
fn list_kernels(registry: &SessionRegistry) -> Result<(), anyhow::Error> {
    let specs = registry.kernel_specs();
    if specs.is_empty() {
        println!("No Jupyter kernels found. Is Jupyter installed?");
        return Ok(());
    }
    for spec in specs.specs() {
        println!("{:<20} {:<10} {}", spec.name, spec.language, spec.display_name);
    }
    Ok(())
}

/// Start a kernel for the language, run the code, print the result, and shut
/// the kernel down.
async fn run_code(
    registry: &SessionRegistry,
    language: &str,
    code: &str,
) -> Result<(), anyhow::Error> {
    let session_id = registry.start_for_language(language).await?;

    // Shut the kernel down no matter how the execution went
    let execution = registry.execute(&session_id, code).await;
    if let Err(e) = registry.stop_session(&session_id).await {
        log::warn!("Failed to stop session: {}", e);
    }

    let result = execution?;
    if !result.stdout.is_empty() {
        print!("{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
    }
    match result.status {
        ExecutionStatus::Ok => {
            if let Some(text) = result.text() {
                println!("{}", text);
            }
            Ok(())
        }
        ExecutionStatus::Error => {
            if let Some(error) = &result.error {
                eprintln!("{}: {}", error.ename, error.evalue);
                for line in &error.traceback {
                    eprintln!("{}", line);
                }
            }
            anyhow::bail!("execution failed")
        }
        ExecutionStatus::Aborted => anyhow::bail!("execution was aborted"),
    }
}
