//! Build automation tasks for sockio
//!
//! Run with: cargo xtask <command>

use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "sockio build automation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all tests
    Test,

    /// Run clippy lints
    Lint,

    /// Check formatting
    Fmt,

    /// Run all CI checks
    Ci,

    /// Run the capacity tests that need CAP_NET_ADMIN (uses sudo)
    Privileged,

    /// Run a fuzz target for a fixed time (requires cargo-fuzz)
    Fuzz {
        /// Target name, e.g. fuzz_control_message
        target: String,

        /// Seconds to run
        #[arg(long, default_value_t = 60)]
        seconds: u64,
    },

    /// Generate documentation
    Doc,
}

const CAPACITY_TESTS: &[&str] = &[
    "test_forced_receive_capacity",
    "test_forced_send_capacity",
    "test_set_capacity_falls_back_to_force",
];

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Test => {
            run_command("cargo", &["test", "--all-features", "--workspace"])?;
        }
        Commands::Lint => {
            run_command("cargo", &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
        }
        Commands::Fmt => {
            run_command("cargo", &["fmt", "--all", "--check"])?;
        }
        Commands::Ci => {
            println!("Running CI checks...");
            run_command("cargo", &["fmt", "--all", "--check"])?;
            run_command("cargo", &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
            run_command("cargo", &["test", "--all-features", "--workspace"])?;
            println!("All CI checks passed!");
        }
        Commands::Privileged => {
            println!("Running privileged capacity tests under sudo...");
            for test in CAPACITY_TESTS {
                run_command(
                    "sudo",
                    &[
                        "-E",
                        "cargo",
                        "test",
                        "-p",
                        "sockio-integration-tests",
                        "--test",
                        "integration_tests",
                        "--",
                        "--exact",
                        test,
                    ],
                )?;
            }
        }
        Commands::Fuzz { target, seconds } => {
            let max_time = format!("-max_total_time={seconds}");
            run_command_in(
                "fuzz",
                "cargo",
                &["+nightly", "fuzz", "run", &target, "--", &max_time],
            )?;
        }
        Commands::Doc => {
            run_command("cargo", &["doc", "--workspace", "--no-deps", "--open"])?;
        }
    }

    Ok(())
}

fn run_command(program: &str, args: &[&str]) -> anyhow::Result<()> {
    run_command_in(".", program, args)
}

fn run_command_in(dir: &str, program: &str, args: &[&str]) -> anyhow::Result<()> {
    let status = Command::new(program).current_dir(dir).args(args).status()?;

    if !status.success() {
        anyhow::bail!("{} {:?} failed", program, args);
    }

    Ok(())
}
