// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, Subcommand};
use std::fs::read_to_string;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::prelude::*;

mod utils;

use crate::utils::{Backend, UtilsError};

pub enum HvBridgeExitCode {
    /// Success exit code.
    Ok = 0,
    /// Generic error exit code.
    GenericError = 1,
    /// Generic exit code for an error considered not possible to occur if program logic is
    /// sound.
    UnexpectedError = 2,
    /// Bad configuration for the plan.
    BadConfiguration = 153,
}

#[derive(Debug, thiserror::Error)]
enum CliInputError {
    #[error("Failed to open file: {0}")]
    FileIo(#[from] std::io::Error),
    #[error("Failed to run plan: {0}")]
    Utils(#[from] UtilsError),
}

#[derive(Debug, thiserror::Error)]
enum MainError {
    #[error("Unexpected input error: {0}")]
    CliError(#[from] CliInputError),
}

impl From<MainError> for ExitCode {
    fn from(value: MainError) -> Self {
        let exit_code = match value {
            MainError::CliError(e) => match e {
                CliInputError::FileIo(_) => HvBridgeExitCode::BadConfiguration,
                CliInputError::Utils(UtilsError::CreateResources(_)) => {
                    HvBridgeExitCode::BadConfiguration
                }
                CliInputError::Utils(UtilsError::Teardown(_)) => HvBridgeExitCode::UnexpectedError,
                CliInputError::Utils(_) => HvBridgeExitCode::GenericError,
            },
        };
        ExitCode::from(exit_code as u8)
    }
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Log level, overridden by RUST_LOG
    #[arg(
        long,
        global = true,
        default_value = "info",
        value_parser = ["error", "warn", "info", "debug", "trace"]
    )]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Virtual Machine related operations
    #[command(subcommand)]
    Vm(VmOperation),
}

#[derive(Debug, Subcommand)]
enum VmOperation {
    /// Build the VMs of a plan, report them and tear them down
    Run {
        /// Path of the plan file
        #[arg(short, long, value_name = "PATH")]
        config: PathBuf,
        /// Host backend to drive
        #[arg(short, long, value_enum, default_value_t = Backend::Kvm)]
        backend: Backend,
    },
}

fn init_logging(level: &str) {
    let filter = format!("bridge={level},hvbridge={level}");
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn run(cli: Cli) -> Result<(), CliInputError> {
    match cli.command {
        Command::Vm(op) => match op {
            VmOperation::Run { config, backend } => {
                let config = read_to_string(config)?;
                utils::run_plan(&config, backend)?;
                Ok(())
            }
        },
    }
}

fn main_exec() -> Result<(), MainError> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    let result = run(cli);
    if let Err(e) = result {
        eprintln!("{}", e);
        return Err(MainError::CliError(e));
    }
    Ok(())
}

fn main() -> ExitCode {
    let result = main_exec();
    if let Err(err) = result {
        eprintln!("Error: {err:?}");
        ExitCode::from(err)
    } else {
        ExitCode::from(HvBridgeExitCode::Ok as u8)
    }
}
