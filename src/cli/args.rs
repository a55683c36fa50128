/*
 * SPDX-FileCopyrightText: 2024-2026 bootpatch contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use crate::cli::{install, payload, rebrand};

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Subcommand)]
pub enum Command {
    Patch(install::PatchCli),
    Flash(install::FlashCli),
    Uninstall(install::UninstallCli),
    FixEnv(install::FixEnvCli),
    Extract(payload::ExtractCli),
    Rebrand(rebrand::RebrandCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &Arc<AtomicBool>) -> Result<()> {
    // Parse the arguments first so that `--help` doesn't pull in the logging
    // machinery.
    let cli = Cli::parse();

    init_logging();
    logging_initialized.store(true, Ordering::SeqCst);

    match cli.command {
        Command::Patch(c) => install::patch_subcommand(&c, cancel_signal),
        Command::Flash(c) => install::flash_subcommand(&c, cancel_signal),
        Command::Uninstall(c) => install::uninstall_subcommand(&c, cancel_signal),
        Command::FixEnv(c) => install::fix_env_subcommand(&c, cancel_signal),
        Command::Extract(c) => payload::extract_subcommand(&c, cancel_signal),
        Command::Rebrand(c) => rebrand::rebrand_subcommand(&c),
    }
}
