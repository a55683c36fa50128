/*
 * SPDX-FileCopyrightText: 2024-2026 bootpatch contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{env, path::PathBuf, sync::atomic::AtomicBool};

use anyhow::{bail, Result};
use clap::{Args, Parser};

use crate::{
    cli::warning,
    patch::{
        install::{self, InstallConfig, InstallOutcome},
        shell::ShellExecutor,
    },
};

#[derive(Debug, Args)]
pub struct ConfigGroup {
    /// Scratch directory for intermediate files.
    #[arg(long, value_name = "DIR", value_parser)]
    pub work_dir: Option<PathBuf>,

    /// Directory of helper scripts staged into the scratch directory.
    #[arg(long, value_name = "DIR", value_parser)]
    pub assets: Option<PathBuf>,

    /// Strip dm-verity from the patched image.
    #[arg(long)]
    pub remove_verity: bool,

    /// Strip forced encryption from the patched image.
    #[arg(long)]
    pub remove_encryption: bool,

    /// Clear the disable flags in vbmeta images.
    #[arg(long)]
    pub patch_vbmeta: bool,

    /// Target the recovery partition instead of boot.
    #[arg(long)]
    pub recovery: bool,

    /// A/B slot suffix to operate on.
    #[arg(long, value_name = "SLOT")]
    pub slot: Option<String>,

    /// Randomize the output file name.
    #[arg(long)]
    pub random_name: bool,

    /// Output file name prefix.
    #[arg(long, value_name = "NAME", default_value = "patched_boot")]
    pub prefix: String,

    /// Build code embedded in the output file name.
    #[arg(long, value_name = "CODE", default_value = "local")]
    pub build: String,
}

impl ConfigGroup {
    fn to_config(&self) -> InstallConfig {
        let work_dir = self
            .work_dir
            .clone()
            .unwrap_or_else(|| env::temp_dir().join("bootpatch"));

        let mut config = InstallConfig::new(work_dir);
        config.assets_dir = self.assets.clone();
        config.keep_verity = !self.remove_verity;
        config.keep_encryption = !self.remove_encryption;
        config.patch_vbmeta = self.patch_vbmeta;
        config.recovery_mode = self.recovery;
        config.slot = self.slot.clone();
        config.randomize_name = self.random_name;
        config.product_prefix = self.prefix.clone();
        config.build_code = self.build.clone();
        config
    }
}

/// Patch a boot artifact file and write the result next to it.
#[derive(Debug, Parser)]
pub struct PatchCli {
    /// Path to boot image, OTA zip, payload, or tar archive.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    #[command(flatten)]
    pub config: ConfigGroup,
}

/// Patch the device's boot image in place and flash it back.
#[derive(Debug, Parser)]
pub struct FlashCli {
    /// Patch the inactive slot and switch the reboot target to it.
    #[arg(long)]
    pub second_slot: bool,

    #[command(flatten)]
    pub config: ConfigGroup,
}

/// Restore the backed-up stock images.
#[derive(Debug, Parser)]
pub struct UninstallCli {
    #[command(flatten)]
    pub config: ConfigGroup,
}

/// Repair the helper environment.
#[derive(Debug, Parser)]
pub struct FixEnvCli {
    #[command(flatten)]
    pub config: ConfigGroup,
}

fn report(outcome: InstallOutcome) -> Result<()> {
    for line in &outcome.console {
        println!("{line}");
    }

    if outcome.busy {
        bail!("Another install session is active");
    }
    if !outcome.success {
        for line in &outcome.log {
            warning!("{line}");
        }
        bail!("Installation failed");
    }

    Ok(())
}

pub fn patch_subcommand(cli: &PatchCli, cancel_signal: &AtomicBool) -> Result<()> {
    let config = cli.config.to_config();
    let executor = ShellExecutor::new();

    report(install::patch_file(
        &config,
        &executor,
        &cli.input,
        cancel_signal,
    ))
}

pub fn flash_subcommand(cli: &FlashCli, cancel_signal: &AtomicBool) -> Result<()> {
    let config = cli.config.to_config();
    let executor = ShellExecutor::new();

    let outcome = if cli.second_slot {
        install::second_slot_install(&config, &executor, cancel_signal)
    } else {
        install::direct_install(&config, &executor, cancel_signal)
    };

    report(outcome)
}

pub fn uninstall_subcommand(cli: &UninstallCli, cancel_signal: &AtomicBool) -> Result<()> {
    let config = cli.config.to_config();
    let executor = ShellExecutor::new();

    report(install::uninstall(&config, &executor, cancel_signal))
}

pub fn fix_env_subcommand(cli: &FixEnvCli, cancel_signal: &AtomicBool) -> Result<()> {
    let config = cli.config.to_config();
    let executor = ShellExecutor::new();

    report(install::fix_environment(&config, &executor, cancel_signal))
}
