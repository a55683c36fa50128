/*
 * SPDX-FileCopyrightText: 2024-2026 bootpatch contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    collections::HashMap,
    fs,
    io,
    path::PathBuf,
    process::Command,
};

use anyhow::{Context, Result};
use clap::Parser;

use crate::{
    cli::status,
    patch::rebrand::{self, PackageSigner},
};

fn parse_replacement(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(old, new)| (old.to_owned(), new.to_owned()))
        .ok_or_else(|| format!("Invalid OLD=NEW pair: {raw:?}"))
}

/// Rewrite an application package's compiled manifest and re-sign it.
#[derive(Debug, Parser)]
pub struct RebrandCli {
    /// Path to input package.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Path to output package.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub output: PathBuf,

    /// Manifest string replacement. May be repeated.
    #[arg(short, long = "replace", value_name = "OLD=NEW", value_parser = parse_replacement)]
    pub replace: Vec<(String, String)>,

    /// External signer invoked as `<COMMAND> <unsigned> <signed>`.
    #[arg(long, value_name = "COMMAND", value_parser)]
    pub signer: Option<PathBuf>,
}

/// Signer backed by an external command operating on temporary files.
struct CommandSigner {
    program: PathBuf,
}

impl PackageSigner for CommandSigner {
    fn sign(&self, unsigned: &[u8]) -> io::Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let unsigned_path = dir.path().join("unsigned.apk");
        let signed_path = dir.path().join("signed.apk");

        fs::write(&unsigned_path, unsigned)?;

        let status = Command::new(&self.program)
            .arg(&unsigned_path)
            .arg(&signed_path)
            .status()?;
        if !status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("Signer command failed: {:?}", self.program),
            ));
        }

        fs::read(&signed_path)
    }
}

/// Pass-through for callers that sign out of band.
struct NullSigner;

impl PackageSigner for NullSigner {
    fn sign(&self, unsigned: &[u8]) -> io::Result<Vec<u8>> {
        Ok(unsigned.to_vec())
    }
}

pub fn rebrand_subcommand(cli: &RebrandCli) -> Result<()> {
    let replacements: HashMap<String, String> = cli.replace.iter().cloned().collect();

    let signer: Box<dyn PackageSigner> = match &cli.signer {
        Some(program) => Box::new(CommandSigner {
            program: program.clone(),
        }),
        None => Box::new(NullSigner),
    };

    rebrand::rebrand_package(&cli.input, &replacements, signer.as_ref(), &cli.output)
        .with_context(|| format!("Failed to rebrand package: {:?}", cli.input))?;

    status!("Wrote rebranded package to {:?}", cli.output);

    Ok(())
}
