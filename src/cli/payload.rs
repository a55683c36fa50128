/*
 * SPDX-FileCopyrightText: 2024-2026 bootpatch contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek},
    path::PathBuf,
    sync::atomic::AtomicBool,
};

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::{
    cli::status,
    format::{
        container::{self, Route},
        payload::{self, PayloadHeader},
    },
    patch::install::{self, ArtifactKind},
    stream::{FromReader, SectionReaderAt, UserPosFile},
};

/// Extract a partition image from an OTA payload.
#[derive(Debug, Parser)]
pub struct ExtractCli {
    /// Path to payload.bin or full OTA zip.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Path to output image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub output: PathBuf,

    /// Partition to extract instead of the default boot preference.
    #[arg(short, long, value_name = "NAME")]
    pub partition: Option<String>,
}

fn extract_from(
    cli: &ExtractCli,
    mut reader: impl Read + Seek,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let header = PayloadHeader::from_reader(&mut reader)
        .with_context(|| format!("Failed to parse payload header: {:?}", cli.input))?;

    let partition = match &cli.partition {
        Some(name) => header
            .manifest
            .partitions
            .iter()
            .find(|p| p.partition_name == *name)
            .with_context(|| format!("Partition not found in payload: {name}"))?,
        None => payload::find_boot_partition(&header.manifest)?,
    };

    let mut output = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&cli.output)
        .with_context(|| format!("Failed to open for writing: {:?}", cli.output))?;

    status!("Extracting {} to {:?}", partition.partition_name, cli.output);

    payload::extract_partition(
        &mut reader,
        &mut output,
        &header,
        partition,
        |i, total| status!("Applied {i}/{total} operations"),
        cancel_signal,
    )?;

    Ok(())
}

pub fn extract_subcommand(cli: &ExtractCli, cancel_signal: &AtomicBool) -> Result<()> {
    let mut file =
        File::open(&cli.input).with_context(|| format!("Failed to open: {:?}", cli.input))?;

    let kind = install::sniff_format(&mut file)?;
    file.rewind()?;

    match kind {
        ArtifactKind::Payload => extract_from(cli, &mut file, cancel_signal),
        ArtifactKind::Zip => match container::route(&file)? {
            Route::Payload { offset, size, .. } => {
                let slice = SectionReaderAt::new(&file, offset, size);
                extract_from(cli, UserPosFile::new(&slice), cancel_signal)
            }
            Route::BootImage(_) => bail!("Archive contains no payload: {:?}", cli.input),
        },
        _ => bail!("Not an OTA payload: {:?}", cli.input),
    }
}
