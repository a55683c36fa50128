/*
 * SPDX-FileCopyrightText: 2024-2026 bootpatch contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    io::{self, Read, Seek, SeekFrom, Write},
    sync::atomic::AtomicBool,
};

use bzip2::write::BzDecoder;
use liblzma::write::XzDecoder;
use num_traits::ToPrimitive;
use prost::Message;
use ring::digest::Context;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    protobuf::chromeos_update_engine::{
        install_operation, DeltaArchiveManifest, InstallOperation, PartitionUpdate,
    },
    stream::{self, CountingReader, FromReader, ReadDiscardExt, ReadFixedSizeExt},
};

pub const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";

/// Partitions that can serve as the boot image, in order of preference.
const BOOT_PARTITION_CANDIDATES: &[&str] = &["init_boot", "boot"];

/// How often extraction progress is reported (in operations).
const PROGRESS_INTERVAL: usize = 5;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 4]),
    #[error("Unsupported payload version: {0}")]
    UnsupportedVersion(u64),
    #[error("Payload manifest is empty")]
    EmptyManifest,
    #[error("Payload contains no manifest signatures")]
    NoSignatures,
    #[error("Unsupported partition operation: {0:?}")]
    UnsupportedOperation(install_operation::Type),
    #[error("Unknown partition operation type: {0}")]
    UnknownOperation(i32),
    #[error("Boot partition not found in payload")]
    BootPartitionNotFound,
    #[error("Expected sha256 {expected}, but have {actual}")]
    MismatchedDigest { expected: String, actual: String },
    #[error("{0:?} field is missing")]
    MissingField(&'static str),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Failed to decode payload manifest")]
    Protobuf(#[from] prost::DecodeError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug)]
pub struct PayloadHeader {
    pub version: u64,
    pub manifest: DeltaArchiveManifest,
    pub metadata_signature_size: u32,
    /// Offset of the blob section. All [`InstallOperation::data_offset`]
    /// values are relative to this.
    pub blob_offset: u64,
}

impl<R: Read> FromReader<R> for PayloadHeader {
    type Error = Error;

    /// Parse the header from an OTA payload stream. After this function
    /// returns, the stream position is set to the beginning of the blob
    /// section.
    fn from_reader(reader: R) -> Result<Self> {
        let mut reader = CountingReader::new(reader);

        let magic = reader.read_array_exact::<4>()?;
        if magic != *PAYLOAD_MAGIC {
            return Err(Error::UnknownMagic(magic));
        }

        let version = u64::from_be_bytes(reader.read_array_exact::<8>()?);
        if version != 2 {
            return Err(Error::UnsupportedVersion(version));
        }

        let manifest_size = u64::from_be_bytes(reader.read_array_exact::<8>()?);
        if manifest_size == 0 {
            return Err(Error::EmptyManifest);
        }
        let manifest_size = manifest_size
            .to_usize()
            .ok_or(Error::IntegerTooLarge("manifest_size"))?;

        let metadata_signature_size = u32::from_be_bytes(reader.read_array_exact::<4>()?);
        if metadata_signature_size == 0 {
            return Err(Error::NoSignatures);
        }

        let manifest_raw = reader.read_vec_exact(manifest_size)?;
        let manifest = DeltaArchiveManifest::decode(manifest_raw.as_slice())?;

        // The signature block is skipped, not verified.
        reader.read_discard_exact(metadata_signature_size.into())?;

        debug!(
            "Parsed payload manifest: version {version}, {} partitions",
            manifest.partitions.len(),
        );

        Ok(Self {
            version,
            manifest,
            metadata_signature_size,
            blob_offset: reader.stream_position()?,
        })
    }
}

/// Find the partition to treat as the boot image. `init_boot` is preferred
/// over `boot` because devices launching with Android 13 or newer keep the GKI
/// ramdisk there.
pub fn find_boot_partition(manifest: &DeltaArchiveManifest) -> Result<&PartitionUpdate> {
    BOOT_PARTITION_CANDIDATES
        .iter()
        .find_map(|name| {
            manifest
                .partitions
                .iter()
                .find(|p| p.partition_name == *name)
        })
        .ok_or(Error::BootPartitionNotFound)
}

/// Apply a single partition operation from the payload blob to `writer`. Only
/// full-replace and zero-fill operations are supported; delta operations are
/// rejected.
pub fn apply_operation(
    mut reader: impl Read + Seek,
    mut writer: impl Write + Seek,
    block_size: u32,
    blob_offset: u64,
    op: &InstallOperation,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let op_type = install_operation::Type::try_from(op.r#type)
        .map_err(|_| Error::UnknownOperation(op.r#type))?;

    if op_type == install_operation::Type::Zero {
        // The destination was preallocated and is already zero-filled.
        trace!("Skipping zero operation");
        return Ok(());
    }

    if op.dst_extents.is_empty() {
        return Err(Error::MissingField("dst_extents"));
    }

    for extent in &op.dst_extents {
        let start_block = extent
            .start_block
            .ok_or(Error::MissingField("start_block"))?;
        let out_offset = start_block
            .checked_mul(block_size.into())
            .ok_or(Error::IntegerTooLarge("out_offset"))?;

        let data_offset = op.data_offset.ok_or(Error::MissingField("data_offset"))?;
        let data_length = op.data_length.ok_or(Error::MissingField("data_length"))?;
        let in_offset = blob_offset
            .checked_add(data_offset)
            .ok_or(Error::IntegerTooLarge("in_offset"))?;

        reader.seek(SeekFrom::Start(in_offset))?;
        writer.seek(SeekFrom::Start(out_offset))?;

        match op_type {
            install_operation::Type::Replace => {
                stream::copy_n(&mut reader, &mut writer, data_length, cancel_signal)?;
            }
            install_operation::Type::ReplaceBz => {
                let mut decoder = BzDecoder::new(&mut writer);
                stream::copy_n(&mut reader, &mut decoder, data_length, cancel_signal)?;
                decoder.finish()?;
            }
            install_operation::Type::ReplaceXz => {
                let mut decoder = XzDecoder::new(&mut writer);
                stream::copy_n(&mut reader, &mut decoder, data_length, cancel_signal)?;
                decoder.finish()?;
            }
            other => return Err(Error::UnsupportedOperation(other)),
        }
    }

    Ok(())
}

/// Materialize a partition from the payload into `output`. The output is
/// preallocated to the declared size and the operations are applied strictly
/// in manifest order. `progress` is invoked at every 5th operation and on the
/// last one.
///
/// If the manifest declares a content hash for the partition, the fully
/// materialized output is hashed with SHA-256 and compared byte-for-byte. When
/// no hash is declared, extraction is accepted unconditionally.
pub fn extract_partition(
    mut payload: impl Read + Seek,
    mut output: impl Read + Write + Seek,
    header: &PayloadHeader,
    partition: &PartitionUpdate,
    mut progress: impl FnMut(usize, usize),
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let info = partition
        .new_partition_info
        .as_ref()
        .ok_or(Error::MissingField("new_partition_info"))?;
    let size = info.size.ok_or(Error::MissingField("size"))?;

    // Write one byte at the final offset to materialize the full length. All
    // untouched regions read back as zeros.
    if size > 0 {
        output.seek(SeekFrom::Start(size - 1))?;
        output.write_all(&[0])?;
    }

    let total = partition.operations.len();

    for (i, op) in partition.operations.iter().enumerate() {
        apply_operation(
            &mut payload,
            &mut output,
            header.manifest.block_size(),
            header.blob_offset,
            op,
            cancel_signal,
        )?;

        if (i + 1) % PROGRESS_INTERVAL == 0 || i + 1 == total {
            progress(i + 1, total);
        }
    }

    if let Some(expected) = &info.hash {
        output.rewind()?;

        let mut context = Context::new(&ring::digest::SHA256);
        stream::copy_n_inspect(
            &mut output,
            io::sink(),
            size,
            |data| context.update(data),
            cancel_signal,
        )?;
        let digest = context.finish();

        if digest.as_ref() != expected.as_slice() {
            return Err(Error::MismatchedDigest {
                expected: hex::encode(expected),
                actual: hex::encode(digest.as_ref()),
            });
        }

        debug!(
            "Partition {} digest verified: {}",
            partition.partition_name,
            hex::encode(digest.as_ref()),
        );
    }

    Ok(())
}
