/*
 * SPDX-FileCopyrightText: 2024-2026 bootpatch contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Rewrites an application package's compiled manifest and re-signs it. The
//! signer is injected so the certificate handling stays outside this crate.

use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufReader, Cursor, Read, Write},
    path::Path,
};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;
use zip::{
    result::ZipError, write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter,
};

use crate::{format::axml, util};

pub const PATH_MANIFEST: &str = "AndroidManifest.xml";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Package has no {PATH_MANIFEST:?} entry")]
    ManifestMissing,
    #[error("Failed to patch manifest")]
    Axml(#[from] axml::Error),
    #[error("Zip error")]
    Zip(#[from] ZipError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Produces signed package bytes from unsigned package bytes. Signing is pure
/// bytes-to-bytes; key material never passes through this crate.
pub trait PackageSigner {
    fn sign(&self, unsigned: &[u8]) -> io::Result<Vec<u8>>;
}

/// Rewrite `package`'s manifest string pool with `replacements`, re-sign the
/// result, and write it atomically to `output`. Every entry other than the
/// manifest is copied through without recompression.
pub fn rebrand_package(
    package: &Path,
    replacements: &HashMap<String, String>,
    signer: &dyn PackageSigner,
    output: &Path,
) -> Result<()> {
    let mut zip = ZipArchive::new(BufReader::new(File::open(package)?))?;
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

    let mut manifest_seen = false;

    for i in 0..zip.len() {
        let is_manifest = zip.by_index_raw(i)?.name() == PATH_MANIFEST;

        if is_manifest {
            let mut data = Vec::new();
            zip.by_index(i)?.read_to_end(&mut data)?;

            let patched = axml::patch_string_pool(&data, replacements)?;

            let options =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            writer.start_file(PATH_MANIFEST, options)?;
            writer.write_all(&patched)?;

            manifest_seen = true;
        } else {
            let entry = zip.by_index_raw(i)?;
            writer.raw_copy_file(entry)?;
        }
    }

    if !manifest_seen {
        return Err(Error::ManifestMissing);
    }

    let unsigned = writer.finish()?.into_inner();

    debug!("Signing rebranded package: {} bytes", unsigned.len());
    let signed = signer.sign(&unsigned)?;

    let mut temp = NamedTempFile::new_in(util::parent_path(output))?;
    temp.write_all(&signed)?;
    temp.persist(output).map_err(|e| Error::Io(e.error))?;

    Ok(())
}
