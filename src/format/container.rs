/*
 * SPDX-FileCopyrightText: 2024-2026 bootpatch contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Chooses an extraction strategy for an arbitrary zip-like container without
//! fully unpacking it. OTA packages are routed to the payload extractor via a
//! zero-copy byte range, while factory images and plain archives are searched
//! (recursively, through stored nested zips) for a boot image entry.

use std::{
    io::{self, Read, Write},
    sync::atomic::AtomicBool,
};

use thiserror::Error;
use tracing::debug;
use zip::{result::ZipError, CompressionMethod, ZipArchive};

use crate::stream::{self, ReadAt, SectionReaderAt, UserPosFile};

pub const PATH_PAYLOAD: &str = "payload.bin";
pub const PATH_METADATA: &str = "META-INF/com/android/metadata";

/// Boot image entry names, in order of preference.
const IMAGE_CANDIDATES: &[&str] = &["init_boot.img", "boot.img"];

#[derive(Debug, Error)]
pub enum Error {
    #[error("Entry is compressed, but must be stored: {0}")]
    NotStored(String),
    #[error("Boot image not found in archive")]
    InnerImageNotFound,
    #[error("Zip error")]
    Zip(#[from] ZipError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Where a routed boot image entry lives inside the outer container.
#[derive(Clone, Debug)]
pub struct EntryLocation {
    /// Full entry path within its immediate archive.
    pub name: String,
    /// Uncompressed size.
    pub size: u64,
    /// Absolute byte range of the raw entry data when the entry is stored.
    /// Deflated entries must be stream-inflated instead.
    pub raw_range: Option<(u64, u64)>,
    /// Absolute byte range of the nested factory image zip containing the
    /// entry, if any.
    pub nested: Option<(u64, u64)>,
}

/// Routing decision for a container.
#[derive(Clone, Debug)]
pub enum Route {
    /// The container is an OTA package. The byte range covers the stored
    /// `payload.bin` entry.
    Payload {
        offset: u64,
        size: u64,
        notes: Option<String>,
    },
    /// The container holds a boot image entry directly or in a nested factory
    /// image zip.
    BootImage(EntryLocation),
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_factory_image_zip(path: &str) -> bool {
    let name = file_name(path);
    name.starts_with("image-") && name.ends_with(".zip")
}

/// Search an archive for a boot image entry by trailing filename, preferring
/// `init_boot.img` over `boot.img`. Offsets in the result are relative to the
/// archive's own byte source.
fn find_image_entry<R: Read + io::Seek>(zip: &mut ZipArchive<R>) -> Result<Option<EntryLocation>> {
    for want in IMAGE_CANDIDATES {
        for i in 0..zip.len() {
            let entry = zip.by_index_raw(i)?;
            if file_name(entry.name()) != *want {
                continue;
            }

            let raw_range = if entry.compression() == CompressionMethod::Stored {
                Some((entry.data_start(), entry.data_start() + entry.size()))
            } else {
                None
            };

            return Ok(Some(EntryLocation {
                name: entry.name().to_owned(),
                size: entry.size(),
                raw_range,
                nested: None,
            }));
        }
    }

    Ok(None)
}

/// Find a nested factory image archive (`image-*.zip`). The nested zip must be
/// stored so that it can be parsed over a byte-range slice.
fn find_nested_zip<R: Read + io::Seek>(zip: &mut ZipArchive<R>) -> Result<Option<(u64, u64)>> {
    for i in 0..zip.len() {
        let entry = zip.by_index_raw(i)?;
        if !is_factory_image_zip(entry.name()) {
            continue;
        }

        if entry.compression() != CompressionMethod::Stored {
            return Err(Error::NotStored(entry.name().to_owned()));
        }

        return Ok(Some((entry.data_start(), entry.size())));
    }

    Ok(None)
}

fn read_release_notes<R: Read + io::Seek>(zip: &mut ZipArchive<R>) -> Option<String> {
    let mut entry = zip.by_name(PATH_METADATA).ok()?;
    let mut notes = String::new();
    entry.read_to_string(&mut notes).ok()?;
    Some(notes)
}

/// Decide how to extract a boot image from the container backing `source`.
///
/// A `payload.bin` entry always wins, even when loose boot image entries are
/// present in the same archive. Otherwise the archive is searched for
/// `init_boot.img`/`boot.img`, then for a stored nested `image-*.zip` to
/// search inside.
pub fn route<R: ReadAt>(source: &R) -> Result<Route> {
    let mut zip = ZipArchive::new(UserPosFile::new(source))?;

    let payload_range = match zip.by_name(PATH_PAYLOAD) {
        Ok(entry) => {
            // OTA convention requires the payload to be stored so that
            // streaming updates can read it by byte range.
            if entry.compression() != CompressionMethod::Stored {
                return Err(Error::NotStored(PATH_PAYLOAD.to_owned()));
            }

            Some((entry.data_start(), entry.size()))
        }
        Err(ZipError::FileNotFound) => None,
        Err(e) => return Err(e.into()),
    };

    if let Some((offset, size)) = payload_range {
        let notes = read_release_notes(&mut zip);

        debug!("Routing as OTA package: payload at {offset}, {size} bytes");

        return Ok(Route::Payload {
            offset,
            size,
            notes,
        });
    }

    if let Some(location) = find_image_entry(&mut zip)? {
        debug!("Found boot image entry: {}", location.name);
        return Ok(Route::BootImage(location));
    }

    if let Some((offset, size)) = find_nested_zip(&mut zip)? {
        let slice = SectionReaderAt::new(source, offset, size);
        let mut nested_zip = ZipArchive::new(UserPosFile::new(&slice))?;

        if let Some(mut location) = find_image_entry(&mut nested_zip)? {
            // Offsets from the nested scan are slice-relative.
            if let Some((start, end)) = location.raw_range {
                location.raw_range = Some((offset + start, offset + end));
            }
            location.nested = Some((offset, size));

            debug!(
                "Found boot image entry in nested archive: {}",
                location.name,
            );
            return Ok(Route::BootImage(location));
        }
    }

    Err(Error::InnerImageNotFound)
}

/// Extract a routed boot image entry to `writer`. Stored entries are copied
/// directly from their byte range; deflated entries are stream-inflated.
pub fn extract_entry<R: ReadAt>(
    source: &R,
    location: &EntryLocation,
    mut writer: impl Write,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    if let Some((start, end)) = location.raw_range {
        let slice = SectionReaderAt::new(source, start, end - start);
        stream::copy_n(
            UserPosFile::new(&slice),
            &mut writer,
            end - start,
            cancel_signal,
        )?;
        return Ok(());
    }

    // Deflated entry. Reopen the containing archive and inflate.
    let (base, bound) = match location.nested {
        Some((offset, size)) => (offset, size),
        None => (0, source.file_len()?),
    };
    let slice = SectionReaderAt::new(source, base, bound);
    let mut zip = ZipArchive::new(UserPosFile::new(&slice))?;
    let entry = zip.by_name(&location.name)?;

    stream::copy(entry, &mut writer, cancel_signal)?;

    Ok(())
}
