/*
 * SPDX-FileCopyrightText: 2024-2026 bootpatch contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Rewrites the string pool of a compiled Android binary XML document. This is
//! a pure transform over bytes; the platform parser tolerates no deviation
//! from the chunk layout, so the data region and offset table are rebuilt in
//! full rather than patched in place.

use std::collections::HashMap;

use thiserror::Error;
use tracing::trace;

use crate::format::padding;

const CHUNK_XML: u16 = 0x0003;
const CHUNK_STRING_POOL: u16 = 0x0001;

const STRING_POOL_HEADER_SIZE: usize = 28;
const FLAG_UTF8: u32 = 0x0000_0100;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Document truncated at offset {0}")]
    Truncated(usize),
    #[error("Not a binary XML document (chunk type {0:#06x})")]
    NotBinaryXml(u16),
    #[error("Invalid chunk size {size} at offset {offset}")]
    InvalidChunkSize { offset: usize, size: u32 },
    #[error("String pool chunk not found")]
    StringPoolNotFound,
    #[error("String data offset {0} overlaps the pool header or offset table")]
    InvalidStringsStart(u32),
    #[error("String pool styles are not supported ({0} styles)")]
    StylesUnsupported(u32),
    #[error("UTF-8 string pools are not supported")]
    Utf8PoolUnsupported,
    #[error("Replacement string does not fit in a length prefix: {0:?}")]
    StringTooLong(String),
}

type Result<T> = std::result::Result<T, Error>;

fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    let raw = data
        .get(offset..offset + 2)
        .ok_or(Error::Truncated(offset))?;
    Ok(u16::from_le_bytes(raw.try_into().unwrap()))
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    let raw = data
        .get(offset..offset + 4)
        .ok_or(Error::Truncated(offset))?;
    Ok(u32::from_le_bytes(raw.try_into().unwrap()))
}

/// Find the string pool chunk by walking chunk headers from offset 8, summing
/// each chunk's declared size. Returns the chunk's byte offset.
fn find_string_pool(data: &[u8]) -> Result<usize> {
    let doc_type = read_u16(data, 0)?;
    if doc_type != CHUNK_XML {
        return Err(Error::NotBinaryXml(doc_type));
    }

    let mut pos = 8usize;

    while pos + 8 <= data.len() {
        let chunk_type = read_u16(data, pos)?;
        let chunk_size = read_u32(data, pos + 4)?;

        if chunk_type == CHUNK_STRING_POOL {
            return Ok(pos);
        }

        if chunk_size < 8 {
            return Err(Error::InvalidChunkSize {
                offset: pos,
                size: chunk_size,
            });
        }

        pos += chunk_size as usize;
    }

    Err(Error::StringPoolNotFound)
}

/// One pool entry, kept as raw UTF-16 code units so that non-substituted
/// entries are re-emitted byte-identically even if they aren't valid UTF-16.
struct PoolString {
    units: Vec<u16>,
}

impl PoolString {
    fn decoded(&self) -> Option<String> {
        String::from_utf16(&self.units).ok()
    }
}

/// Rewrite the document's string pool, substituting every pool entry that
/// exactly matches a key in `replacements` with the mapped value. All other
/// bytes of the document are preserved; the two affected chunk-size fields
/// (outer document and string pool) are adjusted by the total size delta and
/// the offset table is recomputed.
pub fn patch_string_pool(data: &[u8], replacements: &HashMap<String, String>) -> Result<Vec<u8>> {
    let pool_start = find_string_pool(data)?;

    let pool_size = read_u32(data, pool_start + 4)? as usize;
    let string_count = read_u32(data, pool_start + 8)? as usize;
    let style_count = read_u32(data, pool_start + 12)?;
    let flags = read_u32(data, pool_start + 16)?;
    let strings_start = read_u32(data, pool_start + 20)? as usize;
    let styles_start = read_u32(data, pool_start + 24)?;

    if style_count != 0 || styles_start != 0 {
        return Err(Error::StylesUnsupported(style_count));
    }
    if flags & FLAG_UTF8 != 0 {
        return Err(Error::Utf8PoolUnsupported);
    }
    if pool_start + pool_size > data.len() {
        return Err(Error::Truncated(data.len()));
    }
    // The string data must begin at or after the end of the offset table, or
    // the rebuilt table would be written outside the data region.
    if strings_start < STRING_POOL_HEADER_SIZE + 4 * string_count || strings_start > pool_size {
        return Err(Error::InvalidStringsStart(strings_start as u32));
    }

    let offset_table = pool_start + STRING_POOL_HEADER_SIZE;
    let data_base = pool_start + strings_start;

    // Parse every entry: u16 code unit count, code units, u16 NUL.
    let mut strings = Vec::with_capacity(string_count);

    for i in 0..string_count {
        let rel = read_u32(data, offset_table + 4 * i)? as usize;
        let mut at = data_base + rel;

        let len = read_u16(data, at)? as usize;
        at += 2;

        let mut units = Vec::with_capacity(len);
        for _ in 0..len {
            units.push(read_u16(data, at)?);
            at += 2;
        }

        strings.push(PoolString { units });
    }

    // Rebuild the data region with substitutions applied.
    let mut out = data[..data_base].to_vec();
    let mut new_offsets = Vec::with_capacity(string_count);

    for string in &strings {
        new_offsets.push((out.len() - data_base) as u32);

        let replacement = string
            .decoded()
            .and_then(|s| replacements.get(&s).cloned());

        let units: Vec<u16> = match &replacement {
            Some(new) => {
                let units: Vec<u16> = new.encode_utf16().collect();
                if units.len() > usize::from(u16::MAX) {
                    return Err(Error::StringTooLong(new.clone()));
                }
                trace!("Substituting pool entry: {new:?}");
                units
            }
            None => string.units.clone(),
        };

        out.extend_from_slice(&(units.len() as u16).to_le_bytes());
        for unit in &units {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out.extend_from_slice(&0u16.to_le_bytes());
    }

    // The chunk must stay 4-byte aligned.
    let padding = padding::calc(out.len() - pool_start, 4);
    out.resize(out.len() + padding, 0);

    let new_pool_size = out.len() - pool_start;

    // Everything after the original string pool chunk is unchanged.
    out.extend_from_slice(&data[pool_start + pool_size..]);

    // The size delta propagates to exactly two chunk headers: the outer
    // document and the string pool itself.
    let delta = new_pool_size as i64 - pool_size as i64;
    let doc_size = i64::from(read_u32(data, 4)?) + delta;

    out[4..8].copy_from_slice(&(doc_size as u32).to_le_bytes());
    out[pool_start + 4..pool_start + 8].copy_from_slice(&(new_pool_size as u32).to_le_bytes());

    for (i, offset) in new_offsets.iter().enumerate() {
        let at = offset_table + 4 * i;
        out[at..at + 4].copy_from_slice(&offset.to_le_bytes());
    }

    Ok(out)
}

/// Parsed view of a string pool, for inspection and tests.
pub struct StringPool {
    pub pool_offset: usize,
    pub pool_size: usize,
    pub strings: Vec<String>,
}

/// Parse the document's string pool without modifying anything.
pub fn parse_string_pool(data: &[u8]) -> Result<StringPool> {
    let pool_start = find_string_pool(data)?;

    let pool_size = read_u32(data, pool_start + 4)? as usize;
    let string_count = read_u32(data, pool_start + 8)? as usize;
    let strings_start = read_u32(data, pool_start + 20)? as usize;

    let offset_table = pool_start + STRING_POOL_HEADER_SIZE;
    let data_base = pool_start + strings_start;

    let mut strings = Vec::with_capacity(string_count);

    for i in 0..string_count {
        let rel = read_u32(data, offset_table + 4 * i)? as usize;
        let mut at = data_base + rel;

        let len = read_u16(data, at)? as usize;
        at += 2;

        let mut units = Vec::with_capacity(len);
        for _ in 0..len {
            units.push(read_u16(data, at)?);
            at += 2;
        }

        strings.push(String::from_utf16_lossy(&units));
    }

    Ok(StringPool {
        pool_offset: pool_start,
        pool_size,
        strings,
    })
}
