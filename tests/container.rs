/*
 * SPDX-FileCopyrightText: 2024-2026 bootpatch contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs::File,
    io::{Cursor, Write},
    sync::atomic::AtomicBool,
};

use assert_matches::assert_matches;
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

use bootpatch::{
    format::container::{self, Error, Route},
    stream::ReadAt,
};

fn build_zip(entries: &[(&str, &[u8], CompressionMethod)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

    for (name, data, method) in entries {
        let options = SimpleFileOptions::default().compression_method(*method);
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }

    writer.finish().unwrap().into_inner()
}

fn as_file(data: &[u8]) -> File {
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(data).unwrap();
    file
}

fn extract(file: &File, location: &container::EntryLocation) -> Vec<u8> {
    let cancel_signal = AtomicBool::new(false);
    let mut out = Vec::new();
    container::extract_entry(file, location, &mut out, &cancel_signal).unwrap();
    out
}

#[test]
fn payload_always_wins() {
    let payload = b"CrAU fake payload contents";
    let data = build_zip(&[
        ("boot.img", b"loose boot image", CompressionMethod::Stored),
        ("payload.bin", payload, CompressionMethod::Stored),
    ]);
    let file = as_file(&data);

    let route = container::route(&file).unwrap();
    let (offset, size) = assert_matches!(
        route,
        Route::Payload { offset, size, .. } => (offset, size)
    );

    assert_eq!(size, payload.len() as u64);

    let mut raw = vec![0u8; size as usize];
    file.read_exact_at(&mut raw, offset).unwrap();
    assert_eq!(raw, payload);
}

#[test]
fn deflated_payload_rejected() {
    let data = build_zip(&[(
        "payload.bin",
        b"CrAU fake payload contents",
        CompressionMethod::Deflated,
    )]);
    let file = as_file(&data);

    assert_matches!(container::route(&file), Err(Error::NotStored(name)) if name == "payload.bin");
}

#[test]
fn release_notes_from_metadata() {
    let data = build_zip(&[
        ("payload.bin", b"CrAU", CompressionMethod::Stored),
        (
            "META-INF/com/android/metadata",
            b"post-build=vendor/device:14\n",
            CompressionMethod::Deflated,
        ),
    ]);
    let file = as_file(&data);

    let route = container::route(&file).unwrap();
    let notes = assert_matches!(route, Route::Payload { notes, .. } => notes);
    assert!(notes.unwrap().contains("post-build"));
}

#[test]
fn stored_image_has_raw_range() {
    let image = b"boot image contents";
    let data = build_zip(&[
        ("firmware-update/boot.img", image, CompressionMethod::Stored),
    ]);
    let file = as_file(&data);

    let route = container::route(&file).unwrap();
    let location = assert_matches!(route, Route::BootImage(location) => location);

    assert_eq!(location.name, "firmware-update/boot.img");
    assert!(location.raw_range.is_some());
    assert_eq!(extract(&file, &location), image);
}

#[test]
fn deflated_image_is_inflated() {
    let image = vec![0x42u8; 8192];
    let data = build_zip(&[("boot.img", &image, CompressionMethod::Deflated)]);
    let file = as_file(&data);

    let route = container::route(&file).unwrap();
    let location = assert_matches!(route, Route::BootImage(location) => location);

    assert!(location.raw_range.is_none());
    assert_eq!(extract(&file, &location), image);
}

#[test]
fn init_boot_preferred_over_boot() {
    let data = build_zip(&[
        ("boot.img", b"boot", CompressionMethod::Stored),
        ("init_boot.img", b"init_boot", CompressionMethod::Stored),
    ]);
    let file = as_file(&data);

    let route = container::route(&file).unwrap();
    let location = assert_matches!(route, Route::BootImage(location) => location);

    assert_eq!(location.name, "init_boot.img");
    assert_eq!(extract(&file, &location), b"init_boot");
}

#[test]
fn nested_factory_image() {
    let image = b"nested init_boot contents";
    let inner = build_zip(&[
        ("userdata.img", b"userdata", CompressionMethod::Stored),
        ("init_boot.img", image, CompressionMethod::Stored),
    ]);
    let outer = build_zip(&[
        ("flash-all.sh", b"#!/bin/sh\n", CompressionMethod::Deflated),
        ("image-device-ap1a.zip", &inner, CompressionMethod::Stored),
    ]);
    let file = as_file(&outer);

    let route = container::route(&file).unwrap();
    let location = assert_matches!(route, Route::BootImage(location) => location);

    assert_eq!(location.name, "init_boot.img");
    assert!(location.nested.is_some());

    // The raw range must have been rebased to the outer file.
    let (start, end) = location.raw_range.unwrap();
    let mut raw = vec![0u8; (end - start) as usize];
    file.read_exact_at(&mut raw, start).unwrap();
    assert_eq!(raw, image);

    assert_eq!(extract(&file, &location), image);
}

#[test]
fn nested_deflated_image_extracts_via_inflation() {
    let image = vec![0x17u8; 4096];
    let inner = build_zip(&[("boot.img", &image, CompressionMethod::Deflated)]);
    let outer = build_zip(&[("image-device.zip", &inner, CompressionMethod::Stored)]);
    let file = as_file(&outer);

    let route = container::route(&file).unwrap();
    let location = assert_matches!(route, Route::BootImage(location) => location);

    assert!(location.raw_range.is_none());
    assert!(location.nested.is_some());
    assert_eq!(extract(&file, &location), image);
}

#[test]
fn deflated_nested_zip_rejected() {
    let inner = build_zip(&[("boot.img", b"data", CompressionMethod::Stored)]);
    let outer = build_zip(&[("image-device.zip", &inner, CompressionMethod::Deflated)]);
    let file = as_file(&outer);

    assert_matches!(container::route(&file), Err(Error::NotStored(_)));
}

#[test]
fn no_image_anywhere() {
    let data = build_zip(&[("README.txt", b"nothing here", CompressionMethod::Deflated)]);
    let file = as_file(&data);

    assert_matches!(container::route(&file), Err(Error::InnerImageNotFound));
}
