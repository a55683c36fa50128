/*
 * SPDX-FileCopyrightText: 2024-2026 bootpatch contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

fn main() {
    println!("cargo:rerun-if-changed=protobuf/update_metadata.proto");

    // protox compiles the proto files in pure Rust so that a protoc binary is
    // not needed at build time.
    let file_descriptors = protox::compile(["protobuf/update_metadata.proto"], ["protobuf"])
        .expect("Failed to compile protobuf definitions");

    prost_build::Config::new()
        .compile_fds(file_descriptors)
        .expect("Failed to generate protobuf code");
}
