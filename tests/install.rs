/*
 * SPDX-FileCopyrightText: 2024-2026 bootpatch contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs::{self, File},
    io::{self, Cursor, Read, Write},
    path::Path,
    sync::{atomic::AtomicBool, Mutex},
};

use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

use bootpatch::patch::{
    install::{self, InstallConfig},
    session::SessionGuard,
    shell::{CommandExecutor, CommandOutput},
};

// The session guard is process-wide state shared by every test in this
// binary, so the tests must not overlap.
static TEST_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> std::sync::MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

const ENV_KEYS: &[&str] = &[
    "KEEPVERITY",
    "KEEPFORCEENCRYPT",
    "PATCHVBMETAFLAG",
    "RECOVERYMODE",
    "SLOT",
];

/// Stands in for the privileged helper scripts. `boot_patch.sh` prepends a
/// marker to the staged image; the flash and dump scripts touch files so the
/// flow can be asserted on.
struct FakePatcher {
    fail_patch: bool,
    commands: Mutex<Vec<String>>,
    stdin: Mutex<Vec<u8>>,
}

impl FakePatcher {
    fn new() -> Self {
        Self {
            fail_patch: false,
            commands: Mutex::new(Vec::new()),
            stdin: Mutex::new(Vec::new()),
        }
    }

    fn failing() -> Self {
        Self {
            fail_patch: true,
            ..Self::new()
        }
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn stdin(&self) -> Vec<u8> {
        self.stdin.lock().unwrap().clone()
    }
}

impl CommandExecutor for FakePatcher {
    fn run(&self, dir: &Path, command: &str, env: &[(&str, String)]) -> io::Result<CommandOutput> {
        for key in ENV_KEYS {
            assert!(
                env.iter().any(|(k, _)| k == key),
                "missing env flag: {key}",
            );
        }

        self.commands.lock().unwrap().push(command.to_owned());

        if command.starts_with("sh boot_patch.sh") {
            if self.fail_patch {
                return Ok(CommandOutput {
                    success: false,
                    lines: vec!["! Unsupported image format".to_owned()],
                });
            }

            let source = fs::read(dir.join("boot.img"))?;
            let mut patched = b"PATCHED".to_vec();
            patched.extend_from_slice(&source);
            fs::write(dir.join("new-boot.img"), patched)?;

            return Ok(CommandOutput {
                success: true,
                lines: vec!["- Repacking boot image".to_owned()],
            });
        }

        if command.starts_with("sh dump_boot.sh") {
            fs::write(dir.join("boot.img"), b"DEVICEBOOT")?;
        }

        Ok(CommandOutput {
            success: true,
            lines: Vec::new(),
        })
    }

    fn run_with_input(
        &self,
        dir: &Path,
        command: &str,
        env: &[(&str, String)],
        input: &mut (dyn Read + Send),
    ) -> io::Result<CommandOutput> {
        input.read_to_end(&mut self.stdin.lock().unwrap())?;
        self.run(dir, command, env)
    }
}

fn config_for(dir: &Path) -> InstallConfig {
    InstallConfig::new(dir.join("work"))
}

fn write_file(path: &Path, data: &[u8]) {
    File::create(path).unwrap().write_all(data).unwrap();
}

fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(data.len() as u64);
        builder.append_data(&mut header, name, *data).unwrap();
    }

    builder.into_inner().unwrap()
}

fn read_tar(data: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut archive = tar::Archive::new(Cursor::new(data));
    let mut entries = Vec::new();

    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        entries.push((name, data));
    }

    entries
}

#[test]
fn raw_image_end_to_end() {
    let _lock = lock();
    let temp = tempfile::tempdir().unwrap();

    let input = temp.path().join("original.img");
    write_file(&input, b"ANDROID!raw boot image");

    let config = config_for(temp.path());
    let executor = FakePatcher::new();
    let cancel_signal = AtomicBool::new(false);

    let outcome = install::patch_file(&config, &executor, &input, &cancel_signal);

    assert!(outcome.success, "console: {:?}", outcome.console);
    assert!(!outcome.busy);
    assert_eq!(outcome.console.last().unwrap(), "- All done!");

    let output = temp.path().join("patched_boot_local.img");
    assert_eq!(fs::read(output).unwrap(), b"PATCHEDANDROID!raw boot image");

    // The workdir must be gone after the session ends.
    assert!(!temp.path().join("work").exists());
}

#[test]
fn zip_image_end_to_end() {
    let _lock = lock();
    let temp = tempfile::tempdir().unwrap();

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    writer.start_file("init_boot.img", options).unwrap();
    writer.write_all(b"init boot contents").unwrap();
    let data = writer.finish().unwrap().into_inner();

    let input = temp.path().join("firmware.zip");
    write_file(&input, &data);

    let config = config_for(temp.path());
    let executor = FakePatcher::new();
    let cancel_signal = AtomicBool::new(false);

    let outcome = install::patch_file(&config, &executor, &input, &cancel_signal);

    assert!(outcome.success, "console: {:?}", outcome.console);
    assert_eq!(
        fs::read(temp.path().join("patched_boot_local.img")).unwrap(),
        b"PATCHEDinit boot contents",
    );
}

#[test]
fn tar_repack_preserves_other_entries() {
    let _lock = lock();
    let temp = tempfile::tempdir().unwrap();

    let data = build_tar(&[
        ("vbmeta.img", b"vbmeta contents"),
        ("boot.img", b"boot contents"),
    ]);
    let input = temp.path().join("firmware.tar");
    write_file(&input, &data);

    let config = config_for(temp.path());
    let executor = FakePatcher::new();
    let cancel_signal = AtomicBool::new(false);

    let outcome = install::patch_file(&config, &executor, &input, &cancel_signal);
    assert!(outcome.success, "console: {:?}", outcome.console);

    let output = fs::read(temp.path().join("patched_boot_local.tar")).unwrap();
    let entries = read_tar(&output);

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].0, "vbmeta.img");
    assert_eq!(entries[0].1, b"vbmeta contents");
    assert_eq!(entries[1].0, "boot.img");
    assert_eq!(entries[1].1, b"PATCHEDboot contents");
}

#[test]
fn recovery_mode_prefers_recovery_entry() {
    let _lock = lock();
    let temp = tempfile::tempdir().unwrap();

    let data = build_tar(&[
        ("recovery.img", b"recovery contents"),
        ("boot.img", b"boot contents"),
    ]);
    let input = temp.path().join("firmware.tar");
    write_file(&input, &data);

    let mut config = config_for(temp.path());
    config.recovery_mode = true;

    let executor = FakePatcher::new();
    let cancel_signal = AtomicBool::new(false);

    let outcome = install::patch_file(&config, &executor, &input, &cancel_signal);
    assert!(outcome.success, "console: {:?}", outcome.console);

    let output = fs::read(temp.path().join("patched_boot_local.tar")).unwrap();
    let entries = read_tar(&output);

    assert_eq!(entries[0].0, "boot.img");
    assert_eq!(entries[0].1, b"boot contents");
    assert_eq!(entries[1].0, "recovery.img");
    assert_eq!(entries[1].1, b"PATCHEDrecovery contents");
}

#[test]
fn randomized_output_name() {
    let _lock = lock();
    let temp = tempfile::tempdir().unwrap();

    let input = temp.path().join("original.img");
    write_file(&input, b"ANDROID!raw");

    let mut config = config_for(temp.path());
    config.randomize_name = true;

    let executor = FakePatcher::new();
    let cancel_signal = AtomicBool::new(false);

    let outcome = install::patch_file(&config, &executor, &input, &cancel_signal);
    assert!(outcome.success, "console: {:?}", outcome.console);

    let name = fs::read_dir(temp.path())
        .unwrap()
        .filter_map(|e| e.unwrap().file_name().into_string().ok())
        .find(|n| n.starts_with("patched_boot_local_") && n.ends_with(".img"))
        .unwrap();
    let suffix = name
        .strip_prefix("patched_boot_local_")
        .unwrap()
        .strip_suffix(".img")
        .unwrap();

    assert_eq!(suffix.len(), 5);
    assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
}

#[test]
fn concurrent_session_rejected() {
    let _lock = lock();
    let temp = tempfile::tempdir().unwrap();

    let input = temp.path().join("original.img");
    write_file(&input, b"ANDROID!raw");

    let config = config_for(temp.path());
    let executor = FakePatcher::new();
    let cancel_signal = AtomicBool::new(false);

    let guard = SessionGuard::acquire().unwrap();
    let outcome = install::patch_file(&config, &executor, &input, &cancel_signal);
    drop(guard);

    assert!(!outcome.success);
    assert!(outcome.busy);
    // Busy is diagnostic only; the console must stay clean.
    assert!(outcome.console.is_empty());
    assert!(!outcome.log.is_empty());

    // Nothing was staged or written.
    assert!(executor.commands().is_empty());
    assert!(!temp.path().join("patched_boot_local.img").exists());
}

#[test]
fn script_failure_cleans_up() {
    let _lock = lock();
    let temp = tempfile::tempdir().unwrap();

    let input = temp.path().join("original.img");
    write_file(&input, b"ANDROID!raw");

    let config = config_for(temp.path());
    let executor = FakePatcher::failing();
    let cancel_signal = AtomicBool::new(false);

    let outcome = install::patch_file(&config, &executor, &input, &cancel_signal);

    assert!(!outcome.success);
    assert!(!outcome.busy);
    assert_eq!(outcome.console.last().unwrap(), "! Installation failed");

    assert!(!temp.path().join("patched_boot_local.img").exists());
    assert!(!temp.path().join("work").exists());
}

#[test]
fn missing_image_in_tar_fails() {
    let _lock = lock();
    let temp = tempfile::tempdir().unwrap();

    let data = build_tar(&[("vbmeta.img", b"vbmeta contents")]);
    let input = temp.path().join("firmware.tar");
    write_file(&input, &data);

    let config = config_for(temp.path());
    let executor = FakePatcher::new();
    let cancel_signal = AtomicBool::new(false);

    let outcome = install::patch_file(&config, &executor, &input, &cancel_signal);

    assert!(!outcome.success);
    assert!(outcome
        .console
        .iter()
        .any(|l| l.starts_with("! No boot image found")));
}

#[test]
fn direct_install_runs_dump_patch_flash() {
    let _lock = lock();
    let temp = tempfile::tempdir().unwrap();

    let config = config_for(temp.path());
    let executor = FakePatcher::new();
    let cancel_signal = AtomicBool::new(false);

    let outcome = install::direct_install(&config, &executor, &cancel_signal);
    assert!(outcome.success, "console: {:?}", outcome.console);

    assert_eq!(
        executor.commands(),
        [
            "sh dump_boot.sh boot.img",
            "sh boot_patch.sh boot.img",
            "sh flash_boot.sh",
        ],
    );

    // The patched image is streamed into the flash script's stdin.
    assert_eq!(executor.stdin(), b"PATCHEDDEVICEBOOT");
}

#[test]
fn second_slot_install_switches_slot() {
    let _lock = lock();
    let temp = tempfile::tempdir().unwrap();

    let mut config = config_for(temp.path());
    config.slot = Some("_b".to_owned());

    let executor = FakePatcher::new();
    let cancel_signal = AtomicBool::new(false);

    let outcome = install::second_slot_install(&config, &executor, &cancel_signal);
    assert!(outcome.success, "console: {:?}", outcome.console);

    assert_eq!(
        executor.commands().last().unwrap(),
        "sh switch_slot.sh",
    );
}

#[test]
fn assets_are_staged_into_workdir() {
    let _lock = lock();
    let temp = tempfile::tempdir().unwrap();

    let assets = temp.path().join("assets");
    fs::create_dir(&assets).unwrap();
    write_file(&assets.join("boot_patch.sh"), b"#!/system/bin/sh\n");

    let input = temp.path().join("original.img");
    write_file(&input, b"ANDROID!raw");

    let mut config = config_for(temp.path());
    config.assets_dir = Some(assets);

    // The fake verifies nothing about assets; assert through the filesystem
    // by failing the patch step, which leaves no other side effects.
    struct AssetChecker;

    impl CommandExecutor for AssetChecker {
        fn run(
            &self,
            dir: &Path,
            _command: &str,
            _env: &[(&str, String)],
        ) -> io::Result<CommandOutput> {
            assert!(dir.join("boot_patch.sh").exists());
            Ok(CommandOutput {
                success: false,
                lines: Vec::new(),
            })
        }

        fn run_with_input(
            &self,
            dir: &Path,
            command: &str,
            env: &[(&str, String)],
            _input: &mut (dyn Read + Send),
        ) -> io::Result<CommandOutput> {
            self.run(dir, command, env)
        }
    }

    let cancel_signal = AtomicBool::new(false);
    let outcome = install::patch_file(&config, &AssetChecker, &input, &cancel_signal);

    assert!(!outcome.success);
}
