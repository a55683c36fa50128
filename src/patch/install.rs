/*
 * SPDX-FileCopyrightText: 2024-2026 bootpatch contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! End-to-end install pipeline. Every flow is a short-circuiting chain of
//! stage primitives running under the process-wide session guard; failures
//! surface as console lines on the outcome, not as panics or partial output.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind, Read, Seek},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    format::{
        container::{self, Route},
        payload::{self, PayloadHeader},
    },
    patch::{
        session::{Console, SessionGuard},
        shell::CommandExecutor,
    },
    stream::{self, FromReader, SectionReaderAt, UserPosFile},
    util,
};

/// Helper scripts staged into the workdir. Their contents are owned by the
/// privileged environment, not this crate.
pub const SCRIPT_BOOT_PATCH: &str = "boot_patch.sh";
pub const SCRIPT_DUMP_BOOT: &str = "dump_boot.sh";
pub const SCRIPT_FLASH_BOOT: &str = "flash_boot.sh";
pub const SCRIPT_SWITCH_SLOT: &str = "switch_slot.sh";
pub const SCRIPT_FIX_ENV: &str = "fix_env.sh";
pub const SCRIPT_RESTORE: &str = "restore_boot.sh";

/// Name the source image is staged under inside the workdir.
pub const FILE_SOURCE: &str = "boot.img";
/// Name the patch script writes its result to.
pub const FILE_PATCHED: &str = "new-boot.img";

const SNIFF_LEN: usize = 512;
const SUFFIX_LEN: usize = 5;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No boot image found in {0:?}")]
    ImageNotFound(PathBuf),
    #[error("External tool exited with an error: {0}")]
    ExternalTool(String),
    #[error("Patched image was not produced at {0:?}")]
    MissingPatchedImage(PathBuf),
    #[error("Payload error")]
    Payload(#[from] payload::Error),
    #[error("Container error")]
    Container(#[from] container::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Sniffed format of a source artifact.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArtifactKind {
    Tar,
    Payload,
    Zip,
    RawImage,
}

/// Classify an artifact by its first 512 bytes. Anything unrecognized is
/// treated as a raw image and handed to the patch script as-is.
pub fn sniff_format(mut reader: impl Read) -> io::Result<ArtifactKind> {
    let mut buf = [0u8; SNIFF_LEN];
    let mut n = 0;

    while n < buf.len() {
        let read = reader.read(&mut buf[n..])?;
        if read == 0 {
            break;
        }
        n += read;
    }

    let buf = &buf[..n];

    let kind = if buf.len() >= 262 && &buf[257..262] == b"ustar" {
        ArtifactKind::Tar
    } else if buf.starts_with(payload::PAYLOAD_MAGIC) {
        ArtifactKind::Payload
    } else if buf.starts_with(b"PK\x03\x04") {
        ArtifactKind::Zip
    } else {
        ArtifactKind::RawImage
    };

    debug!("Sniffed artifact format: {kind:?}");

    Ok(kind)
}

/// Session-scoped scratch directory. Purged before use so stale state from an
/// earlier crash can't leak in, and removed again on drop.
#[derive(Debug)]
struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    fn create(path: &Path) -> io::Result<Self> {
        match fs::remove_dir_all(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::create_dir_all(path)?;

        Ok(Self {
            path: path.to_owned(),
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            warn!("Failed to clean up {:?}: {e}", self.path);
        }
    }
}

#[derive(Clone, Debug)]
pub struct InstallConfig {
    /// Scratch directory. Purged at session start and removed at session end.
    pub work_dir: PathBuf,
    /// Directory of helper scripts and tools copied into the workdir.
    pub assets_dir: Option<PathBuf>,
    pub keep_verity: bool,
    pub keep_encryption: bool,
    pub patch_vbmeta: bool,
    pub recovery_mode: bool,
    /// A/B slot suffix for the flows that target a specific slot.
    pub slot: Option<String>,
    /// Append a random 5-character suffix to the output file name.
    pub randomize_name: bool,
    pub product_prefix: String,
    pub build_code: String,
}

impl InstallConfig {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            assets_dir: None,
            keep_verity: true,
            keep_encryption: true,
            patch_vbmeta: false,
            recovery_mode: false,
            slot: None,
            randomize_name: false,
            product_prefix: "patched_boot".to_owned(),
            build_code: "local".to_owned(),
        }
    }
}

/// Result surface of one install session.
#[derive(Debug)]
pub struct InstallOutcome {
    pub success: bool,
    /// Set when the session was rejected because another one was active. The
    /// rejection is recorded in the log, never as a console error line.
    pub busy: bool,
    pub console: Vec<String>,
    pub log: Vec<String>,
}

struct Installer<'a> {
    config: &'a InstallConfig,
    executor: &'a dyn CommandExecutor,
    console: Console,
    cancel_signal: &'a AtomicBool,
}

impl Installer<'_> {
    fn env_flags(&self) -> Vec<(&'static str, String)> {
        vec![
            ("KEEPVERITY", self.config.keep_verity.to_string()),
            ("KEEPFORCEENCRYPT", self.config.keep_encryption.to_string()),
            ("PATCHVBMETAFLAG", self.config.patch_vbmeta.to_string()),
            ("RECOVERYMODE", self.config.recovery_mode.to_string()),
            ("SLOT", self.config.slot.clone().unwrap_or_default()),
        ]
    }

    fn stage_assets(&mut self, workdir: &Path) -> Result<()> {
        let Some(assets) = &self.config.assets_dir else {
            return Ok(());
        };

        for entry in fs::read_dir(assets)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::copy(entry.path(), workdir.join(entry.file_name()))?;
            }
        }

        Ok(())
    }

    fn run_script(&mut self, workdir: &Path, command: &str) -> Result<()> {
        let env = self.env_flags();
        let output = self.executor.run(workdir, command, &env)?;

        for line in output.lines {
            self.console.say(line);
        }

        if !output.success {
            return Err(Error::ExternalTool(command.to_owned()));
        }

        Ok(())
    }

    /// Stage the boot image out of `input` into the workdir under
    /// [`FILE_SOURCE`]. Returns the artifact kind and the partition role name
    /// the image had in the source, which the output stage reuses.
    fn obtain_source_image(&mut self, input: &Path, workdir: &Path) -> Result<(ArtifactKind, String)> {
        let mut file = File::open(input)?;
        let kind = sniff_format(&mut file)?;
        file.rewind()?;

        let role = match kind {
            ArtifactKind::RawImage => {
                self.console.say("- Copying image to cache");

                let mut dest = File::create(workdir.join(FILE_SOURCE))?;
                stream::copy(&mut file, &mut dest, self.cancel_signal)?;

                FILE_SOURCE.to_owned()
            }
            ArtifactKind::Payload => {
                self.console.say("- Unpacking OTA payload");
                self.extract_from_payload(&mut file, workdir)?
            }
            ArtifactKind::Zip => self.extract_from_zip(&file, workdir)?,
            ArtifactKind::Tar => {
                self.console.say("- Scanning tar archive");
                self.extract_from_tar(input, workdir)?
            }
        };

        Ok((kind, role))
    }

    fn extract_from_payload(
        &mut self,
        mut reader: impl Read + Seek,
        workdir: &Path,
    ) -> Result<String> {
        let header = PayloadHeader::from_reader(&mut reader)?;
        let partition = payload::find_boot_partition(&header.manifest)?;

        let mut output = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(workdir.join(FILE_SOURCE))?;

        let console = &mut self.console;
        payload::extract_partition(
            &mut reader,
            &mut output,
            &header,
            partition,
            |i, total| console.say(format!("- Downloading {i}/{total}")),
            self.cancel_signal,
        )?;

        Ok(format!("{}.img", partition.partition_name))
    }

    fn extract_from_zip(&mut self, file: &File, workdir: &Path) -> Result<String> {
        match container::route(file)? {
            Route::Payload {
                offset,
                size,
                notes,
            } => {
                self.console.say("- Unpacking OTA payload");

                if let Some(notes) = notes {
                    for line in notes.lines() {
                        self.console.log(line.to_owned());
                    }
                }

                let slice = SectionReaderAt::new(file, offset, size);
                let mut reader = UserPosFile::new(&slice);
                self.extract_from_payload(&mut reader, workdir)
            }
            Route::BootImage(location) => {
                self.console
                    .say(format!("- Extracting {}", location.name));

                let mut dest = File::create(workdir.join(FILE_SOURCE))?;
                container::extract_entry(file, &location, &mut dest, self.cancel_signal)?;

                let name = location
                    .name
                    .rsplit('/')
                    .next()
                    .unwrap_or(&location.name)
                    .to_owned();
                Ok(name)
            }
        }
    }

    fn extract_from_tar(&mut self, input: &Path, workdir: &Path) -> Result<String> {
        let candidates: &[&str] = if self.config.recovery_mode {
            &["recovery.img", "init_boot.img", "boot.img"]
        } else {
            &["init_boot.img", "boot.img"]
        };

        let mut present = Vec::new();
        let mut archive = tar::Archive::new(File::open(input)?);
        for entry in archive.entries()? {
            let entry = entry?;
            let path = entry.path()?;
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                present.push(name.to_owned());
            }
        }

        let chosen = candidates
            .iter()
            .find(|c| present.iter().any(|p| p == *c))
            .ok_or_else(|| Error::ImageNotFound(input.to_owned()))?;

        self.console.say(format!("- Extracting {chosen}"));

        let mut archive = tar::Archive::new(File::open(input)?);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            if path.file_name().and_then(|n| n.to_str()) != Some(chosen) {
                continue;
            }

            let mut dest = File::create(workdir.join(FILE_SOURCE))?;
            stream::copy(&mut entry, &mut dest, self.cancel_signal)?;

            return Ok((*chosen).to_owned());
        }

        Err(Error::ImageNotFound(input.to_owned()))
    }

    /// Flash the patched image by streaming it into the flash script's stdin.
    /// The script writes its stdin to the target partition, so it never needs
    /// filesystem access to the workdir.
    fn flash_patched(&mut self, workdir: &Path) -> Result<()> {
        self.console.say("- Flashing new boot image");

        let env = self.env_flags();
        let mut patched = File::open(workdir.join(FILE_PATCHED))?;

        let output = self.executor.run_with_input(
            workdir,
            &format!("sh {SCRIPT_FLASH_BOOT}"),
            &env,
            &mut patched,
        )?;

        for line in output.lines {
            self.console.say(line);
        }

        if !output.success {
            return Err(Error::ExternalTool(SCRIPT_FLASH_BOOT.to_owned()));
        }

        Ok(())
    }

    /// Run the patch script against the staged image and return the path of
    /// the patched result.
    fn patch_image(&mut self, workdir: &Path) -> Result<PathBuf> {
        self.console.say("- Patching boot image");
        self.run_script(workdir, &format!("sh {SCRIPT_BOOT_PATCH} {FILE_SOURCE}"))?;

        let patched = workdir.join(FILE_PATCHED);
        if !patched.exists() {
            return Err(Error::MissingPatchedImage(patched));
        }

        Ok(patched)
    }

    fn output_name(&self, kind: ArtifactKind) -> String {
        let ext = if kind == ArtifactKind::Tar { "tar" } else { "img" };
        let prefix = &self.config.product_prefix;
        let build = &self.config.build_code;

        if self.config.randomize_name {
            format!("{prefix}_{build}_{}.{ext}", util::random_suffix(SUFFIX_LEN))
        } else {
            format!("{prefix}_{build}.{ext}")
        }
    }

    /// Write the result next to the input. The file appears atomically via a
    /// rename; an existing file with the same name is replaced.
    fn emit_output(
        &mut self,
        input: &Path,
        patched: &Path,
        kind: ArtifactKind,
        role: &str,
    ) -> Result<PathBuf> {
        let dest_dir = util::parent_path(input).to_owned();
        let dest = dest_dir.join(self.output_name(kind));

        let mut temp = NamedTempFile::new_in(&dest_dir)?;

        if kind == ArtifactKind::Tar {
            self.repack_tar(input, patched, role, temp.as_file_mut())?;
        } else {
            let mut source = File::open(patched)?;
            stream::copy(&mut source, temp.as_file_mut(), self.cancel_signal)?;
        }

        temp.persist(&dest).map_err(|e| Error::Io(e.error))?;

        Ok(dest)
    }

    /// Rebuild the input tar with the boot entry swapped for the patched
    /// image. All other entries are streamed through unchanged.
    fn repack_tar(
        &mut self,
        input: &Path,
        patched: &Path,
        role: &str,
        writer: &mut File,
    ) -> Result<()> {
        let mut archive = tar::Archive::new(File::open(input)?);
        let mut builder = tar::Builder::new(writer);

        for entry in archive.entries()? {
            let entry = entry?;
            let path = entry.path()?.into_owned();
            if path.file_name().and_then(|n| n.to_str()) == Some(role) {
                continue;
            }

            let header = entry.header().clone();
            builder.append(&header, entry)?;
        }

        let mut source = File::open(patched)?;
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(source.metadata()?.len());
        builder.append_data(&mut header, role, &mut source)?;

        builder.finish()?;

        Ok(())
    }

    fn patch_file(&mut self, input: &Path) -> Result<()> {
        let workdir = WorkDir::create(&self.config.work_dir)?;
        self.stage_assets(workdir.path())?;

        let (kind, role) = self.obtain_source_image(input, workdir.path())?;
        let patched = self.patch_image(workdir.path())?;
        let dest = self.emit_output(input, &patched, kind, &role)?;

        self.console
            .say(format!("- Output file is written to {}", dest.display()));

        Ok(())
    }

    fn direct_install(&mut self) -> Result<()> {
        let workdir = WorkDir::create(&self.config.work_dir)?;
        self.stage_assets(workdir.path())?;

        self.console.say("- Copying boot image from device");
        self.run_script(
            workdir.path(),
            &format!("sh {SCRIPT_DUMP_BOOT} {FILE_SOURCE}"),
        )?;

        self.patch_image(workdir.path())?;
        self.flash_patched(workdir.path())?;

        Ok(())
    }

    fn second_slot_install(&mut self) -> Result<()> {
        let workdir = WorkDir::create(&self.config.work_dir)?;
        self.stage_assets(workdir.path())?;

        self.console.say("- Copying boot image from inactive slot");
        self.run_script(
            workdir.path(),
            &format!("sh {SCRIPT_DUMP_BOOT} {FILE_SOURCE}"),
        )?;

        self.patch_image(workdir.path())?;
        self.flash_patched(workdir.path())?;

        // Hand the reboot target over to the bootloader control interface.
        self.console.say("- Switching active slot");
        self.run_script(workdir.path(), &format!("sh {SCRIPT_SWITCH_SLOT}"))?;

        Ok(())
    }

    fn fix_environment(&mut self) -> Result<()> {
        let workdir = WorkDir::create(&self.config.work_dir)?;
        self.stage_assets(workdir.path())?;

        self.console.say("- Fixing environment");
        self.run_script(workdir.path(), &format!("sh {SCRIPT_FIX_ENV}"))?;

        Ok(())
    }

    fn uninstall(&mut self) -> Result<()> {
        let workdir = WorkDir::create(&self.config.work_dir)?;
        self.stage_assets(workdir.path())?;

        self.console.say("- Restoring stock boot image");
        self.run_script(workdir.path(), &format!("sh {SCRIPT_RESTORE}"))?;

        Ok(())
    }
}

fn run_session<'a>(
    config: &'a InstallConfig,
    executor: &'a dyn CommandExecutor,
    cancel_signal: &'a AtomicBool,
    body: impl FnOnce(&mut Installer<'a>) -> Result<()>,
) -> InstallOutcome {
    let Some(_guard) = SessionGuard::acquire() else {
        let mut console = Console::new();
        console.log("Rejected: another install session is active");

        let (console, log) = console.into_parts();
        return InstallOutcome {
            success: false,
            busy: true,
            console,
            log,
        };
    };

    let mut installer = Installer {
        config,
        executor,
        console: Console::new(),
        cancel_signal,
    };

    let success = match body(&mut installer) {
        Ok(()) => {
            installer.console.say("- All done!");
            true
        }
        Err(e) => {
            installer.console.log(format!("{e:?}"));
            installer.console.say(format!("! {e}"));
            installer.console.say("! Installation failed");
            false
        }
    };

    let (console, log) = installer.console.into_parts();
    InstallOutcome {
        success,
        busy: false,
        console,
        log,
    }
}

/// Patch a boot artifact file and write the result next to it.
pub fn patch_file(
    config: &InstallConfig,
    executor: &dyn CommandExecutor,
    input: &Path,
    cancel_signal: &AtomicBool,
) -> InstallOutcome {
    run_session(config, executor, cancel_signal, |i| i.patch_file(input))
}

/// Patch the device's active boot image in place and flash it back.
pub fn direct_install(
    config: &InstallConfig,
    executor: &dyn CommandExecutor,
    cancel_signal: &AtomicBool,
) -> InstallOutcome {
    run_session(config, executor, cancel_signal, |i| i.direct_install())
}

/// Patch the inactive A/B slot after an OTA and switch the reboot target to
/// it.
pub fn second_slot_install(
    config: &InstallConfig,
    executor: &dyn CommandExecutor,
    cancel_signal: &AtomicBool,
) -> InstallOutcome {
    run_session(config, executor, cancel_signal, |i| i.second_slot_install())
}

/// Repair the helper environment without touching any boot image.
pub fn fix_environment(
    config: &InstallConfig,
    executor: &dyn CommandExecutor,
    cancel_signal: &AtomicBool,
) -> InstallOutcome {
    run_session(config, executor, cancel_signal, |i| i.fix_environment())
}

/// Restore the backed-up stock images.
pub fn uninstall(
    config: &InstallConfig,
    executor: &dyn CommandExecutor,
    cancel_signal: &AtomicBool,
) -> InstallOutcome {
    run_session(config, executor, cancel_signal, |i| i.uninstall())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn sniff_known_formats() {
        let mut tar = vec![0u8; 512];
        tar[257..262].copy_from_slice(b"ustar");
        assert_eq!(sniff_format(Cursor::new(tar)).unwrap(), ArtifactKind::Tar);

        assert_eq!(
            sniff_format(Cursor::new(b"CrAU\x00".to_vec())).unwrap(),
            ArtifactKind::Payload,
        );
        assert_eq!(
            sniff_format(Cursor::new(b"PK\x03\x04rest".to_vec())).unwrap(),
            ArtifactKind::Zip,
        );
        assert_eq!(
            sniff_format(Cursor::new(b"ANDROID!".to_vec())).unwrap(),
            ArtifactKind::RawImage,
        );
    }

    #[test]
    fn sniff_short_input() {
        assert_eq!(
            sniff_format(Cursor::new(Vec::new())).unwrap(),
            ArtifactKind::RawImage,
        );
    }
}
