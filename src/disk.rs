//! Attach disk images to block devices and mount their filesystems read-only.
//!
//! The lifecycle is an explicit acquire/release pair:
//! - [`DiskImage::open`] validates the file extension before anything touches the kernel.
//! - [`mount`] asks a [`Mounter`] to attach the image and returns a [`MountHandle`].
//! - [`MountHandle::unmount`] releases mounts and devices; it is idempotent and also runs
//!   from `Drop`, so error propagation, panics and cancellation all release the device.
//!
//! [`SystemMounter`] is the production implementation: loop devices via `losetup`
//! for raw images, NBD devices via `qemu-nbd` for qcow images, partition discovery via
//! `lsblk --json`, and read-only mounts through the `fsopen`/`fsmount` API.

use crate::config::Config;
use crate::error::ForensicsError;
use anyhow::{anyhow, bail, Context, Result};
use log::{debug, error, info, warn};
use rustix::mount::{
    fsconfig_create, fsconfig_set_flag, fsconfig_set_string, fsmount, fsopen, move_mount,
    unmount, FsMountFlags, FsOpenFlags, MountAttrFlags, MoveMountFlags, UnmountFlags,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Raw,
    Img,
    Dd,
    Qcow,
    Qcow2,
    Qcow3,
}

impl ImageFormat {
    /// Derive the format from the file extension alone.
    pub fn from_path(path: &Path) -> std::result::Result<Self, ForensicsError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());

        match extension.as_deref() {
            Some("raw") => Ok(ImageFormat::Raw),
            Some("img") => Ok(ImageFormat::Img),
            Some("dd") => Ok(ImageFormat::Dd),
            Some("qcow") => Ok(ImageFormat::Qcow),
            Some("qcow2") => Ok(ImageFormat::Qcow2),
            Some("qcow3") => Ok(ImageFormat::Qcow3),
            _ => Err(ForensicsError::UnsupportedFormat {
                path: path.to_path_buf(),
            }),
        }
    }

    pub fn is_qcow(self) -> bool {
        matches!(
            self,
            ImageFormat::Qcow | ImageFormat::Qcow2 | ImageFormat::Qcow3
        )
    }
}

/// A disk image accepted for processing.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskImage {
    path: PathBuf,
    format: ImageFormat,
}

impl DiskImage {
    pub fn open<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ForensicsError> {
        let path = path.as_ref();
        let format = ImageFormat::from_path(path)?;

        if !path.is_file() {
            return Err(ForensicsError::mount(path, "image file does not exist"));
        }

        Ok(Self {
            path: path.to_path_buf(),
            format,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// File name used to tag results coming from this image.
    pub fn label(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Loop,
    Nbd,
}

/// Everything a [`Mounter`] created for one image, in creation order.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub device: PathBuf,
    pub kind: DeviceKind,
    pub mountpoints: Vec<PathBuf>,
}

/// Attaches images to devices and mounts them. Implementations must undo
/// everything from `attach` in `detach`.
pub trait Mounter {
    fn attach(&self, image: &DiskImage) -> Result<Attachment>;
    fn detach(&self, attachment: &Attachment) -> Result<()>;
}

/// Scoped ownership of an attached image.
pub struct MountHandle<'m> {
    mounter: &'m dyn Mounter,
    image: PathBuf,
    attachment: Option<Attachment>,
}

impl<'m> MountHandle<'m> {
    pub fn mountpoints(&self) -> &[PathBuf] {
        self.attachment
            .as_ref()
            .map(|a| a.mountpoints.as_slice())
            .unwrap_or(&[])
    }

    pub fn device(&self) -> Option<&Path> {
        self.attachment.as_ref().map(|a| a.device.as_path())
    }

    pub fn is_mounted(&self) -> bool {
        self.attachment.is_some()
    }

    /// Release mounts and devices. Calling it again is a no-op.
    pub fn unmount(&mut self) -> std::result::Result<(), ForensicsError> {
        match self.attachment.take() {
            Some(attachment) => {
                debug!(
                    "Releasing {} ({})",
                    attachment.device.display(),
                    self.image.display()
                );
                self.mounter
                    .detach(&attachment)
                    .map_err(|e| ForensicsError::mount(&self.image, e))
            }
            None => Ok(()),
        }
    }
}

impl Drop for MountHandle<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.unmount() {
            error!("{}", e);
        }
    }
}

/// Attach `image` and mount its filesystems.
pub fn mount<'m>(
    image: &DiskImage,
    mounter: &'m dyn Mounter,
) -> std::result::Result<MountHandle<'m>, ForensicsError> {
    info!("Mounting disk image {}", image.path().display());
    let attachment = mounter
        .attach(image)
        .map_err(|e| ForensicsError::mount(image.path(), e))?;

    debug!(
        "Disk {} attached as {} with {} mountpoint(s)",
        image.label(),
        attachment.device.display(),
        attachment.mountpoints.len()
    );

    Ok(MountHandle {
        mounter,
        image: image.path().to_path_buf(),
        attachment: Some(attachment),
    })
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    path: String,
    fstype: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

/// Filesystem types that are never mounted.
const SKIPPED_FSTYPES: &[&str] = &["swap", "crypto_LUKS", "LVM2_member", "linux_raid_member"];

fn collect_filesystems(device: &LsblkDevice, out: &mut Vec<(String, String)>) {
    if let Some(fstype) = &device.fstype {
        if !SKIPPED_FSTYPES.contains(&fstype.as_str()) {
            out.push((device.path.clone(), fstype.clone()));
        }
    }
    for child in &device.children {
        collect_filesystems(child, out);
    }
}

/// Parse `lsblk --json --output PATH,FSTYPE` into `(device, fstype)` pairs.
fn parse_lsblk(json: &str) -> Result<Vec<(String, String)>> {
    let output: LsblkOutput = serde_json::from_str(json).context("Failed to parse lsblk output")?;
    let mut filesystems = Vec::new();
    for device in &output.blockdevices {
        collect_filesystems(device, &mut filesystems);
    }
    Ok(filesystems)
}

fn journal_option(fstype: &str) -> Option<&'static str> {
    match fstype {
        "ext3" | "ext4" => Some("noload"),
        "xfs" => Some("norecovery"),
        _ => None,
    }
}

struct FsHandle {
    fd: OwnedFd,
}

impl FsHandle {
    fn open(fstype: &str) -> std::io::Result<Self> {
        Ok(Self {
            fd: fsopen(fstype, FsOpenFlags::FSOPEN_CLOEXEC)?,
        })
    }
}

impl AsFd for FsHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

fn mount_readonly(device: &str, fstype: &str, target: &Path) -> Result<()> {
    let fs = FsHandle::open(fstype)
        .with_context(|| format!("Filesystem type {} is not supported", fstype))?;
    fsconfig_set_flag(fs.as_fd(), "ro")?;
    fsconfig_set_string(fs.as_fd(), "source", device)?;
    if let Some(option) = journal_option(fstype) {
        fsconfig_set_flag(fs.as_fd(), option)?;
    }
    fsconfig_create(fs.as_fd()).with_context(|| format!("Failed to create {} superblock", fstype))?;

    let mnt = fsmount(
        fs.as_fd(),
        FsMountFlags::FSMOUNT_CLOEXEC,
        MountAttrFlags::MOUNT_ATTR_RDONLY,
    )?;
    move_mount(
        mnt.as_fd(),
        "",
        rustix::fs::CWD,
        target,
        MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH,
    )
    .with_context(|| format!("Failed to attach mount at {}", target.display()))?;
    Ok(())
}

/// Loop/NBD based mounter used in production.
pub struct SystemMounter {
    mount_base: PathBuf,
    attach_attempts: u32,
    retry_delay: Duration,
}

impl SystemMounter {
    pub fn new(config: &Config) -> Self {
        Self {
            mount_base: config.mount_base.clone(),
            attach_attempts: config.attach_attempts.max(1),
            retry_delay: config.attach_retry_delay(),
        }
    }

    fn run_command(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!("Running {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("Failed to execute {} command: {:?}", program, args))?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("{} command failed: {}", program, error.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Retries `op` while no device slot is available.
    fn with_retries<T>(&self, what: &str, op: impl Fn() -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attach_attempts => {
                    warn!(
                        "{} failed (attempt {}/{}): {:#}",
                        what, attempt, self.attach_attempts, e
                    );
                    thread::sleep(self.retry_delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn attach_loop(&self, image: &Path) -> Result<PathBuf> {
        let image = image
            .to_str()
            .ok_or_else(|| anyhow!("Image path is not valid UTF-8: {}", image.display()))?;
        let device = self.with_retries("losetup", || {
            self.run_command(
                "losetup",
                &["--find", "--show", "--read-only", "--partscan", image],
            )
        })?;
        Ok(PathBuf::from(device.trim()))
    }

    fn find_free_nbd(&self) -> Result<PathBuf> {
        for entry in fs::read_dir("/sys/block").context("Failed to list /sys/block")? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("nbd") {
                continue;
            }
            // A connected NBD device exposes a pid file.
            if !entry.path().join("pid").exists() {
                return Ok(PathBuf::from("/dev").join(name));
            }
        }
        bail!("no free NBD device (is the nbd module loaded?)")
    }

    fn attach_nbd(&self, image: &Path) -> Result<PathBuf> {
        let image = image
            .to_str()
            .ok_or_else(|| anyhow!("Image path is not valid UTF-8: {}", image.display()))?;
        let device = self.with_retries("qemu-nbd", || {
            let device = self.find_free_nbd()?;
            let connect = format!("--connect={}", device.display());
            self.run_command("qemu-nbd", &["--read-only", &connect, image])?;
            Ok(device)
        })?;

        // qemu-nbd returns before the kernel has read the partition table.
        let size_file = Path::new("/sys/block")
            .join(device.file_name().unwrap_or_default())
            .join("size");
        for _ in 0..50 {
            let size = fs::read_to_string(&size_file).unwrap_or_default();
            if size.trim().parse::<u64>().unwrap_or(0) > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }
        Ok(device)
    }

    fn release_device(&self, device: &Path, kind: DeviceKind) -> Result<()> {
        let device = device.to_string_lossy();
        match kind {
            DeviceKind::Loop => self.run_command("losetup", &["--detach", &device])?,
            DeviceKind::Nbd => self.run_command("qemu-nbd", &["--disconnect", &device])?,
        };
        Ok(())
    }

    fn mount_filesystems(&self, device: &Path, attachment: &mut Attachment) -> Result<()> {
        let json = self.run_command(
            "lsblk",
            &["--json", "--output", "PATH,FSTYPE", &device.to_string_lossy()],
        )?;
        let filesystems = parse_lsblk(&json)?;
        if filesystems.is_empty() {
            bail!("no mountable filesystem found on {}", device.display());
        }

        for (source, fstype) in filesystems {
            // Short names keep overlay lowerdir option strings under the kernel limit.
            let mountpoint = tempfile::Builder::new()
                .prefix("cf")
                .rand_bytes(6)
                .tempdir_in(&self.mount_base)
                .context("Failed to create mount point")?
                .keep();

            match mount_readonly(&source, &fstype, &mountpoint) {
                Ok(()) => {
                    debug!("Mounted {} ({}) at {}", source, fstype, mountpoint.display());
                    attachment.mountpoints.push(mountpoint);
                }
                Err(e) => {
                    warn!("Skipping {} ({}): {:#}", source, fstype, e);
                    fs::remove_dir(&mountpoint).ok();
                }
            }
        }

        if attachment.mountpoints.is_empty() {
            bail!("none of the filesystems on {} could be mounted", device.display());
        }
        Ok(())
    }
}

impl Mounter for SystemMounter {
    fn attach(&self, image: &DiskImage) -> Result<Attachment> {
        let (device, kind) = if image.format().is_qcow() {
            (self.attach_nbd(image.path())?, DeviceKind::Nbd)
        } else {
            (self.attach_loop(image.path())?, DeviceKind::Loop)
        };

        let mut attachment = Attachment {
            device: device.clone(),
            kind,
            mountpoints: Vec::new(),
        };

        if let Err(e) = self.mount_filesystems(&device, &mut attachment) {
            // Roll back whatever was mounted before the failure.
            if let Err(release) = self.detach(&attachment) {
                error!("Rollback of {} failed: {:#}", device.display(), release);
            }
            return Err(e);
        }

        Ok(attachment)
    }

    fn detach(&self, attachment: &Attachment) -> Result<()> {
        let mut first_error = None;

        for mountpoint in attachment.mountpoints.iter().rev() {
            if let Err(e) = unmount(mountpoint.as_path(), UnmountFlags::empty()) {
                warn!(
                    "Unmount of {} failed ({}), detaching lazily",
                    mountpoint.display(),
                    e
                );
                if let Err(e) = unmount(mountpoint.as_path(), UnmountFlags::DETACH) {
                    first_error.get_or_insert(anyhow!(
                        "failed to unmount {}: {}",
                        mountpoint.display(),
                        e
                    ));
                    continue;
                }
            }
            fs::remove_dir(mountpoint).ok();
        }

        if let Err(e) = self.release_device(&attachment.device, attachment.kind) {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Released {}", attachment.device.display());
                Ok(())
            }
        }
    }
}
