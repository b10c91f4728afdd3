use std::any::Any;
use streamer_base::FileIoAliases;

/// Information about a single storage device the streamer can read from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriveInformation {
    // Mount points / roots served by the drive
    pub paths: Vec<String>,
    pub profile: String,
    pub io_channel_count: u32,
    pub physical_sector_size: u32,
    pub logical_sector_size: u32,
    pub has_seek_penalty: bool,
}

impl Default for DriveInformation {
    fn default() -> Self {
        DriveInformation {
            paths: Vec::default(),
            profile: "Default".to_string(),
            io_channel_count: 1,
            physical_sector_size: 512,
            logical_sector_size: 512,
            has_seek_penalty: true,
        }
    }
}

pub type DriveList = Vec<DriveInformation>;

/// What the stack configurations get to look at when building the stream stack
pub struct HardwareInformation {
    // Platform specific payload, a DriveList on the platforms that collect drive information
    pub platform_data: Option<Box<dyn Any + Send + Sync>>,
    pub profile: String,
    pub max_physical_sector_size: usize,
    pub max_logical_sector_size: usize,
    pub max_page_size: usize,
    pub max_transfer: usize,
}

impl Default for HardwareInformation {
    fn default() -> Self {
        HardwareInformation {
            platform_data: None,
            profile: "Default".to_string(),
            max_physical_sector_size: 16,
            max_logical_sector_size: 16,
            max_page_size: 4096,
            max_transfer: 512 * 1024,
        }
    }
}

impl HardwareInformation {
    pub fn drive_list(&self) -> Option<&DriveList> {
        self.platform_data.as_ref()?.downcast_ref::<DriveList>()
    }

    /// Stores the drives and widens the maximums so they cover every drive
    pub fn set_drive_list(
        &mut self,
        drives: DriveList,
    ) {
        for drive in &drives {
            self.max_physical_sector_size = self
                .max_physical_sector_size
                .max(drive.physical_sector_size as usize);
            self.max_logical_sector_size = self
                .max_logical_sector_size
                .max(drive.logical_sector_size as usize);
        }
        self.platform_data = Some(Box::new(drives));
    }
}

impl std::fmt::Debug for HardwareInformation {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("HardwareInformation")
            .field("drives", &self.drive_list())
            .field("profile", &self.profile)
            .field("max_physical_sector_size", &self.max_physical_sector_size)
            .field("max_logical_sector_size", &self.max_logical_sector_size)
            .field("max_page_size", &self.max_page_size)
            .field("max_transfer", &self.max_transfer)
            .finish()
    }
}

/// Inspects the storage devices that hold the alias roots. With `include_all_hardware` every mounted
/// block device is reported. Returns None if the hardware can't be inspected on this platform, in
/// which case a generic stack should be used.
pub fn collect_io_hardware_information(
    aliases: &FileIoAliases,
    include_all_hardware: bool,
) -> Option<HardwareInformation> {
    profiling::scope!("collect_io_hardware_information");

    #[cfg(target_os = "linux")]
    {
        linux::collect(aliases, include_all_hardware)
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (aliases, include_all_hardware);
        log::warn!("Collecting storage hardware information isn't supported on this platform");
        None
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MountEntry {
    pub device: String,
    pub mount_point: String,
}

/// Parses the /proc/mounts format, keeping only mounts of real devices
pub(crate) fn parse_mounts(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            if !device.starts_with("/dev/") {
                return None;
            }

            Some(MountEntry {
                device: device.to_string(),
                mount_point: decode_mount_escapes(mount_point),
            })
        })
        .collect()
}

// Spaces, tabs, newlines and backslashes are written as octal escapes
fn decode_mount_escapes(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(value) = field
                .get(i + 1..i + 4)
                .and_then(|digits| u8::from_str_radix(digits, 8).ok())
            {
                decoded.push(value);
                i += 4;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

/// Index of the mount point that contains `path`, picking the most specific one
pub(crate) fn find_mount_for_path(
    mounts: &[MountEntry],
    path: &str,
) -> Option<usize> {
    mounts
        .iter()
        .enumerate()
        .filter(|(_, mount)| std::path::Path::new(path).starts_with(&mount.mount_point))
        .max_by_key(|(_, mount)| mount.mount_point.len())
        .map(|(index, _)| index)
}

/// Drives that serve the least specific mount points go first so that drives with more specific
/// mount points end up higher in the stack and get to claim their files first.
pub(crate) fn sort_drives_least_specific_first(drives: &mut DriveList) {
    drives.sort_by_key(|drive| {
        drive
            .paths
            .iter()
            .map(|path| path.len())
            .min()
            .unwrap_or(0)
    });
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::path::{Path, PathBuf};
    use streamer_base::hashing::HashMap;

    pub(super) fn collect(
        aliases: &FileIoAliases,
        include_all_hardware: bool,
    ) -> Option<HardwareInformation> {
        let mounts = match std::fs::read_to_string("/proc/mounts") {
            Ok(contents) => parse_mounts(&contents),
            Err(e) => {
                log::warn!("Unable to read the mounted file systems: {}", e);
                return None;
            }
        };

        let mut used_mounts = vec![include_all_hardware; mounts.len()];
        for root in aliases.roots() {
            match find_mount_for_path(&mounts, root) {
                Some(index) => used_mounts[index] = true,
                None => log::warn!("No storage drive found for '{}'", root),
            }
        }

        // Group mount points by the disk they're on
        let mut disks: HashMap<String, DriveInformation> = HashMap::default();
        let mut disk_order = Vec::default();
        for (mount, _) in mounts.iter().zip(&used_mounts).filter(|(_, used)| **used) {
            let disk = match disk_name_for_device(&mount.device) {
                Some(disk) => disk,
                None => {
                    log::debug!("Skipping {}, it isn't a block device", mount.device);
                    continue;
                }
            };

            if !disks.contains_key(&disk) {
                disks.insert(disk.clone(), read_drive_information(&disk));
                disk_order.push(disk.clone());
            }

            if let Some(drive) = disks.get_mut(&disk) {
                if !drive.paths.contains(&mount.mount_point) {
                    drive.paths.push(mount.mount_point.clone());
                }
            }
        }

        let mut drives: DriveList = disk_order
            .into_iter()
            .filter_map(|disk| disks.remove(&disk))
            .collect();
        sort_drives_least_specific_first(&mut drives);

        let mut hardware = HardwareInformation::default();
        hardware.max_page_size = page_size();
        for disk in &drives {
            log::info!(
                "Found drive for {:?}: {} channels, {}/{} byte sectors, seek penalty: {}",
                disk.paths,
                disk.io_channel_count,
                disk.physical_sector_size,
                disk.logical_sector_size,
                disk.has_seek_penalty
            );
        }
        hardware.set_drive_list(drives);
        Some(hardware)
    }

    // Partitions like sda1 or nvme0n1p2 have their statistics on the parent disk
    fn disk_name_for_device(device: &str) -> Option<String> {
        let device_path = std::fs::canonicalize(device).ok()?;
        let name = device_path.file_name()?.to_str()?.to_string();
        let class_path = PathBuf::from("/sys/class/block").join(&name);
        if !class_path.exists() {
            return None;
        }

        if class_path.join("partition").exists() {
            let sys_path = std::fs::canonicalize(&class_path).ok()?;
            let parent = sys_path.parent()?.file_name()?.to_str()?;
            Some(parent.to_string())
        } else {
            Some(name)
        }
    }

    fn read_queue_value(
        disk: &str,
        name: &str,
    ) -> Option<u64> {
        let path = Path::new("/sys/block").join(disk).join("queue").join(name);
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    fn read_drive_information(disk: &str) -> DriveInformation {
        let defaults = DriveInformation::default();
        DriveInformation {
            paths: Vec::default(),
            profile: defaults.profile,
            io_channel_count: read_queue_value(disk, "nr_requests")
                .map(|value| value.clamp(1, u32::MAX as u64) as u32)
                .unwrap_or(defaults.io_channel_count),
            physical_sector_size: read_queue_value(disk, "physical_block_size")
                .map(|value| value as u32)
                .unwrap_or(defaults.physical_sector_size),
            logical_sector_size: read_queue_value(disk, "logical_block_size")
                .map(|value| value as u32)
                .unwrap_or(defaults.logical_sector_size),
            has_seek_penalty: read_queue_value(disk, "rotational")
                .map(|value| value != 0)
                .unwrap_or(defaults.has_seek_penalty),
        }
    }

    fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }
}
