//! Free-space lookup for the installation root

use std::path::Path;
use sysinfo::Disks;

/// Reports free bytes on the volume holding a path
pub trait DiskSpace: Send + Sync {
    /// `None` when the volume cannot be determined
    fn available_bytes(&self, path: &Path) -> Option<u64>;
}

/// Uses the mounted-disk table from sysinfo
#[derive(Debug, Default, Clone)]
pub struct SysinfoDiskSpace;

impl DiskSpace for SysinfoDiskSpace {
    fn available_bytes(&self, path: &Path) -> Option<u64> {
        let target = existing_ancestor(path)?;
        let disks = Disks::new_with_refreshed_list();

        // Longest mount point containing the path wins
        disks
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

/// The install directory may not exist yet; measure its closest parent
fn existing_ancestor(path: &Path) -> Option<std::path::PathBuf> {
    path.ancestors()
        .find(|p| p.exists())
        .and_then(|p| p.canonicalize().ok())
}
