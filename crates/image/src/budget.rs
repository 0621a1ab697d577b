//! Host disk budget for decompressed images.

use std::path::Path;

use {sysinfo::Disks, tracing::debug};

/// Whether a `compressed`-byte archive expanded by `ratio` fits in `free`.
#[must_use]
pub fn fits(compressed: u64, ratio: f64, free: u64) -> bool {
    let needed = (compressed as f64 * ratio.max(1.0)).ceil();
    needed <= free as f64
}

/// Free bytes on the filesystem holding `path`, from the disk whose mount
/// point is the longest prefix of it. `None` when no disk matches.
#[must_use]
pub fn host_free_space(path: &Path) -> Option<u64> {
    let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    let free = disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().components().count())
        .map(|d| d.available_space());
    debug!(path = %path.display(), free = ?free, "host free space");
    free
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case(100, 4.0, 400, true)]
    #[case(100, 4.0, 399, false)]
    #[case(100, 0.5, 100, true)]
    #[case(0, 4.0, 0, true)]
    #[case(1 << 30, 4.0, 1 << 31, false)]
    fn budget(#[case] compressed: u64, #[case] ratio: f64, #[case] free: u64, #[case] ok: bool) {
        assert_eq!(fits(compressed, ratio, free), ok);
    }
}
