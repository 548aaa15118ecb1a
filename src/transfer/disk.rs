//! Free-space check before a receive pre-allocates its output file.

use std::io;
use std::path::Path;

use tracing::warn;

use crate::error::TransferError;

/// Reports free bytes on the filesystem holding `path`.
pub trait SpaceProbe: Send + Sync {
    fn available(&self, path: &Path) -> io::Result<u64>;
}

/// `statvfs(2)`-backed probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn available(&self, path: &Path) -> io::Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
        #[allow(clippy::unnecessary_cast)]
        Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
    }
}

/// Bytes required for a file of `file_size`: the size plus 10% headroom.
pub fn required_space(file_size: u64) -> u64 {
    file_size.saturating_add(file_size / 10)
}

/// Fail with `InsufficientSpace` unless `dir` can hold `file_size` plus
/// headroom. A probe failure is logged and the check is skipped.
pub fn ensure_space(probe: &dyn SpaceProbe, dir: &Path, file_size: u64) -> Result<(), TransferError> {
    let needed = required_space(file_size);
    match probe.available(dir) {
        Ok(available) if available < needed => {
            Err(TransferError::InsufficientSpace { available, needed })
        }
        Ok(_) => Ok(()),
        Err(e) => {
            warn!(
                "disk space probe failed for {}: {e}, skipping disk space check",
                dir.display()
            );
            Ok(())
        }
    }
}
