//! Device existence predicate.
//!
//! The checker is the cheapest source of truth the reconciler has: a stat
//! call, no open. It is deliberately uncached so it can be called at any
//! rate and always reflects the filesystem.

use async_trait::async_trait;
use std::path::Path;

/// Capability: answer "does this device path currently exist".
#[async_trait]
pub trait DeviceChecker: Send + Sync {
    /// True iff the path resolves to an entry the process may stat.
    ///
    /// Must not open the device; probing is the prober's job.
    async fn exists(&self, path: &str) -> bool;

    /// True iff the path exists and is a character device node.
    async fn is_char_device(&self, path: &str) -> bool;
}

/// Stat-based checker used in production.
#[derive(Debug, Default, Clone)]
pub struct StatDeviceChecker;

#[async_trait]
impl DeviceChecker for StatDeviceChecker {
    async fn exists(&self, path: &str) -> bool {
        // A stat syscall can briefly block; tolerable for /dev nodes.
        Path::new(path).exists()
    }

    async fn is_char_device(&self, path: &str) -> bool {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            std::fs::metadata(path)
                .map(|m| m.file_type().is_char_device())
                .unwrap_or(false)
        }
        #[cfg(not(unix))]
        {
            Path::new(path).exists()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_path_does_not_exist() {
        let checker = StatDeviceChecker;
        assert!(!checker.exists("/dev/video-nonexistent-42").await);
        assert!(!checker.is_char_device("/dev/video-nonexistent-42").await);
    }

    #[tokio::test]
    async fn regular_file_exists_but_is_not_char_device() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let path = file.path().to_string_lossy().to_string();
        let checker = StatDeviceChecker;
        assert!(checker.exists(&path).await);
        assert!(!checker.is_char_device(&path).await);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn dev_null_is_a_char_device() {
        let checker = StatDeviceChecker;
        assert!(checker.is_char_device("/dev/null").await);
    }
}
