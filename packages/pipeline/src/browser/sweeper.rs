//! Orphan-profile sweeper.
//!
//! OS-level tab leaks and hard kills leave `argus_profile_*` directories
//! behind in the temp dir. A periodic task deletes any such directory
//! whose mtime is older than the TTL.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::TEMP_PROFILE_PREFIX;
use crate::kernel::service_host::Service;

const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);
const ORPHAN_TTL: Duration = Duration::from_secs(90 * 60);

/// Deletes orphaned profile directories under `base_dir`; returns how many
/// were removed. Only directories matching the profile prefix are touched.
pub fn sweep_orphan_profiles(base_dir: &Path, ttl: Duration) -> usize {
    let entries = match std::fs::read_dir(base_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %base_dir.display(), error = %e, "sweeper could not read base dir");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(TEMP_PROFILE_PREFIX) {
            continue;
        }
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }

        let stale = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| mtime.elapsed().ok())
            .map(|age| age >= ttl)
            .unwrap_or(false);
        if !stale {
            continue;
        }

        let path = entry.path();
        match std::fs::remove_dir_all(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "could not remove orphan profile"),
        }
    }

    if removed > 0 {
        info!(removed, dir = %base_dir.display(), "swept orphan browser profiles");
    }
    removed
}

/// Periodic sweeper over the system temp dir.
pub struct ProfileSweeper;

#[async_trait]
impl Service for ProfileSweeper {
    fn name(&self) -> &'static str {
        "profile-sweeper"
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                    let base = std::env::temp_dir();
                    tokio::task::spawn_blocking(move || sweep_orphan_profiles(&base, ORPHAN_TTL))
                        .await
                        .ok();
                }
            }
        }
    }
}
