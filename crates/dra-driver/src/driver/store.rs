//! CDI specs and allocation sidecars on disk.
//!
//! Every prepared claim owns two files in the CDI directory, named after the
//! driver and the first eight characters of the claim UID:
//! `<prefix>.json` for the container runtime and `<prefix>.alloc.json` with
//! the [`AllocationInfo`] needed to release the claim after a restart.

use std::fs;
use std::io;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;

use api_types::cdi;
use api_types::cdi::ContainerEdits;
use api_types::AllocationInfo;
use api_types::DeviceType;
use tempfile::NamedTempFile;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::DriverError;
use crate::error::Result;
use crate::handler::short_uid;

/// Default directory watched by CDI-aware runtimes.
pub const DEFAULT_CDI_DIR: &str = "/etc/cdi";

const SPEC_SUFFIX: &str = ".json";
const ALLOCATION_SUFFIX: &str = ".alloc.json";

#[derive(Debug, Clone)]
pub struct CdiStore {
    dir: PathBuf,
    driver_name: String,
}

impl CdiStore {
    pub fn new(dir: impl Into<PathBuf>, driver_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            driver_name: driver_name.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn driver_prefix(&self) -> String {
        self.driver_name.replace('/', "-")
    }

    /// `<driver with '/' replaced by '-'>-<claim uid[..8]>`
    pub fn file_prefix(&self, claim_uid: &str) -> String {
        format!("{}-{}", self.driver_prefix(), short_uid(claim_uid))
    }

    pub fn spec_path(&self, claim_uid: &str) -> PathBuf {
        self.dir
            .join(format!("{}{SPEC_SUFFIX}", self.file_prefix(claim_uid)))
    }

    pub fn allocation_path(&self, claim_uid: &str) -> PathBuf {
        self.dir
            .join(format!("{}{ALLOCATION_SUFFIX}", self.file_prefix(claim_uid)))
    }

    /// Fully qualified CDI device name, `<driver>/<type>=<device>`.
    pub fn device_id(&self, device_type: DeviceType, device_name: &str) -> String {
        format!("{}/{device_type}={device_name}", self.driver_name)
    }

    /// Writes the claim's CDI spec and returns the CDI device id.
    pub fn write_spec(
        &self,
        claim_uid: &str,
        device_type: DeviceType,
        device_name: &str,
        edits: &ContainerEdits,
    ) -> Result<String> {
        let spec = cdi::Spec {
            cdi_version: cdi::CDI_VERSION.to_string(),
            kind: format!("{}/{device_type}", self.driver_name),
            devices: vec![cdi::Device {
                name: device_name.to_string(),
                container_edits: edits.clone(),
            }],
        };
        let data = serde_json::to_vec_pretty(&spec)
            .map_err(|e| DriverError::persistence(format!("marshal CDI spec: {e}")))?;

        let path = self.spec_path(claim_uid);
        self.write_atomic(&path, &data)
            .map_err(|e| DriverError::persistence(format!("write CDI spec {}: {e}", path.display())))?;

        let id = self.device_id(device_type, device_name);
        info!(path = %path.display(), cdi_device_id = %id, "created CDI spec");
        Ok(id)
    }

    pub fn write_allocation(&self, allocation: &AllocationInfo) -> Result<()> {
        let data = serde_json::to_vec_pretty(allocation)
            .map_err(|e| DriverError::persistence(format!("marshal allocation: {e}")))?;
        let path = self.allocation_path(&allocation.claim_uid);
        self.write_atomic(&path, &data).map_err(|e| {
            DriverError::persistence(format!("write allocation state {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "saved allocation state");
        Ok(())
    }

    pub fn remove_spec(&self, claim_uid: &str) {
        remove_if_present(&self.spec_path(claim_uid), "CDI spec");
    }

    /// Removes both files of the claim; missing files are fine.
    pub fn remove(&self, claim_uid: &str) {
        self.remove_spec(claim_uid);
        remove_if_present(&self.allocation_path(claim_uid), "allocation state");
    }

    /// Every readable sidecar of this driver. Broken files are skipped.
    pub fn load_allocations(&self) -> Vec<AllocationInfo> {
        let pattern = self
            .dir
            .join(format!("{}-*{ALLOCATION_SUFFIX}", glob::Pattern::escape(&self.driver_prefix())));
        let paths = match glob::glob(&pattern.to_string_lossy()) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(error = %e, "invalid allocation state pattern");
                return Vec::new();
            }
        };

        let mut allocations = Vec::new();
        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!(error = %e, "failed to list allocation state");
                    continue;
                }
            };
            let data = match fs::read(&path) {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read allocation state");
                    continue;
                }
            };
            let allocation: AllocationInfo = match serde_json::from_slice(&data) {
                Ok(allocation) => allocation,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse allocation state");
                    continue;
                }
            };
            if allocation.claim_uid.is_empty() {
                warn!(path = %path.display(), "skipping allocation state with empty claim UID");
                continue;
            }
            debug!(
                claim_uid = %allocation.claim_uid,
                device_type = %allocation.device_type,
                kind = %allocation.kind,
                device = %allocation.device_name,
                "restored allocation"
            );
            allocations.push(allocation);
        }
        allocations
    }

    /// Writes through a temp file in the same directory so readers never see
    /// a partial document.
    fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut file = NamedTempFile::new_in(&self.dir)?;
        file.write_all(data)?;
        file.as_file().sync_all()?;
        file.as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))?;
        file.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

fn remove_if_present(path: &Path, what: &str) {
    match fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "deleted {what}"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to delete {what}"),
    }
}
