//! Boot asset paths and their one-shot validation.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{RecoveryError, RecoveryResult};

/// The four artifacts a forced load needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    /// Board-support bitstream (`system_top.bit`).
    SystemTopBit,
    /// Boot-loader image (`BOOT.BIN`).
    BootBin,
    /// Kernel image (`uImage`).
    KernelImage,
    /// Device tree blob.
    Devicetree,
}

impl AssetKind {
    pub const ALL: [AssetKind; 4] = [
        AssetKind::SystemTopBit,
        AssetKind::BootBin,
        AssetKind::KernelImage,
        AssetKind::Devicetree,
    ];
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AssetKind::SystemTopBit => "system top bitstream",
            AssetKind::BootBin => "boot binary",
            AssetKind::KernelImage => "kernel image",
            AssetKind::Devicetree => "device tree",
        };
        f.write_str(name)
    }
}

/// Caller-supplied asset paths, not yet checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootAssetPaths {
    pub system_top_bit: PathBuf,
    pub boot_bin: PathBuf,
    pub kernel_image: PathBuf,
    pub devicetree: PathBuf,
}

impl BootAssetPaths {
    pub fn path(&self, kind: AssetKind) -> &Path {
        match kind {
            AssetKind::SystemTopBit => &self.system_top_bit,
            AssetKind::BootBin => &self.boot_bin,
            AssetKind::KernelImage => &self.kernel_image,
            AssetKind::Devicetree => &self.devicetree,
        }
    }
}

/// Size and content digest of one validated asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDigest {
    pub kind: AssetKind,
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

/// A set of boot assets that all existed and were readable when validated.
///
/// Only [`BootAssetSet::validate`] constructs one, so holding a value is proof
/// the check ran. The orchestrator validates once per run and never again
/// between tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootAssetSet {
    paths: BootAssetPaths,
    digests: Vec<AssetDigest>,
}

impl BootAssetSet {
    /// Check that every path is an openable regular file.
    ///
    /// Fails with [`RecoveryError::AssetMissing`] naming the first bad asset.
    pub fn validate(paths: &BootAssetPaths) -> RecoveryResult<Self> {
        let mut digests = Vec::with_capacity(AssetKind::ALL.len());
        for kind in AssetKind::ALL {
            let path = paths.path(kind);
            let digest = digest_file(path).map_err(|_| RecoveryError::AssetMissing {
                asset: kind,
                path: path.to_path_buf(),
            })?;
            debug!(asset = %kind, path = %path.display(), size = digest.0, "boot asset validated");
            digests.push(AssetDigest {
                kind,
                path: path.to_path_buf(),
                size: digest.0,
                sha256: digest.1,
            });
        }

        Ok(Self {
            paths: paths.clone(),
            digests,
        })
    }

    pub fn path(&self, kind: AssetKind) -> &Path {
        self.paths.path(kind)
    }

    pub fn paths(&self) -> &BootAssetPaths {
        &self.paths
    }

    pub fn digests(&self) -> &[AssetDigest] {
        &self.digests
    }

    /// Byte size recorded at validation time.
    pub fn size(&self, kind: AssetKind) -> u64 {
        self.digests
            .iter()
            .find(|d| d.kind == kind)
            .map(|d| d.size)
            .unwrap_or(0)
    }
}

fn digest_file(path: &Path) -> std::io::Result<(u64, String)> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is not a regular file", path.display()),
        ));
    }

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }

    Ok((size, hex::encode(hasher.finalize())))
}
