// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Runtime configuration: the validated, immutable settings a `Vmm` is
//! built from. A payload path, vCPU/memory sizing, and management/snapshot
//! options are assembled through a builder and validated once in `build()`.

mod builder;

pub use builder::VMMConfigBuilder;

use std::convert::TryFrom;
use std::path::PathBuf;

/// Default snapshot path, used when neither `--snapshot-path` nor a
/// management-plane snapshot request names one explicitly.
pub const DEFAULT_SNAPSHOT_PATH: &str = "monitor.snapshot";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("payload path error: {0}")]
    PayloadConfig(String),
    #[error("vCPU count must be nonzero")]
    ZeroVcpus,
}

pub type Result<T> = std::result::Result<T, Error>;

/// A validated path to the ELF payload the first vCPU boots into. Kept as
/// its own type so its `TryFrom<String>` validation (existence) stays next
/// to the type it validates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PayloadConfig {
    pub payload_path: PathBuf,
}

impl TryFrom<String> for PayloadConfig {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        let payload_path = PathBuf::from(value);
        if !payload_path.exists() {
            return Err(Error::PayloadConfig(format!(
                "payload file {} does not exist",
                payload_path.display()
            )));
        }
        Ok(PayloadConfig { payload_path })
    }
}

/// Fully validated monitor configuration. Built only through
/// [`VMMConfigBuilder`]; there is no public constructor that skips
/// validation.
#[derive(Debug, Clone)]
pub struct VMMConfig {
    /// `None` only when `restore` is set: a restored snapshot supplies its
    /// own payload descriptors, so no fresh ELF load is needed.
    pub payload: Option<PayloadConfig>,
    pub cpus: u8,
    pub memory: u32,
    pub verbose: u8,
    pub mgmt_socket: Option<PathBuf>,
    pub mgmt_dir: Option<PathBuf>,
    pub snapshot_path: PathBuf,
    pub restore: Option<PathBuf>,
    pub net: Option<String>,
}

impl VMMConfig {
    /// Starts a fluent builder for the vCPU count and memory size, the two
    /// parameters that are always required.
    pub fn builder(num_vcpus: u8, mem_size_mb: u32) -> VMMConfigBuilder {
        VMMConfigBuilder::new(num_vcpus, mem_size_mb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_try_from_payloadconfig() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let cfg = PayloadConfig::try_from(path.clone()).unwrap();
        assert_eq!(cfg.payload_path, PathBuf::from(path));
    }

    #[test]
    fn test_fail_try_from_payloadconfig_missing_file() {
        let err = PayloadConfig::try_from("/no/such/payload/binary".to_string()).unwrap_err();
        assert!(matches!(err, Error::PayloadConfig(_)));
    }

    #[test]
    fn test_builder_rejects_zero_vcpus() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let err = VMMConfig::builder(0, 512)
            .payload(Some(path))
            .build()
            .unwrap_err();
        assert_eq!(err, Error::ZeroVcpus);
    }

    #[test]
    fn test_builder_requires_payload_or_restore() {
        let err = VMMConfig::builder(1, 512).build().unwrap_err();
        assert!(matches!(err, Error::PayloadConfig(_)));
    }

    #[test]
    fn test_builder_restore_bypasses_payload_requirement() {
        let cfg = VMMConfig::builder(1, 512)
            .restore(Some("/tmp/some.snapshot".to_string()))
            .build()
            .unwrap();
        assert!(cfg.payload.is_none());
        assert_eq!(cfg.restore, Some(PathBuf::from("/tmp/some.snapshot")));
    }

    #[test]
    fn test_builder_default_snapshot_path() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let cfg = VMMConfig::builder(2, 1024).payload(Some(path)).build().unwrap();
        assert_eq!(cfg.snapshot_path, PathBuf::from(DEFAULT_SNAPSHOT_PATH));
        assert_eq!(cfg.cpus, 2);
        assert_eq!(cfg.memory, 1024);
    }
}
