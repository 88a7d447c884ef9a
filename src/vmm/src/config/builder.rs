use std::convert::TryFrom;
use std::path::PathBuf;

use super::{Error, PayloadConfig, Result, VMMConfig, DEFAULT_SNAPSHOT_PATH};

/// See `VMMConfig` for explanations of these options.
#[derive(Debug, Default)]
pub struct VMMConfigBuilder {
    payload: Option<String>,
    cpus: u8,
    memory: u32,
    verbose: u8,
    mgmt_socket: Option<String>,
    mgmt_dir: Option<String>,
    snapshot_path: Option<String>,
    restore: Option<String>,
    net: Option<String>,
}

impl VMMConfigBuilder {
    pub fn new(num_vcpus: u8, mem_size_mb: u32) -> Self {
        VMMConfigBuilder {
            cpus: num_vcpus,
            memory: mem_size_mb,
            ..Default::default()
        }
    }

    pub fn payload(mut self, payload: Option<String>) -> Self {
        self.payload = payload;
        self
    }

    pub fn verbose(mut self, lvl: u8) -> Self {
        self.verbose = lvl;
        self
    }

    pub fn mgmt_socket(mut self, mgmt_socket: Option<String>) -> Self {
        self.mgmt_socket = mgmt_socket;
        self
    }

    pub fn mgmt_dir(mut self, mgmt_dir: Option<String>) -> Self {
        self.mgmt_dir = mgmt_dir;
        self
    }

    pub fn snapshot_path(mut self, snapshot_path: Option<String>) -> Self {
        self.snapshot_path = snapshot_path;
        self
    }

    pub fn restore(mut self, restore: Option<String>) -> Self {
        self.restore = restore;
        self
    }

    pub fn net(mut self, net: Option<String>) -> Self {
        self.net = net;
        self
    }

    /// Validates and produces the final config. A restore path bypasses the
    /// requirement for a payload, since the snapshot supplies its own.
    pub fn build(self) -> Result<VMMConfig> {
        if self.cpus == 0 {
            return Err(Error::ZeroVcpus);
        }

        let restore = self.restore.map(PathBuf::from);

        let payload = if restore.is_some() {
            None
        } else {
            match self.payload {
                Some(p) => Some(PayloadConfig::try_from(p)?),
                None => {
                    return Err(Error::PayloadConfig(
                        "no payload path given and no --restore snapshot provided".to_string(),
                    ))
                }
            }
        };

        Ok(VMMConfig {
            payload,
            cpus: self.cpus,
            memory: self.memory,
            verbose: self.verbose,
            mgmt_socket: self.mgmt_socket.map(PathBuf::from),
            mgmt_dir: self.mgmt_dir.map(PathBuf::from),
            snapshot_path: self
                .snapshot_path
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_PATH)),
            restore,
            net: self.net,
        })
    }
}
