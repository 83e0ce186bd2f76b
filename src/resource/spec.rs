//! Creation specs for claims, pods and volumes

use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::{ResourceDetails, ResourceHandle};

/// Storage backend a claim is provisioned from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageInterface {
    /// Block storage (RBD)
    CephBlockPool,
    /// Shared filesystem (CephFS)
    CephFileSystem,
}

impl StorageInterface {
    /// Access/volume mode combinations the interface supports
    pub fn supported_modes(&self) -> &'static [(AccessMode, VolumeMode)] {
        match self {
            StorageInterface::CephBlockPool => &[
                (AccessMode::ReadWriteOnce, VolumeMode::Filesystem),
                (AccessMode::ReadWriteOnce, VolumeMode::Block),
                (AccessMode::ReadWriteMany, VolumeMode::Block),
            ],
            StorageInterface::CephFileSystem => &[
                (AccessMode::ReadWriteOnce, VolumeMode::Filesystem),
                (AccessMode::ReadWriteMany, VolumeMode::Filesystem),
            ],
        }
    }

    /// Short name used in resource names and task labels
    pub fn short_name(&self) -> &'static str {
        match self {
            StorageInterface::CephBlockPool => "rbd",
            StorageInterface::CephFileSystem => "cephfs",
        }
    }
}

impl fmt::Display for StorageInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageInterface::CephBlockPool => write!(f, "CephBlockPool"),
            StorageInterface::CephFileSystem => write!(f, "CephFileSystem"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    ReadWriteOnce,
    ReadWriteMany,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::ReadWriteOnce => "ReadWriteOnce",
            AccessMode::ReadWriteMany => "ReadWriteMany",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeMode {
    Filesystem,
    Block,
}

impl VolumeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeMode::Filesystem => "Filesystem",
            VolumeMode::Block => "Block",
        }
    }
}

/// Spec for a persistent volume claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSpec {
    pub name_prefix: String,
    pub interface: StorageInterface,
    pub access_mode: AccessMode,
    pub volume_mode: VolumeMode,
    /// Requested size as a Kubernetes quantity (e.g. "5Gi")
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

impl ClaimSpec {
    /// Build `count` claim specs whose access modes are spread randomly over
    /// the modes the interface supports.
    ///
    /// The supported modes are shuffled and then cycled, so every mode is used
    /// once before any mode repeats.
    pub fn distribute<R: Rng + ?Sized>(
        interface: StorageInterface,
        count: usize,
        size: &str,
        storage_class: Option<&str>,
        rng: &mut R,
    ) -> Vec<ClaimSpec> {
        let mut modes = interface.supported_modes().to_vec();
        modes.shuffle(rng);

        modes
            .iter()
            .cycle()
            .take(count)
            .map(|(access_mode, volume_mode)| ClaimSpec {
                name_prefix: format!("pvc-{}", interface.short_name()),
                interface,
                access_mode: *access_mode,
                volume_mode: *volume_mode,
                size: size.to_string(),
                storage_class: storage_class.map(String::from),
            })
            .collect()
    }

    pub fn details(&self) -> ResourceDetails {
        ResourceDetails::Claim {
            interface: self.interface,
            access_mode: self.access_mode,
            volume_mode: self.volume_mode,
        }
    }
}

/// Spec for a pod consuming one claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    pub name_prefix: String,
    pub claim: String,
    /// Expose the claim as a raw block device instead of a mount
    pub raw_block: bool,
}

impl PodSpec {
    /// Pods to run on a claim: one per claim, a second one for shared (RWX)
    /// claims. Block-mode claims get raw-block pods. Non-claim handles get none.
    pub fn for_claim(claim: &ResourceHandle) -> Vec<PodSpec> {
        let ResourceDetails::Claim {
            access_mode,
            volume_mode,
            ..
        } = claim.details()
        else {
            return Vec::new();
        };

        let count = match access_mode {
            AccessMode::ReadWriteMany => 2,
            AccessMode::ReadWriteOnce => 1,
        };
        let spec = PodSpec {
            name_prefix: "pod".to_string(),
            claim: claim.id().to_string(),
            raw_block: *volume_mode == VolumeMode::Block,
        };
        vec![spec; count]
    }

    pub fn details(&self) -> ResourceDetails {
        ResourceDetails::Pod {
            claim: self.claim.clone(),
            raw_block: self.raw_block,
        }
    }
}

/// Spec for a cloud block volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    pub name: String,
    pub size_gib: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl VolumeSpec {
    pub fn details(&self) -> ResourceDetails {
        ResourceDetails::Volume {
            size_gib: self.size_gib,
        }
    }
}
