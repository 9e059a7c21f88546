//! Container identity and metadata types.
//!
//! This module defines the strong identifier type for containers and the
//! descriptor record that the metadata resolvers populate. A descriptor is
//! created as a *stub* (identity only, image fields carrying the
//! `"incomplete"` sentinel) the first time a process event references a
//! container, and is completed later by the asynchronous runtime lookup and
//! the delayed cgroup-limit reader.
//!
//! The primary types in this module are:
//!
//! - [`ContainerId`]: a validated 12- to 64-character lowercase hex
//!   identifier as produced by the container runtime.
//! - [`ContainerInfo`]: the full container descriptor (identity, image,
//!   labels, env, ports, mounts, health probes, resource limits).
//! - [`ThreadInfo`]: the per-thread record handed in by the event pipeline,
//!   carrying the already-extracted container id and cgroup paths.
//!
//! Identifiers are opaque and should not be manipulated as structured
//! strings; use the constructors to guarantee validity and `as_str()` for
//! display or logging.
//!
//! # Examples
//!
//! ```
//! use container_meta::container::{ContainerId, ContainerInfo};
//!
//! let id: ContainerId = "4f1f20f9c661aa7bd4b8b5e3f5c3a77f".parse().unwrap();
//! let stub = ContainerInfo::stub(id.clone(), Some("web-1".to_owned()));
//! assert_eq!(stub.image, "incomplete");
//! assert!(!stub.metadata_complete);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

mod error;
pub mod manager;

pub use error::{Error, Result};

/// Sentinel placed in the image fields of a stub descriptor until the
/// asynchronous lookup completes.
pub const INCOMPLETE_IMAGE: &str = "incomplete";

const MIN_ID_LEN: usize = 12;
const MAX_ID_LEN: usize = 64;

/// A validated container identifier: 12 to 64 lowercase hex characters.
///
/// Runtimes report container ids as (possibly truncated) hex digests.
/// `ContainerId` enforces the character set and length at construction time
/// via [`ContainerId::new`], so consumers can assume every instance is
/// well-formed.
///
/// # Examples
///
/// ```
/// # use container_meta::container::{ContainerId, Error};
/// let id = ContainerId::new("0123456789abcdef".to_owned()).unwrap();
/// assert_eq!(id.as_str(), "0123456789abcdef");
///
/// assert!(matches!(
///     ContainerId::new("UPPERCASE-IS-INVALID".to_owned()),
///     Err(Error::InvalidContainerId(_))
/// ));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new `ContainerId` from the given string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidContainerId`] if the input is shorter than 12
    /// or longer than 64 characters, or contains anything other than
    /// lowercase hex digits (`0-9`, `a-f`).
    pub fn new(src: String) -> Result<Self> {
        if src.len() < MIN_ID_LEN
            || src.len() > MAX_ID_LEN
            || !src.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(Error::InvalidContainerId(src));
        }

        Ok(Self(src))
    }

    /// Returns the container id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ContainerId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ContainerId::new(s.to_owned())
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The runtime that owns a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerType {
    #[default]
    Docker,
    Containerd,
    Cri,
    Crio,
    Lxc,
    LibvirtLxc,
}

/// A published `/tcp` port binding. Addresses and ports are in host byte
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortMapping {
    pub host_ip: u32,
    pub host_port: u16,
    pub container_port: u16,
}

/// A bind mount or volume attached to the container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MountInfo {
    pub source: String,
    pub destination: String,
    pub mode: String,
    pub rw: bool,
    pub propagation: String,
}

/// The flavor of a health probe extracted from container metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Docker `Healthcheck` declared on the image or container config.
    Healthcheck,
    /// Kubernetes liveness probe from the pod spec.
    LivenessProbe,
    /// Kubernetes readiness probe from the pod spec.
    ReadinessProbe,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeKind::Healthcheck => "healthcheck",
            ProbeKind::LivenessProbe => "liveness-probe",
            ProbeKind::ReadinessProbe => "readiness-probe",
        };
        f.write_str(name)
    }
}

/// A command executed periodically against a running container to assess
/// its health. The core extracts probes; it does not run them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthProbe {
    pub kind: ProbeKind,
    pub exe: String,
    pub args: Vec<String>,
}

/// The container descriptor.
///
/// Created as a stub by [`ContainerInfo::stub`] on first sighting and
/// overwritten by the asynchronous metadata lookup; the cgroup-limit reader
/// may update the resource fields once more afterwards. `metadata_complete`
/// is only set by a successful lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    pub container_type: ContainerType,
    pub id: Option<ContainerId>,
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub image_repo: String,
    pub image_tag: String,
    pub image_digest: String,
    pub labels: HashMap<String, String>,
    /// Environment entries in the order the runtime reported them.
    pub env: Vec<String>,
    pub port_mappings: Vec<PortMapping>,
    pub mounts: Vec<MountInfo>,
    pub health_probes: Vec<HealthProbe>,
    /// IPv4 address in host byte order; 0 when unknown.
    pub container_ip: u32,
    pub privileged: Option<bool>,
    pub memory_limit: i64,
    pub swap_limit: i64,
    pub cpu_shares: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub cpuset_cpu_count: u32,
    pub is_pod_sandbox: bool,
    pub metadata_complete: bool,
}

impl Default for ContainerInfo {
    fn default() -> Self {
        Self {
            container_type: ContainerType::Docker,
            id: None,
            name: String::new(),
            image: String::new(),
            image_id: String::new(),
            image_repo: String::new(),
            image_tag: String::new(),
            image_digest: String::new(),
            labels: HashMap::new(),
            env: Vec::new(),
            port_mappings: Vec::new(),
            mounts: Vec::new(),
            health_probes: Vec::new(),
            container_ip: 0,
            privileged: None,
            memory_limit: 0,
            swap_limit: 0,
            // kernel defaults when no limit is configured
            cpu_shares: 1024,
            cpu_quota: 0,
            cpu_period: 100_000,
            cpuset_cpu_count: 0,
            is_pod_sandbox: false,
            metadata_complete: false,
        }
    }
}

impl ContainerInfo {
    /// Builds the minimal descriptor inserted when a container is first
    /// sighted: identity plus the `"incomplete"` sentinel in every image
    /// field, with `metadata_complete` unset.
    pub fn stub(id: ContainerId, name: Option<String>) -> Self {
        Self {
            container_type: ContainerType::Docker,
            id: Some(id),
            name: name.unwrap_or_default(),
            image: INCOMPLETE_IMAGE.to_owned(),
            image_id: INCOMPLETE_IMAGE.to_owned(),
            image_repo: INCOMPLETE_IMAGE.to_owned(),
            image_tag: INCOMPLETE_IMAGE.to_owned(),
            image_digest: INCOMPLETE_IMAGE.to_owned(),
            metadata_complete: false,
            ..Self::default()
        }
    }
}

/// Per-thread context handed in by the event pipeline.
///
/// Whether a thread belongs to a container (and which one) is decided
/// upstream by the cgroup-path parser; this record only transports the
/// result, together with the thread's per-subsystem cgroup paths needed by
/// the delayed resource-limit reader.
#[derive(Debug, Clone, Default)]
pub struct ThreadInfo {
    pub pid: u32,
    pub tid: u32,
    pub container_id: Option<ContainerId>,
    pub container_name: Option<String>,
    /// Cgroup path of the `memory` subsystem, as listed in `/proc/pid/cgroup`.
    pub mem_cgroup: Option<String>,
    /// Cgroup path of the `cpu` subsystem.
    pub cpu_cgroup: Option<String>,
    /// Cgroup path of the `cpuset` subsystem.
    pub cpuset_cgroup: Option<String>,
}
