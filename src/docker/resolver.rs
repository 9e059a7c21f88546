//! Normalisation of the runtime's container manifest into a descriptor.
//!
//! The resolver runs on the lookup source's worker thread. Per container it
//! fetches `/containers/<id>/json`, optionally follows up with
//! `/images/<id>/json?digests=1` to pin down repository, tag and digest,
//! and for containers that join another container's network namespace
//! (`NetworkMode = container:<id>`) fetches the owning container as well —
//! synchronously, on the same thread, bypassing the lookup queue.
//!
//! Manifest decoding is deliberately tolerant: absent or null sections fall
//! back to defaults, and malformed optional sections (probes, image info)
//! are logged and skipped without failing the container as a whole. Only a
//! failed fetch or an unparseable top-level manifest yields an unsuccessful
//! result.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;

use serde::Deserialize;
use serde_json::Value;

use crate::async_source::ValueResolver;
use crate::cgroup::count_cpu_list;
use crate::container::{ContainerId, ContainerInfo, ContainerType, MountInfo, PortMapping};
use crate::docker::client::{DockerResponse, DockerTransport};
use crate::docker::image::ImageName;
use crate::docker::probes;
use crate::docker::ContainerLookupResult;

/// Upper bound on `NetworkMode = container:<id>` chains; anything deeper is
/// treated as a pathological loop.
const MAX_SECONDARY_DEPTH: u32 = 4;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct ContainerManifest {
    config: ContainerConfig,
    host_config: HostConfig,
    network_settings: NetworkSettings,
    mounts: Option<Vec<MountEntry>>,
    /// Content-addressed image reference, e.g. `sha256:abcd…`.
    image: String,
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct ContainerConfig {
    image: String,
    labels: Option<HashMap<String, String>>,
    env: Option<Vec<String>>,
    healthcheck: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct HostConfig {
    network_mode: String,
    memory: i64,
    memory_swap: i64,
    cpu_shares: i64,
    cpu_quota: i64,
    cpu_period: i64,
    cpuset_cpus: String,
    privileged: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NetworkSettings {
    #[serde(rename = "IPAddress")]
    ip_address: String,
    #[serde(rename = "Ports")]
    ports: Option<BTreeMap<String, Option<Vec<PortBindingEntry>>>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct PortBindingEntry {
    host_ip: String,
    host_port: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct MountEntry {
    source: String,
    destination: String,
    mode: String,
    #[serde(rename = "RW")]
    rw: bool,
    propagation: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct ImageManifest {
    repo_digests: Option<Vec<String>>,
    repo_tags: Option<Vec<String>>,
}

/// Fetches and normalises container metadata over a [`DockerTransport`].
///
/// The API-version prefix is per instance: the first 4xx on a versioned
/// container fetch blanks it for the rest of the instance's lifetime, so a
/// daemon that rejected the version once is not asked again.
pub struct DockerMetadataResolver<T> {
    transport: T,
    api_version: String,
    query_image_info: bool,
}

impl<T: DockerTransport> DockerMetadataResolver<T> {
    pub fn new(transport: T, api_version: impl Into<String>, query_image_info: bool) -> Self {
        Self {
            transport,
            api_version: api_version.into(),
            query_image_info,
        }
    }

    fn versioned(&self, path: &str) -> String {
        format!("{}{}", self.api_version, path)
    }

    fn fetch_container_json(&mut self, id: &ContainerId) -> Option<String> {
        let path = format!("/containers/{id}/json");
        match self.transport.request(&self.versioned(&path)) {
            DockerResponse::Ok(body) => Some(body),
            DockerResponse::BadRequest => {
                log::debug!("({id}) versioned fetch rejected, retrying without api version");
                self.api_version.clear();
                match self.transport.request(&path) {
                    DockerResponse::Ok(body) => Some(body),
                    _ => None,
                }
            }
            DockerResponse::Error => None,
        }
    }

    /// Resolves `id` into `container`. Returns `false` when the fetch
    /// failed or the manifest did not parse; the descriptor is then left
    /// with whatever was filled in before the failure.
    pub fn parse_docker(
        &mut self,
        id: &ContainerId,
        container: &mut ContainerInfo,
        depth: u32,
    ) -> bool {
        if depth > MAX_SECONDARY_DEPTH {
            log::warn!("({id}) network-mode container chain too deep, giving up");
            return false;
        }

        log::debug!("({id}) looking up container info");
        let Some(json) = self.fetch_container_json(id) else {
            log::debug!("({id}) container info fetch failed");
            return false;
        };

        let manifest: ContainerManifest = match serde_json::from_str(&json) {
            Ok(manifest) => manifest,
            Err(err) => {
                log::error!("({id}) could not parse container info: {err}");
                return false;
            }
        };

        container.image = manifest.config.image.clone();

        let root_image = manifest.image.as_str();
        if let Some((_, image_id)) = root_image.split_once(':') {
            container.image_id = image_id.to_owned();
        }

        let labels = manifest.config.labels.clone().unwrap_or_default();
        probes::parse_health_probes(&labels, manifest.config.healthcheck.as_ref(), container);

        // containers can be spawned with the image id standing in for the
        // image name, with or without the hash prefix
        let image_is_id = (!container.image_id.is_empty()
            && shares_prefix(&container.image, &container.image_id))
            || (!root_image.is_empty() && shares_prefix(&container.image, root_image));

        if !image_is_id || !self.query_image_info {
            let parts = ImageName::split(&container.image);
            container.image_repo = parts.repo;
            container.image_tag = parts.tag;
            container.image_digest = parts.digest;
        }

        if self.query_image_info
            && !container.image_id.is_empty()
            && (image_is_id
                || container.image_digest.is_empty()
                || container.image_tag.is_empty())
        {
            self.fetch_image_info(id, container);
        }

        if container.image_tag.is_empty() {
            container.image_tag = "latest".to_owned();
        }

        // node agents prefix container names with '/'
        container.name = manifest
            .name
            .strip_prefix('/')
            .unwrap_or(&manifest.name)
            .to_owned();
        if container.name.starts_with("k8s_POD") {
            container.is_pod_sandbox = true;
        }

        let ip = manifest.network_settings.ip_address.as_str();
        if ip.is_empty() {
            if let Some(secondary) = manifest.host_config.network_mode.strip_prefix("container:")
            {
                self.inherit_secondary_ip(id, secondary, container, depth);
            }
        } else {
            match ip.parse::<Ipv4Addr>() {
                Ok(addr) => container.container_ip = u32::from(addr),
                Err(err) => log::warn!("({id}) invalid container ip `{ip}`: {err}"),
            }
        }

        for (port_key, bindings) in manifest.network_settings.ports.unwrap_or_default() {
            let Some(tcp_pos) = port_key.find("/tcp") else {
                continue;
            };
            let container_port: u16 = port_key[..tcp_pos].parse().unwrap_or(0);
            for binding in bindings.unwrap_or_default() {
                let Ok(host_ip) = binding.host_ip.parse::<Ipv4Addr>() else {
                    log::debug!(
                        "({id}) skipping port binding with host ip `{}`",
                        binding.host_ip
                    );
                    continue;
                };
                container.port_mappings.push(PortMapping {
                    host_ip: u32::from(host_ip),
                    host_port: binding.host_port.parse().unwrap_or(0),
                    container_port,
                });
            }
        }

        container.labels = labels;
        container.env = manifest.config.env.unwrap_or_default();

        let host_config = &manifest.host_config;
        container.memory_limit = host_config.memory;
        container.swap_limit = host_config.memory_swap;
        if host_config.cpu_shares > 0 {
            container.cpu_shares = host_config.cpu_shares;
        }
        container.cpu_quota = host_config.cpu_quota;
        if host_config.cpu_period > 0 {
            container.cpu_period = host_config.cpu_period;
        }
        if !host_config.cpuset_cpus.is_empty() {
            container.cpuset_cpu_count = match count_cpu_list(&host_config.cpuset_cpus) {
                Some(count) => count,
                None => {
                    log::warn!("({id}) invalid cpuset list `{}`", host_config.cpuset_cpus);
                    0
                }
            };
        }
        container.privileged = host_config.privileged;

        for mount in manifest.mounts.unwrap_or_default() {
            container.mounts.push(MountInfo {
                source: mount.source,
                destination: mount.destination,
                mode: mount.mode,
                rw: mount.rw,
                propagation: mount.propagation,
            });
        }

        log::debug!("({id}) container info resolved");
        true
    }

    /// Fills repository, tag and digest from the image manifest when the
    /// raw image reference alone was not enough.
    fn fetch_image_info(&mut self, id: &ContainerId, container: &mut ContainerInfo) {
        log::debug!("({id}) fetching image info for `{}`", container.image_id);
        let path = format!("/images/{}/json?digests=1", container.image_id);
        let body = match self.transport.request(&self.versioned(&path)) {
            DockerResponse::Ok(body) => body,
            _ => {
                log::error!("({id}) could not fetch image info for `{}`", container.image_id);
                return;
            }
        };

        let manifest: ImageManifest = match serde_json::from_str(&body) {
            Ok(manifest) => manifest,
            Err(err) => {
                log::error!("({id}) could not parse image info: {err}");
                return;
            }
        };

        // RepoDigests only lists images pulled from a registry; retagged or
        // locally built images may not match the repository at all.
        let mut digests: HashSet<String> = HashSet::new();
        for repo_digest in manifest.repo_digests.unwrap_or_default() {
            let Some((name, digest)) = repo_digest.split_once('@') else {
                continue;
            };
            digests.insert(digest.to_owned());
            if container.image_repo.is_empty() {
                container.image_repo = name.to_owned();
            }
            if repo_digest.contains(&container.image_repo) {
                container.image_digest = digest.to_owned();
                break;
            }
        }

        for repo_tag in manifest.repo_tags.unwrap_or_default() {
            let Some((name, tag)) = repo_tag.rsplit_once(':') else {
                continue;
            };
            if container.image_repo.is_empty() {
                container.image_repo = name.to_owned();
            }
            if repo_tag.contains(&container.image_repo) {
                container.image_tag = tag.to_owned();
                break;
            }
        }

        // one repo digest with many tags, or many repo digests sharing the
        // same value: a single distinct digest is still unambiguous
        if container.image_digest.is_empty() && digests.len() == 1 {
            if let Some(digest) = digests.into_iter().next() {
                container.image_digest = digest;
            }
        }
    }

    /// Resolves the container owning the network namespace and copies its
    /// address. Runs on the worker thread and bypasses the lookup queue on
    /// purpose, so ordering with the cache's own queue cannot deadlock.
    fn inherit_secondary_ip(
        &mut self,
        id: &ContainerId,
        secondary: &str,
        container: &mut ContainerInfo,
        depth: u32,
    ) {
        let secondary_id = match secondary.parse::<ContainerId>() {
            Ok(secondary_id) => secondary_id,
            Err(err) => {
                log::warn!("({id}) bad network-mode container reference: {err}");
                return;
            }
        };

        log::debug!("({id}) blocking fetch of secondary container `{secondary_id}`");
        let mut secondary_info = ContainerInfo {
            id: Some(secondary_id.clone()),
            ..ContainerInfo::default()
        };
        if self.parse_docker(&secondary_id, &mut secondary_info, depth + 1) {
            container.container_ip = secondary_info.container_ip;
        } else {
            log::error!("({id}) secondary container fetch of `{secondary_id}` failed");
        }
    }
}

impl<T: DockerTransport> ValueResolver<ContainerId, ContainerLookupResult>
    for DockerMetadataResolver<T>
{
    fn resolve(&mut self, key: &ContainerId) -> ContainerLookupResult {
        let mut container = ContainerInfo {
            container_type: ContainerType::Docker,
            id: Some(key.clone()),
            ..ContainerInfo::default()
        };

        // An unsuccessful result is stored anyway: the cgroup names of
        // docker and containerd are often identical, and a negative answer
        // lets the manager try another engine for the same id.
        let successful = self.parse_docker(key, &mut container, 0);
        if successful {
            container.metadata_complete = true;
        } else {
            log::debug!("({key}) failed to get container metadata, storing unsuccessful result");
        }

        ContainerLookupResult {
            successful,
            container,
        }
    }
}

fn shares_prefix(a: &str, b: &str) -> bool {
    let n = a.len().min(b.len());
    a.as_bytes()[..n] == b.as_bytes()[..n]
}
