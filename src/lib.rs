//! Container-metadata resolution core of a kernel-event telemetry agent.
//!
//! When the agent observes a process event inside a container, the event
//! must be enriched with the container's identity and resource
//! configuration: image name and digest, labels, environment, port
//! mappings, health probes, memory and cpu limits. The authoritative
//! sources of that data — the container runtime's HTTP API on a local UNIX
//! socket and the kernel's control-group filesystem — can be slow or
//! temporarily unreachable, so this crate never queries them on the event
//! path. Instead, a stub descriptor is published immediately and a
//! worker-backed lookup cache fills in the rest out of band:
//!
//! - [`async_source`] — the generic deduplicating key→value lookup cache
//!   with callback delivery and TTL retention.
//! - [`docker`] — the runtime metadata engine: HTTP client, manifest
//!   normalisation, probe extraction, and the event-path `resolve` glue.
//! - [`cgroup`] — the delayed reader of per-container resource limits.
//! - [`container`] — identifiers, the descriptor model, and the in-memory
//!   container manager with new-container fan-out.

pub mod async_source;
pub mod cgroup;
pub mod container;
pub mod docker;
pub mod fsutil;
