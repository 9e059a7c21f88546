//! Docker metadata engine: event-path entry point and asynchronous lookup.
//!
//! [`DockerEngine::resolve`] is what the event pipeline calls for every
//! process event that carries a container id. It guarantees the manager
//! holds at least a stub descriptor immediately, schedules the slow
//! metadata fetch out of band, and reports whether the descriptor is
//! already complete so the pipeline knows when to stop trying other
//! engines. The event path never blocks on the runtime: lookups are handed
//! to an [`AsyncKeyValueSource`] with a zero wait budget, and completed
//! descriptors reach the manager through the lookup callback.

pub mod client;
pub mod image;
pub mod probes;
pub mod resolver;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::async_source::AsyncKeyValueSource;
use crate::container::manager::ContainerManager;
use crate::container::{ContainerId, ContainerInfo, ThreadInfo};
use client::UnixHttpClient;
use resolver::DockerMetadataResolver;

/// Outcome of one asynchronous metadata lookup.
///
/// Stored for successful and failed fetches alike, so that every
/// registered callback fires and the manager can drive fallback engines on
/// a negative answer. The `Default` value is the failure result delivered
/// when a source is stopped with lookups still pending.
#[derive(Debug, Clone, Default)]
pub struct ContainerLookupResult {
    pub successful: bool,
    pub container: ContainerInfo,
}

/// Engine configuration, fixed at construction time.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Path of the runtime's UNIX socket.
    pub socket_path: PathBuf,
    /// API-version prefix for request paths; may be blanked at runtime by
    /// the one-shot fallback on a 4xx answer.
    pub api_version: String,
    /// Whether to issue the secondary image-info fetch to pin down
    /// repository, tag and digest.
    pub query_image_info: bool,
    /// How long a lookup caller may block waiting for an in-flight fetch.
    /// Zero on the event path: callers always take the callback route.
    pub max_wait: Duration,
    /// Retention of completed lookup results.
    pub ttl: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(client::DEFAULT_SOCKET_PATH),
            api_version: "/v1.24".to_owned(),
            query_image_info: true,
            max_wait: Duration::ZERO,
            ttl: Duration::from_secs(10),
        }
    }
}

/// Resolves container metadata for process events attributed to Docker.
pub struct DockerEngine {
    config: DockerConfig,
    source: Option<AsyncKeyValueSource<ContainerId, ContainerLookupResult>>,
}

impl DockerEngine {
    pub fn new(config: DockerConfig) -> Self {
        Self {
            config,
            source: None,
        }
    }

    /// Toggles the image-info sub-fetch.
    ///
    /// Takes effect when the lookup source is created, i.e. before the
    /// first resolving `resolve` call on this engine.
    pub fn set_query_image_info(&mut self, query_image_info: bool) {
        log::debug!("setting query_image_info={query_image_info}");
        self.config.query_image_info = query_image_info;
    }

    /// Entry point for the event pipeline.
    ///
    /// Ensures the manager holds at least a stub descriptor for the thread's
    /// container and, when `query_os` is set and the descriptor is still
    /// incomplete, schedules the asynchronous metadata lookup. Returns
    /// `true` iff the manager's descriptor is complete when the call
    /// returns, which tells the pipeline that no other engine needs to look
    /// at this container.
    pub fn resolve(
        &mut self,
        manager: &Arc<ContainerManager>,
        thread_info: &ThreadInfo,
        query_os: bool,
    ) -> bool {
        let Some(container_id) = thread_info.container_id.clone() else {
            return false;
        };

        if manager.get_container(&container_id).is_none() {
            log::debug!("({container_id}) no existing container info, creating initial stub");
            manager.add_container(
                ContainerInfo::stub(container_id.clone(), thread_info.container_name.clone()),
                thread_info,
            );
        }

        let complete = manager
            .get_container(&container_id)
            .is_some_and(|container| container.metadata_complete);

        if !complete && query_os {
            self.schedule_lookup(manager, container_id.clone());
            // a cached result may have completed the descriptor synchronously
            return manager
                .get_container(&container_id)
                .is_some_and(|container| container.metadata_complete);
        }

        complete
    }

    fn schedule_lookup(&mut self, manager: &Arc<ContainerManager>, container_id: ContainerId) {
        let source = self.ensure_source();

        let callback_manager = Arc::clone(manager);
        let completed = source.lookup(container_id, move |id, result: &ContainerLookupResult| {
            log::debug!("({id}) lookup finished, successful={}", result.successful);
            if result.successful {
                callback_manager.notify_new_container(result.container.clone());
            }
        });

        // a fresh cached result is handled exactly like the callback would
        if let Some(result) = completed {
            if result.successful {
                manager.notify_new_container(result.container);
            }
        }
    }

    fn ensure_source(&mut self) -> &AsyncKeyValueSource<ContainerId, ContainerLookupResult> {
        if self.source.is_none() {
            log::debug!("creating docker metadata source");
            let transport = UnixHttpClient::new(&self.config.socket_path);
            let resolver = DockerMetadataResolver::new(
                transport,
                self.config.api_version.clone(),
                self.config.query_image_info,
            );
            self.source = Some(AsyncKeyValueSource::new(
                self.config.max_wait,
                self.config.ttl,
                resolver,
            ));
        }
        self.source.as_ref().expect("metadata source just created")
    }

    #[cfg(test)]
    fn with_source(source: AsyncKeyValueSource<ContainerId, ContainerLookupResult>) -> Self {
        Self {
            config: DockerConfig::default(),
            source: Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::INCOMPLETE_IMAGE;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn thread_info(id: &str) -> ThreadInfo {
        ThreadInfo {
            pid: 4242,
            tid: 4242,
            container_id: Some(id.parse().unwrap()),
            container_name: Some("web-1".to_owned()),
            ..ThreadInfo::default()
        }
    }

    fn wait_until_complete(manager: &ContainerManager, id: &ContainerId) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if manager
                .get_container(id)
                .is_some_and(|container| container.metadata_complete)
            {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("descriptor for `{id}` never completed");
    }

    #[test]
    fn test_resolve_without_container_id() {
        let manager = Arc::new(ContainerManager::new());
        let mut engine = DockerEngine::new(DockerConfig::default());

        assert!(!engine.resolve(&manager, &ThreadInfo::default(), true));
        assert_eq!(manager.size(), 0);
    }

    #[test]
    fn test_resolve_inserts_stub_without_querying() {
        let manager = Arc::new(ContainerManager::new());
        let mut engine = DockerEngine::new(DockerConfig::default());
        let tinfo = thread_info("4f1f20f9c661");

        assert!(!engine.resolve(&manager, &tinfo, false));

        let stub = manager
            .get_container(tinfo.container_id.as_ref().unwrap())
            .unwrap();
        assert_eq!(stub.name, "web-1");
        for field in [
            &stub.image,
            &stub.image_id,
            &stub.image_repo,
            &stub.image_tag,
            &stub.image_digest,
        ] {
            assert_eq!(field, INCOMPLETE_IMAGE);
        }
        assert!(!stub.metadata_complete);
    }

    #[test]
    fn test_resolve_completes_descriptor_asynchronously() {
        let _ = env_logger::builder().is_test(true).try_init();

        let lookups = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&lookups);
        let source = AsyncKeyValueSource::new(
            Duration::ZERO,
            Duration::from_secs(10),
            move |key: &ContainerId| {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut container = ContainerInfo::stub(key.clone(), Some("web-1".to_owned()));
                container.image = "nginx:1.25".to_owned();
                container.metadata_complete = true;
                ContainerLookupResult {
                    successful: true,
                    container,
                }
            },
        );

        let manager = Arc::new(ContainerManager::new());
        let mut engine = DockerEngine::with_source(source);
        let tinfo = thread_info("4f1f20f9c661");
        let id = tinfo.container_id.clone().unwrap();

        let mut rx = manager.subscribe();

        assert!(!engine.resolve(&manager, &tinfo, true));
        wait_until_complete(&manager, &id);

        let published = rx.blocking_recv().unwrap();
        assert_eq!(published.image, "nginx:1.25");

        // a completed descriptor resolves synchronously and changes nothing
        let before = manager.get_container(&id).unwrap();
        assert!(engine.resolve(&manager, &tinfo, true));
        assert_eq!(manager.get_container(&id).unwrap(), before);
        assert_eq!(lookups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsuccessful_lookup_leaves_stub_visible() {
        let source = AsyncKeyValueSource::new(
            Duration::ZERO,
            Duration::from_secs(10),
            |_key: &ContainerId| ContainerLookupResult::default(),
        );

        let manager = Arc::new(ContainerManager::new());
        let mut engine = DockerEngine::with_source(source);
        let tinfo = thread_info("4f1f20f9c661");
        let id = tinfo.container_id.clone().unwrap();

        let mut rx = manager.subscribe();

        assert!(!engine.resolve(&manager, &tinfo, true));
        // give the worker time to store the unsuccessful result
        std::thread::sleep(Duration::from_millis(50));

        let stub = manager.get_container(&id).unwrap();
        assert!(!stub.metadata_complete);
        assert_eq!(stub.image, INCOMPLETE_IMAGE);
        assert!(rx.try_recv().is_err());

        // another engine may still claim the container later
        assert!(!engine.resolve(&manager, &tinfo, true));
    }
}
