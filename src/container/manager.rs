//! In-memory container table with new-container fan-out.
//!
//! The manager is the rendezvous point between the event pipeline (which
//! inserts stub descriptors on first sighting), the asynchronous metadata
//! lookup (which overwrites the stub once the runtime answers), and the
//! delayed cgroup-limit reader (which patches the resource fields). All
//! three may run on different threads; the table is a [`DashMap`] and every
//! operation here is safe to call from a lookup worker.

use dashmap::DashMap;

use super::{ContainerId, ContainerInfo, ThreadInfo};

/// Tracks every sighted container and publishes completed descriptors.
#[derive(Debug, Default)]
pub struct ContainerManager {
    containers: DashMap<ContainerId, ContainerInfo>,
    new_container_tx: std::sync::Mutex<Vec<tokio::sync::mpsc::UnboundedSender<ContainerInfo>>>,
}

impl ContainerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a clone of the descriptor for `id`, if the container is
    /// still tracked.
    pub fn get_container(&self, id: &ContainerId) -> Option<ContainerInfo> {
        self.containers.get(id).map(|entry| entry.value().clone())
    }

    /// Inserts or replaces the descriptor for a container.
    ///
    /// `thread_info` is the thread whose event caused the insertion; it is
    /// only used for diagnostics here, association of threads to containers
    /// is owned by the process table upstream.
    pub fn add_container(&self, info: ContainerInfo, thread_info: &ThreadInfo) {
        let Some(id) = info.id.clone() else {
            log::warn!("refusing to add container descriptor without an id");
            return;
        };
        log::debug!(
            "adding container `{}` (pid={}, complete={})",
            id,
            thread_info.pid,
            info.metadata_complete
        );
        self.containers.insert(id, info);
    }

    /// Stores a completed descriptor and fans it out to all subscribers.
    ///
    /// Called exactly once per successful asynchronous resolution.
    pub fn notify_new_container(&self, info: ContainerInfo) {
        let Some(id) = info.id.clone() else {
            log::warn!("dropping completed descriptor without an id");
            return;
        };
        log::debug!("container `{}` metadata complete, notifying", id);
        self.containers.insert(id, info.clone());

        let mut senders = self
            .new_container_tx
            .lock()
            .expect("subscriber list lock poisoned");
        // drop subscribers that went away
        senders.retain(|tx| tx.send(info.clone()).is_ok());
    }

    /// Registers a subscriber for completed descriptors.
    ///
    /// The channel is unbounded so that lookup worker threads can publish
    /// without an async runtime at hand.
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<ContainerInfo> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.new_container_tx
            .lock()
            .expect("subscriber list lock poisoned")
            .push(tx);
        rx
    }

    /// Removes a container once the pipeline observes its teardown.
    pub fn remove_container(&self, id: &ContainerId) {
        self.containers.remove(id);
    }

    /// Applies delayed cgroup-limit results to a descriptor that still
    /// exists. Returns `false` if the container is already gone and the
    /// update was dropped.
    pub fn update_resource_limits(
        &self,
        id: &ContainerId,
        apply: impl FnOnce(&mut ContainerInfo),
    ) -> bool {
        match self.containers.get_mut(id) {
            Some(mut entry) => {
                apply(entry.value_mut());
                true
            }
            None => false,
        }
    }

    pub fn size(&self) -> usize {
        self.containers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::INCOMPLETE_IMAGE;

    fn id(s: &str) -> ContainerId {
        s.parse().unwrap()
    }

    #[test]
    fn test_add_and_get_container() {
        let manager = ContainerManager::new();
        let cid = id("4f1f20f9c661");
        let stub = ContainerInfo::stub(cid.clone(), None);

        manager.add_container(stub, &ThreadInfo::default());

        let stored = manager.get_container(&cid).unwrap();
        assert_eq!(stored.image, INCOMPLETE_IMAGE);
        assert_eq!(manager.size(), 1);

        manager.remove_container(&cid);
        assert!(manager.get_container(&cid).is_none());
        assert_eq!(manager.size(), 0);
    }

    #[test]
    fn test_notify_new_container_overwrites_stub_and_fans_out() {
        let manager = ContainerManager::new();
        let cid = id("4f1f20f9c661");
        manager.add_container(ContainerInfo::stub(cid.clone(), None), &ThreadInfo::default());

        let mut rx = manager.subscribe();

        let mut complete = ContainerInfo::stub(cid.clone(), Some("web".to_owned()));
        complete.image = "nginx:1.25".to_owned();
        complete.metadata_complete = true;
        manager.notify_new_container(complete);

        let stored = manager.get_container(&cid).unwrap();
        assert!(stored.metadata_complete);
        assert_eq!(stored.image, "nginx:1.25");

        let published = rx.try_recv().unwrap();
        assert_eq!(published.id, Some(cid));
        assert!(published.metadata_complete);
    }

    #[test]
    fn test_update_resource_limits_on_gone_container() {
        let manager = ContainerManager::new();
        let cid = id("4f1f20f9c661");

        assert!(!manager.update_resource_limits(&cid, |info| info.memory_limit = 1));

        manager.add_container(ContainerInfo::stub(cid.clone(), None), &ThreadInfo::default());
        assert!(manager.update_resource_limits(&cid, |info| info.memory_limit = 512));
        assert_eq!(manager.get_container(&cid).unwrap().memory_limit, 512);
    }
}
