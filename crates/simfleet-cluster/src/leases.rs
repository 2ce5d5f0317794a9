//! ActiveDevices: which node owns each handed-out device, and until when.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use simfleet_core::DeviceRef;
use simfleet_node::Node;

use crate::error::{ClusterError, ClusterResult};

/// Returned by `next_release_at` when nothing can expire.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

struct SessionEntry {
    node: Arc<dyn Node>,
    owner: Option<String>,
    refreshed_at: Instant,
    /// `None` never expires.
    timeout: Option<Duration>,
}

impl SessionEntry {
    fn release_at(&self) -> Option<Instant> {
        self.timeout.map(|timeout| self.refreshed_at + timeout)
    }
}

/// The lease table. One entry per device reference.
#[derive(Default)]
pub struct ActiveDevices {
    entries: Mutex<HashMap<DeviceRef, SessionEntry>>,
}

impl ActiveDevices {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<DeviceRef, SessionEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or overwrite the lease for `reference`.
    pub fn register(
        &self,
        reference: DeviceRef,
        node: Arc<dyn Node>,
        timeout: Option<Duration>,
        owner: Option<String>,
    ) {
        debug!(device = %reference, node = %node.public_host(), ?timeout, ?owner, "lease registered");
        let entry = SessionEntry {
            node,
            owner,
            refreshed_at: Instant::now(),
            timeout,
        };
        if self.entries().insert(reference.clone(), entry).is_some() {
            warn!(device = %reference, "lease replaced an existing one");
        }
    }

    /// Owning node of `reference`. Refreshes the lease.
    pub fn get_node_for(&self, reference: &DeviceRef) -> ClusterResult<Arc<dyn Node>> {
        let mut entries = self.entries();
        let entry = entries
            .get_mut(reference)
            .ok_or_else(|| ClusterError::DeviceNotFound(reference.clone()))?;
        entry.refreshed_at = Instant::now();
        Ok(entry.node.clone())
    }

    pub fn contains(&self, reference: &DeviceRef) -> bool {
        self.entries().contains_key(reference)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// References whose lease has run out.
    pub fn ready_for_release(&self) -> Vec<DeviceRef> {
        let now = Instant::now();
        self.entries()
            .iter()
            .filter(|(_, entry)| entry.release_at().is_some_and(|at| at <= now))
            .map(|(reference, _)| reference.clone())
            .collect()
    }

    /// Remove every expired lease and return it with its owning node.
    ///
    /// Expiry is checked and the entries removed under one lock, so a lease
    /// refreshed before this call is never taken.
    pub fn take_expired(&self) -> Vec<(DeviceRef, Arc<dyn Node>)> {
        let now = Instant::now();
        let mut entries = self.entries();
        let expired: Vec<DeviceRef> = entries
            .iter()
            .filter(|(_, entry)| entry.release_at().is_some_and(|at| at <= now))
            .map(|(reference, _)| reference.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|reference| {
                let entry = entries.remove(&reference)?;
                Some((reference, entry.node))
            })
            .collect()
    }

    /// Soonest lease deadline, or a far-future instant when none can expire.
    pub fn next_release_at(&self) -> Instant {
        self.entries()
            .values()
            .filter_map(SessionEntry::release_at)
            .min()
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE)
    }

    /// Drop the lease and release the device on its node.
    ///
    /// `false` when no lease exists or the node did not know the device.
    pub async fn release_device(&self, reference: &DeviceRef, reason: &str) -> bool {
        let Some(entry) = self.entries().remove(reference) else {
            debug!(device = %reference, "no lease to release");
            return false;
        };
        info!(device = %reference, node = %entry.node.public_host(), %reason, "releasing leased device");
        entry.node.delete_release(reference, reason).await
    }

    /// Release several devices concurrently. Returns how many were released.
    pub async fn release_devices(&self, references: &[DeviceRef], reason: &str) -> usize {
        join_all(
            references
                .iter()
                .map(|reference| self.release_device(reference, reason)),
        )
        .await
        .into_iter()
        .filter(|released| *released)
        .count()
    }

    /// Forget every lease on `node` without touching the devices.
    pub fn unregister_node_devices(&self, node: &str) -> Vec<DeviceRef> {
        let mut entries = self.entries();
        let removed: Vec<DeviceRef> = entries
            .iter()
            .filter(|(_, entry)| entry.node.public_host() == node)
            .map(|(reference, _)| reference.clone())
            .collect();
        for reference in &removed {
            entries.remove(reference);
        }
        if !removed.is_empty() {
            info!(%node, count = removed.len(), "dropped leases of deregistered node");
        }
        removed
    }

    pub fn active_devices_by_node(&self, node: &str) -> Vec<DeviceRef> {
        self.entries()
            .iter()
            .filter(|(_, entry)| entry.node.public_host() == node)
            .map(|(reference, _)| reference.clone())
            .collect()
    }

    /// Whether `node` holds a lease that never expires.
    pub fn has_unexpiring_leases(&self, node: &str) -> bool {
        self.entries()
            .values()
            .any(|entry| entry.timeout.is_none() && entry.node.public_host() == node)
    }

    pub fn user_device_refs(&self, owner: &str) -> Vec<DeviceRef> {
        self.entries()
            .iter()
            .filter(|(_, entry)| entry.owner.as_deref() == Some(owner))
            .map(|(reference, _)| reference.clone())
            .collect()
    }

    pub async fn release_user_devices(&self, owner: &str, reason: &str) -> usize {
        let references = self.user_device_refs(owner);
        self.release_devices(&references, reason).await
    }

    pub fn device_refs(&self) -> Vec<DeviceRef> {
        self.entries().keys().cloned().collect()
    }
}
