use crate::device::{DeviceId, DeviceIdentity, HardwareAddress};
use crate::error::{FleetError, FleetResult};
use crate::session::types::{Activity, ConnectionSession, SessionUpdate};
use dashmap::DashMap;
use std::sync::Arc;

/// Keyed store of connection sessions and known device identities.
///
/// Every mutation goes through a single DashMap entry, so updates for one
/// device are atomic and different devices only share a shard lock for the
/// duration of a field copy. Locks are never held across an await.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<DeviceId, ConnectionSession>>,
    identities: Arc<DashMap<DeviceId, DeviceIdentity>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the session, if one exists
    pub fn get(&self, device_id: DeviceId) -> Option<ConnectionSession> {
        self.sessions.get(&device_id).map(|s| s.clone())
    }

    /// Apply a partial update, creating the session if needed
    pub fn upsert(&self, device_id: DeviceId, update: SessionUpdate) -> ConnectionSession {
        let mut entry = self
            .sessions
            .entry(device_id)
            .or_insert_with(|| ConnectionSession::new(device_id));
        entry.apply(update);
        entry.clone()
    }

    /// Read-modify-write under the entry lock. `f` must not block.
    pub fn update_with<R>(
        &self,
        device_id: DeviceId,
        f: impl FnOnce(&mut ConnectionSession) -> R,
    ) -> R {
        let mut entry = self
            .sessions
            .entry(device_id)
            .or_insert_with(|| ConnectionSession::new(device_id));
        f(&mut entry)
    }

    pub fn remove(&self, device_id: DeviceId) -> Option<ConnectionSession> {
        self.sessions.remove(&device_id).map(|(_, s)| s)
    }

    pub fn sessions(&self) -> Vec<ConnectionSession> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.sessions.iter().map(|e| *e.key()).collect()
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }

    /// Claim the busy slot for `activity`. Fails with `Busy` if another
    /// activity already holds it; released when the guard drops.
    pub fn try_begin(&self, device_id: DeviceId, activity: Activity) -> FleetResult<ActivityGuard> {
        let mut entry = self
            .sessions
            .entry(device_id)
            .or_insert_with(|| ConnectionSession::new(device_id));

        if let Some(current) = entry.activity {
            return Err(FleetError::Busy {
                device_id,
                activity: current.to_string(),
            });
        }
        entry.activity = Some(activity);

        Ok(ActivityGuard {
            sessions: self.sessions.clone(),
            device_id,
            activity,
        })
    }

    pub fn register_identity(&self, identity: DeviceIdentity) {
        self.identities.insert(identity.id, identity);
    }

    pub fn identity(&self, device_id: DeviceId) -> Option<DeviceIdentity> {
        self.identities.get(&device_id).map(|i| i.clone())
    }

    pub fn identities(&self) -> Vec<DeviceIdentity> {
        self.identities.iter().map(|e| e.value().clone()).collect()
    }

    pub fn known_addresses(&self) -> Vec<HardwareAddress> {
        self.identities
            .iter()
            .filter_map(|e| e.value().address)
            .collect()
    }

    /// Resolve an advertised address to a known device, trying both byte orders
    pub fn resolve_address(&self, address: &HardwareAddress) -> Option<DeviceIdentity> {
        self.identities
            .iter()
            .find(|e| e.value().address.is_some_and(|known| known.matches(address)))
            .map(|e| e.value().clone())
    }

    pub fn forget_identity(&self, device_id: DeviceId) -> Option<DeviceIdentity> {
        self.identities.remove(&device_id).map(|(_, i)| i)
    }
}

/// Holds a device's busy slot; clears it on drop.
#[must_use = "the busy slot is released as soon as the guard is dropped"]
pub struct ActivityGuard {
    sessions: Arc<DashMap<DeviceId, ConnectionSession>>,
    device_id: DeviceId,
    activity: Activity,
}

impl ActivityGuard {
    pub fn activity(&self) -> Activity {
        self.activity
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        if let Some(mut session) = self.sessions.get_mut(&self.device_id) {
            if session.activity == Some(self.activity) {
                session.activity = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::ConnectionStatus;

    fn addr(raw: &str) -> HardwareAddress {
        raw.parse().unwrap()
    }

    #[test]
    fn test_upsert_get_remove() {
        let registry = SessionRegistry::new();
        assert!(registry.get(DeviceId(1)).is_none());

        registry.upsert(DeviceId(1), SessionUpdate::status(ConnectionStatus::Connecting));
        assert_eq!(
            registry.get(DeviceId(1)).unwrap().status,
            ConnectionStatus::Connecting
        );

        let removed = registry.remove(DeviceId(1)).unwrap();
        assert_eq!(removed.device_id, DeviceId(1));
        assert!(registry.get(DeviceId(1)).is_none());
        assert!(registry.remove(DeviceId(1)).is_none());
    }

    #[test]
    fn test_single_activity_per_device() {
        let registry = SessionRegistry::new();

        let guard = registry.try_begin(DeviceId(1), Activity::Probing).unwrap();
        let session = registry.get(DeviceId(1)).unwrap();
        assert!(session.is_probing());
        assert!(!session.is_downloading());

        for other in [
            Activity::Scanning,
            Activity::Connecting,
            Activity::Probing,
            Activity::Downloading,
        ] {
            let err = registry.try_begin(DeviceId(1), other).err().unwrap();
            assert!(matches!(err, FleetError::Busy { .. }));
        }

        // A different device is unaffected
        let _other = registry.try_begin(DeviceId(2), Activity::Downloading).unwrap();

        drop(guard);
        assert!(registry.get(DeviceId(1)).unwrap().activity.is_none());
        let _next = registry.try_begin(DeviceId(1), Activity::Downloading).unwrap();
    }

    #[test]
    fn test_guard_after_session_removed() {
        let registry = SessionRegistry::new();
        let guard = registry.try_begin(DeviceId(5), Activity::Connecting).unwrap();
        registry.remove(DeviceId(5));
        drop(guard);
        assert!(registry.get(DeviceId(5)).is_none());
    }

    #[test]
    fn test_resolve_address_both_byte_orders() {
        let registry = SessionRegistry::new();
        registry.register_identity(DeviceIdentity::new(42u64, addr("AA:BB:CC:DD:EE:FF")));
        registry.register_identity(DeviceIdentity::new(43u64, addr("11:22:33:44:55:66")));

        let direct = registry.resolve_address(&addr("AA:BB:CC:DD:EE:FF")).unwrap();
        let reversed = registry.resolve_address(&addr("FF:EE:DD:CC:BB:AA")).unwrap();
        assert_eq!(direct.id, DeviceId(42));
        assert_eq!(reversed.id, DeviceId(42));
        assert!(registry.resolve_address(&addr("00:00:00:00:00:01")).is_none());

        registry.forget_identity(DeviceId(42)).unwrap();
        assert!(registry.resolve_address(&addr("FF:EE:DD:CC:BB:AA")).is_none());
        assert_eq!(registry.known_addresses(), vec![addr("11:22:33:44:55:66")]);
    }

    #[tokio::test]
    async fn test_concurrent_updates_different_devices() {
        let registry = SessionRegistry::new();
        let mut handles = Vec::new();
        for id in 0..32u64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    registry.update_with(DeviceId(id), |s| {
                        s.last_error = Some(format!("{}", id));
                    });
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.device_ids().len(), 32);
    }
}
