//! In-process lock table keyed by `(tenant, originator, type)`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::entity::EntityRef;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct AlarmKey {
    pub tenant_id: Uuid,
    pub originator: EntityRef,
    pub alarm_type: String,
}

impl AlarmKey {
    pub fn new(tenant_id: Uuid, originator: EntityRef, alarm_type: impl Into<String>) -> Self {
        Self {
            tenant_id,
            originator,
            alarm_type: alarm_type.into(),
        }
    }
}

type Slot = Arc<AsyncMutex<()>>;

/// Entries exist only while someone holds or waits for them.
#[derive(Default)]
pub(crate) struct KeyedLocks {
    slots: Mutex<HashMap<AlarmKey, Slot>>,
}

/// Held for the duration of one alarm mutation.
pub(crate) struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    key: AlarmKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: AlarmKey) -> KeyGuard<'_> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.entry(key.clone()).or_default().clone()
        };
        let guard = slot.lock_owned().await;
        KeyGuard {
            locks: self,
            key,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut slots = self.locks.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.get(&self.key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::new());
        let key = AlarmKey::new(Uuid::new_v4(), EntityRef::random(EntityType::Device), "Overheat");
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let (locks, key, inside, peak) = (locks.clone(), key.clone(), inside.clone(), peak.clone());
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(key).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let device = EntityRef::random(EntityType::Device);
        let tenant = Uuid::new_v4();
        let _a = locks.lock(AlarmKey::new(tenant, device, "A")).await;
        let _b = locks.lock(AlarmKey::new(tenant, device, "B")).await;
        assert_eq!(locks.len(), 2);
    }
}
