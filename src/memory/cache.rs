//! Process-wide registry of live conversation memories
//!
//! Guarantees at most one live `ConversationMemory` per address and a single
//! store round trip per address per process lifetime (single-flight loads).
//! Bounded by an LRU policy: evicting an instance is safe since the store
//! always holds the durable state.

use crate::address::ContextAddress;
use crate::error::RelayError;
use crate::memory::conversation::{ConversationMemory, MemoryConfig};
use crate::memory::store::MemoryStore;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OnceCell};
use tracing::info;

/// Handle to one conversation's memory. Updates for the same address
/// serialize on the inner mutex.
pub type SharedMemory = Arc<Mutex<ConversationMemory>>;

struct CacheSlot {
    cell: Arc<OnceCell<SharedMemory>>,
    last_access: Instant,
}

pub struct MemoryCache {
    store: Arc<dyn MemoryStore>,
    config: MemoryConfig,
    capacity: usize,
    slots: Mutex<HashMap<String, CacheSlot>>,
}

impl MemoryCache {
    pub fn new(store: Arc<dyn MemoryStore>, config: MemoryConfig) -> Self {
        let capacity = std::env::var("MEMORY_CACHE_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1024);

        Self::with_capacity(store, config, capacity)
    }

    pub fn with_capacity(
        store: Arc<dyn MemoryStore>,
        config: MemoryConfig,
        capacity: usize,
    ) -> Self {
        Self {
            store,
            config,
            capacity: capacity.max(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Same in-process instance for the same address across repeated calls.
    ///
    /// Concurrent first callers for one address share a single load: the slot
    /// map lock is only held to fetch or insert the slot, and the store round
    /// trip runs inside the slot's OnceCell.
    pub async fn get_or_create(&self, address: &ContextAddress) -> Result<SharedMemory> {
        let key = address.canonical_key();

        let cell = {
            let mut slots = self.slots.lock().await;

            if !slots.contains_key(&key) && slots.len() >= self.capacity {
                evict_lru(&mut slots);
            }

            let slot = slots.entry(key).or_insert_with(|| CacheSlot {
                cell: Arc::new(OnceCell::new()),
                last_access: Instant::now(),
            });
            slot.last_access = Instant::now();
            Arc::clone(&slot.cell)
        };

        let memory = cell
            .get_or_try_init(|| async {
                let memory = ConversationMemory::for_address(
                    address.clone(),
                    self.store.as_ref(),
                    self.config.clone(),
                )
                .await?;
                Ok::<SharedMemory, RelayError>(Arc::new(Mutex::new(memory)))
            })
            .await?;

        Ok(Arc::clone(memory))
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }
}

/// Drop the least-recently-accessed initialized slot. Loads still in flight
/// are never evicted.
fn evict_lru(slots: &mut HashMap<String, CacheSlot>) {
    let victim = slots
        .iter()
        .filter(|(_, slot)| slot.cell.initialized())
        .min_by_key(|(_, slot)| slot.last_access)
        .map(|(key, _)| key.clone());

    if let Some(key) = victim {
        info!("Evicting cached memory for {}", key);
        slots.remove(&key);
    }
}
