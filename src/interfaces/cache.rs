/*
* Copyright (C) 2019-2021 TON Labs. All Rights Reserved.
*
* Licensed under the SOFTWARE EVALUATION License (the "License"); you may not use
* this file except in compliance with the License.
*
* Unless required by applicable law or agreed to in writing, software
* distributed under the License is distributed on an "AS IS" BASIS,
* WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
* See the License for the specific TON DEV software governing permissions and
* limitations under the License.
*/

use crate::{engine_traits::InsertManager, types::entities::{Entity, SmcInterface}};

use ever_block::{Result, UInt256};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

pub const INTERFACES_TRACE_TARGET: &str = "interfaces";

/// Code-hash verdicts: has some code ever been confirmed or refuted as an
/// implementation of an interface. A verdict, once set, never flips.
#[derive(Default)]
pub struct InterfaceManager {
    cache: lockfree::map::Map<(UInt256, SmcInterface), bool>,
}

impl InterfaceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` means the pair was never checked.
    pub fn check(&self, code_hash: &UInt256, interface: SmcInterface) -> Option<bool> {
        self.cache
            .get(&(code_hash.clone(), interface))
            .map(|guard| *guard.val())
    }

    pub fn set(&self, code_hash: &UInt256, interface: SmcInterface, has: bool) {
        let key = (code_hash.clone(), interface);
        if let Some(prev) = self.cache.get(&key) {
            if *prev.val() != has {
                log::warn!(
                    target: INTERFACES_TRACE_TARGET,
                    "refusing to flip interface verdict for {:x} {}: {} -> {}",
                    code_hash, interface, prev.val(), has
                );
            }
            return;
        }
        self.cache.insert(key, has);
    }
}

/// Write-through cache of per-account entities. A lookup miss escalates to the
/// database writer; a hit never touches the VM. Bounded: overflow drops the
/// whole map, correctness is preserved because every entry is write-through.
pub struct EntityCache<T> {
    cache: lockfree::map::Map<String, T>,
    len: AtomicUsize,
    limit: usize,
    insert_manager: Arc<dyn InsertManager>,
}

impl<T> EntityCache<T>
where
    T: Clone + Send + Sync + 'static,
    T: TryFrom<Entity>,
    Entity: From<T>,
{
    pub fn new(insert_manager: Arc<dyn InsertManager>, limit: usize) -> Self {
        EntityCache {
            cache: lockfree::map::Map::new(),
            len: AtomicUsize::new(0),
            limit,
            insert_manager,
        }
    }

    /// Local cache first, then the database writer. `NotFound` on a full miss.
    pub async fn check(&self, raw_address: &str) -> Result<T> {
        if let Some(guard) = self.cache.get(raw_address) {
            return Ok(guard.val().clone());
        }
        let entity = self.insert_manager.get_entity(raw_address).await?;
        let data = T::try_from(entity).map_err(|_| {
            crate::indexer_err!(InvalidData, "entity kind mismatch for {}", raw_address)
        })?;
        self.insert_local(raw_address.to_string(), data.clone());
        Ok(data)
    }

    /// Caches locally and upserts downstream.
    pub async fn add(&self, raw_address: String, data: T) -> Result<()> {
        self.insert_local(raw_address, data.clone());
        self.insert_manager.upsert_entity(Entity::from(data)).await
    }

    fn insert_local(&self, raw_address: String, data: T) {
        if self.cache.insert(raw_address, data).is_none()
            && self.len.fetch_add(1, Ordering::Relaxed) + 1 > self.limit
        {
            log::info!(
                target: INTERFACES_TRACE_TARGET,
                "entity cache overflow at {} entries, dropping", self.limit
            );
            for guard in self.cache.iter() {
                self.cache.remove(guard.key());
            }
            self.len.store(0, Ordering::Relaxed);
        }
    }
}
