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

pub mod cache;
pub mod events;
mod jetton;
mod nft;

#[cfg(test)]
#[path = "../tests/test_interfaces.rs"]
mod tests;

pub use cache::{EntityCache, InterfaceManager, INTERFACES_TRACE_TARGET};

use crate::{
    engine_traits::InsertManager,
    indexer_err,
    smc::SmcExecutor,
    types::entities::{
        Entity, JettonMasterData, JettonWalletData, NftCollectionData, NftItemData, SmcInterface,
    },
};

use ever_block::{base64_decode, read_single_root_boc, Cell, MsgAddressInt, Result, UInt256};
use std::sync::Arc;

/// The interface detectors with their shared caches. One instance serves the
/// whole worker; all methods are callable concurrently.
pub struct Detectors {
    executor: Arc<SmcExecutor>,
    interface_manager: InterfaceManager,
    jetton_masters: EntityCache<JettonMasterData>,
    jetton_wallets: EntityCache<JettonWalletData>,
    nft_collections: EntityCache<NftCollectionData>,
    nft_items: EntityCache<NftItemData>,
}

impl Detectors {
    pub fn new(
        executor: Arc<SmcExecutor>,
        insert_manager: Arc<dyn InsertManager>,
        entity_cache_limit: usize,
    ) -> Self {
        Detectors {
            executor,
            interface_manager: InterfaceManager::new(),
            jetton_masters: EntityCache::new(insert_manager.clone(), entity_cache_limit),
            jetton_wallets: EntityCache::new(insert_manager.clone(), entity_cache_limit),
            nft_collections: EntityCache::new(insert_manager.clone(), entity_cache_limit),
            nft_items: EntityCache::new(insert_manager, entity_cache_limit),
        }
    }

    pub fn executor(&self) -> &Arc<SmcExecutor> {
        &self.executor
    }

    pub fn vm_invocation_count(&self) -> u64 {
        self.executor.vm_invocation_count()
    }

    /// Tries every interface on one account state. Cross-contract and cache
    /// misses are classification results here, not failures.
    pub async fn detect_all(
        &self,
        address: &MsgAddressInt,
        code: &Cell,
        data: &Cell,
        last_tx_lt: u64,
    ) -> Vec<Entity> {
        let mut found = Vec::new();
        match self.detect_jetton_master(address, code, data, last_tx_lt).await {
            Ok(entity) => found.push(Entity::JettonMaster(entity)),
            Err(err) => log_detect_miss(address, SmcInterface::JettonMaster, &err),
        }
        match self.detect_jetton_wallet(address, code, data, last_tx_lt).await {
            Ok(entity) => found.push(Entity::JettonWallet(entity)),
            Err(err) => log_detect_miss(address, SmcInterface::JettonWallet, &err),
        }
        match self.detect_nft_collection(address, code, data, last_tx_lt).await {
            Ok(entity) => found.push(Entity::NftCollection(entity)),
            Err(err) => log_detect_miss(address, SmcInterface::NftCollection, &err),
        }
        match self.detect_nft_item(address, code, data, last_tx_lt).await {
            Ok(entity) => found.push(Entity::NftItem(entity)),
            Err(err) => log_detect_miss(address, SmcInterface::NftItem, &err),
        }
        found
    }

    /// Fails fast when the code hash was already refuted for the interface.
    fn precheck(&self, code_hash: &UInt256, interface: SmcInterface) -> Result<()> {
        if self.interface_manager.check(code_hash, interface) == Some(false) {
            return Err(indexer_err!(
                SmcInterfaceParse,
                "code hash {:x} is not a {}", code_hash, interface
            ));
        }
        Ok(())
    }

    fn interface_manager(&self) -> &InterfaceManager {
        &self.interface_manager
    }
}

fn log_detect_miss(address: &MsgAddressInt, interface: SmcInterface, err: &failure::Error) {
    log::debug!(
        target: INTERFACES_TRACE_TARGET,
        "{} is not a {}: {}", address, interface, err
    );
}

/// True if a cached entity is authoritative for the requested state.
fn cached_is_fresh(
    cached_code_hash: &str,
    cached_data_hash: &str,
    cached_last_tx_lt: u64,
    code: &Cell,
    data: &Cell,
    requested_lt: u64,
) -> bool {
    (cached_code_hash == code.repr_hash().as_hex_string()
        && cached_data_hash == data.repr_hash().as_hex_string())
        || cached_last_tx_lt >= requested_lt
}

fn cells_from_bocs(code_boc: &str, data_boc: &str) -> Result<(Cell, Cell)> {
    let code = read_single_root_boc(base64_decode(code_boc)?)?;
    let data = read_single_root_boc(base64_decode(data_boc)?)?;
    Ok((code, data))
}
