use crate::{
    engine_traits::{ChainReader, InsertManager, InsertedReceiver, KvCommand, KvWriter},
    indexer_err,
    types::{
        entities::Entity,
        records::{AccountStateRecord, ParsedBlock},
        MasterchainBlockDataState, QueueStatus,
    },
};

use ever_block::{Result, ShardAccount, UInt256};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Mutex,
};
use tokio::sync::oneshot;

/// In-memory stand-ins for the external collaborators. Used when no storage
/// backend is linked into the build, and as fixtures in tests.

#[derive(Default)]
pub struct StubChainReader {
    pub last_seqno: u32,
}

#[async_trait::async_trait]
impl ChainReader for StubChainReader {
    async fn get_last_mc_seqno(&self) -> Result<u32> {
        Ok(self.last_seqno)
    }

    async fn fetch_mc_block(&self, mc_seqno: u32) -> Result<MasterchainBlockDataState> {
        Err(indexer_err!(NotFound, "stub reader has no block {}", mc_seqno))
    }

    async fn fetch_account_states(
        &self,
        _mc_seqno: u32,
        _cursor: Option<UInt256>,
        _batch_size: usize,
    ) -> Result<(Vec<(UInt256, ShardAccount)>, Option<UInt256>)> {
        Ok((Vec::new(), None))
    }
}

#[derive(Default)]
pub struct StubInsertManager {
    pub existing: Mutex<BTreeSet<u32>>,
    pub entities: Mutex<HashMap<String, Entity>>,
    pub account_states: Mutex<Vec<AccountStateRecord>>,
    pub checkpoint: Mutex<Option<UInt256>>,
}

#[async_trait::async_trait]
impl InsertManager for StubInsertManager {
    async fn get_existing_seqnos(&self) -> Result<Vec<u32>> {
        Ok(self.existing.lock().expect("stub lock").iter().copied().collect())
    }

    async fn insert(
        &self,
        mc_seq_no: u32,
        _block: ParsedBlock,
    ) -> Result<(QueueStatus, InsertedReceiver)> {
        futures_timer::Delay::new(std::time::Duration::from_millis(3)).await;
        self.existing.lock().expect("stub lock").insert(mc_seq_no);
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(Ok(()));
        Ok((QueueStatus::default(), receiver))
    }

    async fn get_insert_queue_status(&self) -> Result<QueueStatus> {
        Ok(QueueStatus::default())
    }

    async fn upsert_entity(&self, entity: Entity) -> Result<()> {
        self.entities
            .lock()
            .expect("stub lock")
            .insert(entity.address().to_string(), entity);
        Ok(())
    }

    async fn get_entity(&self, raw_address: &str) -> Result<Entity> {
        self.entities
            .lock()
            .expect("stub lock")
            .get(raw_address)
            .cloned()
            .ok_or_else(|| indexer_err!(NotFound, "no entity for {}", raw_address))
    }

    async fn insert_account_states(&self, states: Vec<AccountStateRecord>) -> Result<()> {
        self.account_states.lock().expect("stub lock").extend(states);
        Ok(())
    }

    async fn load_scan_checkpoint(&self) -> Result<Option<UInt256>> {
        Ok(self.checkpoint.lock().expect("stub lock").clone())
    }

    async fn store_scan_checkpoint(&self, cur_addr: &UInt256) -> Result<()> {
        *self.checkpoint.lock().expect("stub lock") = Some(cur_addr.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct StubKvStore {
    pub state: Mutex<StubKvState>,
}

#[derive(Default)]
pub struct StubKvState {
    pub hashes: HashMap<String, HashMap<String, Vec<u8>>>,
    pub zsets: HashMap<String, BTreeMap<String, u64>>,
    pub published: Vec<(String, String)>,
}

#[async_trait::async_trait]
impl KvWriter for StubKvStore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock().expect("stub lock");
        Ok(state.hashes.get(key).and_then(|hash| hash.get(field)).cloned())
    }

    async fn exec(&self, commands: Vec<KvCommand>) -> Result<()> {
        let mut state = self.state.lock().expect("stub lock");
        for command in commands {
            match command {
                KvCommand::HSet { key, field, value } => {
                    state.hashes.entry(key).or_default().insert(field, value);
                }
                KvCommand::HDel { key, field } => {
                    if let Some(hash) = state.hashes.get_mut(&key) {
                        hash.remove(&field);
                    }
                }
                KvCommand::ZAdd { key, member, score } => {
                    state.zsets.entry(key).or_default().insert(member, score);
                }
                KvCommand::ZRem { key, member } => {
                    if let Some(zset) = state.zsets.get_mut(&key) {
                        zset.remove(&member);
                    }
                }
                KvCommand::Publish { channel, payload } => {
                    state.published.push((channel, payload));
                }
            }
        }
        Ok(())
    }
}
