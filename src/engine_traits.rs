use crate::types::{
    entities::Entity,
    records::{AccountStateRecord, ParsedBlock},
    MasterchainBlockDataState, QueueStatus,
};

use ever_block::{Result, ShardAccount, UInt256};
use tokio::sync::oneshot;

/// Completion signal for one enqueued seqno: fires when the downstream writer
/// has made the block durable.
pub type InsertedReceiver = oneshot::Receiver<Result<()>>;

/// Read-only access to materialized chain data.
#[async_trait::async_trait]
pub trait ChainReader: Sync + Send {
    async fn get_last_mc_seqno(&self) -> Result<u32>;
    async fn fetch_mc_block(&self, mc_seqno: u32) -> Result<MasterchainBlockDataState>;
    /// Account states at the given masterchain height in ascending address
    /// order, starting strictly after `cursor`. Returns the batch and the
    /// cursor to resume from, or `None` when the walk is complete.
    async fn fetch_account_states(
        &self,
        mc_seqno: u32,
        cursor: Option<UInt256>,
        batch_size: usize,
    ) -> Result<(Vec<(UInt256, ShardAccount)>, Option<UInt256>)>;
}

/// The downstream database writer.
#[async_trait::async_trait]
pub trait InsertManager: Sync + Send {
    async fn get_existing_seqnos(&self) -> Result<Vec<u32>>;
    /// Enqueues one parsed block. Returns the post-insert queue status as soon
    /// as the block is durably queued; the receiver fires when it is durably
    /// committed.
    async fn insert(
        &self,
        mc_seq_no: u32,
        block: ParsedBlock,
    ) -> Result<(QueueStatus, InsertedReceiver)>;
    async fn get_insert_queue_status(&self) -> Result<QueueStatus>;
    async fn upsert_entity(&self, entity: Entity) -> Result<()>;
    /// Resolves an entity by raw address; `IndexerError::NotFound` on miss.
    async fn get_entity(&self, raw_address: &str) -> Result<Entity>;
    async fn insert_account_states(&self, states: Vec<AccountStateRecord>) -> Result<()>;
    async fn load_scan_checkpoint(&self) -> Result<Option<UInt256>>;
    async fn store_scan_checkpoint(&self, cur_addr: &UInt256) -> Result<()>;
}

/// One write in a key-value transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvCommand {
    HSet { key: String, field: String, value: Vec<u8> },
    HDel { key: String, field: String },
    ZAdd { key: String, member: String, score: u64 },
    ZRem { key: String, member: String },
    Publish { channel: String, payload: String },
}

/// The auxiliary key-value store used for emulated traces. `exec` applies the
/// whole batch transactionally.
#[async_trait::async_trait]
pub trait KvWriter: Sync + Send {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;
    async fn exec(&self, commands: Vec<KvCommand>) -> Result<()>;
}
