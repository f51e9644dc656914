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

pub mod entities;
pub mod records;

use ever_block::{Block, BlockIdExt, Cell, HashmapE};
use ever_executor::BlockchainConfig;
use std::{ops::{AddAssign, SubAssign}, sync::Arc};

/// Depth of the downstream insertion queue, per record kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QueueStatus {
    pub mc_blocks: u32,
    pub blocks: u32,
    pub txs: u32,
    pub msgs: u32,
}

impl QueueStatus {
    pub fn with_counts(mc_blocks: u32, blocks: u32, txs: u32, msgs: u32) -> Self {
        QueueStatus { mc_blocks, blocks, txs, msgs }
    }

    /// True if any component is strictly above the corresponding limit.
    pub fn exceeds_any(&self, limits: &QueueStatus) -> bool {
        self.mc_blocks > limits.mc_blocks
            || self.blocks > limits.blocks
            || self.txs > limits.txs
            || self.msgs > limits.msgs
    }
}

impl AddAssign for QueueStatus {
    fn add_assign(&mut self, other: Self) {
        self.mc_blocks += other.mc_blocks;
        self.blocks += other.blocks;
        self.txs += other.txs;
        self.msgs += other.msgs;
    }
}

impl SubAssign for QueueStatus {
    fn sub_assign(&mut self, other: Self) {
        self.mc_blocks = self.mc_blocks.saturating_sub(other.mc_blocks);
        self.blocks = self.blocks.saturating_sub(other.blocks);
        self.txs = self.txs.saturating_sub(other.txs);
        self.msgs = self.msgs.saturating_sub(other.msgs);
    }
}

/// One block together with its root cell and, when materialized, the post state.
#[derive(Clone)]
pub struct ShardBlockData {
    pub block_id: BlockIdExt,
    pub block: Block,
    pub root_cell: Cell,
    pub state_root: Option<Cell>,
}

/// Everything the pipeline needs about one masterchain height. Materialized by
/// the chain reader, lives for the duration of one seqno's pipeline.
#[derive(Clone)]
pub struct MasterchainBlockDataState {
    /// Masterchain block first, then the full current shard set, with states.
    pub shard_blocks: Vec<ShardBlockData>,
    /// Blocks newly referenced by this masterchain block (the diff vs. the
    /// previous masterchain height), masterchain block included.
    pub shard_blocks_diff: Vec<ShardBlockData>,
    pub config: Arc<BlockchainConfig>,
    pub libraries: HashmapE,
}

impl MasterchainBlockDataState {
    pub fn mc_block(&self) -> Option<&ShardBlockData> {
        self.shard_blocks_diff.iter().find(|b| b.block_id.shard().is_masterchain())
    }
}
