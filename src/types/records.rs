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

use crate::types::{
    entities::{Entity, TokenEvent},
    QueueStatus,
};

#[cfg(test)]
#[path = "../tests/test_records.rs"]
mod tests;

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockRecord {
    pub block_id: String,
    pub workchain: i32,
    pub shard: String,
    pub seq_no: u32,
    pub root_hash: String,
    pub file_hash: String,
    pub mc_seq_no: u32,
    pub gen_utime: u32,
    pub start_lt: u64,
    pub end_lt: u64,
    pub tx_count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransactionRecord {
    pub hash: String,
    pub account: String,
    pub lt: u64,
    pub now: u32,
    pub block_id: String,
    pub total_fees: u128,
    pub aborted: bool,
    pub orig_status: String,
    pub end_status: String,
    pub in_msg_hash: Option<String>,
    pub out_msg_hashes: Vec<String>,
    pub boc: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MessageDirection {
    #[default]
    Internal,
    ExternalIn,
    ExternalOut,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MessageRecord {
    pub hash: String,
    pub direction: MessageDirection,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub value: u128,
    pub created_lt: u64,
    pub opcode: Option<u32>,
    pub transaction_hash: String,
    pub is_inbound: bool,
    pub boc: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AccountStateRecord {
    pub address: String,
    pub status: String,
    pub balance: u128,
    pub last_trans_lt: u64,
    pub last_trans_hash: String,
    pub code_hash: Option<String>,
    pub data_hash: Option<String>,
    pub code_boc: Option<String>,
    pub data_boc: Option<String>,
}

/// The value-typed result of parsing one masterchain height. Ownership moves
/// parser -> scheduler -> inserter.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ParsedBlock {
    pub mc_seq_no: u32,
    pub blocks: Vec<BlockRecord>,
    pub transactions: Vec<TransactionRecord>,
    pub messages: Vec<MessageRecord>,
    pub account_states: Vec<AccountStateRecord>,
    pub entities: Vec<Entity>,
    pub events: Vec<TokenEvent>,
}

impl ParsedBlock {
    /// What this block adds to the insertion queue if admitted.
    pub fn queue_contribution(&self) -> QueueStatus {
        QueueStatus {
            mc_blocks: 1,
            blocks: self.blocks.len() as u32,
            txs: self.transactions.len() as u32,
            msgs: self.messages.len() as u32,
        }
    }
}
