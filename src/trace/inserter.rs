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

use super::{Trace, TraceNode, TRACE_TARGET};
use crate::engine_traits::{KvCommand, KvWriter};

use ever_block::{base64_encode, write_boc, Result};
use std::{collections::VecDeque, sync::Arc};

pub const NEW_TRACE_CHANNEL: &str = "new_trace";

/// One stored trace node. Out-message hashes let a later re-emulation walk and
/// delete the stale subtree.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TraceNodeRecord {
    pub in_msg_hash: String,
    pub transaction_hash: String,
    pub account: String,
    pub lt: u64,
    pub emulated: bool,
    pub out_msg_hashes: Vec<String>,
    pub transaction_boc: String,
}

/// Writes finished traces into the key-value store. All writes for one trace
/// go through a single transactional batch.
pub struct TraceInserter {
    kv: Arc<dyn KvWriter>,
}

impl TraceInserter {
    pub fn new(kv: Arc<dyn KvWriter>) -> Self {
        TraceInserter { kv }
    }

    pub async fn insert(&self, trace: &Trace) -> Result<()> {
        let trace_key = trace.id.as_hex_string();
        let mut commands = Vec::new();
        let mut flattened = Vec::new();

        let mut queue = VecDeque::new();
        queue.push_back(&trace.root);
        while let Some(node) = queue.pop_front() {
            for child in &node.children {
                queue.push_back(child);
            }
            if !node.emulated {
                // an earlier emulation may have stored a hypothetical subtree
                // under this node's key, drop it before re-inserting
                self.delete_stored_subtree(
                    &trace_key,
                    node.node_id.as_hex_string(),
                    &mut commands,
                )
                .await?;
            }
            flattened.push(node_record(node)?);
        }

        for record in &flattened {
            commands.push(KvCommand::HSet {
                key: trace_key.clone(),
                field: record.in_msg_hash.clone(),
                value: serde_json::to_vec(record)?,
            });
            commands.push(KvCommand::ZAdd {
                key: record.account.clone(),
                member: format!("{}:{}", trace_key, record.in_msg_hash),
                score: record.lt,
            });
        }

        for (account, interfaces) in &trace.interfaces {
            commands.push(KvCommand::HSet {
                key: trace_key.clone(),
                field: account.clone(),
                value: serde_json::to_vec(interfaces)?,
            });
        }

        commands.push(KvCommand::Publish {
            channel: NEW_TRACE_CHANNEL.to_string(),
            payload: trace_key.clone(),
        });

        log::debug!(
            target: TRACE_TARGET,
            "inserting trace {} with {} nodes", trace_key, flattened.len()
        );
        self.kv.exec(commands).await
    }

    /// Depth-first walk over the stored tree following out-message references.
    async fn delete_stored_subtree(
        &self,
        trace_key: &str,
        root_field: String,
        commands: &mut Vec<KvCommand>,
    ) -> Result<()> {
        let mut stack = vec![root_field];
        while let Some(field) = stack.pop() {
            let stored = match self.kv.hget(trace_key, &field).await? {
                Some(stored) => stored,
                None => continue,
            };
            let record: TraceNodeRecord = serde_json::from_slice(&stored)?;
            for out_msg_hash in record.out_msg_hashes {
                stack.push(out_msg_hash);
            }
            commands.push(KvCommand::HDel {
                key: trace_key.to_string(),
                field,
            });
            commands.push(KvCommand::ZRem {
                key: record.account.clone(),
                member: format!("{}:{}", trace_key, record.in_msg_hash),
            });
        }
        Ok(())
    }
}

fn node_record(node: &TraceNode) -> Result<TraceNodeRecord> {
    Ok(TraceNodeRecord {
        in_msg_hash: node.node_id.as_hex_string(),
        transaction_hash: node.transaction_hash.as_hex_string(),
        account: node.account.clone(),
        lt: node.lt,
        emulated: node.emulated,
        out_msg_hashes: node.children.iter().map(|child| child.node_id.as_hex_string()).collect(),
        transaction_boc: base64_encode(write_boc(&node.transaction_root)?),
    })
}
