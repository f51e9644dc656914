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

use super::*;
use crate::types::entities::{JettonTransfer, JettonWalletData};
use pretty_assertions::assert_eq;

fn sample_block() -> ParsedBlock {
    ParsedBlock {
        mc_seq_no: 42,
        blocks: vec![BlockRecord {
            block_id: "(-1:8000000000000000, 42)".to_string(),
            workchain: -1,
            shard: "8000000000000000".to_string(),
            seq_no: 42,
            root_hash: "aa".repeat(32),
            file_hash: "bb".repeat(32),
            mc_seq_no: 42,
            gen_utime: 1700000000,
            start_lt: 1000,
            end_lt: 1010,
            tx_count: 2,
        }],
        transactions: vec![TransactionRecord {
            hash: "cc".repeat(32),
            account: format!("-1:{}", "11".repeat(32)),
            lt: 1001,
            now: 1700000001,
            block_id: "(-1:8000000000000000, 42)".to_string(),
            total_fees: 1_000_000,
            aborted: false,
            orig_status: "active".to_string(),
            end_status: "active".to_string(),
            in_msg_hash: Some("dd".repeat(32)),
            out_msg_hashes: vec!["ee".repeat(32)],
            boc: "te6ccgEBAQEAAgAAAA==".to_string(),
        }],
        messages: vec![MessageRecord {
            hash: "dd".repeat(32),
            direction: MessageDirection::Internal,
            source: Some(format!("0:{}", "22".repeat(32))),
            destination: Some(format!("-1:{}", "11".repeat(32))),
            value: 5_000_000_000,
            created_lt: 1000,
            opcode: Some(0x0f8a7ea5),
            transaction_hash: "cc".repeat(32),
            is_inbound: true,
            boc: "te6ccgEBAQEAAgAAAA==".to_string(),
        }],
        account_states: vec![AccountStateRecord {
            address: format!("-1:{}", "11".repeat(32)),
            status: "active".to_string(),
            balance: 10_000_000_000,
            last_trans_lt: 1001,
            last_trans_hash: "cc".repeat(32),
            code_hash: Some("ff".repeat(32)),
            data_hash: Some("ab".repeat(32)),
            code_boc: Some("te6ccgEBAQEAAgAAAA==".to_string()),
            data_boc: Some("te6ccgEBAQEAAgAAAA==".to_string()),
        }],
        entities: vec![Entity::JettonWallet(JettonWalletData {
            address: format!("0:{}", "33".repeat(32)),
            balance: 100,
            owner: format!("0:{}", "44".repeat(32)),
            jetton: format!("0:{}", "55".repeat(32)),
            last_transaction_lt: 900,
            code_hash: "ff".repeat(32),
            data_hash: "ab".repeat(32),
        })],
        events: vec![TokenEvent::JettonTransfer(JettonTransfer {
            transaction_hash: "cc".repeat(32),
            query_id: 7,
            source: format!("0:{}", "33".repeat(32)),
            amount: 100,
            destination: format!("0:{}", "44".repeat(32)),
            response_destination: None,
            custom_payload_boc: None,
            forward_ton_amount: 0,
            forward_payload_boc: None,
        })],
    }
}

#[test]
fn test_parsed_block_serialization_round_trip() {
    let block = sample_block();
    let serialized = serde_json::to_string(&block).unwrap();
    let reparsed: ParsedBlock = serde_json::from_str(&serialized).unwrap();
    assert_eq!(block, reparsed);
}

#[test]
fn test_queue_contribution_counts_records() {
    let block = sample_block();
    let contribution = block.queue_contribution();
    assert_eq!(contribution, QueueStatus::with_counts(1, 1, 1, 1));
}

#[test]
fn test_queue_status_arithmetic() {
    let mut status = QueueStatus::with_counts(1, 2, 3, 4);
    status += QueueStatus::with_counts(1, 1, 1, 1);
    assert_eq!(status, QueueStatus::with_counts(2, 3, 4, 5));
    status -= QueueStatus::with_counts(5, 1, 1, 1);
    assert_eq!(status.mc_blocks, 0);

    let limits = QueueStatus::with_counts(10, 10, 10, 10);
    assert!(!status.exceeds_any(&limits));
    assert!(QueueStatus::with_counts(11, 0, 0, 0).exceeds_any(&limits));
}
