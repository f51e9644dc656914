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
use crate::{
    stubs::StubKvStore,
    trace::inserter::{TraceInserter, NEW_TRACE_CHANNEL},
};
use ever_block::AccountId;

fn hash(byte: u8) -> UInt256 {
    UInt256::from_slice(&[byte; 32])
}

fn address(byte: u8) -> MsgAddressInt {
    MsgAddressInt::with_standart(None, 0, AccountId::from(hash(byte))).unwrap()
}

fn tx(
    in_msg: u8,
    is_first: bool,
    out_msgs: &[u8],
    lt: u64,
) -> TransactionInfo {
    TransactionInfo {
        account: address(in_msg),
        hash: hash(0xf0 ^ in_msg),
        root: Cell::default(),
        lt,
        in_msg_hash: hash(in_msg),
        is_first,
        initial_msg_hash: None,
        out_msgs: out_msgs
            .iter()
            .map(|byte| OutMsgInfo { hash: hash(*byte), root: Cell::default() })
            .collect(),
    }
}

#[test]
fn test_trace_id_assignment_within_block() {
    let emulator = TraceEmulator::new(20);
    let mut txs = vec![
        tx(0x01, true, &[0x02], 10),
        tx(0x02, false, &[0x03], 20),
        tx(0x09, false, &[], 30),
    ];
    emulator.assign_trace_ids(&mut txs);

    // the external-in root starts the chain, its consumer inherits it
    assert_eq!(txs[0].initial_msg_hash, Some(hash(0x01)));
    assert_eq!(txs[1].initial_msg_hash, Some(hash(0x01)));
    // no producer and no carryover: the transaction is skipped
    assert_eq!(txs[2].initial_msg_hash, None);
}

#[test]
fn test_trace_id_carries_across_blocks() {
    let emulator = TraceEmulator::new(20);

    let mut first_block = vec![tx(0x01, true, &[0x02], 10)];
    emulator.assign_trace_ids(&mut first_block);
    assert_eq!(first_block[0].initial_msg_hash, Some(hash(0x01)));

    // the consumer of out message 0x02 arrives only in the next block
    let mut second_block = vec![tx(0x02, false, &[0x04], 20)];
    emulator.assign_trace_ids(&mut second_block);
    assert_eq!(second_block[0].initial_msg_hash, Some(hash(0x01)));

    // and the chain keeps extending through its own out messages
    let mut third_block = vec![tx(0x04, false, &[], 30)];
    emulator.assign_trace_ids(&mut third_block);
    assert_eq!(third_block[0].initial_msg_hash, Some(hash(0x01)));
}

fn raw_account(byte: u8) -> String {
    format!("0:{}", format!("{:02x}", byte).repeat(32))
}

fn node(id: u8, emulated: bool, children: Vec<TraceNode>) -> TraceNode {
    TraceNode {
        transaction_root: Cell::default(),
        transaction_hash: hash(0xf0 ^ id),
        node_id: hash(id),
        account: raw_account(id),
        lt: id as u64 * 10,
        emulated,
        children,
    }
}

#[test]
fn test_trace_node_counts() {
    let tree = node(1, false, vec![
        node(2, false, vec![node(4, true, vec![])]),
        node(3, true, vec![]),
    ]);
    assert_eq!(tree.transactions_count(), 4);
    assert_eq!(tree.depth(), 3);
}

fn trace_with(root: TraceNode) -> Trace {
    Trace {
        id: hash(0x01),
        root,
        emulated_accounts: HashMap::new(),
        interfaces: HashMap::new(),
    }
}

#[tokio::test]
async fn test_reemulation_replaces_stored_subtree() {
    let kv = Arc::new(StubKvStore::default());
    let inserter = TraceInserter::new(kv.clone());

    // first pass: the observed root plus one emulated continuation
    let first = trace_with(node(0x01, false, vec![node(0x02, true, vec![])]));
    inserter.insert(&first).await.unwrap();
    {
        let state = kv.state.lock().unwrap();
        let fields = state.hashes.get(&hash(0x01).as_hex_string()).unwrap();
        assert_eq!(fields.len(), 2);
    }

    // second pass: the continuation was observed on chain and spawned its own
    // emulated child, the old hypothetical subtree must go away
    let second = trace_with(node(0x01, false, vec![
        node(0x02, false, vec![node(0x03, true, vec![])]),
    ]));
    inserter.insert(&second).await.unwrap();

    let state = kv.state.lock().unwrap();
    let fields = state.hashes.get(&hash(0x01).as_hex_string()).unwrap();
    assert_eq!(fields.len(), 3);
    assert!(fields.contains_key(&hash(0x01).as_hex_string()));
    assert!(fields.contains_key(&hash(0x02).as_hex_string()));
    assert!(fields.contains_key(&hash(0x03).as_hex_string()));

    // both passes announced the trace
    assert_eq!(
        state.published,
        vec![
            (NEW_TRACE_CHANNEL.to_string(), hash(0x01).as_hex_string()),
            (NEW_TRACE_CHANNEL.to_string(), hash(0x01).as_hex_string()),
        ]
    );
}

#[tokio::test]
async fn test_insert_scores_nodes_by_lt() {
    let kv = Arc::new(StubKvStore::default());
    let inserter = TraceInserter::new(kv.clone());

    let trace = trace_with(node(0x01, false, vec![node(0x02, true, vec![])]));
    inserter.insert(&trace).await.unwrap();

    let state = kv.state.lock().unwrap();
    let root_account = raw_account(0x01);
    let member = format!("{}:{}", hash(0x01).as_hex_string(), hash(0x01).as_hex_string());
    assert_eq!(state.zsets.get(&root_account).unwrap().get(&member), Some(&10));
}
