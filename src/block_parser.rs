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

use crate::{
    smc::to_raw_address,
    types::{
        records::{
            AccountStateRecord, BlockRecord, MessageDirection, MessageRecord, ParsedBlock,
            TransactionRecord,
        },
        MasterchainBlockDataState, ShardBlockData,
    },
};

use ever_block::{
    base64_encode, error, write_boc, AccountBlock, AccountId, AccountStatus, Cell, Deserializable,
    HashmapAugType, Message, MsgAddressInt, Result, ShardAccount, ShardStateUnsplit, Transaction,
    UInt256,
};
use std::collections::{BTreeMap, HashSet};

pub const PARSER_TRACE_TARGET: &str = "parser";

/// Decodes one masterchain height into flat database records. Entities and
/// events are attached later by the enrichment pass.
pub fn parse_block_data_state(
    mc_seq_no: u32,
    data: &MasterchainBlockDataState,
) -> Result<ParsedBlock> {
    let mut parsed = ParsedBlock {
        mc_seq_no,
        ..Default::default()
    };

    let mut changed_accounts: HashSet<(i32, UInt256)> = HashSet::new();
    for shard_block in &data.shard_blocks_diff {
        parse_single_block(mc_seq_no, shard_block, &mut parsed, &mut changed_accounts)?;
    }

    for (workchain_id, account_id) in changed_accounts {
        match find_account_state(data, workchain_id, &account_id)? {
            Some(shard_account) => {
                parsed.account_states.push(parse_account_state(&shard_account)?)
            }
            None => log::warn!(
                target: PARSER_TRACE_TARGET,
                "no post state for account {}:{:x} at mc seqno {}",
                workchain_id, account_id, mc_seq_no
            ),
        }
    }

    log::debug!(
        target: PARSER_TRACE_TARGET,
        "parsed mc seqno {}: {} blocks, {} transactions, {} messages, {} account states",
        mc_seq_no,
        parsed.blocks.len(),
        parsed.transactions.len(),
        parsed.messages.len(),
        parsed.account_states.len()
    );
    Ok(parsed)
}

fn parse_single_block(
    mc_seq_no: u32,
    shard_block: &ShardBlockData,
    parsed: &mut ParsedBlock,
    changed_accounts: &mut HashSet<(i32, UInt256)>,
) -> Result<()> {
    let block_id = &shard_block.block_id;
    let workchain_id = block_id.shard().workchain_id();
    let info = shard_block.block.read_info()?;
    let extra = shard_block.block.read_extra()?;

    // sort transactions by (lt, account) for a stable record order
    let mut transactions = BTreeMap::new();
    extra.read_account_blocks()?.iterate_objects(|account_block: AccountBlock| {
        changed_accounts.insert((
            workchain_id,
            account_block.account_id().clone().get_next_hash()?,
        ));
        account_block.transactions().iterate_slices(|_, transaction_slice| {
            let cell = transaction_slice.reference(0)?;
            let transaction = Transaction::construct_from_cell(cell.clone())?;
            let ordering_key = (transaction.logical_time(), transaction.account_id().clone());
            transactions.insert(ordering_key, (cell, transaction));
            Ok(true)
        })?;
        Ok(true)
    })?;

    parsed.blocks.push(BlockRecord {
        block_id: block_id.to_string(),
        workchain: workchain_id,
        shard: format!("{:016x}", block_id.shard().shard_prefix_with_tag()),
        seq_no: block_id.seq_no(),
        root_hash: block_id.root_hash().as_hex_string(),
        file_hash: block_id.file_hash().as_hex_string(),
        mc_seq_no,
        gen_utime: info.gen_utime().as_u32(),
        start_lt: info.start_lt(),
        end_lt: info.end_lt(),
        tx_count: transactions.len() as u32,
    });

    for (_, (cell, transaction)) in transactions {
        parse_transaction(block_id.to_string(), workchain_id, cell, transaction, parsed)?;
    }
    Ok(())
}

fn parse_transaction(
    block_id: String,
    workchain_id: i32,
    cell: Cell,
    transaction: Transaction,
    parsed: &mut ParsedBlock,
) -> Result<()> {
    let tx_hash = cell.repr_hash().as_hex_string();
    let account = MsgAddressInt::with_standart(
        None,
        workchain_id as i8,
        transaction.account_id().clone(),
    )?;

    let mut in_msg_hash = None;
    if let Some(msg_cell) = transaction.in_msg_cell() {
        let record = parse_message(&msg_cell, tx_hash.clone(), true)?;
        in_msg_hash = Some(record.hash.clone());
        parsed.messages.push(record);
    }

    let mut out_msg_hashes = Vec::new();
    transaction.out_msgs.iterate_slices(|slice| {
        let msg_cell = slice.reference(0)?;
        let record = parse_message(&msg_cell, tx_hash.clone(), false)?;
        out_msg_hashes.push(record.hash.clone());
        parsed.messages.push(record);
        Ok(true)
    })?;

    let descr = transaction.read_description()?;
    parsed.transactions.push(TransactionRecord {
        hash: tx_hash,
        account: to_raw_address(&account),
        lt: transaction.logical_time(),
        now: transaction.now(),
        block_id,
        total_fees: transaction.total_fees().grams.as_u128(),
        aborted: descr.is_aborted(),
        orig_status: account_status_name(&transaction.orig_status).to_string(),
        end_status: account_status_name(&transaction.end_status).to_string(),
        in_msg_hash,
        out_msg_hashes,
        boc: base64_encode(write_boc(&cell)?),
    });
    Ok(())
}

fn parse_message(msg_cell: &Cell, transaction_hash: String, is_inbound: bool) -> Result<MessageRecord> {
    let message = Message::construct_from_cell(msg_cell.clone())?;
    let direction = if message.is_inbound_external() {
        MessageDirection::ExternalIn
    } else if message.is_internal() {
        MessageDirection::Internal
    } else {
        MessageDirection::ExternalOut
    };
    let opcode = message.body().and_then(|mut body| {
        if body.remaining_bits() >= 32 {
            body.get_next_u32().ok()
        } else {
            None
        }
    });
    Ok(MessageRecord {
        hash: msg_cell.repr_hash().as_hex_string(),
        direction,
        source: message.src_ref().map(to_raw_address),
        destination: message.dst().map(|addr| to_raw_address(&addr)),
        value: message.get_value().map(|cc| cc.grams.as_u128()).unwrap_or_default(),
        created_lt: message.at_and_lt().map(|(_, lt)| lt).unwrap_or_default(),
        opcode,
        transaction_hash,
        is_inbound,
        boc: base64_encode(write_boc(msg_cell)?),
    })
}

pub fn parse_account_state(shard_account: &ShardAccount) -> Result<AccountStateRecord> {
    let account = shard_account.read_account()?;
    let address = account
        .get_addr()
        .cloned()
        .ok_or_else(|| error!("account state without an address"))?;
    let code = account.get_code();
    let data = account.get_data();
    Ok(AccountStateRecord {
        address: to_raw_address(&address),
        status: account_status_name(&account.status()).to_string(),
        balance: account.balance().map(|cc| cc.grams.as_u128()).unwrap_or_default(),
        last_trans_lt: shard_account.last_trans_lt(),
        last_trans_hash: shard_account.last_trans_hash().as_hex_string(),
        code_hash: code.as_ref().map(|cell| cell.repr_hash().as_hex_string()),
        data_hash: data.as_ref().map(|cell| cell.repr_hash().as_hex_string()),
        code_boc: match &code {
            Some(cell) => Some(base64_encode(write_boc(cell)?)),
            None => None,
        },
        data_boc: match &data {
            Some(cell) => Some(base64_encode(write_boc(cell)?)),
            None => None,
        },
    })
}

fn find_account_state(
    data: &MasterchainBlockDataState,
    workchain_id: i32,
    account_id: &UInt256,
) -> Result<Option<ShardAccount>> {
    for shard_block in &data.shard_blocks {
        let shard = shard_block.block_id.shard();
        if shard.workchain_id() != workchain_id {
            continue;
        }
        if !shard.is_masterchain() && !shard.contains_account(AccountId::from(account_id.clone()))? {
            continue;
        }
        let state_root = match &shard_block.state_root {
            Some(root) => root.clone(),
            None => continue,
        };
        let state = ShardStateUnsplit::construct_from_cell(state_root)?;
        let accounts = state.read_accounts()?;
        return accounts.account(&AccountId::from(account_id.clone()));
    }
    Ok(None)
}

fn account_status_name(status: &AccountStatus) -> &'static str {
    match status {
        AccountStatus::AccStateUninit => "uninit",
        AccountStatus::AccStateFrozen => "frozen",
        AccountStatus::AccStateActive => "active",
        AccountStatus::AccStateNonexist => "nonexist",
    }
}
