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

pub mod inserter;

use crate::{
    indexer_err,
    interfaces::Detectors,
    smc::to_raw_address,
    types::{entities::Entity, MasterchainBlockDataState, ShardBlockData},
};

use ever_block::{
    Account, Cell, Deserializable, HashmapAugType, HashmapE, Message, MsgAddressInt, Result,
    Serializable, ShardAccounts, ShardIdent, ShardStateUnsplit, Transaction, TransactionDescr,
    UInt256,
};
use ever_executor::{
    BlockchainConfig, ExecuteParams, OrdinaryTransactionExecutor, TransactionExecutor,
};
use futures::future::BoxFuture;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::AtomicU64,
        Arc, Mutex, Weak,
    },
    time::Instant,
};
use tokio::sync::{mpsc, oneshot};

#[cfg(test)]
#[path = "../tests/test_trace.rs"]
mod tests;

pub const TRACE_TARGET: &str = "trace";

pub type TraceId = UInt256;

/// One node of a causal transaction tree. Children are exclusively owned.
#[derive(Clone, Debug)]
pub struct TraceNode {
    pub transaction_root: Cell,
    pub transaction_hash: UInt256,
    /// In-message hash, the node's identity within a trace.
    pub node_id: UInt256,
    pub account: String,
    pub lt: u64,
    pub emulated: bool,
    pub children: Vec<TraceNode>,
}

impl TraceNode {
    pub fn transactions_count(&self) -> usize {
        1 + self.children.iter().map(TraceNode::transactions_count).sum::<usize>()
    }

    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(TraceNode::depth).max().unwrap_or(0)
    }
}

/// A causal tree rooted at the first observed transaction of a cross-contract
/// chain. The id is the hash of the chain's initial external-in message.
#[derive(Clone, Debug)]
pub struct Trace {
    pub id: TraceId,
    pub root: TraceNode,
    /// Final emulated account roots, raw address keyed.
    pub emulated_accounts: HashMap<String, Cell>,
    /// Interfaces detected on emulated accounts, raw address keyed.
    pub interfaces: HashMap<String, Vec<Entity>>,
}

impl Trace {
    pub fn transactions_count(&self) -> usize {
        self.root.transactions_count()
    }

    pub fn depth(&self) -> usize {
        self.root.depth()
    }
}

#[derive(Clone)]
struct OutMsgInfo {
    hash: UInt256,
    root: Cell,
}

#[derive(Clone)]
struct TransactionInfo {
    account: MsgAddressInt,
    hash: UInt256,
    root: Cell,
    lt: u64,
    in_msg_hash: UInt256,
    is_first: bool,
    initial_msg_hash: Option<UInt256>,
    out_msgs: Vec<OutMsgInfo>,
}

/// Extends partial transaction trees observed in masterchain blocks by VM
/// emulation of the messages whose consumers are not on chain yet.
pub struct TraceEmulator {
    depth_limit: u32,
    /// Out-message hash to trace id, carried forward from previous blocks.
    interblock_trace_ids: Mutex<HashMap<UInt256, UInt256>>,
}

impl TraceEmulator {
    pub fn new(depth_limit: u32) -> Self {
        TraceEmulator {
            depth_limit,
            interblock_trace_ids: Mutex::new(HashMap::new()),
        }
    }

    /// Produces one trace per cross-contract chain starting or continuing in
    /// this masterchain block.
    pub async fn process_block(&self, mc_data: &MasterchainBlockDataState) -> Result<Vec<Trace>> {
        let started = Instant::now();

        let mut txs = Vec::new();
        for shard_block in &mc_data.shard_blocks_diff {
            parse_block_transactions(shard_block, &mut txs)?;
        }
        txs.sort_by_key(|tx| tx.lt);
        self.assign_trace_ids(&mut txs);

        let tx_by_in_msg_hash: HashMap<UInt256, TransactionInfo> =
            txs.iter().map(|tx| (tx.in_msg_hash.clone(), tx.clone())).collect();

        let mut seen_roots = HashSet::new();
        let mut traces = Vec::new();
        for tx in &txs {
            let trace_id = match &tx.initial_msg_hash {
                Some(hash) => hash.clone(),
                None => continue,
            };
            if !seen_roots.insert(trace_id.clone()) {
                continue;
            }
            let tail = TraceTail::new(mc_data, self.depth_limit)?;
            match tail.emulate(tx, &tx_by_in_msg_hash).await {
                Ok(mut trace) => {
                    trace.id = trace_id;
                    log::info!(
                        target: TRACE_TARGET,
                        "emulated trace {:x}: {} transactions, {} depth",
                        trace.id, trace.transactions_count(), trace.depth()
                    );
                    traces.push(trace);
                }
                Err(err) => log::error!(
                    target: TRACE_TARGET,
                    "failed to emulate trace {:x} from tx {:x}: {}", trace_id, tx.hash, err
                ),
            }
        }

        log::info!(
            target: TRACE_TARGET,
            "finished emulating mc block: {} traces in {} ms",
            traces.len(), started.elapsed().as_millis()
        );
        Ok(traces)
    }

    /// Chain identification: external-in roots start a chain, everything else
    /// inherits from the in-block producer or the interblock carryover.
    fn assign_trace_ids(&self, txs: &mut [TransactionInfo]) {
        let mut interblock = self.interblock_trace_ids.lock().expect("trace ids lock");
        let mut local_out: HashMap<UInt256, UInt256> = HashMap::new();
        for tx in txs.iter_mut() {
            if tx.is_first {
                tx.initial_msg_hash = Some(tx.in_msg_hash.clone());
            } else if let Some(hash) = local_out.get(&tx.in_msg_hash) {
                tx.initial_msg_hash = Some(hash.clone());
            } else if let Some(hash) = interblock.get(&tx.in_msg_hash) {
                tx.initial_msg_hash = Some(hash.clone());
            } else {
                log::warn!(
                    target: TRACE_TARGET,
                    "couldn't get initial msg hash for tx {:x}, skipping it", tx.hash
                );
                continue;
            }
            if let Some(initial) = &tx.initial_msg_hash {
                for out_msg in &tx.out_msgs {
                    local_out.insert(out_msg.hash.clone(), initial.clone());
                    interblock.insert(out_msg.hash.clone(), initial.clone());
                }
            }
        }
    }
}

/// Follows the chain tip, emulating and inserting traces for every new
/// masterchain block. Failed heights are retried on the next pass.
pub async fn run_trace_emulation(
    chain_reader: Arc<dyn crate::engine_traits::ChainReader>,
    emulator: Arc<TraceEmulator>,
    detectors: Arc<Detectors>,
    inserter: Arc<inserter::TraceInserter>,
    stop: Arc<std::sync::atomic::AtomicBool>,
) -> Result<()> {
    use std::sync::atomic::Ordering;

    let mut next_seqno = chain_reader.get_last_mc_seqno().await? + 1;
    log::info!(target: TRACE_TARGET, "trace emulation starts at seqno {}", next_seqno);
    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }
        let tip = match chain_reader.get_last_mc_seqno().await {
            Ok(tip) => tip,
            Err(err) => {
                log::warn!(target: TRACE_TARGET, "failed to refresh chain tip: {}", err);
                futures_timer::Delay::new(std::time::Duration::from_millis(250)).await;
                continue;
            }
        };
        while next_seqno <= tip && !stop.load(Ordering::Relaxed) {
            if let Err(err) = emulate_one_block(
                &chain_reader, &emulator, &detectors, &inserter, next_seqno,
            )
            .await
            {
                log::error!(
                    target: TRACE_TARGET,
                    "failed to emulate mc seqno {}: {}", next_seqno, err
                );
                break;
            }
            next_seqno += 1;
        }
        futures_timer::Delay::new(std::time::Duration::from_millis(250)).await;
    }
}

async fn emulate_one_block(
    chain_reader: &Arc<dyn crate::engine_traits::ChainReader>,
    emulator: &Arc<TraceEmulator>,
    detectors: &Arc<Detectors>,
    inserter: &Arc<inserter::TraceInserter>,
    mc_seqno: u32,
) -> Result<()> {
    let data = chain_reader.fetch_mc_block(mc_seqno).await?;
    let traces = emulator.process_block(&data).await?;
    for mut trace in traces {
        if let Err(err) = detect_trace_interfaces(&mut trace, detectors).await {
            log::error!(
                target: TRACE_TARGET,
                "failed to detect interfaces on trace {:x}: {}", trace.id, err
            );
        }
        inserter.insert(&trace).await?;
    }
    Ok(())
}

/// Runs C3 on every emulated account of a finished trace.
pub async fn detect_trace_interfaces(trace: &mut Trace, detectors: &Detectors) -> Result<()> {
    for (raw_address, account_root) in &trace.emulated_accounts {
        let account = Account::construct_from_cell(account_root.clone())?;
        let (code, data) = match (account.get_code(), account.get_data()) {
            (Some(code), Some(data)) => (code, data),
            _ => continue,
        };
        let address = crate::smc::parse_raw_address(raw_address)?;
        let entities = detectors
            .detect_all(&address, &code, &data, account.last_tr_time().unwrap_or_default())
            .await;
        if !entities.is_empty() {
            trace.interfaces.insert(raw_address.clone(), entities);
        }
    }
    Ok(())
}

struct EmulationRequest {
    msg_root: Cell,
    destination: MsgAddressInt,
    depth: u32,
    reply: oneshot::Sender<Result<TraceNode>>,
}

struct EmulatedAccounts {
    /// Raw address to the account root as mutated by emulation so far.
    accounts: HashMap<String, Cell>,
    workers: HashMap<String, mpsc::UnboundedSender<EmulationRequest>>,
}

/// Per-trace emulation state: shard states for cold account lookups and the
/// shared emulated-account map. Messages to one destination are serialized by
/// that destination's worker, so causally dependent messages observe each
/// other's effects.
struct TraceTailInner {
    config: Arc<BlockchainConfig>,
    libraries: HashmapE,
    block_utime: u32,
    block_lt: u64,
    shard_states: Vec<(ShardIdent, ShardAccounts)>,
    emulated_accounts: Mutex<EmulatedAccounts>,
    depth_limit: u32,
}

struct TraceTail {
    inner: Arc<TraceTailInner>,
}

enum PendingChild {
    Observed(PendingNode),
    Emulated(oneshot::Receiver<Result<TraceNode>>),
}

struct PendingNode {
    node: TraceNode,
    children: Vec<PendingChild>,
}

impl TraceTail {
    fn new(mc_data: &MasterchainBlockDataState, depth_limit: u32) -> Result<Self> {
        let mut shard_states = Vec::new();
        let mut block_utime = 0;
        let mut block_lt = 0;
        for shard_block in &mc_data.shard_blocks {
            if let Some(state_root) = &shard_block.state_root {
                let state = ShardStateUnsplit::construct_from_cell(state_root.clone())?;
                if shard_block.block_id.shard().is_masterchain() {
                    block_utime = state.gen_time();
                    block_lt = state.gen_lt();
                }
                shard_states.push((shard_block.block_id.shard().clone(), state.read_accounts()?));
            }
        }
        Ok(TraceTail {
            inner: Arc::new(TraceTailInner {
                config: mc_data.config.clone(),
                libraries: mc_data.libraries.clone(),
                block_utime,
                block_lt,
                shard_states,
                emulated_accounts: Mutex::new(EmulatedAccounts {
                    accounts: HashMap::new(),
                    workers: HashMap::new(),
                }),
                depth_limit,
            }),
        })
    }

    async fn emulate(
        self,
        root_tx: &TransactionInfo,
        tx_by_in_msg_hash: &HashMap<UInt256, TransactionInfo>,
    ) -> Result<Trace> {
        let pending = self.build_observed(root_tx, tx_by_in_msg_hash)?;
        let root = resolve_pending(pending).await?;
        let emulated_accounts = {
            let guard = self.inner.emulated_accounts.lock().expect("emulated accounts lock");
            guard.accounts.clone()
        };
        Ok(Trace {
            id: UInt256::default(),
            root,
            emulated_accounts,
            interfaces: HashMap::new(),
        })
    }

    /// Walks the observed contiguous subtree; every out message whose consumer
    /// is not in this block goes to the emulation workers.
    fn build_observed(
        &self,
        tx: &TransactionInfo,
        tx_by_in_msg_hash: &HashMap<UInt256, TransactionInfo>,
    ) -> Result<PendingNode> {
        let node = TraceNode {
            transaction_root: tx.root.clone(),
            transaction_hash: tx.hash.clone(),
            node_id: tx.in_msg_hash.clone(),
            account: to_raw_address(&tx.account),
            lt: tx.lt,
            emulated: false,
            children: Vec::new(),
        };
        let mut children = Vec::new();
        for out_msg in &tx.out_msgs {
            let message = Message::construct_from_cell(out_msg.root.clone())?;
            if !message.is_internal() {
                continue;
            }
            let destination = match message.dst() {
                Some(destination) => destination,
                None => {
                    log::error!(
                        target: TRACE_TARGET,
                        "failed to fetch destination address for out msg {:x}", out_msg.hash
                    );
                    continue;
                }
            };
            if let Some(child_tx) = tx_by_in_msg_hash.get(&out_msg.hash) {
                children.push(PendingChild::Observed(
                    self.build_observed(child_tx, tx_by_in_msg_hash)?,
                ));
            } else {
                children.push(PendingChild::Emulated(emulate_message(
                    &self.inner,
                    out_msg.root.clone(),
                    destination,
                    self.inner.depth_limit,
                )));
            }
        }
        Ok(PendingNode { node, children })
    }
}

fn resolve_pending(pending: PendingNode) -> BoxFuture<'static, Result<TraceNode>> {
    Box::pin(async move {
        let mut node = pending.node;
        for child in pending.children {
            match child {
                PendingChild::Observed(sub) => node.children.push(resolve_pending(sub).await?),
                PendingChild::Emulated(receiver) => {
                    let child = receiver
                        .await
                        .map_err(|_| indexer_err!(Vm, "emulation worker dropped its reply"))??;
                    node.children.push(child);
                }
            }
        }
        Ok(node)
    })
}

/// Routes a message to its destination's worker, creating the worker on first
/// contact with that address.
fn emulate_message(
    inner: &Arc<TraceTailInner>,
    msg_root: Cell,
    destination: MsgAddressInt,
    depth: u32,
) -> oneshot::Receiver<Result<TraceNode>> {
    let (reply, receiver) = oneshot::channel();
    if depth == 0 {
        let _ = reply.send(Err(indexer_err!(Vm, "emulation depth limit reached")));
        return receiver;
    }
    let raw = to_raw_address(&destination);
    let sender = {
        let mut guard = inner.emulated_accounts.lock().expect("emulated accounts lock");
        guard
            .workers
            .entry(raw)
            .or_insert_with(|| {
                let (sender, requests) = mpsc::unbounded_channel();
                tokio::spawn(account_worker(Arc::downgrade(inner), requests));
                sender
            })
            .clone()
    };
    let request = EmulationRequest { msg_root, destination, depth, reply };
    if let Err(err) = sender.send(request) {
        let _ = err.0.reply.send(Err(indexer_err!(Vm, "emulation worker is gone")));
    }
    receiver
}

/// Serializes emulation per destination address. The VM run and the account
/// map update happen here; children are resolved off the worker so that chains
/// revisiting this address cannot deadlock it.
async fn account_worker(
    inner: Weak<TraceTailInner>,
    mut requests: mpsc::UnboundedReceiver<EmulationRequest>,
) {
    while let Some(request) = requests.recv().await {
        let strong = match inner.upgrade() {
            Some(strong) => strong,
            None => break,
        };
        let depth = request.depth;
        let reply = request.reply;
        let outcome = tokio::task::block_in_place(|| {
            strong.execute_on_account(&request.msg_root, &request.destination)
        });
        match outcome {
            Err(err) => {
                let _ = reply.send(Err(err));
            }
            Ok((node, out_msgs)) => {
                let inner = inner.clone();
                tokio::spawn(async move {
                    let strong = match inner.upgrade() {
                        Some(strong) => strong,
                        None => return,
                    };
                    let mut children = Vec::new();
                    for (msg_root, destination) in out_msgs {
                        children.push(emulate_message(&strong, msg_root, destination, depth - 1));
                    }
                    drop(strong);
                    let mut node = node;
                    for receiver in children {
                        match receiver.await {
                            Ok(Ok(child)) => node.children.push(child),
                            Ok(Err(err)) => {
                                let _ = reply.send(Err(err));
                                return;
                            }
                            Err(_) => {
                                let _ = reply.send(Err(indexer_err!(
                                    Vm, "emulation worker dropped its reply"
                                )));
                                return;
                            }
                        }
                    }
                    let _ = reply.send(Ok(node));
                });
            }
        }
    }
}

impl TraceTailInner {
    /// Executes one message against the destination's current emulated state,
    /// falling back to the on-chain state for the first contact.
    fn execute_on_account(
        &self,
        msg_root: &Cell,
        destination: &MsgAddressInt,
    ) -> Result<(TraceNode, Vec<(Cell, MsgAddressInt)>)> {
        let message = Message::construct_from_cell(msg_root.clone())?;
        let raw = to_raw_address(destination);

        let mut account_root = {
            let guard = self.emulated_accounts.lock().expect("emulated accounts lock");
            match guard.accounts.get(&raw) {
                Some(root) => root.clone(),
                None => self.load_account_state(destination)?,
            }
        };

        let params = ExecuteParams {
            state_libs: self.libraries.clone(),
            block_unixtime: self.block_utime,
            block_lt: self.block_lt,
            last_tr_lt: Arc::new(AtomicU64::new(self.block_lt)),
            seed_block: UInt256::default(),
            debug: false,
            ..ExecuteParams::default()
        };
        let executor = OrdinaryTransactionExecutor::new((*self.config).clone());
        let transaction = executor
            .execute_with_libs_and_params(Some(&message), &mut account_root, params)
            .map_err(|err| indexer_err!(Vm, "emulation of message to {} failed: {}", raw, err))?;

        {
            let mut guard = self.emulated_accounts.lock().expect("emulated accounts lock");
            guard.accounts.insert(raw.clone(), account_root);
        }

        let transaction_root = transaction.serialize()?;
        let node = TraceNode {
            transaction_hash: transaction_root.repr_hash(),
            transaction_root,
            node_id: msg_root.repr_hash(),
            account: raw,
            lt: transaction.logical_time(),
            emulated: true,
            children: Vec::new(),
        };

        let mut out_msgs = Vec::new();
        transaction.out_msgs.iterate_slices(|slice| {
            let msg_cell = slice.reference(0)?;
            let out_message = Message::construct_from_cell(msg_cell.clone())?;
            if out_message.is_internal() {
                if let Some(destination) = out_message.dst() {
                    out_msgs.push((msg_cell, destination));
                }
            }
            Ok(true)
        })?;
        Ok((node, out_msgs))
    }

    fn load_account_state(&self, address: &MsgAddressInt) -> Result<Cell> {
        let account_id = address.address();
        for (shard, accounts) in &self.shard_states {
            if shard.workchain_id() != address.workchain_id() {
                continue;
            }
            if !shard.is_masterchain() && !shard.contains_account(account_id.clone())? {
                continue;
            }
            if let Some(shard_account) = accounts.account(&account_id)? {
                return Ok(shard_account.account_cell());
            }
        }
        // never seen on chain: emulate against an empty account
        Account::default().serialize()
    }
}

fn parse_block_transactions(
    shard_block: &ShardBlockData,
    txs: &mut Vec<TransactionInfo>,
) -> Result<()> {
    let workchain_id = shard_block.block_id.shard().workchain_id();
    let extra = shard_block.block.read_extra()?;
    extra.read_account_blocks()?.iterate_objects(|account_block| {
        account_block.transactions().iterate_slices(|_, transaction_slice| {
            let cell = transaction_slice.reference(0)?;
            let transaction = Transaction::construct_from_cell(cell.clone())?;
            if !matches!(transaction.read_description()?, TransactionDescr::Ordinary(_)) {
                log::debug!(
                    target: TRACE_TARGET,
                    "skipping non-ordinary transaction {:x}", cell.repr_hash()
                );
                return Ok(true);
            }
            let in_msg_cell = match transaction.in_msg_cell() {
                Some(in_msg_cell) => in_msg_cell,
                None => {
                    log::error!(
                        target: TRACE_TARGET,
                        "ordinary transaction {:x} without in msg, skipping", cell.repr_hash()
                    );
                    return Ok(true);
                }
            };
            let in_msg = Message::construct_from_cell(in_msg_cell.clone())?;

            let mut out_msgs = Vec::new();
            transaction.out_msgs.iterate_slices(|slice| {
                let msg_cell = slice.reference(0)?;
                out_msgs.push(OutMsgInfo { hash: msg_cell.repr_hash(), root: msg_cell });
                Ok(true)
            })?;

            txs.push(TransactionInfo {
                account: MsgAddressInt::with_standart(
                    None,
                    workchain_id as i8,
                    transaction.account_id().clone(),
                )?,
                hash: cell.repr_hash(),
                root: cell,
                lt: transaction.logical_time(),
                in_msg_hash: in_msg_cell.repr_hash(),
                is_first: in_msg.is_inbound_external(),
                initial_msg_hash: None,
                out_msgs,
            });
            Ok(true)
        })?;
        Ok(true)
    })?;
    Ok(())
}
