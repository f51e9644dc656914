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
    engine_traits::{ChainReader, InsertManager},
    event_processor::EventProcessor,
    interfaces::Detectors,
    smc::SmcExecutor,
    stubs::StubInsertManager,
    types::{
        entities::Entity,
        records::AccountStateRecord,
    },
};
use ever_block::{HashmapE, ShardAccount, UInt256};
use ever_executor::BlockchainConfig;
use std::{
    collections::BTreeSet,
    sync::{atomic::AtomicU32, Mutex},
};
use tokio::sync::oneshot;

fn empty_data_state() -> MasterchainBlockDataState {
    MasterchainBlockDataState {
        shard_blocks: Vec::new(),
        shard_blocks_diff: Vec::new(),
        config: Arc::new(BlockchainConfig::default()),
        libraries: HashmapE::with_bit_len(256),
    }
}

#[derive(Default)]
struct TestChainReader {
    tip: AtomicU32,
    fetched: Mutex<BTreeSet<u32>>,
}

#[async_trait::async_trait]
impl ChainReader for TestChainReader {
    async fn get_last_mc_seqno(&self) -> Result<u32> {
        Ok(self.tip.load(Ordering::Relaxed))
    }

    async fn fetch_mc_block(&self, mc_seqno: u32) -> Result<MasterchainBlockDataState> {
        self.fetched.lock().unwrap().insert(mc_seqno);
        Ok(empty_data_state())
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

/// Writer double with adjustable queue depth and optionally held completions.
#[derive(Default)]
struct TestInsertManager {
    existing: Mutex<BTreeSet<u32>>,
    status: Mutex<QueueStatus>,
    hold_completions: bool,
    held: Mutex<Vec<oneshot::Sender<Result<()>>>>,
}

#[async_trait::async_trait]
impl InsertManager for TestInsertManager {
    async fn get_existing_seqnos(&self) -> Result<Vec<u32>> {
        Ok(self.existing.lock().unwrap().iter().copied().collect())
    }

    async fn insert(
        &self,
        mc_seq_no: u32,
        _block: ParsedBlock,
    ) -> Result<(QueueStatus, crate::engine_traits::InsertedReceiver)> {
        let (sender, receiver) = oneshot::channel();
        if self.hold_completions {
            self.held.lock().unwrap().push(sender);
        } else {
            self.existing.lock().unwrap().insert(mc_seq_no);
            let _ = sender.send(Ok(()));
        }
        Ok((*self.status.lock().unwrap(), receiver))
    }

    async fn get_insert_queue_status(&self) -> Result<QueueStatus> {
        Ok(*self.status.lock().unwrap())
    }

    async fn upsert_entity(&self, _entity: Entity) -> Result<()> {
        Ok(())
    }

    async fn get_entity(&self, raw_address: &str) -> Result<Entity> {
        Err(crate::indexer_err!(NotFound, "no entity for {}", raw_address))
    }

    async fn insert_account_states(&self, _states: Vec<AccountStateRecord>) -> Result<()> {
        Ok(())
    }

    async fn load_scan_checkpoint(&self) -> Result<Option<UInt256>> {
        Ok(None)
    }

    async fn store_scan_checkpoint(&self, _cur_addr: &UInt256) -> Result<()> {
        Ok(())
    }
}

fn make_event_processor(insert_manager: Arc<dyn InsertManager>) -> Arc<EventProcessor> {
    let detectors = Arc::new(Detectors::new(
        Arc::new(SmcExecutor::new(0, 1_000_000)),
        insert_manager,
        1024,
    ));
    Arc::new(EventProcessor::new(detectors))
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        futures_timer::Delay::new(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_gap_fill_dispatches_missing_seqnos() {
    let reader = Arc::new(TestChainReader::default());
    reader.tip.store(7, Ordering::Relaxed);
    let insert_manager = Arc::new(TestInsertManager::default());
    insert_manager.existing.lock().unwrap().extend([1, 2, 4, 5]);

    let scheduler = IndexScheduler::new(
        reader.clone(),
        insert_manager.clone(),
        make_event_processor(insert_manager.clone()),
        SchedulerConfig::default(),
        None,
    );
    let stop = Arc::new(AtomicBool::new(false));
    let handle = tokio::spawn(scheduler.run_indexing(stop.clone()));

    wait_until(
        || insert_manager.existing.lock().unwrap().len() == 7,
        "all gaps to be indexed",
    )
    .await;
    stop.store(true, Ordering::Relaxed);

    let fetched = reader.fetched.lock().unwrap().clone();
    assert_eq!(fetched, BTreeSet::from([3, 6, 7]));
    assert_eq!(
        insert_manager.existing.lock().unwrap().clone(),
        BTreeSet::from([1, 2, 3, 4, 5, 6, 7])
    );
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_max_active_tasks_bounds_in_flight_seqnos() {
    let reader = Arc::new(TestChainReader::default());
    reader.tip.store(10, Ordering::Relaxed);
    let insert_manager = Arc::new(TestInsertManager {
        hold_completions: true,
        ..Default::default()
    });

    let config = SchedulerConfig {
        max_active_tasks: 2,
        ..Default::default()
    };
    let scheduler = IndexScheduler::new(
        reader.clone(),
        insert_manager.clone(),
        make_event_processor(insert_manager.clone()),
        config,
        None,
    );
    let stop = Arc::new(AtomicBool::new(false));
    tokio::spawn(scheduler.run_indexing(stop.clone()));

    wait_until(
        || reader.fetched.lock().unwrap().len() == 2,
        "the first two seqnos to start",
    )
    .await;
    // no completions arrive, so nothing beyond the cap may start
    futures_timer::Delay::new(Duration::from_millis(800)).await;
    assert_eq!(reader.fetched.lock().unwrap().clone(), BTreeSet::from([1, 2]));
    stop.store(true, Ordering::Relaxed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_backpressure_holds_admission_until_queue_drains() {
    let reader = Arc::new(TestChainReader::default());
    reader.tip.store(3, Ordering::Relaxed);
    let insert_manager = Arc::new(TestInsertManager::default());
    *insert_manager.status.lock().unwrap() = QueueStatus::with_counts(0, 0, 1_000_000, 0);

    let scheduler = IndexScheduler::new(
        reader.clone(),
        insert_manager.clone(),
        make_event_processor(insert_manager.clone()),
        SchedulerConfig::default(),
        None,
    );
    let stop = Arc::new(AtomicBool::new(false));
    tokio::spawn(scheduler.run_indexing(stop.clone()));

    // the reported depth exceeds max_queue_txs, nothing may be dispatched
    futures_timer::Delay::new(Duration::from_millis(800)).await;
    assert!(reader.fetched.lock().unwrap().is_empty());

    *insert_manager.status.lock().unwrap() = QueueStatus::default();
    wait_until(
        || insert_manager.existing.lock().unwrap().len() == 3,
        "the queue to drain and seqnos to index",
    )
    .await;
    stop.store(true, Ordering::Relaxed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lower_bound_skips_older_seqnos() {
    let reader = Arc::new(TestChainReader::default());
    reader.tip.store(12, Ordering::Relaxed);
    let insert_manager = Arc::new(TestInsertManager::default());

    let scheduler = IndexScheduler::new(
        reader.clone(),
        insert_manager.clone(),
        make_event_processor(insert_manager.clone()),
        SchedulerConfig::default(),
        Some(10),
    );
    let stop = Arc::new(AtomicBool::new(false));
    tokio::spawn(scheduler.run_indexing(stop.clone()));

    wait_until(
        || insert_manager.existing.lock().unwrap().len() == 3,
        "seqnos from the lower bound to be indexed",
    )
    .await;
    stop.store(true, Ordering::Relaxed);

    assert_eq!(reader.fetched.lock().unwrap().clone(), BTreeSet::from([10, 11, 12]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_seqno_is_retried_until_done() {
    struct FlakyReader {
        inner: TestChainReader,
        failures_left: Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl ChainReader for FlakyReader {
        async fn get_last_mc_seqno(&self) -> Result<u32> {
            self.inner.get_last_mc_seqno().await
        }

        async fn fetch_mc_block(&self, mc_seqno: u32) -> Result<MasterchainBlockDataState> {
            {
                let mut failures_left = self.failures_left.lock().unwrap();
                if *failures_left > 0 {
                    *failures_left -= 1;
                    return Err(crate::indexer_err!(Db, "transient fetch failure"));
                }
            }
            self.inner.fetch_mc_block(mc_seqno).await
        }

        async fn fetch_account_states(
            &self,
            mc_seqno: u32,
            cursor: Option<UInt256>,
            batch_size: usize,
        ) -> Result<(Vec<(UInt256, ShardAccount)>, Option<UInt256>)> {
            self.inner.fetch_account_states(mc_seqno, cursor, batch_size).await
        }
    }

    let reader = Arc::new(FlakyReader {
        inner: TestChainReader::default(),
        failures_left: Mutex::new(2),
    });
    reader.inner.tip.store(1, Ordering::Relaxed);
    let insert_manager = Arc::new(TestInsertManager::default());

    let scheduler = IndexScheduler::new(
        reader.clone(),
        insert_manager.clone(),
        make_event_processor(insert_manager.clone()),
        SchedulerConfig::default(),
        None,
    );
    let stop = Arc::new(AtomicBool::new(false));
    tokio::spawn(scheduler.run_indexing(stop.clone()));

    wait_until(
        || insert_manager.existing.lock().unwrap().contains(&1),
        "the flaky seqno to be retried to completion",
    )
    .await;
    stop.store(true, Ordering::Relaxed);
    assert_eq!(*reader.failures_left.lock().unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stub_insert_manager_round_trip() {
    // the in-memory stub is itself part of the external contract
    let stub = StubInsertManager::default();
    let (status, receiver) = stub.insert(5, ParsedBlock::default()).await.unwrap();
    assert_eq!(status, QueueStatus::default());
    receiver.await.unwrap().unwrap();
    assert_eq!(stub.get_existing_seqnos().await.unwrap(), vec![5]);
}
