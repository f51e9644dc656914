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
    block_parser::parse_block_data_state,
    config::SchedulerConfig,
    engine_traits::{ChainReader, InsertManager, InsertedReceiver},
    event_processor::EventProcessor,
    types::{records::ParsedBlock, MasterchainBlockDataState, QueueStatus},
};

use ever_block::Result;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::mpsc;

#[cfg(test)]
#[path = "tests/test_scheduler.rs"]
mod tests;

pub const SCHEDULER_TRACE_TARGET: &str = "scheduler";

const ALARM_PERIOD: Duration = Duration::from_millis(250);
const RETRY_INITIAL: Duration = Duration::from_millis(200);
const RETRY_CAP: Duration = Duration::from_secs(60);
const TPS_EMA_ALPHA: f64 = 0.1;
const CONTRIBUTION_EMA_ALPHA: f64 = 0.2;
const PROGRESS_LOG_ALARMS: u32 = 40;

enum SeqnoState {
    /// Admitted for processing but not started.
    Queued,
    /// Failed, waiting out its retry delay.
    BackingOff,
    Fetching,
    Parsing,
    Detecting,
    /// Fully processed, held back by queue caps.
    AwaitingAdmission(Box<ParsedBlock>),
    Inserting,
}

impl SeqnoState {
    fn is_in_flight(&self) -> bool {
        matches!(
            self,
            SeqnoState::Fetching
                | SeqnoState::Parsing
                | SeqnoState::Detecting
                | SeqnoState::AwaitingAdmission(_)
                | SeqnoState::Inserting
        )
    }
}

struct SeqnoTask {
    state: SeqnoState,
    backoff: Duration,
    attempts: u32,
}

enum SchedulerMsg {
    Alarm,
    GotLastKnownSeqno(u32),
    GotQueueStatus(QueueStatus),
    SeqnoFetched(u32, Result<MasterchainBlockDataState>),
    SeqnoParsed(u32, Result<ParsedBlock>),
    SeqnoProcessed(u32, Result<ParsedBlock>),
    SeqnoQueuedToInsert(u32, Result<(QueueStatus, InsertedReceiver)>),
    SeqnoInserted(u32, Result<()>),
    RetryReady(u32),
}

/// Drives the gap-free progression over masterchain seqnos. All of its state
/// is owned by the single task inside `run_indexing`; concurrent pipeline
/// stages report back through the message channel only.
pub struct IndexScheduler {
    chain_reader: Arc<dyn ChainReader>,
    insert_manager: Arc<dyn InsertManager>,
    event_processor: Arc<EventProcessor>,
    config: SchedulerConfig,
    from_seqno: Option<u32>,

    tasks: BTreeMap<u32, SeqnoTask>,
    existing: std::collections::BTreeSet<u32>,
    last_known_seqno: u32,
    last_indexed_seqno: u32,
    cur_queue_status: QueueStatus,
    queue_limits: QueueStatus,

    // rolling estimate of one seqno's queue contribution
    avg_contribution: [f64; 4],
    avg_tps: f64,
    done_count: u64,
    last_done_count: u64,
    alarms: u32,

    sender: mpsc::UnboundedSender<SchedulerMsg>,
    receiver: mpsc::UnboundedReceiver<SchedulerMsg>,
}

impl IndexScheduler {
    pub fn new(
        chain_reader: Arc<dyn ChainReader>,
        insert_manager: Arc<dyn InsertManager>,
        event_processor: Arc<EventProcessor>,
        config: SchedulerConfig,
        from_seqno: Option<u32>,
    ) -> Self {
        let queue_limits = QueueStatus::with_counts(
            config.max_queue_mc_blocks,
            config.max_queue_blocks,
            config.max_queue_txs,
            config.max_queue_msgs,
        );
        let (sender, receiver) = mpsc::unbounded_channel();
        IndexScheduler {
            chain_reader,
            insert_manager,
            event_processor,
            config,
            from_seqno,
            tasks: BTreeMap::new(),
            existing: Default::default(),
            last_known_seqno: 0,
            last_indexed_seqno: 0,
            cur_queue_status: QueueStatus::default(),
            queue_limits,
            avg_contribution: [0.0; 4],
            avg_tps: 0.0,
            done_count: 0,
            last_done_count: 0,
            alarms: 0,
            sender,
            receiver,
        }
    }

    /// The long-running indexing loop. Returns after `stop` is raised and the
    /// loop has observed it on an alarm tick.
    pub async fn run_indexing(mut self, stop: Arc<AtomicBool>) -> Result<()> {
        let (existing, last_known, queue_status) = futures::join!(
            self.insert_manager.get_existing_seqnos(),
            self.chain_reader.get_last_mc_seqno(),
            self.insert_manager.get_insert_queue_status()
        );
        let existing = existing?;
        self.last_known_seqno = last_known?;
        // the first scheduling pass must already see the real downstream depth
        self.cur_queue_status = queue_status?;
        self.existing = existing.into_iter().collect();

        self.last_indexed_seqno = self.from_seqno.unwrap_or(1).saturating_sub(1);
        self.advance_indexed_prefix();

        log::info!(
            target: SCHEDULER_TRACE_TARGET,
            "starting indexing from seqno {} up to known tip {}, {} already indexed",
            self.last_indexed_seqno + 1, self.last_known_seqno, self.existing.len()
        );
        self.schedule_next_seqnos();

        let alarm_sender = self.sender.clone();
        let alarm_stop = stop.clone();
        tokio::spawn(async move {
            loop {
                futures_timer::Delay::new(ALARM_PERIOD).await;
                if alarm_stop.load(Ordering::Relaxed) {
                    break;
                }
                if alarm_sender.send(SchedulerMsg::Alarm).is_err() {
                    break;
                }
            }
        });

        while let Some(msg) = self.receiver.recv().await {
            match msg {
                SchedulerMsg::Alarm => {
                    if stop.load(Ordering::Relaxed) {
                        log::info!(
                            target: SCHEDULER_TRACE_TARGET,
                            "stop requested, {} seqnos left in flight", self.in_flight_count()
                        );
                        break;
                    }
                    self.on_alarm();
                }
                SchedulerMsg::GotLastKnownSeqno(seqno) => {
                    if seqno > self.last_known_seqno {
                        self.last_known_seqno = seqno;
                    }
                }
                SchedulerMsg::GotQueueStatus(status) => {
                    self.cur_queue_status = status;
                    self.admit_awaiting();
                }
                SchedulerMsg::SeqnoFetched(seqno, result) => self.on_fetched(seqno, result),
                SchedulerMsg::SeqnoParsed(seqno, result) => self.on_parsed(seqno, result),
                SchedulerMsg::SeqnoProcessed(seqno, result) => self.on_processed(seqno, result),
                SchedulerMsg::SeqnoQueuedToInsert(seqno, result) => {
                    self.on_queued_to_insert(seqno, result)
                }
                SchedulerMsg::SeqnoInserted(seqno, result) => self.on_inserted(seqno, result),
                SchedulerMsg::RetryReady(seqno) => self.on_retry_ready(seqno),
            }
        }
        Ok(())
    }

    fn on_alarm(&mut self) {
        self.alarms += 1;

        let reader = self.chain_reader.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            match reader.get_last_mc_seqno().await {
                Ok(seqno) => {
                    let _ = sender.send(SchedulerMsg::GotLastKnownSeqno(seqno));
                }
                Err(err) => log::warn!(
                    target: SCHEDULER_TRACE_TARGET,
                    "failed to refresh last known seqno: {}", err
                ),
            }
        });
        let insert_manager = self.insert_manager.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            match insert_manager.get_insert_queue_status().await {
                Ok(status) => {
                    let _ = sender.send(SchedulerMsg::GotQueueStatus(status));
                }
                Err(err) => log::warn!(
                    target: SCHEDULER_TRACE_TARGET,
                    "failed to refresh insert queue status: {}", err
                ),
            }
        });

        self.update_tps();
        self.schedule_next_seqnos();
    }

    fn update_tps(&mut self) {
        let newly_done = self.done_count - self.last_done_count;
        self.last_done_count = self.done_count;
        let instant_tps = newly_done as f64 / ALARM_PERIOD.as_secs_f64();
        self.avg_tps = self.avg_tps * (1.0 - TPS_EMA_ALPHA) + instant_tps * TPS_EMA_ALPHA;

        if self.alarms % PROGRESS_LOG_ALARMS == 0 {
            log::info!(
                target: SCHEDULER_TRACE_TARGET,
                "indexed up to {} (tip {}), {:.2} blocks/s, {} in flight, queue {:?}",
                self.last_indexed_seqno, self.last_known_seqno,
                self.avg_tps, self.in_flight_count(), self.cur_queue_status
            );
        }
    }

    /// Admits seqnos lowest first while the task cap and the projected queue
    /// depth allow.
    fn schedule_next_seqnos(&mut self) {
        loop {
            if self.in_flight_count() >= self.config.max_active_tasks as usize {
                break;
            }
            if self.projected_queue_status().exceeds_any(&self.queue_limits) {
                break;
            }
            let seqno = match self.next_candidate() {
                Some(seqno) => seqno,
                None => break,
            };
            self.start_fetch(seqno);
        }
    }

    fn next_candidate(&self) -> Option<u32> {
        let queued = self
            .tasks
            .iter()
            .find(|(_, task)| matches!(task.state, SeqnoState::Queued))
            .map(|(seqno, _)| *seqno);

        let mut fresh = self.last_indexed_seqno + 1;
        let fresh = loop {
            if fresh > self.last_known_seqno {
                break None;
            }
            if !self.existing.contains(&fresh) && !self.tasks.contains_key(&fresh) {
                break Some(fresh);
            }
            fresh += 1;
        };

        match (queued, fresh) {
            (Some(queued), Some(fresh)) => Some(queued.min(fresh)),
            (queued, fresh) => queued.or(fresh),
        }
    }

    fn in_flight_count(&self) -> usize {
        self.tasks.values().filter(|task| task.state.is_in_flight()).count()
    }

    /// Current downstream depth plus the reserved contribution of seqnos that
    /// have not reached the inserter yet.
    fn projected_queue_status(&self) -> QueueStatus {
        let mut projected = self.cur_queue_status;
        for task in self.tasks.values() {
            match &task.state {
                SeqnoState::Fetching | SeqnoState::Parsing | SeqnoState::Detecting => {
                    projected += self.estimated_contribution();
                }
                SeqnoState::AwaitingAdmission(block) => {
                    projected += block.queue_contribution();
                }
                _ => {}
            }
        }
        projected
    }

    fn estimated_contribution(&self) -> QueueStatus {
        QueueStatus::with_counts(
            self.avg_contribution[0].ceil() as u32,
            self.avg_contribution[1].ceil() as u32,
            self.avg_contribution[2].ceil() as u32,
            self.avg_contribution[3].ceil() as u32,
        )
    }

    fn observe_contribution(&mut self, contribution: &QueueStatus) {
        let observed = [
            contribution.mc_blocks as f64,
            contribution.blocks as f64,
            contribution.txs as f64,
            contribution.msgs as f64,
        ];
        for (avg, value) in self.avg_contribution.iter_mut().zip(observed) {
            *avg = *avg * (1.0 - CONTRIBUTION_EMA_ALPHA) + value * CONTRIBUTION_EMA_ALPHA;
        }
    }

    fn start_fetch(&mut self, seqno: u32) {
        let task = self.tasks.entry(seqno).or_insert_with(|| SeqnoTask {
            state: SeqnoState::Queued,
            backoff: RETRY_INITIAL,
            attempts: 0,
        });
        task.state = SeqnoState::Fetching;

        log::debug!(target: SCHEDULER_TRACE_TARGET, "fetching seqno {}", seqno);
        let reader = self.chain_reader.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let result = reader.fetch_mc_block(seqno).await;
            let _ = sender.send(SchedulerMsg::SeqnoFetched(seqno, result));
        });
    }

    fn on_fetched(&mut self, seqno: u32, result: Result<MasterchainBlockDataState>) {
        let data = match result {
            Ok(data) => data,
            Err(err) => return self.fail_seqno(seqno, "fetch", err),
        };
        if let Some(task) = self.tasks.get_mut(&seqno) {
            task.state = SeqnoState::Parsing;
        }
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let result =
                tokio::task::spawn_blocking(move || parse_block_data_state(seqno, &data))
                    .await
                    .unwrap_or_else(|err| Err(failure::err_msg(format!("parse task: {}", err))));
            let _ = sender.send(SchedulerMsg::SeqnoParsed(seqno, result));
        });
    }

    fn on_parsed(&mut self, seqno: u32, result: Result<ParsedBlock>) {
        let mut parsed = match result {
            Ok(parsed) => parsed,
            Err(err) => return self.fail_seqno(seqno, "parse", err),
        };
        if let Some(task) = self.tasks.get_mut(&seqno) {
            task.state = SeqnoState::Detecting;
        }
        let event_processor = self.event_processor.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let result = event_processor.process(&mut parsed).await.map(|_| parsed);
            let _ = sender.send(SchedulerMsg::SeqnoProcessed(seqno, result));
        });
    }

    fn on_processed(&mut self, seqno: u32, result: Result<ParsedBlock>) {
        let parsed = match result {
            Ok(parsed) => parsed,
            Err(err) => return self.fail_seqno(seqno, "detect", err),
        };
        self.observe_contribution(&parsed.queue_contribution());
        if self.cur_queue_status.exceeds_any(&self.queue_limits) {
            log::debug!(
                target: SCHEDULER_TRACE_TARGET,
                "seqno {} awaits admission, queue {:?}", seqno, self.cur_queue_status
            );
            if let Some(task) = self.tasks.get_mut(&seqno) {
                task.state = SeqnoState::AwaitingAdmission(Box::new(parsed));
            }
            return;
        }
        self.start_insert(seqno, parsed);
    }

    fn start_insert(&mut self, seqno: u32, parsed: ParsedBlock) {
        if let Some(task) = self.tasks.get_mut(&seqno) {
            task.state = SeqnoState::Inserting;
        }
        let insert_manager = self.insert_manager.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let result = insert_manager.insert(seqno, parsed).await;
            let _ = sender.send(SchedulerMsg::SeqnoQueuedToInsert(seqno, result));
        });
    }

    /// Lowest processed seqnos go to the inserter as soon as caps allow.
    fn admit_awaiting(&mut self) {
        loop {
            if self.cur_queue_status.exceeds_any(&self.queue_limits) {
                break;
            }
            let seqno = match self
                .tasks
                .iter()
                .find(|(_, task)| matches!(task.state, SeqnoState::AwaitingAdmission(_)))
                .map(|(seqno, _)| *seqno)
            {
                Some(seqno) => seqno,
                None => break,
            };
            let parsed = match self.tasks.get_mut(&seqno) {
                Some(task) => {
                    match std::mem::replace(&mut task.state, SeqnoState::Inserting) {
                        SeqnoState::AwaitingAdmission(block) => *block,
                        other => {
                            task.state = other;
                            break;
                        }
                    }
                }
                None => break,
            };
            // count the admitted block against the caps right away
            self.cur_queue_status += parsed.queue_contribution();
            self.start_insert(seqno, parsed);
        }
    }

    fn on_queued_to_insert(
        &mut self,
        seqno: u32,
        result: Result<(QueueStatus, InsertedReceiver)>,
    ) {
        let (status, receiver) = match result {
            Ok(queued) => queued,
            Err(err) => return self.fail_seqno(seqno, "insert", err),
        };
        self.cur_queue_status = status;
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let result = match receiver.await {
                Ok(result) => result,
                Err(_) => Err(failure::err_msg("inserter dropped the completion channel")),
            };
            let _ = sender.send(SchedulerMsg::SeqnoInserted(seqno, result));
        });
    }

    fn on_inserted(&mut self, seqno: u32, result: Result<()>) {
        if let Err(err) = result {
            return self.fail_seqno(seqno, "await-inserted", err);
        }
        self.tasks.remove(&seqno);
        self.existing.insert(seqno);
        self.done_count += 1;
        self.advance_indexed_prefix();
        log::debug!(
            target: SCHEDULER_TRACE_TARGET,
            "seqno {} done, last indexed {}", seqno, self.last_indexed_seqno
        );
        self.admit_awaiting();
        self.schedule_next_seqnos();
    }

    fn advance_indexed_prefix(&mut self) {
        while self.existing.contains(&(self.last_indexed_seqno + 1)) {
            self.last_indexed_seqno += 1;
        }
        // seqnos at or below the prefix are implied by last_indexed_seqno
        self.existing = self.existing.split_off(&(self.last_indexed_seqno + 1));
    }

    /// A failed seqno is never dropped: it backs off exponentially and returns
    /// to the queue.
    fn fail_seqno(&mut self, seqno: u32, stage: &'static str, err: failure::Error) {
        let (backoff, attempts) = match self.tasks.get_mut(&seqno) {
            Some(task) => {
                task.state = SeqnoState::BackingOff;
                task.attempts += 1;
                let delay = task.backoff;
                task.backoff = (task.backoff * 2).min(RETRY_CAP);
                (delay, task.attempts)
            }
            None => (RETRY_INITIAL, 1),
        };
        log::warn!(
            target: SCHEDULER_TRACE_TARGET,
            "seqno {} failed at {} (attempt {}), retrying in {:?}: {}",
            seqno, stage, attempts, backoff, err
        );
        let sender = self.sender.clone();
        tokio::spawn(async move {
            futures_timer::Delay::new(backoff).await;
            let _ = sender.send(SchedulerMsg::RetryReady(seqno));
        });
    }

    fn on_retry_ready(&mut self, seqno: u32) {
        if let Some(task) = self.tasks.get_mut(&seqno) {
            if matches!(task.state, SeqnoState::BackingOff) {
                task.state = SeqnoState::Queued;
            }
        }
        self.schedule_next_seqnos();
    }
}
