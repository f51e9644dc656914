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
    block_parser::parse_account_state,
    config::ScannerConfig,
    engine_traits::{ChainReader, InsertManager},
    interfaces::Detectors,
    smc::parse_raw_address,
};

use ever_block::{base64_decode, read_single_root_boc, Result, ShardAccount, UInt256};
use std::{
    collections::{HashMap, HashSet},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

#[cfg(test)]
#[path = "tests/test_scanner.rs"]
mod tests;

pub const SCANNER_TRACE_TARGET: &str = "scanner";

/// Sweeps every account state at a fixed masterchain height, in ascending
/// address order, deriving interface-bearing entities along the way. The walk
/// is checkpointed after each batch so a restart is idempotent.
pub struct StateScanner {
    chain_reader: Arc<dyn ChainReader>,
    insert_manager: Arc<dyn InsertManager>,
    detectors: Arc<Detectors>,
    config: ScannerConfig,
    skip_list: Mutex<SkipList>,
}

/// Code hashes that repeatedly produced no interface. Reads dominate writes.
#[derive(Default)]
struct SkipList {
    no_interface_count: HashMap<String, u32>,
    code_hashes_to_skip: HashSet<String>,
}

impl StateScanner {
    pub fn new(
        chain_reader: Arc<dyn ChainReader>,
        insert_manager: Arc<dyn InsertManager>,
        detectors: Arc<Detectors>,
        config: ScannerConfig,
    ) -> Self {
        StateScanner {
            chain_reader,
            insert_manager,
            detectors,
            config,
            skip_list: Mutex::new(SkipList::default()),
        }
    }

    pub async fn run(&self, mc_seqno: u32, stop: Arc<AtomicBool>) -> Result<()> {
        let mut cursor = self.starting_cursor().await?;
        log::info!(
            target: SCANNER_TRACE_TARGET,
            "scanning account states at mc seqno {} from {}",
            mc_seqno,
            cursor.as_ref().map(|addr| addr.as_hex_string()).unwrap_or_else(|| "start".to_string())
        );

        let started = Instant::now();
        let mut processed: u64 = 0;
        loop {
            if stop.load(Ordering::Relaxed) {
                log::info!(target: SCANNER_TRACE_TARGET, "stop requested, scan interrupted");
                return Ok(());
            }
            let (batch, next_cursor) = self
                .chain_reader
                .fetch_account_states(mc_seqno, cursor.clone(), self.config.batch_size)
                .await?;
            processed += batch.len() as u64;
            self.process_batch(&batch).await?;

            match next_cursor {
                Some(next_cursor) => {
                    self.insert_manager.store_scan_checkpoint(&next_cursor).await?;
                    cursor = Some(next_cursor);
                }
                None => break,
            }
            if processed % 10_000 < self.config.batch_size as u64 {
                log::info!(
                    target: SCANNER_TRACE_TARGET,
                    "scanned {} accounts in {} s", processed, started.elapsed().as_secs()
                );
            }
        }

        log::info!(
            target: SCANNER_TRACE_TARGET,
            "scan finished: {} accounts in {} s", processed, started.elapsed().as_secs()
        );
        Ok(())
    }

    async fn starting_cursor(&self) -> Result<Option<UInt256>> {
        if self.config.from_checkpoint {
            if let Some(checkpoint) = self.insert_manager.load_scan_checkpoint().await? {
                return Ok(Some(checkpoint));
            }
            log::warn!(
                target: SCANNER_TRACE_TARGET,
                "no persisted checkpoint, starting from the beginning"
            );
        }
        match &self.config.cur_addr {
            Some(cur_addr) => Ok(Some(UInt256::from_str(cur_addr)?)),
            None => Ok(None),
        }
    }

    async fn process_batch(&self, batch: &[(UInt256, ShardAccount)]) -> Result<()> {
        let mut states = Vec::with_capacity(batch.len());
        for (_, shard_account) in batch {
            let record = match parse_account_state(shard_account) {
                Ok(record) => record,
                Err(err) => {
                    log::warn!(
                        target: SCANNER_TRACE_TARGET,
                        "skipping unreadable account state: {}", err
                    );
                    continue;
                }
            };

            if self.config.index_interfaces {
                self.index_account_interfaces(&record, shard_account.last_trans_lt()).await?;
            }
            states.push(record);
        }
        self.insert_manager.insert_account_states(states).await
    }

    async fn index_account_interfaces(
        &self,
        record: &crate::types::records::AccountStateRecord,
        last_trans_lt: u64,
    ) -> Result<()> {
        let (code_boc, data_boc) = match (&record.code_boc, &record.data_boc) {
            (Some(code_boc), Some(data_boc)) => (code_boc, data_boc),
            _ => return Ok(()),
        };
        let code_hash = match &record.code_hash {
            Some(code_hash) => code_hash.clone(),
            None => return Ok(()),
        };
        {
            let skip_list = self.skip_list.lock().expect("skip list lock");
            if skip_list.code_hashes_to_skip.contains(&code_hash) {
                return Ok(());
            }
        }

        let address = parse_raw_address(&record.address)?;
        let code = read_single_root_boc(base64_decode(code_boc)?)?;
        let data = read_single_root_boc(base64_decode(data_boc)?)?;
        let entities = self.detectors.detect_all(&address, &code, &data, last_trans_lt).await;

        if entities.is_empty() {
            // the walk visits every address once, so each sighting is a
            // distinct address
            let mut skip_list = self.skip_list.lock().expect("skip list lock");
            let count = skip_list.no_interface_count.entry(code_hash.clone()).or_insert(0);
            *count += 1;
            if *count >= self.config.skip_code_hash_threshold {
                log::debug!(
                    target: SCANNER_TRACE_TARGET,
                    "code hash {} produced no interface {} times, skipping it from now on",
                    code_hash, count
                );
                skip_list.code_hashes_to_skip.insert(code_hash);
            }
        }
        Ok(())
    }
}
