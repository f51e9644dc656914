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
    smc::SmcExecutor,
    stubs::StubInsertManager,
    types::MasterchainBlockDataState,
};
use ever_block::{Account, AccountId, MsgAddressInt};

fn account_key(byte: u8) -> UInt256 {
    UInt256::from_slice(&[byte; 32])
}

fn shard_account(byte: u8) -> ShardAccount {
    let address = MsgAddressInt::with_standart(None, 0, AccountId::from(account_key(byte))).unwrap();
    ShardAccount::with_params(&Account::with_address(address), UInt256::default(), byte as u64)
        .unwrap()
}

/// Serves a fixed, address-ordered account set in cursor batches.
struct TestChainReader {
    accounts: Vec<(UInt256, ShardAccount)>,
}

impl TestChainReader {
    fn new(keys: &[u8]) -> Self {
        let mut accounts: Vec<(UInt256, ShardAccount)> = keys
            .iter()
            .map(|byte| (account_key(*byte), shard_account(*byte)))
            .collect();
        accounts.sort_by(|a, b| a.0.cmp(&b.0));
        TestChainReader { accounts }
    }
}

#[async_trait::async_trait]
impl ChainReader for TestChainReader {
    async fn get_last_mc_seqno(&self) -> Result<u32> {
        Ok(100)
    }

    async fn fetch_mc_block(&self, mc_seqno: u32) -> Result<MasterchainBlockDataState> {
        Err(crate::indexer_err!(NotFound, "no block {}", mc_seqno))
    }

    async fn fetch_account_states(
        &self,
        _mc_seqno: u32,
        cursor: Option<UInt256>,
        batch_size: usize,
    ) -> Result<(Vec<(UInt256, ShardAccount)>, Option<UInt256>)> {
        let start = match cursor {
            Some(cursor) => self.accounts.iter().position(|(key, _)| key > &cursor).unwrap_or(self.accounts.len()),
            None => 0,
        };
        let end = (start + batch_size).min(self.accounts.len());
        let batch = self.accounts[start..end].to_vec();
        let next_cursor = if end < self.accounts.len() {
            batch.last().map(|(key, _)| key.clone())
        } else {
            None
        };
        Ok((batch, next_cursor))
    }
}

fn make_scanner(
    reader: Arc<TestChainReader>,
    insert_manager: Arc<StubInsertManager>,
    config: ScannerConfig,
) -> StateScanner {
    let detectors = Arc::new(Detectors::new(
        Arc::new(SmcExecutor::new(0, 1_000_000)),
        insert_manager.clone(),
        1024,
    ));
    StateScanner::new(reader, insert_manager, detectors, config)
}

#[tokio::test]
async fn test_full_scan_visits_every_account_in_order() {
    let reader = Arc::new(TestChainReader::new(&[0x10, 0x20, 0x30, 0x40, 0x50]));
    let insert_manager = Arc::new(StubInsertManager::default());
    let config = ScannerConfig { batch_size: 2, ..Default::default() };

    let scanner = make_scanner(reader, insert_manager.clone(), config);
    scanner.run(100, Arc::new(AtomicBool::new(false))).await.unwrap();

    let states = insert_manager.account_states.lock().unwrap();
    let addresses: Vec<String> = states.iter().map(|state| state.address.clone()).collect();
    assert_eq!(addresses.len(), 5);
    let mut sorted = addresses.clone();
    sorted.sort();
    assert_eq!(addresses, sorted);

    // the walk checkpointed the last full batch boundary
    assert_eq!(
        insert_manager.checkpoint.lock().unwrap().clone(),
        Some(account_key(0x40))
    );
}

#[tokio::test]
async fn test_scan_resumes_from_checkpoint() {
    let keys = [0x10, 0x20, 0x30, 0x40, 0x50];

    // an uninterrupted run over the whole set
    let full_manager = Arc::new(StubInsertManager::default());
    let scanner = make_scanner(
        Arc::new(TestChainReader::new(&keys)),
        full_manager.clone(),
        ScannerConfig { batch_size: 2, ..Default::default() },
    );
    scanner.run(100, Arc::new(AtomicBool::new(false))).await.unwrap();
    let full_addresses: Vec<String> = full_manager
        .account_states
        .lock()
        .unwrap()
        .iter()
        .map(|state| state.address.clone())
        .collect();

    // a run that was interrupted after the first batch and resumed
    let resumed_manager = Arc::new(StubInsertManager::default());
    resumed_manager
        .store_scan_checkpoint(&account_key(0x20))
        .await
        .unwrap();
    let scanner = make_scanner(
        Arc::new(TestChainReader::new(&keys)),
        resumed_manager.clone(),
        ScannerConfig { batch_size: 2, from_checkpoint: true, ..Default::default() },
    );
    scanner.run(100, Arc::new(AtomicBool::new(false))).await.unwrap();
    let resumed_addresses: Vec<String> = resumed_manager
        .account_states
        .lock()
        .unwrap()
        .iter()
        .map(|state| state.address.clone())
        .collect();

    // first-batch addresses plus the resumed tail equal the full run
    assert_eq!(full_addresses[2..].to_vec(), resumed_addresses);
}

#[tokio::test]
async fn test_scan_with_explicit_cursor_option() {
    let keys = [0x10, 0x20, 0x30, 0x40, 0x50];
    let insert_manager = Arc::new(StubInsertManager::default());
    let scanner = make_scanner(
        Arc::new(TestChainReader::new(&keys)),
        insert_manager.clone(),
        ScannerConfig {
            batch_size: 2,
            cur_addr: Some(account_key(0x30).as_hex_string()),
            ..Default::default()
        },
    );
    scanner.run(100, Arc::new(AtomicBool::new(false))).await.unwrap();

    let states = insert_manager.account_states.lock().unwrap();
    assert_eq!(states.len(), 2);
}

#[tokio::test]
async fn test_accounts_without_code_are_not_detected() {
    let reader = Arc::new(TestChainReader::new(&[0x10, 0x20]));
    let insert_manager = Arc::new(StubInsertManager::default());
    let detectors = Arc::new(Detectors::new(
        Arc::new(SmcExecutor::new(0, 1_000_000)),
        insert_manager.clone(),
        1024,
    ));
    let scanner = StateScanner::new(
        reader,
        insert_manager.clone(),
        detectors.clone(),
        ScannerConfig { batch_size: 10, index_interfaces: true, ..Default::default() },
    );
    scanner.run(100, Arc::new(AtomicBool::new(false))).await.unwrap();

    // uninit accounts carry no code, the VM must stay untouched
    assert_eq!(detectors.vm_invocation_count(), 0);
    assert_eq!(insert_manager.account_states.lock().unwrap().len(), 2);
}
