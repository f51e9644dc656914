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
    error::IndexerError,
    interfaces::events::JETTON_TRANSFER_OPCODE,
    smc::{parse_raw_address, to_raw_address},
    stubs::StubInsertManager,
    types::{entities::JettonTransfer, records::TransactionRecord},
};
use ever_block::{BuilderData, Serializable, SliceData};

fn make_detectors(insert_manager: Arc<StubInsertManager>) -> Detectors {
    Detectors::new(
        Arc::new(SmcExecutor::new(0, 1_000_000)),
        insert_manager,
        1024,
    )
}

fn addr(byte: u8) -> String {
    format!("0:{}", hex_repeat(byte))
}

fn hex_repeat(byte: u8) -> String {
    format!("{:02x}", byte).repeat(32)
}

#[test]
fn test_interface_verdict_never_flips() {
    let manager = InterfaceManager::new();
    let code_hash = UInt256::calc_file_hash(b"some code");

    assert_eq!(manager.check(&code_hash, SmcInterface::JettonMaster), None);
    manager.set(&code_hash, SmcInterface::JettonMaster, true);
    assert_eq!(manager.check(&code_hash, SmcInterface::JettonMaster), Some(true));

    manager.set(&code_hash, SmcInterface::JettonMaster, false);
    assert_eq!(manager.check(&code_hash, SmcInterface::JettonMaster), Some(true));

    // a different interface tag is an independent verdict
    assert_eq!(manager.check(&code_hash, SmcInterface::NftItem), None);
}

#[tokio::test]
async fn test_entity_cache_miss_escalates_to_writer() {
    let insert_manager = Arc::new(StubInsertManager::default());
    let wallet = JettonWalletData {
        address: addr(0x33),
        balance: 5,
        owner: addr(0x44),
        jetton: addr(0x55),
        last_transaction_lt: 10,
        code_hash: hex_repeat(0xff),
        data_hash: hex_repeat(0xab),
    };
    insert_manager
        .upsert_entity(Entity::JettonWallet(wallet.clone()))
        .await
        .unwrap();

    let cache: EntityCache<JettonWalletData> = EntityCache::new(insert_manager.clone(), 16);
    let resolved = cache.check(&wallet.address).await.unwrap();
    assert_eq!(resolved, wallet);

    let miss = cache.check(&addr(0x99)).await;
    assert!(IndexerError::is_not_found(&miss.unwrap_err()));
}

#[tokio::test]
async fn test_entity_cache_write_through() {
    let insert_manager = Arc::new(StubInsertManager::default());
    let cache: EntityCache<JettonWalletData> = EntityCache::new(insert_manager.clone(), 16);

    let wallet = JettonWalletData {
        address: addr(0x11),
        ..Default::default()
    };
    cache.add(wallet.address.clone(), wallet.clone()).await.unwrap();

    // both the local map and the downstream writer hold the entity now
    assert_eq!(cache.check(&wallet.address).await.unwrap(), wallet);
    assert!(insert_manager.entities.lock().unwrap().contains_key(&wallet.address));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cached_jetton_master_returns_without_vm() {
    let insert_manager = Arc::new(StubInsertManager::default());
    let detectors = make_detectors(insert_manager);

    let code = Cell::default();
    let data = Cell::default();
    let raw_address = addr(0x77);
    let address = parse_raw_address(&raw_address).unwrap();

    let cached = JettonMasterData {
        address: raw_address.clone(),
        total_supply: 1_000_000,
        mintable: true,
        code_hash: code.repr_hash().as_hex_string(),
        data_hash: data.repr_hash().as_hex_string(),
        last_transaction_lt: 100,
        ..Default::default()
    };
    detectors
        .jetton_masters
        .add(raw_address.clone(), cached.clone())
        .await
        .unwrap();

    let first = detectors.detect_jetton_master(&address, &code, &data, 100).await.unwrap();
    let second = detectors.detect_jetton_master(&address, &code, &data, 200).await.unwrap();

    assert_eq!(first, cached);
    assert_eq!(first, second);
    assert_eq!(detectors.vm_invocation_count(), 0);
}

#[tokio::test]
async fn test_refuted_code_hash_fails_fast() {
    let insert_manager = Arc::new(StubInsertManager::default());
    let detectors = make_detectors(insert_manager);

    let code = Cell::default();
    let data = Cell::default();
    let address = parse_raw_address(&addr(0x12)).unwrap();

    detectors
        .interface_manager()
        .set(&code.repr_hash(), SmcInterface::JettonMaster, false);

    let result = detectors.detect_jetton_master(&address, &code, &data, 1).await;
    assert!(IndexerError::is_interface_mismatch(&result.unwrap_err()));
    assert_eq!(detectors.vm_invocation_count(), 0);
}

fn transfer_body(destination: &str, amount_grams: u64) -> SliceData {
    let mut builder = BuilderData::new();
    builder.append_raw(&JETTON_TRANSFER_OPCODE.to_be_bytes(), 32).unwrap();
    builder.append_raw(&7u64.to_be_bytes(), 64).unwrap();
    ever_block::CurrencyCollection::with_grams(amount_grams)
        .grams
        .write_to(&mut builder)
        .unwrap();
    parse_raw_address(destination).unwrap().write_to(&mut builder).unwrap();
    // response destination: addr_none
    builder.append_raw(&[0x00], 2).unwrap();
    // no custom payload
    builder.append_bit_zero().unwrap();
    ever_block::CurrencyCollection::with_grams(0).grams.write_to(&mut builder).unwrap();
    // forward payload inline, empty
    builder.append_bit_zero().unwrap();
    SliceData::load_builder(builder).unwrap()
}

#[tokio::test]
async fn test_parse_jetton_transfer_for_known_wallet() {
    let insert_manager = Arc::new(StubInsertManager::default());
    let detectors = make_detectors(insert_manager);

    let wallet_address = addr(0x33);
    detectors
        .jetton_wallets
        .add(
            wallet_address.clone(),
            JettonWalletData { address: wallet_address.clone(), ..Default::default() },
        )
        .await
        .unwrap();

    let transaction = TransactionRecord {
        hash: hex_repeat(0xcc),
        account: wallet_address.clone(),
        ..Default::default()
    };
    let destination = addr(0x44);
    let transfer = detectors
        .parse_jetton_transfer(&transaction, transfer_body(&destination, 1000))
        .await
        .unwrap();

    assert_eq!(
        transfer,
        JettonTransfer {
            transaction_hash: transaction.hash.clone(),
            query_id: 7,
            source: wallet_address,
            amount: 1000,
            destination,
            response_destination: None,
            custom_payload_boc: None,
            forward_ton_amount: 0,
            forward_payload_boc: None,
        }
    );
}

#[tokio::test]
async fn test_parse_transfer_for_unknown_wallet_fails() {
    let insert_manager = Arc::new(StubInsertManager::default());
    let detectors = make_detectors(insert_manager);

    let transaction = TransactionRecord {
        hash: hex_repeat(0xcc),
        account: addr(0x33),
        ..Default::default()
    };
    let result = detectors
        .parse_jetton_transfer(&transaction, transfer_body(&addr(0x44), 1))
        .await;
    let err = result.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<IndexerError>(),
        Some(IndexerError::EventParse(_))
    ));
}

#[tokio::test]
async fn test_malformed_transfer_body_fails() {
    let insert_manager = Arc::new(StubInsertManager::default());
    let detectors = make_detectors(insert_manager);

    let wallet_address = addr(0x33);
    detectors
        .jetton_wallets
        .add(
            wallet_address.clone(),
            JettonWalletData { address: wallet_address.clone(), ..Default::default() },
        )
        .await
        .unwrap();

    let transaction = TransactionRecord {
        hash: hex_repeat(0xcc),
        account: wallet_address,
        ..Default::default()
    };

    let mut truncated = BuilderData::new();
    truncated.append_raw(&JETTON_TRANSFER_OPCODE.to_be_bytes(), 32).unwrap();
    let result = detectors
        .parse_jetton_transfer(&transaction, SliceData::load_builder(truncated).unwrap())
        .await;
    assert!(result.is_err());
}

#[test]
fn test_cached_is_fresh_rules() {
    let code = Cell::default();
    let data = Cell::default();
    let code_hash = code.repr_hash().as_hex_string();
    let data_hash = data.repr_hash().as_hex_string();

    // same cells: always fresh
    assert!(cached_is_fresh(&code_hash, &data_hash, 10, &code, &data, 100));
    // different data, but the cached entity is newer than the request
    assert!(cached_is_fresh(&code_hash, "other", 100, &code, &data, 50));
    assert!(cached_is_fresh(&code_hash, "other", 100, &code, &data, 100));
    // different data and the request is newer
    assert!(!cached_is_fresh(&code_hash, "other", 100, &code, &data, 101));
}
