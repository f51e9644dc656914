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

use super::{cached_is_fresh, cells_from_bocs, Detectors, INTERFACES_TRACE_TARGET};
use crate::{
    error::IndexerError,
    indexer_err,
    smc::{
        address_arg, check_stack_shape, item_as_address, item_as_bool, item_as_cell, item_as_u128,
        parse_token_data, to_raw_address, SlotType,
    },
    types::entities::{JettonMasterData, JettonWalletData, SmcInterface},
};

use ever_block::{base64_encode, write_boc, Cell, MsgAddressInt, Result};

/// Jetton master detection: `get_jetton_data` must return
/// `(int total_supply, int mintable, slice admin_address, cell jetton_content,
/// cell jetton_wallet_code)`.
impl Detectors {
    pub async fn detect_jetton_master(
        &self,
        address: &MsgAddressInt,
        code: &Cell,
        data: &Cell,
        last_tx_lt: u64,
    ) -> Result<JettonMasterData> {
        let code_hash = code.repr_hash();
        self.precheck(&code_hash, SmcInterface::JettonMaster)?;

        let raw_address = to_raw_address(address);
        match self.jetton_masters.check(&raw_address).await {
            Ok(cached) => {
                if cached_is_fresh(
                    &cached.code_hash, &cached.data_hash, cached.last_transaction_lt,
                    code, data, last_tx_lt,
                ) {
                    return Ok(cached);
                }
            }
            Err(err) if IndexerError::is_not_found(&err) => {}
            Err(err) => return Err(err),
        }

        let parsed = self.run_jetton_master_getter(address, code, data, last_tx_lt)?;
        self.interface_manager().set(&code_hash, SmcInterface::JettonMaster, true);
        self.jetton_masters.add(raw_address, parsed.clone()).await?;
        Ok(parsed)
    }

    fn run_jetton_master_getter(
        &self,
        address: &MsgAddressInt,
        code: &Cell,
        data: &Cell,
        last_tx_lt: u64,
    ) -> Result<JettonMasterData> {
        let stack = tokio::task::block_in_place(|| {
            self.executor().run_getter(code, data, address, "get_jetton_data", vec![])
        })
        .map_err(|err| self.refute(code, SmcInterface::JettonMaster, err))?;

        const SHAPE: [SlotType; 5] = [
            SlotType::Int, SlotType::Int, SlotType::Slice, SlotType::Cell, SlotType::Cell,
        ];
        if !check_stack_shape(&stack, &SHAPE) {
            return Err(self.refute(
                code,
                SmcInterface::JettonMaster,
                indexer_err!(SmcInterfaceParse, "get_jetton_data returned a wrong stack"),
            ));
        }

        let jetton_content = match parse_token_data(&item_as_cell(&stack[3])?) {
            Ok(content) => content,
            Err(err) => {
                log::warn!(
                    target: INTERFACES_TRACE_TARGET,
                    "failed to parse jetton content for {}: {}", address, err
                );
                Default::default()
            }
        };

        Ok(JettonMasterData {
            address: to_raw_address(address),
            total_supply: item_as_u128(&stack[0])?,
            mintable: item_as_bool(&stack[1])?,
            admin_address: item_as_address(&stack[2])?.as_ref().map(to_raw_address),
            jetton_content,
            jetton_wallet_code_hash: item_as_cell(&stack[4])?.repr_hash().as_hex_string(),
            code_boc: base64_encode(write_boc(code)?),
            data_boc: base64_encode(write_boc(data)?),
            last_transaction_lt: last_tx_lt,
            code_hash: code.repr_hash().as_hex_string(),
            data_hash: data.repr_hash().as_hex_string(),
        })
    }

    /// Asks a master which wallet serves `owner`. The master must already be
    /// known, locally or downstream; `NotFound` bubbles up otherwise.
    pub async fn get_wallet_address(
        &self,
        master_address: &MsgAddressInt,
        owner_address: &MsgAddressInt,
    ) -> Result<MsgAddressInt> {
        let master = self.jetton_masters.check(&to_raw_address(master_address)).await?;
        let (code, data) = cells_from_bocs(&master.code_boc, &master.data_boc)?;

        let stack = tokio::task::block_in_place(|| {
            self.executor().run_getter(
                &code,
                &data,
                master_address,
                "get_wallet_address",
                vec![address_arg(owner_address)?],
            )
        })?;
        if !check_stack_shape(&stack, &[SlotType::Slice]) {
            return Err(indexer_err!(SmcInterfaceParse, "get_wallet_address returned a wrong stack"));
        }
        item_as_address(&stack[0])?
            .ok_or_else(|| indexer_err!(SmcInterfaceParse, "get_wallet_address returned addr_none"))
    }
}

/// Jetton wallet detection: `get_wallet_data` must return
/// `(int balance, slice owner, slice jetton, cell jetton_wallet_code)` and the
/// referenced master must recognize the wallet.
impl Detectors {
    pub async fn detect_jetton_wallet(
        &self,
        address: &MsgAddressInt,
        code: &Cell,
        data: &Cell,
        last_tx_lt: u64,
    ) -> Result<JettonWalletData> {
        let code_hash = code.repr_hash();
        self.precheck(&code_hash, SmcInterface::JettonWallet)?;

        let raw_address = to_raw_address(address);
        match self.jetton_wallets.check(&raw_address).await {
            Ok(cached) => {
                if cached_is_fresh(
                    &cached.code_hash, &cached.data_hash, cached.last_transaction_lt,
                    code, data, last_tx_lt,
                ) {
                    return Ok(cached);
                }
            }
            Err(err) if IndexerError::is_not_found(&err) => {}
            Err(err) => return Err(err),
        }

        let parsed = self.run_jetton_wallet_getter(address, code, data, last_tx_lt)?;
        self.interface_manager().set(&code_hash, SmcInterface::JettonWallet, true);
        self.verify_belonging_to_master(parsed).await
    }

    fn run_jetton_wallet_getter(
        &self,
        address: &MsgAddressInt,
        code: &Cell,
        data: &Cell,
        last_tx_lt: u64,
    ) -> Result<JettonWalletData> {
        let stack = tokio::task::block_in_place(|| {
            self.executor().run_getter(code, data, address, "get_wallet_data", vec![])
        })
        .map_err(|err| self.refute(code, SmcInterface::JettonWallet, err))?;

        const SHAPE: [SlotType; 4] =
            [SlotType::Int, SlotType::Slice, SlotType::Slice, SlotType::Cell];
        if !check_stack_shape(&stack, &SHAPE) {
            return Err(self.refute(
                code,
                SmcInterface::JettonWallet,
                indexer_err!(SmcInterfaceParse, "get_wallet_data returned a wrong stack"),
            ));
        }

        let owner = item_as_address(&stack[1])?
            .ok_or_else(|| indexer_err!(SmcInterfaceParse, "wallet owner is addr_none"))?;
        let jetton = item_as_address(&stack[2])?
            .ok_or_else(|| indexer_err!(SmcInterfaceParse, "wallet master is addr_none"))?;

        Ok(JettonWalletData {
            address: to_raw_address(address),
            balance: item_as_u128(&stack[0])?,
            owner: to_raw_address(&owner),
            jetton: to_raw_address(&jetton),
            last_transaction_lt: last_tx_lt,
            code_hash: code.repr_hash().as_hex_string(),
            data_hash: data.repr_hash().as_hex_string(),
        })
    }

    /// The master's `get_wallet_address(owner)` must point back at the wallet.
    /// A master that is not indexed yet is accepted tentatively.
    async fn verify_belonging_to_master(&self, data: JettonWalletData) -> Result<JettonWalletData> {
        let master_address = crate::smc::parse_raw_address(&data.jetton)?;
        let owner_address = crate::smc::parse_raw_address(&data.owner)?;

        match self.get_wallet_address(&master_address, &owner_address).await {
            Ok(wallet_address) => {
                if to_raw_address(&wallet_address) != data.address {
                    log::warn!(
                        target: INTERFACES_TRACE_TARGET,
                        "jetton master {} returned wrong wallet address {} for {}",
                        data.jetton, wallet_address, data.address
                    );
                    return Err(indexer_err!(
                        SmcInterfaceParse,
                        "couldn't verify jetton wallet {}. Possibly scam", data.address
                    ));
                }
                self.jetton_wallets.add(data.address.clone(), data.clone()).await?;
                Ok(data)
            }
            Err(err) if IndexerError::is_not_found(&err) => {
                log::warn!(
                    target: INTERFACES_TRACE_TARGET,
                    "jetton master {} is not indexed yet, accepting wallet {} without verification",
                    data.jetton, data.address
                );
                self.jetton_wallets.add(data.address.clone(), data.clone()).await?;
                Ok(data)
            }
            Err(err) => Err(err),
        }
    }

    /// Records a refuted code hash and passes the cause through.
    pub(crate) fn refute(
        &self,
        code: &Cell,
        interface: SmcInterface,
        err: failure::Error,
    ) -> failure::Error {
        self.interface_manager().set(&code.repr_hash(), interface, false);
        err
    }
}
