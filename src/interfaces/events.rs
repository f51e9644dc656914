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

use super::Detectors;
use crate::{
    error::IndexerError,
    indexer_err,
    types::{
        entities::{JettonBurn, JettonTransfer, NftTransfer},
        records::TransactionRecord,
    },
};

use ever_block::{
    base64_encode, write_boc, Deserializable, Grams, MsgAddress, MsgAddressInt, Result, SliceData,
};

pub const JETTON_TRANSFER_OPCODE: u32 = 0x0f8a7ea5;
pub const JETTON_BURN_OPCODE: u32 = 0x595f07bc;
pub const NFT_TRANSFER_OPCODE: u32 = 0x5fcc3d14;

/// Token event decoding. The observed transaction's account must already be
/// classified as the expected interface, otherwise the body is not trusted.
impl Detectors {
    pub async fn parse_jetton_transfer(
        &self,
        transaction: &TransactionRecord,
        mut body: SliceData,
    ) -> Result<JettonTransfer> {
        self.expect_jetton_wallet(&transaction.account).await?;

        expect_opcode(&mut body, JETTON_TRANSFER_OPCODE)?;
        let query_id = body.get_next_u64()?;
        let amount = read_var_amount(&mut body)?;
        let destination = read_internal_address(&mut body, "transfer destination")?;
        let response_destination = read_optional_address(&mut body)?;
        let custom_payload_boc = read_maybe_ref_boc(&mut body)?;
        let forward_ton_amount = read_var_amount(&mut body)?;
        let forward_payload_boc = read_either_boc(&mut body)?;

        Ok(JettonTransfer {
            transaction_hash: transaction.hash.clone(),
            query_id,
            source: transaction.account.clone(),
            amount,
            destination,
            response_destination,
            custom_payload_boc,
            forward_ton_amount,
            forward_payload_boc,
        })
    }

    pub async fn parse_jetton_burn(
        &self,
        transaction: &TransactionRecord,
        mut body: SliceData,
    ) -> Result<JettonBurn> {
        self.expect_jetton_wallet(&transaction.account).await?;

        expect_opcode(&mut body, JETTON_BURN_OPCODE)?;
        let query_id = body.get_next_u64()?;
        let amount = read_var_amount(&mut body)?;
        let response_destination = read_optional_address(&mut body)?;
        let custom_payload_boc = read_maybe_ref_boc(&mut body)?;

        Ok(JettonBurn {
            transaction_hash: transaction.hash.clone(),
            query_id,
            owner: transaction.account.clone(),
            amount,
            response_destination,
            custom_payload_boc,
        })
    }

    pub async fn parse_nft_transfer(
        &self,
        transaction: &TransactionRecord,
        old_owner: Option<&str>,
        mut body: SliceData,
    ) -> Result<NftTransfer> {
        match self.nft_items.check(&transaction.account).await {
            Ok(_) => {}
            Err(err) if IndexerError::is_not_found(&err) => {
                return Err(indexer_err!(EventParse, "NFT item {} not found", transaction.account))
            }
            Err(err) => return Err(err),
        }

        let old_owner = old_owner
            .ok_or_else(|| indexer_err!(EventParse, "NFT transfer without an old owner"))?;

        expect_opcode(&mut body, NFT_TRANSFER_OPCODE)?;
        let query_id = body.get_next_u64()?;
        let new_owner = read_internal_address(&mut body, "transfer new owner")?;
        let response_destination = read_optional_address(&mut body)?;
        let custom_payload_boc = read_maybe_ref_boc(&mut body)?;
        let forward_amount = read_var_amount(&mut body)?;
        let forward_payload_boc = read_either_boc(&mut body)?;

        Ok(NftTransfer {
            transaction_hash: transaction.hash.clone(),
            query_id,
            nft_item: transaction.account.clone(),
            old_owner: old_owner.to_string(),
            new_owner,
            response_destination,
            custom_payload_boc,
            forward_amount,
            forward_payload_boc,
        })
    }

    async fn expect_jetton_wallet(&self, raw_address: &str) -> Result<()> {
        match self.jetton_wallets.check(raw_address).await {
            Ok(_) => Ok(()),
            Err(err) if IndexerError::is_not_found(&err) => {
                Err(indexer_err!(EventParse, "jetton wallet {} not found", raw_address))
            }
            Err(err) => Err(err),
        }
    }
}

fn expect_opcode(body: &mut SliceData, expected: u32) -> Result<()> {
    let opcode = body
        .get_next_u32()
        .map_err(|_| indexer_err!(EventParse, "message body too short for an opcode"))?;
    if opcode != expected {
        return Err(indexer_err!(
            EventParse,
            "unexpected opcode {:#010x}, wanted {:#010x}", opcode, expected
        ));
    }
    Ok(())
}

fn read_var_amount(body: &mut SliceData) -> Result<u128> {
    let amount = Grams::construct_from(body)
        .map_err(|_| indexer_err!(EventParse, "malformed variable-length amount"))?;
    Ok(amount.as_u128())
}

fn read_internal_address(body: &mut SliceData, what: &str) -> Result<String> {
    match address_from_slice_inline(body)? {
        Some(address) => Ok(crate::smc::to_raw_address(&address)),
        None => Err(indexer_err!(EventParse, "{} is addr_none", what)),
    }
}

fn read_optional_address(body: &mut SliceData) -> Result<Option<String>> {
    Ok(address_from_slice_inline(body)?.as_ref().map(crate::smc::to_raw_address))
}

// reads the address in place, advancing the body slice
fn address_from_slice_inline(body: &mut SliceData) -> Result<Option<MsgAddressInt>> {
    match MsgAddress::construct_from(body)
        .map_err(|_| indexer_err!(EventParse, "malformed message address"))?
    {
        MsgAddress::AddrNone => Ok(None),
        MsgAddress::AddrStd(addr) => Ok(Some(MsgAddressInt::AddrStd(addr))),
        MsgAddress::AddrVar(addr) => Ok(Some(MsgAddressInt::AddrVar(addr))),
        MsgAddress::AddrExt(_) => {
            Err(indexer_err!(EventParse, "external address in message body"))
        }
    }
}

fn read_maybe_ref_boc(body: &mut SliceData) -> Result<Option<String>> {
    if body
        .get_next_bit()
        .map_err(|_| indexer_err!(EventParse, "message body too short for a maybe flag"))?
    {
        let cell = body
            .checked_drain_reference()
            .map_err(|_| indexer_err!(EventParse, "maybe flag set without a reference"))?;
        Ok(Some(base64_encode(write_boc(&cell)?)))
    } else {
        Ok(None)
    }
}

fn read_either_boc(body: &mut SliceData) -> Result<Option<String>> {
    if body
        .get_next_bit()
        .map_err(|_| indexer_err!(EventParse, "message body too short for an either flag"))?
    {
        let cell = body
            .checked_drain_reference()
            .map_err(|_| indexer_err!(EventParse, "either flag set without a reference"))?;
        Ok(Some(base64_encode(write_boc(&cell)?)))
    } else if body.remaining_bits() > 0 || body.remaining_references() > 0 {
        let cell = body.clone().into_cell()?;
        Ok(Some(base64_encode(write_boc(&cell)?)))
    } else {
        Ok(None)
    }
}
