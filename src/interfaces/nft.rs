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
        check_stack_shape, item_as_address, item_as_bool, item_as_cell, item_as_u64,
        parse_token_data, to_raw_address, SlotType,
    },
    types::entities::{NftCollectionData, NftItemData, SmcInterface, TokenContent},
};

use ever_block::{base64_encode, write_boc, Cell, MsgAddressInt, Result};
use ever_vm::{int, stack::{integer::IntegerData, StackItem}};

/// NFT collection detection: `get_collection_data` must return
/// `(int next_item_index, cell collection_content, slice owner_address)`.
impl Detectors {
    pub async fn detect_nft_collection(
        &self,
        address: &MsgAddressInt,
        code: &Cell,
        data: &Cell,
        last_tx_lt: u64,
    ) -> Result<NftCollectionData> {
        let code_hash = code.repr_hash();
        self.precheck(&code_hash, SmcInterface::NftCollection)?;

        let raw_address = to_raw_address(address);
        match self.nft_collections.check(&raw_address).await {
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

        let parsed = self.run_nft_collection_getter(address, code, data, last_tx_lt)?;
        self.interface_manager().set(&code_hash, SmcInterface::NftCollection, true);
        self.nft_collections.add(raw_address, parsed.clone()).await?;
        Ok(parsed)
    }

    fn run_nft_collection_getter(
        &self,
        address: &MsgAddressInt,
        code: &Cell,
        data: &Cell,
        last_tx_lt: u64,
    ) -> Result<NftCollectionData> {
        let stack = tokio::task::block_in_place(|| {
            self.executor().run_getter(code, data, address, "get_collection_data", vec![])
        })
        .map_err(|err| self.refute(code, SmcInterface::NftCollection, err))?;

        const SHAPE: [SlotType; 3] = [SlotType::Int, SlotType::Cell, SlotType::Slice];
        if !check_stack_shape(&stack, &SHAPE) {
            return Err(self.refute(
                code,
                SmcInterface::NftCollection,
                indexer_err!(SmcInterfaceParse, "get_collection_data returned a wrong stack"),
            ));
        }

        let collection_content = match parse_token_data(&item_as_cell(&stack[1])?) {
            Ok(content) => content,
            Err(err) => {
                log::warn!(
                    target: INTERFACES_TRACE_TARGET,
                    "failed to parse collection content for {}: {}", address, err
                );
                Default::default()
            }
        };

        Ok(NftCollectionData {
            address: to_raw_address(address),
            next_item_index: item_as_u64(&stack[0])?,
            owner_address: item_as_address(&stack[2])?.as_ref().map(to_raw_address),
            collection_content,
            code_boc: base64_encode(write_boc(code)?),
            data_boc: base64_encode(write_boc(data)?),
            last_transaction_lt: last_tx_lt,
            code_hash: code.repr_hash().as_hex_string(),
            data_hash: data.repr_hash().as_hex_string(),
        })
    }
}

/// NFT item detection: `get_nft_data` must return
/// `(int init, int index, slice collection_address, slice owner_address,
/// cell individual_content)`; an item that names a collection must be
/// acknowledged by it.
impl Detectors {
    pub async fn detect_nft_item(
        &self,
        address: &MsgAddressInt,
        code: &Cell,
        data: &Cell,
        last_tx_lt: u64,
    ) -> Result<NftItemData> {
        let code_hash = code.repr_hash();
        self.precheck(&code_hash, SmcInterface::NftItem)?;

        let raw_address = to_raw_address(address);
        match self.nft_items.check(&raw_address).await {
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

        let (mut parsed, individual_content) =
            self.run_nft_item_getter(address, code, data, last_tx_lt)?;
        self.interface_manager().set(&code_hash, SmcInterface::NftItem, true);

        match &parsed.collection_address {
            None => {
                // a standalone item carries its own content
                parsed.content = match parse_token_data(&individual_content) {
                    Ok(content) => content,
                    Err(err) => {
                        log::warn!(
                            target: INTERFACES_TRACE_TARGET,
                            "failed to parse item content for {}: {}", address, err
                        );
                        Default::default()
                    }
                };
            }
            Some(collection_address) => {
                let collection = match self.nft_collections.check(collection_address).await {
                    Ok(collection) => collection,
                    Err(err) if IndexerError::is_not_found(&err) => {
                        return Err(indexer_err!(
                            NotIndexed,
                            "collection {} was not indexed yet", collection_address
                        ))
                    }
                    Err(err) => return Err(err),
                };
                self.verify_belonging_to_collection(&parsed, &collection)?;
                parsed.content = match self.get_nft_content(
                    parsed.index,
                    individual_content,
                    &collection,
                ) {
                    Ok(content) => content,
                    Err(err) => {
                        log::warn!(
                            target: INTERFACES_TRACE_TARGET,
                            "failed to derive item content for {}: {}", address, err
                        );
                        Default::default()
                    }
                };
            }
        }

        self.nft_items.add(raw_address, parsed.clone()).await?;
        Ok(parsed)
    }

    fn run_nft_item_getter(
        &self,
        address: &MsgAddressInt,
        code: &Cell,
        data: &Cell,
        last_tx_lt: u64,
    ) -> Result<(NftItemData, Cell)> {
        let stack = tokio::task::block_in_place(|| {
            self.executor().run_getter(code, data, address, "get_nft_data", vec![])
        })
        .map_err(|err| self.refute(code, SmcInterface::NftItem, err))?;

        const SHAPE: [SlotType; 5] = [
            SlotType::Int, SlotType::Int, SlotType::Slice, SlotType::Slice, SlotType::Cell,
        ];
        if !check_stack_shape(&stack, &SHAPE) {
            return Err(self.refute(
                code,
                SmcInterface::NftItem,
                indexer_err!(SmcInterfaceParse, "get_nft_data returned a wrong stack"),
            ));
        }

        let parsed = NftItemData {
            address: to_raw_address(address),
            init: item_as_bool(&stack[0])?,
            index: item_as_u64(&stack[1])?,
            collection_address: item_as_address(&stack[2])?.as_ref().map(to_raw_address),
            owner_address: item_as_address(&stack[3])?.as_ref().map(to_raw_address),
            content: TokenContent::new(),
            last_transaction_lt: last_tx_lt,
            code_hash: code.repr_hash().as_hex_string(),
            data_hash: data.repr_hash().as_hex_string(),
        };
        Ok((parsed, item_as_cell(&stack[4])?))
    }

    /// The collection's `get_nft_address_by_index(index)` must return the
    /// item's own address.
    fn verify_belonging_to_collection(
        &self,
        item: &NftItemData,
        collection: &NftCollectionData,
    ) -> Result<()> {
        let collection_address = crate::smc::parse_raw_address(&collection.address)?;
        let (code, data) = cells_from_bocs(&collection.code_boc, &collection.data_boc)?;

        let stack = tokio::task::block_in_place(|| {
            self.executor().run_getter(
                &code,
                &data,
                &collection_address,
                "get_nft_address_by_index",
                vec![int!(item.index)],
            )
        })?;
        if !check_stack_shape(&stack, &[SlotType::Slice]) {
            return Err(indexer_err!(
                SmcInterfaceParse,
                "get_nft_address_by_index returned a wrong stack"
            ));
        }
        let nft_address = item_as_address(&stack[0])?.ok_or_else(|| {
            indexer_err!(SmcInterfaceParse, "get_nft_address_by_index returned addr_none")
        })?;
        if to_raw_address(&nft_address) != item.address {
            return Err(indexer_err!(
                SmcInterfaceParse,
                "NFT item {} doesn't belong to the referred collection {}",
                item.address, collection.address
            ));
        }
        Ok(())
    }

    /// Canonical per-item content is derived by the collection.
    fn get_nft_content(
        &self,
        index: u64,
        individual_content: Cell,
        collection: &NftCollectionData,
    ) -> Result<TokenContent> {
        let collection_address = crate::smc::parse_raw_address(&collection.address)?;
        let (code, data) = cells_from_bocs(&collection.code_boc, &collection.data_boc)?;

        let stack = tokio::task::block_in_place(|| {
            self.executor().run_getter(
                &code,
                &data,
                &collection_address,
                "get_nft_content",
                vec![int!(index), StackItem::Cell(individual_content)],
            )
        })?;
        if !check_stack_shape(&stack, &[SlotType::Cell]) {
            return Err(indexer_err!(SmcInterfaceParse, "get_nft_content returned a wrong stack"));
        }
        parse_token_data(&item_as_cell(&stack[0])?)
    }
}
