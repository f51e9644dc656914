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
    interfaces::{
        events::{JETTON_BURN_OPCODE, JETTON_TRANSFER_OPCODE, NFT_TRANSFER_OPCODE},
        Detectors, INTERFACES_TRACE_TARGET,
    },
    smc::parse_raw_address,
    types::{
        entities::TokenEvent,
        records::{MessageDirection, MessageRecord, ParsedBlock, TransactionRecord},
    },
};

use ever_block::{
    base64_decode, read_single_root_boc, Deserializable, Message, Result, SliceData,
};
use std::{collections::HashMap, sync::Arc};

/// Enriches a parsed block in place: classifies every changed account state
/// and decodes token events from inbound internal messages.
pub struct EventProcessor {
    detectors: Arc<Detectors>,
}

impl EventProcessor {
    pub fn new(detectors: Arc<Detectors>) -> Self {
        EventProcessor { detectors }
    }

    pub fn detectors(&self) -> &Arc<Detectors> {
        &self.detectors
    }

    pub async fn process(&self, parsed: &mut ParsedBlock) -> Result<()> {
        self.detect_interfaces(parsed).await?;
        self.parse_events(parsed).await?;
        Ok(())
    }

    async fn detect_interfaces(&self, parsed: &mut ParsedBlock) -> Result<()> {
        for state in &parsed.account_states {
            let (code_boc, data_boc) = match (&state.code_boc, &state.data_boc) {
                (Some(code_boc), Some(data_boc)) => (code_boc, data_boc),
                _ => continue,
            };
            let address = parse_raw_address(&state.address)?;
            let code = read_single_root_boc(base64_decode(code_boc)?)?;
            let data = read_single_root_boc(base64_decode(data_boc)?)?;
            let entities = self
                .detectors
                .detect_all(&address, &code, &data, state.last_trans_lt)
                .await;
            parsed.entities.extend(entities);
        }
        Ok(())
    }

    async fn parse_events(&self, parsed: &mut ParsedBlock) -> Result<()> {
        let transactions: HashMap<&str, &TransactionRecord> = parsed
            .transactions
            .iter()
            .map(|tx| (tx.hash.as_str(), tx))
            .collect();

        let mut events = Vec::new();
        for message in &parsed.messages {
            if !message.is_inbound || message.direction != MessageDirection::Internal {
                continue;
            }
            let opcode = match message.opcode {
                Some(opcode @ (JETTON_TRANSFER_OPCODE | JETTON_BURN_OPCODE | NFT_TRANSFER_OPCODE)) => {
                    opcode
                }
                _ => continue,
            };
            let transaction = match transactions.get(message.transaction_hash.as_str()) {
                Some(transaction) => *transaction,
                None => continue,
            };
            let body = match message_body(message) {
                Ok(Some(body)) => body,
                Ok(None) => continue,
                Err(err) => {
                    log::warn!(
                        target: INTERFACES_TRACE_TARGET,
                        "failed to decode body of message {}: {}", message.hash, err
                    );
                    continue;
                }
            };

            let event = match opcode {
                JETTON_TRANSFER_OPCODE => self
                    .detectors
                    .parse_jetton_transfer(transaction, body)
                    .await
                    .map(TokenEvent::JettonTransfer),
                JETTON_BURN_OPCODE => self
                    .detectors
                    .parse_jetton_burn(transaction, body)
                    .await
                    .map(TokenEvent::JettonBurn),
                _ => self
                    .detectors
                    .parse_nft_transfer(transaction, message.source.as_deref(), body)
                    .await
                    .map(TokenEvent::NftTransfer),
            };
            match event {
                Ok(event) => events.push(event),
                Err(err) => log::warn!(
                    target: INTERFACES_TRACE_TARGET,
                    "failed to parse event from message {}: {}", message.hash, err
                ),
            }
        }
        parsed.events = events;
        Ok(())
    }
}

fn message_body(record: &MessageRecord) -> Result<Option<SliceData>> {
    let cell = read_single_root_boc(base64_decode(&record.boc)?)?;
    let message = Message::construct_from_cell(cell)?;
    Ok(message.body())
}
