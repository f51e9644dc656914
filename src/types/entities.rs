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

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Token metadata attributes, attribute name to value.
pub type TokenContent = BTreeMap<String, String>;

/// Getter-method conventions this worker recognizes on account code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum SmcInterface {
    JettonMaster,
    JettonWallet,
    NftCollection,
    NftItem,
}

impl Display for SmcInterface {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            SmcInterface::JettonMaster => write!(f, "jetton_master"),
            SmcInterface::JettonWallet => write!(f, "jetton_wallet"),
            SmcInterface::NftCollection => write!(f, "nft_collection"),
            SmcInterface::NftItem => write!(f, "nft_item"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JettonMasterData {
    pub address: String,
    pub total_supply: u128,
    pub mintable: bool,
    pub admin_address: Option<String>,
    pub jetton_content: TokenContent,
    pub jetton_wallet_code_hash: String,
    pub code_boc: String,
    pub data_boc: String,
    pub last_transaction_lt: u64,
    pub code_hash: String,
    pub data_hash: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JettonWalletData {
    pub address: String,
    pub balance: u128,
    pub owner: String,
    pub jetton: String,
    pub last_transaction_lt: u64,
    pub code_hash: String,
    pub data_hash: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NftCollectionData {
    pub address: String,
    pub next_item_index: u64,
    pub owner_address: Option<String>,
    pub collection_content: TokenContent,
    pub code_boc: String,
    pub data_boc: String,
    pub last_transaction_lt: u64,
    pub code_hash: String,
    pub data_hash: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NftItemData {
    pub address: String,
    pub init: bool,
    pub index: u64,
    pub collection_address: Option<String>,
    pub owner_address: Option<String>,
    pub content: TokenContent,
    pub last_transaction_lt: u64,
    pub code_hash: String,
    pub data_hash: String,
}

/// An interface-bearing account, as derived by the detectors.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Entity {
    JettonMaster(JettonMasterData),
    JettonWallet(JettonWalletData),
    NftCollection(NftCollectionData),
    NftItem(NftItemData),
}

impl Entity {
    pub fn address(&self) -> &str {
        match self {
            Entity::JettonMaster(data) => &data.address,
            Entity::JettonWallet(data) => &data.address,
            Entity::NftCollection(data) => &data.address,
            Entity::NftItem(data) => &data.address,
        }
    }

    pub fn last_transaction_lt(&self) -> u64 {
        match self {
            Entity::JettonMaster(data) => data.last_transaction_lt,
            Entity::JettonWallet(data) => data.last_transaction_lt,
            Entity::NftCollection(data) => data.last_transaction_lt,
            Entity::NftItem(data) => data.last_transaction_lt,
        }
    }

    pub fn interface(&self) -> SmcInterface {
        match self {
            Entity::JettonMaster(_) => SmcInterface::JettonMaster,
            Entity::JettonWallet(_) => SmcInterface::JettonWallet,
            Entity::NftCollection(_) => SmcInterface::NftCollection,
            Entity::NftItem(_) => SmcInterface::NftItem,
        }
    }
}

macro_rules! entity_conversions {
    ($variant:ident, $data:ty) => {
        impl From<$data> for Entity {
            fn from(data: $data) -> Self {
                Entity::$variant(data)
            }
        }
        impl TryFrom<Entity> for $data {
            type Error = Entity;
            fn try_from(entity: Entity) -> std::result::Result<Self, Entity> {
                match entity {
                    Entity::$variant(data) => Ok(data),
                    other => Err(other),
                }
            }
        }
    };
}

entity_conversions!(JettonMaster, JettonMasterData);
entity_conversions!(JettonWallet, JettonWalletData);
entity_conversions!(NftCollection, NftCollectionData);
entity_conversions!(NftItem, NftItemData);

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JettonTransfer {
    pub transaction_hash: String,
    pub query_id: u64,
    pub source: String,
    pub amount: u128,
    pub destination: String,
    pub response_destination: Option<String>,
    pub custom_payload_boc: Option<String>,
    pub forward_ton_amount: u128,
    pub forward_payload_boc: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JettonBurn {
    pub transaction_hash: String,
    pub query_id: u64,
    pub owner: String,
    pub amount: u128,
    pub response_destination: Option<String>,
    pub custom_payload_boc: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NftTransfer {
    pub transaction_hash: String,
    pub query_id: u64,
    pub nft_item: String,
    pub old_owner: String,
    pub new_owner: String,
    pub response_destination: Option<String>,
    pub custom_payload_boc: Option<String>,
    pub forward_amount: u128,
    pub forward_payload_boc: Option<String>,
}

/// Token events decoded from internal message bodies.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TokenEvent {
    JettonTransfer(JettonTransfer),
    JettonBurn(JettonBurn),
    NftTransfer(NftTransfer),
}
