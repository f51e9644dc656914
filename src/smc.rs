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

use crate::{indexer_err, types::entities::TokenContent};

use ever_block::{
    Cell, CurrencyCollection, Deserializable, HashmapE, HashmapType, MsgAddress, MsgAddressInt,
    Result, Serializable, SliceData, UInt256,
};
use ever_vm::{
    executor::{gas::gas_state::Gas, Engine},
    stack::{savelist::SaveList, Stack, StackItem},
    SmartContractInfo,
};
use std::{
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

#[cfg(test)]
#[path = "tests/test_smc.rs"]
mod tests;

pub const SMC_TRACE_TARGET: &str = "smc";

/// Expected type of one get-method return slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotType {
    Int,
    Slice,
    Cell,
}

/// Runs get methods on contract code in a sandboxed VM. All invocations share
/// one capability set and gas cap; the invocation counter exists so callers
/// can assert cache hits without instrumenting the VM itself.
pub struct SmcExecutor {
    capabilities: u64,
    gas_limit: i64,
    vm_invocations: AtomicU64,
}

impl SmcExecutor {
    pub fn new(capabilities: u64, gas_limit: i64) -> Self {
        SmcExecutor {
            capabilities,
            gas_limit,
            vm_invocations: AtomicU64::new(0),
        }
    }

    pub fn vm_invocation_count(&self) -> u64 {
        self.vm_invocations.load(Ordering::Relaxed)
    }

    /// Executes `method` on the given code and data, seeded with the current
    /// wall clock and the account address. Returns the result stack bottom up,
    /// first declared return value first.
    pub fn run_getter(
        &self,
        code: &Cell,
        data: &Cell,
        address: &MsgAddressInt,
        method: &str,
        args: Vec<StackItem>,
    ) -> Result<Vec<StackItem>> {
        self.vm_invocations.fetch_add(1, Ordering::Relaxed);

        let code_slice = SliceData::load_cell(code.clone())?;
        let mut ctrls = SaveList::new();
        ctrls.put(4, &mut StackItem::Cell(data.clone()))?;

        let sci = SmartContractInfo {
            capabilities: self.capabilities,
            unix_time: now(),
            balance: CurrencyCollection::with_grams(1_000_000_000),
            myself: SliceData::load_cell(address.serialize()?)?,
            mycode: code.clone(),
            ..Default::default()
        };
        ctrls.put(7, &mut sci.into_temp_data_item())?;

        let mut stack = Stack::new();
        for item in args {
            stack.push(item);
        }
        stack.push(ever_vm::int!(method_id(method)));

        let mut engine = Engine::with_capabilities(self.capabilities).setup_with_libraries(
            code_slice,
            Some(ctrls),
            Some(stack),
            Some(Gas::test_with_limit(self.gas_limit)),
            vec![],
        );

        let exit_code = match engine.execute() {
            Ok(code) => code,
            Err(err) => return Err(indexer_err!(Vm, "{} failed: {}", method, err)),
        };
        if exit_code != 0 && exit_code != 1 {
            return Err(indexer_err!(Vm, "{} terminated with exit code {}", method, exit_code));
        }

        let depth = engine.stack().depth();
        let mut result = Vec::with_capacity(depth);
        for i in 0..depth {
            result.push(engine.stack().get(depth - i - 1).clone());
        }
        Ok(result)
    }
}

fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

/// Get-method id: CRC-16/XMODEM of the name with the external bit set.
pub fn method_id(name: &str) -> u32 {
    let mut crc: u16 = 0;
    for byte in name.as_bytes() {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    (crc as u32) | 0x10000
}

pub fn check_stack_shape(items: &[StackItem], expected: &[SlotType]) -> bool {
    if items.len() != expected.len() {
        return false;
    }
    items.iter().zip(expected.iter()).all(|(item, slot)| match (item, slot) {
        (StackItem::Integer(_), SlotType::Int) => true,
        (StackItem::Slice(_), SlotType::Slice) => true,
        (StackItem::Cell(_), SlotType::Cell) => true,
        _ => false,
    })
}

pub fn item_as_int(item: &StackItem) -> Result<i128> {
    match item {
        StackItem::Integer(value) => value
            .to_string()
            .parse::<i128>()
            .map_err(|_| indexer_err!(SmcInterfaceParse, "integer slot out of range: {}", value)),
        _ => Err(indexer_err!(SmcInterfaceParse, "expected integer slot")),
    }
}

pub fn item_as_u128(item: &StackItem) -> Result<u128> {
    let value = item_as_int(item)?;
    u128::try_from(value)
        .map_err(|_| indexer_err!(SmcInterfaceParse, "negative value in unsigned slot"))
}

pub fn item_as_u64(item: &StackItem) -> Result<u64> {
    let value = item_as_int(item)?;
    u64::try_from(value)
        .map_err(|_| indexer_err!(SmcInterfaceParse, "value does not fit into 64 bits"))
}

pub fn item_as_bool(item: &StackItem) -> Result<bool> {
    Ok(item_as_int(item)? != 0)
}

pub fn item_as_cell(item: &StackItem) -> Result<Cell> {
    match item {
        StackItem::Cell(cell) => Ok(cell.clone()),
        _ => Err(indexer_err!(SmcInterfaceParse, "expected cell slot")),
    }
}

/// Reads a message address from a slice slot. `None` stands for addr_none.
pub fn item_as_address(item: &StackItem) -> Result<Option<MsgAddressInt>> {
    let slice = match item {
        StackItem::Slice(slice) => slice.clone(),
        _ => return Err(indexer_err!(SmcInterfaceParse, "expected slice slot")),
    };
    address_from_slice(slice)
}

pub fn address_from_slice(mut slice: SliceData) -> Result<Option<MsgAddressInt>> {
    match MsgAddress::construct_from(&mut slice)? {
        MsgAddress::AddrNone => Ok(None),
        MsgAddress::AddrStd(addr) => Ok(Some(MsgAddressInt::AddrStd(addr))),
        MsgAddress::AddrVar(addr) => Ok(Some(MsgAddressInt::AddrVar(addr))),
        MsgAddress::AddrExt(_) => {
            Err(indexer_err!(SmcInterfaceParse, "external address in internal slot"))
        }
    }
}

/// Packs an internal address into a slice stack argument.
pub fn address_arg(address: &MsgAddressInt) -> Result<StackItem> {
    Ok(StackItem::Slice(SliceData::load_cell(address.serialize()?)?))
}

pub fn to_raw_address(address: &MsgAddressInt) -> String {
    address.to_string()
}

pub fn parse_raw_address(raw: &str) -> Result<MsgAddressInt> {
    MsgAddressInt::from_str(raw)
        .map_err(|err| indexer_err!(InvalidData, "malformed raw address {}: {}", raw, err))
}

const SNAKE_TAG: u8 = 0x00;
const CHUNKED_TAG: u8 = 0x01;
const ONCHAIN_CONTENT_TAG: u8 = 0x00;
const OFFCHAIN_CONTENT_TAG: u8 = 0x01;

const KNOWN_ATTRIBUTES: [&str; 9] = [
    "uri",
    "name",
    "description",
    "image",
    "image_data",
    "symbol",
    "decimals",
    "amount_style",
    "render_type",
];

lazy_static::lazy_static!(
    static ref ATTRIBUTE_HASHES: Vec<(UInt256, &'static str)> = KNOWN_ATTRIBUTES
        .iter()
        .map(|name| (UInt256::calc_file_hash(name.as_bytes()), *name))
        .collect();
);

/// Decodes a token content cell into an attribute map. Content is either fully
/// on chain (a 256 bit dictionary keyed by sha256 of the attribute name), off
/// chain (a single uri), or semi chain (an on-chain dictionary carrying a uri
/// attribute next to the rest).
pub fn parse_token_data(cell: &Cell) -> Result<TokenContent> {
    let mut slice = SliceData::load_cell_ref(cell)?;
    let mut content = TokenContent::new();
    match slice.get_next_byte()? {
        ONCHAIN_CONTENT_TAG => {
            let root = if slice.get_next_bit()? {
                Some(slice.checked_drain_reference()?)
            } else {
                None
            };
            let dict = HashmapE::with_hashmap(256, root);
            dict.iterate_slices_with_keys(|mut key, value| {
                let key = UInt256::from_slice(&key.get_next_bytes(32)?);
                let name = match ATTRIBUTE_HASHES.iter().find(|(hash, _)| hash == &key) {
                    Some((_, name)) => *name,
                    None => {
                        log::debug!(
                            target: SMC_TRACE_TARGET,
                            "skipping unknown content attribute {:x}", key
                        );
                        return Ok(true);
                    }
                };
                let text = read_content_value(value)?;
                content.insert(name.to_string(), text);
                Ok(true)
            })?;
            Ok(content)
        }
        OFFCHAIN_CONTENT_TAG => {
            let uri = String::from_utf8(read_snake_data(slice)?)
                .map_err(|_| indexer_err!(EventParse, "off-chain uri is not utf-8"))?;
            content.insert("uri".to_string(), uri);
            Ok(content)
        }
        tag => Err(indexer_err!(EventParse, "unknown content tag {:#04x}", tag)),
    }
}

fn read_content_value(mut value: SliceData) -> Result<String> {
    // values are stored in a child cell as a rule, inline as an exception
    if value.remaining_bits() == 0 && value.remaining_references() > 0 {
        value = SliceData::load_cell(value.checked_drain_reference()?)?;
    }
    let bytes = if value.remaining_bits() >= 8 {
        let mut probe = value.clone();
        match probe.get_next_byte()? {
            SNAKE_TAG => read_snake_data(probe)?,
            CHUNKED_TAG => {
                return Err(indexer_err!(EventParse, "chunked content is not supported"))
            }
            _ => read_snake_data(value)?,
        }
    } else {
        read_snake_data(value)?
    };
    String::from_utf8(bytes).map_err(|_| indexer_err!(EventParse, "content value is not utf-8"))
}

fn read_snake_data(mut slice: SliceData) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    loop {
        let byte_count = slice.remaining_bits() / 8;
        data.extend_from_slice(&slice.get_next_bytes(byte_count)?);
        if slice.remaining_references() == 0 {
            break;
        }
        slice = SliceData::load_cell(slice.checked_drain_reference()?)?;
    }
    Ok(data)
}
