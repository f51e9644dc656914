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

use ever_block::{fail, Result};
use std::{fs::File, io::BufReader, path::Path};

#[derive(serde::Deserialize, serde::Serialize, Clone, Debug)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_active_tasks: u32,
    pub max_queue_mc_blocks: u32,
    pub max_queue_blocks: u32,
    pub max_queue_txs: u32,
    pub max_queue_msgs: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_active_tasks: 32,
            max_queue_mc_blocks: 16384,
            max_queue_blocks: 16384,
            max_queue_txs: 524288,
            max_queue_msgs: 524288,
        }
    }
}

#[derive(serde::Deserialize, serde::Serialize, Clone, Debug)]
#[serde(default)]
pub struct ScannerConfig {
    pub batch_size: usize,
    pub index_interfaces: bool,
    pub from_checkpoint: bool,
    // hex encoded account id to resume the walk from
    pub cur_addr: Option<String>,
    pub skip_code_hash_threshold: u32,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            batch_size: 100,
            index_interfaces: false,
            from_checkpoint: false,
            cur_addr: None,
            skip_code_hash_threshold: 16,
        }
    }
}

#[derive(serde::Deserialize, serde::Serialize, Clone, Debug)]
#[serde(default)]
pub struct TraceConfig {
    pub depth_limit: u32,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig { depth_limit: 20 }
    }
}

#[derive(serde::Deserialize, serde::Serialize, Clone, Debug)]
#[serde(default)]
pub struct SmcConfig {
    pub getter_gas_limit: i64,
    pub entity_cache_limit: usize,
}

impl Default for SmcConfig {
    fn default() -> Self {
        SmcConfig {
            getter_gas_limit: 1_000_000,
            entity_cache_limit: 1_048_576,
        }
    }
}

#[derive(serde::Deserialize, serde::Serialize, Clone, Debug, Default)]
pub struct IndexWorkerConfig {
    pub db_root: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_config_path: Option<String>,
    #[serde(alias = "redis_uri", skip_serializing_if = "Option::is_none")]
    pub kv_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_known_seqno: Option<u32>,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub smc: SmcConfig,
}

fn default_threads() -> usize {
    7
}

impl IndexWorkerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let config: IndexWorkerConfig = serde_json::from_reader(reader)?;
        config.check()?;
        Ok(config)
    }

    pub fn check(&self) -> Result<()> {
        if self.db_root.is_empty() {
            fail!("'db_root' option missing");
        }
        if self.threads == 0 {
            fail!("'threads' must be positive");
        }
        Ok(())
    }
}
