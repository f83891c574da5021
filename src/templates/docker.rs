//! `/etc/docker/daemon.json`
//!
//! gpuhost owns a fixed set of keys; anything else an operator put in the
//! file is carried over untouched.

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value, json};

pub const DAEMON_JSON: &str = "/etc/docker/daemon.json";

/// Path of the runtime binary installed by nvidia-container-toolkit.
pub const NVIDIA_RUNTIME_PATH: &str = "nvidia-container-runtime";

/// The daemon.json keys gpuhost manages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonSettings {
    pub storage_driver: String,
    pub log_max_size: String,
    pub log_max_file: u32,
    /// Register the NVIDIA runtime and make it the default
    pub nvidia: bool,
}

impl DaemonSettings {
    fn managed(&self) -> Map<String, Value> {
        let mut keys = Map::new();
        keys.insert("storage-driver".into(), json!(self.storage_driver));
        keys.insert("log-driver".into(), json!("json-file"));
        keys.insert(
            "log-opts".into(),
            json!({
                "max-size": self.log_max_size,
                "max-file": self.log_max_file.to_string(),
            }),
        );
        if self.nvidia {
            keys.insert("default-runtime".into(), json!("nvidia"));
        }
        keys
    }

    /// Merge the managed keys into existing daemon.json content.
    ///
    /// Fails on content that is not a JSON object rather than replacing it.
    pub fn merge(&self, existing: Option<&str>) -> Result<String> {
        let mut root = match existing.map(str::trim).filter(|s| !s.is_empty()) {
            Some(text) => {
                let value: Value = serde_json::from_str(text).context("Invalid daemon.json format")?;
                match value {
                    Value::Object(map) => map,
                    _ => bail!("daemon.json is not a JSON object"),
                }
            }
            None => Map::new(),
        };

        root.extend(self.managed());

        if self.nvidia {
            let runtimes = root
                .entry("runtimes")
                .or_insert_with(|| Value::Object(Map::new()));
            if !runtimes.is_object() {
                *runtimes = Value::Object(Map::new());
            }
            if let Value::Object(runtimes) = runtimes {
                runtimes.insert(
                    "nvidia".into(),
                    json!({ "path": NVIDIA_RUNTIME_PATH, "runtimeArgs": [] }),
                );
            }
        }

        let mut text = serde_json::to_string_pretty(&Value::Object(root))?;
        text.push('\n');
        Ok(text)
    }
}

/// Look up a top-level string key, for verification.
pub fn string_key(content: &str, key: &str) -> Option<String> {
    let value: Value = serde_json::from_str(content).ok()?;
    value.get(key)?.as_str().map(str::to_string)
}
