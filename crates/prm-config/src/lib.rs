//! prm-config
//!
//! Layered YAML configuration for the PR monitor worker. Files merge in
//! order (later overrides earlier via deep-merge), the merged document is
//! canonicalized (sorted keys, compact JSON) and hashed so a running worker
//! can report exactly which configuration it was started with.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

use prm_schemas::DiscoveryConfig;

/// Env var consulted when the config omits `database.url`.
pub const ENV_DB_URL: &str = "PRM_DATABASE_URL";
/// Env var consulted when the config omits `github.token`.
pub const ENV_GITHUB_TOKEN: &str = "PRM_GITHUB_TOKEN";
/// Env var consulted when the config omits `cache.url`.
pub const ENV_REDIS_URL: &str = "PRM_REDIS_URL";

/// Load + merge YAML files in order, then canonicalize to JSON and hash.
/// Later files override earlier files via deep-merge.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).context("canonical json parse failed")?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

/// Empty configuration (all defaults), for when no file is supplied.
pub fn load_default() -> LoadedConfig {
    let canonical = "{}".to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    LoadedConfig {
        config_json: Value::Object(Default::default()),
        canonical_json: canonical,
        config_hash: hex::encode(hasher.finalize()),
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

impl LoadedConfig {
    /// Typed view of the sections the worker consumes. Missing sections fall
    /// back to defaults; secrets fall back to env vars.
    pub fn worker_config(&self) -> Result<WorkerConfig> {
        let discovery: DiscoveryConfig = match self.config_json.get("discovery") {
            Some(v) => serde_json::from_value(v.clone()).context("invalid discovery section")?,
            None => DiscoveryConfig::default(),
        };

        let github: GithubSection = match self.config_json.get("github") {
            Some(v) => serde_json::from_value(v.clone()).context("invalid github section")?,
            None => GithubSection::default(),
        };

        let cache: CacheSection = match self.config_json.get("cache") {
            Some(v) => serde_json::from_value(v.clone()).context("invalid cache section")?,
            None => CacheSection::default(),
        };

        let database: DatabaseSection = match self.config_json.get("database") {
            Some(v) => serde_json::from_value(v.clone()).context("invalid database section")?,
            None => DatabaseSection::default(),
        };

        Ok(WorkerConfig {
            discovery,
            github_token: github
                .token
                .or_else(|| std::env::var(ENV_GITHUB_TOKEN).ok()),
            github_base_url: github.base_url,
            redis_url: cache.url.or_else(|| std::env::var(ENV_REDIS_URL).ok()),
            database_url: database.url.or_else(|| std::env::var(ENV_DB_URL).ok()),
        })
    }
}

/// Fully resolved worker configuration: typed discovery tunables plus the
/// three connection inputs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub discovery: DiscoveryConfig,
    pub github_token: Option<String>,
    pub github_base_url: Option<String>,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct GithubSection {
    token: Option<String>,
    base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct CacheSection {
    url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct DatabaseSection {
    url: Option<String>,
}

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting compact JSON.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}
