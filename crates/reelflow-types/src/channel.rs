use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Where a channel keeps its finished renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageStrategy {
    Filesystem,
    ObjectStore,
    PlanningDb,
}

impl StorageStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageStrategy::Filesystem => "filesystem",
            StorageStrategy::ObjectStore => "object_store",
            StorageStrategy::PlanningDb => "planning_db",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrandingPaths {
    pub intro: Option<String>,
    pub outro: Option<String>,
    pub watermark: Option<String>,
}

/// A logical content lane with isolated credentials and capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    pub max_concurrent: u32,
    pub voice_id: String,
    pub storage_strategy: StorageStrategy,
    #[serde(default)]
    pub branding: BrandingPaths,
    /// Provider label -> ciphertext. Plaintext is never persisted.
    #[serde(default)]
    pub credentials_encrypted: HashMap<String, String>,
    /// Optional override of the worker-wide video-generation ceiling.
    #[serde(default)]
    pub kling_concurrency: Option<u32>,
}

fn default_active() -> bool {
    true
}
