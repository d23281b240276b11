//! Channel registry: loads per-channel configuration, validates it, and
//! publishes a read-mostly snapshot. Reloads build a fresh snapshot and
//! swap it atomically, so readers never block a reload.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::info;

use reelflow_types::Channel;
use reelflow_vault::Vault;

#[derive(Debug, Deserialize)]
struct ChannelsFile {
    channels: Vec<Channel>,
}

/// Immutable view over all configured channels.
#[derive(Debug, Default)]
pub struct ChannelSnapshot {
    channels: HashMap<String, Channel>,
}

impl ChannelSnapshot {
    pub fn get(&self, channel_id: &str) -> Option<&Channel> {
        self.channels.get(channel_id)
    }

    pub fn is_active(&self, channel_id: &str) -> bool {
        self.get(channel_id).map(|c| c.active).unwrap_or(false)
    }

    pub fn active_channel_ids(&self) -> Vec<String> {
        let mut ids = self
            .channels
            .values()
            .filter(|c| c.active)
            .map(|c| c.id.clone())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[derive(Clone)]
pub struct ChannelRegistry {
    config_path: PathBuf,
    vault: Arc<Vault>,
    snapshot: Arc<RwLock<Arc<ChannelSnapshot>>>,
}

impl ChannelRegistry {
    /// Load and validate all channels. Any invalid channel fails the whole
    /// load: a half-applied registry is worse than a startup error.
    pub async fn load(config_path: impl AsRef<Path>, vault: Arc<Vault>) -> Result<Self> {
        let registry = Self {
            config_path: config_path.as_ref().to_path_buf(),
            vault,
            snapshot: Arc::new(RwLock::new(Arc::new(ChannelSnapshot::default()))),
        };
        registry.reload().await?;
        Ok(registry)
    }

    /// Re-read the config file and swap the snapshot in one step. A failed
    /// reload leaves the previous snapshot in place.
    pub async fn reload(&self) -> Result<()> {
        let raw = tokio::fs::read_to_string(&self.config_path)
            .await
            .with_context(|| format!("failed to read {}", self.config_path.display()))?;
        let parsed: ChannelsFile =
            serde_yaml::from_str(&raw).context("channel config is not valid YAML")?;

        let mut channels = HashMap::new();
        for channel in parsed.channels {
            validate_channel(&channel, &self.vault)
                .with_context(|| format!("channel `{}` failed validation", channel.id))?;
            let id = channel.id.clone();
            if channels.insert(id.clone(), channel).is_some() {
                bail!("duplicate channel id `{id}` in config");
            }
        }

        let next = Arc::new(ChannelSnapshot { channels });
        info!(channels = next.len(), "channel registry loaded");
        *self.snapshot.write().await = next;
        Ok(())
    }

    /// Cheap clone of the current snapshot. Lookups that miss mean "unknown
    /// channel" and are non-retriable for the caller.
    pub async fn snapshot(&self) -> Arc<ChannelSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Decrypt one credential for a channel. Absence of the channel or the
    /// provider label is a configuration error.
    pub async fn credential(&self, channel_id: &str, provider: &str) -> Result<String> {
        let snapshot = self.snapshot().await;
        let channel = snapshot
            .get(channel_id)
            .with_context(|| format!("unknown channel `{channel_id}`"))?;
        let blob = channel
            .credentials_encrypted
            .get(provider)
            .with_context(|| format!("channel `{channel_id}` has no `{provider}` credential"))?;
        self.vault.decrypt_string(blob)
    }
}

fn validate_channel(channel: &Channel, vault: &Vault) -> Result<()> {
    if channel.id.trim().is_empty() {
        bail!("empty channel id");
    }
    if channel.max_concurrent < 1 {
        bail!("max_concurrent must be at least 1");
    }
    for (provider, blob) in &channel.credentials_encrypted {
        vault
            .decrypt(blob)
            .with_context(|| format!("`{provider}` credential does not decrypt"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vault() -> Arc<Vault> {
        Arc::new(Vault::from_key_bytes(&[3u8; 32]).expect("vault"))
    }

    fn write_config(yaml: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(yaml.as_bytes()).expect("write");
        file
    }

    #[tokio::test]
    async fn loads_valid_channels() {
        let vault = vault();
        let secret = vault.encrypt(b"yt-refresh-token").expect("encrypt");
        let yaml = format!(
            r#"
channels:
  - id: ch_nature
    name: Nature Shorts
    max_concurrent: 2
    voice_id: voice-en-1
    storage_strategy: filesystem
    credentials_encrypted:
      youtube: "{secret}"
  - id: ch_history
    name: History Long-form
    active: false
    max_concurrent: 1
    voice_id: voice-en-2
    storage_strategy: object_store
"#
        );
        let file = write_config(&yaml);

        let registry = ChannelRegistry::load(file.path(), vault).await.expect("load");
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.is_active("ch_nature"));
        assert!(!snapshot.is_active("ch_history"));
        assert_eq!(snapshot.active_channel_ids(), vec!["ch_nature".to_string()]);

        let token = registry
            .credential("ch_nature", "youtube")
            .await
            .expect("credential");
        assert_eq!(token, "yt-refresh-token");
    }

    #[tokio::test]
    async fn rejects_zero_concurrency() {
        let yaml = r#"
channels:
  - id: ch_bad
    name: Bad
    max_concurrent: 0
    voice_id: v
    storage_strategy: filesystem
"#;
        let file = write_config(yaml);
        assert!(ChannelRegistry::load(file.path(), vault()).await.is_err());
    }

    #[tokio::test]
    async fn rejects_undecryptable_credentials() {
        let yaml = r#"
channels:
  - id: ch_bad
    name: Bad
    max_concurrent: 1
    voice_id: v
    storage_strategy: filesystem
    credentials_encrypted:
      youtube: "bm90LWEtcmVhbC1ibG9i"
"#;
        let file = write_config(yaml);
        assert!(ChannelRegistry::load(file.path(), vault()).await.is_err());
    }

    #[tokio::test]
    async fn rejects_unknown_storage_strategy() {
        let yaml = r#"
channels:
  - id: ch_bad
    name: Bad
    max_concurrent: 1
    voice_id: v
    storage_strategy: carrier_pigeon
"#;
        let file = write_config(yaml);
        assert!(ChannelRegistry::load(file.path(), vault()).await.is_err());
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_snapshot() {
        let yaml = r#"
channels:
  - id: ch_keep
    name: Keep
    max_concurrent: 1
    voice_id: v
    storage_strategy: filesystem
"#;
        let file = write_config(yaml);
        let registry = ChannelRegistry::load(file.path(), vault()).await.expect("load");

        std::fs::write(file.path(), "channels: [{id: ''}]").expect("corrupt");
        assert!(registry.reload().await.is_err());

        let snapshot = registry.snapshot().await;
        assert!(snapshot.get("ch_keep").is_some());
    }

    #[tokio::test]
    async fn unknown_channel_lookup_misses() {
        let yaml = r#"
channels:
  - id: ch_only
    name: Only
    max_concurrent: 1
    voice_id: v
    storage_strategy: filesystem
"#;
        let file = write_config(yaml);
        let registry = ChannelRegistry::load(file.path(), vault()).await.expect("load");
        assert!(registry.snapshot().await.get("ch_missing").is_none());
        assert!(registry.credential("ch_missing", "youtube").await.is_err());
    }
}
