//! Descriptor sources: remote configuration over the broker, the cache file it
//! leaves behind, and the local descriptor file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use super::descriptor::DescriptorSet;
use crate::communication::{Message, QoS, SessionHandle, TopicBuilder};
use crate::config::ComponentSettings;
use crate::error::{NodeError, NodeResult};

/// Where the descriptor set the node booted with came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Remote,
    Cache,
    Local,
    Empty,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Remote => write!(f, "remote"),
            ConfigSource::Cache => write!(f, "cache"),
            ConfigSource::Local => write!(f, "local"),
            ConfigSource::Empty => write!(f, "empty"),
        }
    }
}

/// Requests the descriptor set from the broker side.
///
/// The request goes to `<prefix>/login/<device_id>`; the answer is expected on
/// `<prefix>/login/<device_id>/set`.
pub struct RemoteConfig {
    topics: TopicBuilder,
    session: SessionHandle,
    timeout: Duration,
    cache: Option<PathBuf>,
}

impl RemoteConfig {
    pub fn new(topics: TopicBuilder, session: SessionHandle, timeout: Duration) -> Self {
        Self {
            topics,
            session,
            timeout,
            cache: None,
        }
    }

    /// Persist every successfully received set to `path`
    pub fn with_cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache = Some(path.into());
        self
    }

    /// Ask for the descriptor set and wait up to the timeout for a parsable answer.
    pub async fn fetch(&self) -> NodeResult<DescriptorSet> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        // stays subscribed; later answers fall on a closed channel
        self.session
            .subscribe(&self.topics.login_response(), QoS::AtLeastOnce, move |message| {
                let _ = tx.send(message);
                async {}
            })?;
        let request = serde_json::json!({ "version": crate::VERSION }).to_string();
        self.session
            .publish(Message::new(self.topics.login(), request).with_qos(QoS::AtLeastOnce));

        let answer = tokio::time::timeout(self.timeout, async {
            while let Some(message) = rx.recv().await {
                match parse_answer(&message) {
                    Ok(set) => return Some((set, message.payload)),
                    Err(e) => log::warn!("Ignoring unusable remote configuration: {}", e),
                }
            }
            None
        })
        .await;

        match answer {
            Ok(Some((set, raw))) => {
                if let Some(path) = &self.cache {
                    if let Err(e) = write_cache(path, &raw) {
                        log::warn!("Cannot cache remote configuration at {}: {}", path.display(), e);
                    }
                }
                Ok(set)
            }
            Ok(None) => Err(NodeError::Other("remote configuration channel closed".into())),
            Err(_) => Err(NodeError::Timeout(format!(
                "no remote configuration within {:?}",
                self.timeout
            ))),
        }
    }
}

fn parse_answer(message: &Message) -> NodeResult<DescriptorSet> {
    let text = message
        .payload_str()
        .ok_or_else(|| NodeError::invalid_input("payload is not UTF-8"))?;
    DescriptorSet::from_json(text)
}

fn write_cache(path: &Path, raw: &[u8]) -> NodeResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    // write-then-rename so a power cut never leaves half a file
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, raw)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Pick the descriptor set to boot with: remote, then cache, then the local file.
///
/// Failures along the way are logged and the next source is tried; with nothing
/// usable the node boots with an empty set so it stays reachable.
pub async fn resolve_descriptors(
    settings: &ComponentSettings,
    remote: Option<&RemoteConfig>,
) -> (DescriptorSet, ConfigSource) {
    if let Some(remote) = remote {
        match remote.fetch().await {
            Ok(set) => return (set, ConfigSource::Remote),
            Err(e) => log::warn!("Remote configuration unavailable: {}", e),
        }
        if let Some(cache) = &settings.cache {
            if cache.exists() {
                match DescriptorSet::from_file(cache) {
                    Ok(set) => return (set, ConfigSource::Cache),
                    Err(e) => log::warn!("Cached configuration unusable: {}", e),
                }
            }
        }
    }
    if let Some(file) = &settings.file {
        match DescriptorSet::from_file(file) {
            Ok(set) => return (set, ConfigSource::Local),
            Err(e) => log::error!("Local configuration unusable: {}", e),
        }
    }
    (DescriptorSet::default(), ConfigSource::Empty)
}
