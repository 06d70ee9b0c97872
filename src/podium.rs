// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::engine::{
    Channel, ChannelFault, ChannelManager, ErrorCallback, HistoryAggregator, PendingWrite,
    RecordWriter, WriteReport,
};
use crate::error::PodiumErr;
use crate::ledger::{Confirmation, Ledger};
use crate::media::{image_content_type, ObjectStore, StorageErr};
use crate::paths;
use crate::primitives::{placeholder_payload, Hash256, LedgerAddress, Record};
use crate::settings::Settings;
use crate::wallet::{EncryptedEntry, Identity};
use chrono::prelude::*;
use futures::channel::mpsc;
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// POD balance every new user starts with
pub const INITIAL_POD: u64 = 1000;

/// Integrity every new user starts with
pub const INITIAL_INTEGRITY: f64 = 0.5;

/// Ledger network the process bootstraps from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Universe {
    Sunstone,
    Highgarden,
    Alphanet,
    #[default]
    Alphanet2,
}

impl Universe {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sunstone => "sunstone",
            Self::Highgarden => "highgarden",
            Self::Alphanet => "alphanet",
            Self::Alphanet2 => "alphanet2",
        }
    }
}

impl FromStr for Universe {
    type Err = std::convert::Infallible;

    /// Unknown names fall back to `alphanet2`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "sunstone" => Self::Sunstone,
            "highgarden" => Self::Highgarden,
            "alphanet" => Self::Alphanet,
            _ => Self::Alphanet2,
        })
    }
}

impl fmt::Display for Universe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime configuration of a [`Podium`] instance.
#[derive(Debug, Clone, PartialEq)]
pub struct PodiumConfig {
    pub application_id: String,
    pub universe: Universe,

    /// Hard deadline of history reads. `None` disables it.
    pub timeout: Option<Duration>,

    /// Channel inactivity lifetime. `None` keeps channels open.
    pub lifetime: Option<Duration>,

    pub quiet_period: Duration,
    pub media_store: String,
    pub root_address: Option<LedgerAddress>,

    /// Refuse every write with `Permission`
    pub read_only: bool,
}

impl PodiumConfig {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        let ledger = &settings.ledger;
        let application_id = ledger
            .application_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| generate_application_id(&ledger.application_prefix));

        let root_address = ledger.root_address.as_deref().and_then(|address| {
            LedgerAddress::from_base58(address)
                .map_err(|err| warn!("Ignoring root address {}: {}", address, err))
                .ok()
        });

        Self {
            application_id,
            universe: ledger.universe.parse().unwrap_or_default(),
            timeout: Some(Duration::from_secs(ledger.timeout_secs)).filter(|t| !t.is_zero()),
            lifetime: Some(Duration::from_millis(ledger.connection_lifetime_ms))
                .filter(|l| !l.is_zero()),
            quiet_period: Duration::from_millis(ledger.quiet_period_ms),
            media_store: settings.media.media_store.clone(),
            root_address,
            read_only: ledger.read_only,
        }
    }
}

impl Default for PodiumConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Application id used when none is configured.
#[must_use]
pub fn generate_application_id(prefix: &str) -> String {
    let seed: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{prefix}AUTO|{seed}")
}

/// Match returned by [`Podium::search`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub address: LedgerAddress,
}

/// Application state layer over the ledger.
#[derive(Clone)]
pub struct Podium {
    config: Arc<PodiumConfig>,
    writer: RecordWriter,
    history: HistoryAggregator,
    channels: ChannelManager,
    media: Arc<dyn ObjectStore>,
    launched: i64,
}

impl Podium {
    pub fn new(config: PodiumConfig, ledger: Arc<dyn Ledger>, media: Arc<dyn ObjectStore>) -> Self {
        let app_id = config.application_id.as_str();
        info!(
            "Connecting application {} to {}",
            app_id, config.universe
        );

        Self {
            writer: RecordWriter::new(ledger.clone(), app_id),
            history: HistoryAggregator::new(ledger.clone(), app_id)
                .with_quiet_period(config.quiet_period),
            channels: ChannelManager::new(ledger, app_id),
            media,
            launched: Utc::now().timestamp_millis(),
            config: Arc::new(config),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PodiumConfig {
        &self.config
    }

    /// Time this instance was created, in milliseconds since the unix epoch
    #[must_use]
    pub fn launched(&self) -> i64 {
        self.launched
    }

    #[must_use]
    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    fn check_writable(&self) -> Result<(), PodiumErr> {
        if self.config.read_only {
            return Err(PodiumErr::Permission);
        }

        Ok(())
    }

    // Writes

    /// Writes one record to every address in `addresses`.
    pub async fn store_record(
        &self,
        identity: &Identity,
        addresses: Vec<LedgerAddress>,
        payload: serde_json::Value,
    ) -> Result<Confirmation, PodiumErr> {
        self.check_writable()?;
        let mut confirmations = self
            .writer
            .write(identity, vec![PendingWrite::new(addresses, payload)])
            .await?
            .into_result()?;

        confirmations.pop().ok_or(PodiumErr::EmptyTarget)
    }

    /// Writes several records concurrently, as independent transactions.
    pub async fn store_records(
        &self,
        identity: &Identity,
        writes: Vec<PendingWrite>,
    ) -> Result<WriteReport, PodiumErr> {
        self.check_writable()?;
        debug!("Storing {} records", writes.len());
        self.writer.write(identity, writes).await
    }

    /// Stores a base64 encoded image under `key` in the media bucket.
    pub async fn store_media(&self, image: &str, key: &str) -> Result<(), PodiumErr> {
        self.check_writable()?;
        debug!("Storing media {}", key);
        let bytes = base64::decode(image).map_err(|_| StorageErr::InvalidData)?;

        self.media
            .put_object(&self.config.media_store, key, bytes, &image_content_type(key))
            .await?;

        Ok(())
    }

    // Reads

    /// History of `address` bounded by the configured timeout.
    pub async fn get_history(&self, address: &LedgerAddress) -> Result<Vec<Record>, PodiumErr> {
        self.history.get_history(address, self.config.timeout).await
    }

    pub async fn get_history_within(
        &self,
        address: &LedgerAddress,
        timeout: Option<Duration>,
    ) -> Result<Vec<Record>, PodiumErr> {
        self.history.get_history(address, timeout).await
    }

    /// Latest record of `address` bounded by the configured timeout.
    pub async fn get_latest(&self, address: &LedgerAddress) -> Result<Option<Record>, PodiumErr> {
        self.history.get_latest(address, self.config.timeout).await
    }

    pub async fn get_latest_within(
        &self,
        address: &LedgerAddress,
        timeout: Option<Duration>,
    ) -> Result<Option<Record>, PodiumErr> {
        self.history.get_latest(address, timeout).await
    }

    // Channels

    /// Opens a channel to `address` expiring after the configured lifetime.
    pub fn open_channel<F>(
        &self,
        address: &LedgerAddress,
        on_data: F,
        on_error: Option<ErrorCallback>,
    ) -> Channel
    where
        F: Fn(Record) + Send + Sync + 'static,
    {
        self.channels
            .open_channel(address, on_data, on_error, self.config.lifetime)
    }

    pub fn close_channel(&self, address: &LedgerAddress) {
        self.channels.close_channel(address);
    }

    pub fn close_all_channels(&self) {
        self.channels.close_all_channels();
    }

    /// Closes every channel and stops every timer.
    pub fn clean_up(&self) {
        self.channels.clean_up();
    }

    pub fn take_faults(&self) -> Option<mpsc::UnboundedReceiver<ChannelFault>> {
        self.channels.take_faults()
    }

    // Users

    /// Registers a new user and returns its identity.
    ///
    /// A user is represented by a keystore, a profile, a POD account, an
    /// integrity record and an id ownership record. Posts, following and
    /// followers addresses are seeded with a placeholder.
    pub async fn create_user(
        &self,
        id: &str,
        password: &str,
        name: &str,
        bio: Option<&str>,
        picture: Option<&str>,
        ext: Option<&str>,
    ) -> Result<Identity, PodiumErr> {
        self.check_writable()?;

        if self.is_user(id).await?.is_some() {
            return Err(PodiumErr::DuplicateUser);
        }

        let identity = Identity::generate();
        let address = identity.address();
        let keystore = identity.encrypt(password, id)?;

        let writes = vec![
            PendingWrite::new(vec![paths::for_keystore_of(id, password)], keystore.to_payload()),
            PendingWrite::new(
                vec![paths::for_profile_of(&address)],
                json!({
                    "record": "profile",
                    "type": "profile",
                    "id": id,
                    "name": name,
                    "bio": bio.unwrap_or_default(),
                    "picture": "",
                    "address": address,
                }),
            ),
            PendingWrite::new(
                vec![paths::for_pod_transactions_of(&address)],
                json!({
                    "record": "transaction",
                    "type": "POD",
                    "to": address,
                    "value": INITIAL_POD,
                    "from": "creation",
                }),
            ),
            PendingWrite::new(
                vec![paths::for_integrity_of(&address)],
                json!({
                    "record": "integrity",
                    "type": "integrity",
                    "owner": address,
                    "i": INITIAL_INTEGRITY,
                    "from": "",
                }),
            ),
            PendingWrite::new(
                vec![paths::for_profile_with_id(id)],
                json!({
                    "record": "ownership",
                    "type": "username",
                    "id": id,
                    "owner": address,
                }),
            ),
            PendingWrite::new(
                vec![
                    paths::for_posts_by(&address),
                    paths::for_users_following(&address),
                    paths::for_users_followed_by(&address),
                ],
                placeholder_payload(),
            ),
        ];

        self.store_records(&identity, writes).await?.into_result()?;
        info!("Created user {} at {}", id, address);

        if let Some(picture) = picture.filter(|p| !p.is_empty()) {
            self.update_profile_picture(&identity, picture, ext.unwrap_or("png"))
                .await?;
        }

        Ok(identity)
    }

    /// Stores a profile picture and points the profile of `identity` at it.
    pub async fn update_profile_picture(
        &self,
        identity: &Identity,
        picture: &str,
        ext: &str,
    ) -> Result<Confirmation, PodiumErr> {
        let address = identity.address();
        let key = format!(
            "{}.{}",
            Hash256::hash_from_slice(picture, "media").to_hex(),
            ext
        );
        self.store_media(picture, &key).await?;

        self.store_record(
            identity,
            vec![paths::for_profile_of(&address)],
            json!({
                "record": "image",
                "type": "profile",
                "image": key,
            }),
        )
        .await
    }

    /// Address owning `id`, if the id is taken.
    pub async fn is_user(&self, id: &str) -> Result<Option<LedgerAddress>, PodiumErr> {
        let ownership = match self.get_latest(&paths::for_profile_with_id(id)).await {
            Ok(ownership) => ownership,
            Err(PodiumErr::Timeout) => return Ok(None),
            Err(err) => return Err(err),
        };

        Ok(ownership
            .as_ref()
            .and_then(|record| record.get_str("owner"))
            .and_then(|owner| LedgerAddress::from_base58(owner).ok()))
    }

    /// Recovers the identity of `id` from its keystore.
    pub async fn sign_in(&self, id: &str, password: &str) -> Result<Identity, PodiumErr> {
        let record = self
            .get_latest(&paths::for_keystore_of(id, password))
            .await?
            .ok_or(PodiumErr::Timeout)?;
        let entry = EncryptedEntry::from_record(&record)?;
        let identity = Identity::decrypt(&entry, password, id)?;
        debug!("Signed in {} as {}", id, identity.address());
        Ok(identity)
    }

    /// Credits `value` POD to the account of `identity`.
    pub async fn mint(&self, value: u64, identity: &Identity) -> Result<Confirmation, PodiumErr> {
        let reserve = paths::for_pod_transactions_of(&identity.address());

        self.store_record(
            identity,
            vec![reserve],
            json!({
                "record": "transaction",
                "type": "POD",
                "value": value,
                "from": "mint",
            }),
        )
        .await
    }

    /// Users whose id matches `target` exactly.
    pub async fn search(&self, target: &str) -> Result<Vec<SearchResult>, PodiumErr> {
        let target = target.trim().trim_start_matches('@');

        if target.is_empty() {
            return Ok(vec![]);
        }

        Ok(self
            .is_user(target)
            .await?
            .map(|address| SearchResult {
                id: target.to_owned(),
                address,
            })
            .into_iter()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::media::MemoryObjectStore;
    use tokio::time::Instant;

    fn podium(read_only: bool) -> (MemoryLedger, MemoryObjectStore, Podium) {
        let ledger = MemoryLedger::new();
        let media = MemoryObjectStore::new();
        let config = PodiumConfig {
            application_id: "podium-test".to_owned(),
            timeout: Some(Duration::from_secs(5)),
            read_only,
            ..PodiumConfig::default()
        };
        let podium = Podium::new(config, Arc::new(ledger.clone()), Arc::new(media.clone()));
        (ledger, media, podium)
    }

    #[test]
    fn config_from_settings() {
        let mut settings = Settings::default();
        settings.ledger.application_id = None;
        settings.ledger.application_prefix = "test".to_owned();
        settings.ledger.universe = "Sunstone".to_owned();
        settings.ledger.timeout_secs = 0;
        settings.ledger.root_address = Some("invalid".to_owned());

        let config = PodiumConfig::from_settings(&settings);
        assert!(config.application_id.starts_with("testAUTO|"));
        assert_eq!(config.universe, Universe::Sunstone);
        assert_eq!(config.timeout, None);
        assert_eq!(config.lifetime, Some(Duration::from_secs(60)));
        assert_eq!(config.quiet_period, Duration::from_secs(1));
        assert_eq!(config.root_address, None);
        assert!(!config.read_only);

        assert_eq!("unknown".parse(), Ok(Universe::Alphanet2));
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_write_is_readable_at_each_address() {
        let (_, _, podium) = podium(false);
        let identity = Identity::generate();
        let a1 = LedgerAddress::from_seed("a1");
        let a2 = LedgerAddress::from_seed("a2");

        podium
            .store_record(&identity, vec![a1, a2], json!({"record": "post", "text": "hi"}))
            .await
            .unwrap();

        for address in [a1, a2] {
            let latest = podium.get_latest(&address).await.unwrap().unwrap();
            assert_eq!(latest.get_str("text"), Some("hi"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn read_only_refuses_writes_before_network() {
        let (ledger, media, podium) = podium(true);
        let identity = Identity::generate();

        assert_eq!(
            podium
                .store_record(&identity, vec![LedgerAddress::from_seed("a")], json!({}))
                .await,
            Err(PodiumErr::Permission)
        );
        assert_eq!(
            podium.store_records(&identity, vec![]).await,
            Err(PodiumErr::Permission)
        );
        assert_eq!(
            podium.store_media("aGk=", "a.png").await,
            Err(PodiumErr::Permission)
        );
        assert!(matches!(
            podium.create_user("alice", "pw", "Alice", None, None, None).await,
            Err(PodiumErr::Permission)
        ));
        assert_eq!(ledger.submit_calls(), 0);
        assert!(media.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stores_media_with_image_content_type() {
        let (_, media, podium) = podium(false);
        podium.store_media("aGVsbG8=", "abc.jpeg").await.unwrap();

        let object = media.get("media.podium-network.com/", "abc.jpeg").unwrap();
        assert_eq!(object.bytes, b"hello".to_vec());
        assert_eq!(object.content_type, "image/jpeg");

        assert_eq!(
            podium.store_media("not base64!", "x.png").await,
            Err(PodiumErr::Storage(StorageErr::InvalidData))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn user_lifecycle() {
        let (ledger, media, podium) = podium(false);

        let start = Instant::now();
        assert_eq!(podium.is_user("alice").await, Ok(None));
        assert!(start.elapsed() >= Duration::from_secs(5));

        let identity = podium
            .create_user("alice", "hunter2", "Alice", Some("hi"), Some("aGVsbG8="), Some("png"))
            .await
            .unwrap();
        let address = identity.address();

        assert_eq!(podium.is_user("alice").await, Ok(Some(address)));
        assert_eq!(
            podium.create_user("alice", "pw", "Other", None, None, None).await.unwrap_err(),
            PodiumErr::DuplicateUser
        );

        let signed_in = podium.sign_in("alice", "hunter2").await.unwrap();
        assert_eq!(signed_in.address(), address);

        let profile = podium
            .get_history(&paths::for_profile_of(&address))
            .await
            .unwrap();
        assert_eq!(profile.len(), 2);
        assert_eq!(profile[0].get_str("name"), Some("Alice"));
        assert_eq!(profile[0].get_str("bio"), Some("hi"));
        assert_eq!(media.len(), 1);

        let pod = podium
            .get_latest(&paths::for_pod_transactions_of(&address))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pod.get("value"), Some(&json!(1000)));
        assert_eq!(pod.get_str("from"), Some("creation"));

        // Placeholders make the address enumerable but stay hidden
        let posts = paths::for_posts_by(&address);
        assert_eq!(ledger.items(&posts).len(), 1);
        assert_eq!(podium.get_history(&posts).await, Ok(vec![]));

        let results = podium.search("@alice").await.unwrap();
        assert_eq!(
            results,
            vec![SearchResult {
                id: "alice".to_owned(),
                address
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn mint_credits_own_pod_account() {
        let (_, _, podium) = podium(false);
        let identity = Identity::generate();
        podium.mint(250, &identity).await.unwrap();

        let latest = podium
            .get_latest(&paths::for_pod_transactions_of(&identity.address()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.get("value"), Some(&json!(250)));
        assert_eq!(latest.get_str("from"), Some("mint"));
    }

    #[tokio::test(start_paused = true)]
    async fn channels_use_configured_lifetime() {
        let (_, _, podium) = podium(false);
        let address = LedgerAddress::from_seed("live");
        let channel = podium.open_channel(&address, |_| {}, None);
        assert_eq!(channel.lifetime(), Some(Duration::from_secs(60)));

        podium.clean_up();
        assert!(!channel.is_open());
        assert!(podium.channels().is_empty());
    }
}
