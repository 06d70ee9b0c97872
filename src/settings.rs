// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use config::{Config, ConfigError, File};
use lazy_static::*;
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{create_dir_all, metadata, File as FsFile};
use std::io::Write;
use std::path::{Path, PathBuf};
use struct_field_names_as_array::FieldNamesAsArray;

const ENV_PREFIX: &str = "podium";

lazy_static! {
    pub static ref SETTINGS: Settings = Settings::new().unwrap_or_else(|err| {
        error!("Invalid configuration, falling back to defaults! Reason: {}", err);
        Settings::default()
    });
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, FieldNamesAsArray)]
pub struct Settings {
    /// Ledger settings.
    pub ledger: Ledger,

    /// Media storage settings.
    pub media: Media,

    /// Http server settings.
    pub server: Server,

    /// Process settings.
    pub node: Node,
}

impl Settings {
    /// Loads the settings from the configuration file, writing one with the
    /// default values if it is missing, and the process environment.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = config_path();

        if let Some(config_path) = config_path.as_ref() {
            if metadata(config_path).is_err() {
                write_default_config(config_path);
            }
        }

        let env_source: Vec<_> = std::env::vars().collect();
        Self::from_sources(config_path.as_deref(), &env_source)
    }

    /// Builds settings from an optional configuration file and the given
    /// environment pairs. Variables of the form `PODIUM_<SECTION>_<FIELD>`
    /// override file values, with the underscores of `<FIELD>` dropped.
    pub fn from_sources(
        config_path: Option<&Path>,
        env_source: &[(String, String)],
    ) -> Result<Self, ConfigError> {
        let mut s = Config::builder();

        if let Some(config_path) = config_path {
            s = s.add_source(File::from(config_path).required(false));
        }

        // Set defaults
        let default_settings = Settings::default();
        let defaults: HashMap<String, HashMap<String, DynamicConfVal>> =
            serde_yaml::to_value(&default_settings)
                .and_then(serde_yaml::from_value)
                .map_err(|err| ConfigError::Foreign(Box::new(err)))?;

        for (k1, inner) in &defaults {
            for (k2, v) in inner {
                let key = format!("{k1}.{k2}");

                match v {
                    DynamicConfVal::String(v) => {
                        s = s.set_default(key, v.as_str())?;
                    }

                    DynamicConfVal::Bool(v) => {
                        s = s.set_default(key, v.to_string())?;
                    }

                    DynamicConfVal::U16(v) => {
                        s = s.set_default(key, v.to_string())?;
                    }

                    DynamicConfVal::U64(v) => {
                        s = s.set_default(key, v.to_string())?;
                    }

                    DynamicConfVal::Option(v) => {
                        if let Some(v) = v {
                            s = s.set_default(key, v.as_str())?;
                        }
                    }
                }
            }
        }

        // Make sure to list these in order
        let settings_modules: Vec<_> = vec![
            Ledger::FIELD_NAMES_AS_ARRAY,
            Media::FIELD_NAMES_AS_ARRAY,
            Server::FIELD_NAMES_AS_ARRAY,
            Node::FIELD_NAMES_AS_ARRAY,
        ];

        // Gather all possible settings keys
        let possible_keys: HashMap<String, String> = Settings::FIELD_NAMES_AS_ARRAY
            .iter()
            .zip(settings_modules)
            .flat_map(|(section, fields)| {
                fields.iter().map(move |field| {
                    (
                        format!("{}_{}_{}", ENV_PREFIX, section, field.replace('_', "")),
                        format!("{section}.{field}"),
                    )
                })
            })
            .collect();

        // Env vars are matched manually as the config package `Environment`
        // source cannot tell section and field underscores apart.
        for (k, v) in env_source {
            // Filter empty values
            if v.is_empty() {
                continue;
            }

            if let Some(key) = possible_keys.get(&k.to_lowercase()) {
                s = s.set_override(key.as_str(), v.as_str())?;
            }
        }

        s.build()?.try_deserialize()
    }
}

fn config_path() -> Option<PathBuf> {
    let mut path = dirs::config_dir()?;
    path.push("Podium");
    path.push("config.toml");
    Some(path)
}

fn write_default_config(config_path: &Path) {
    let settings_str = match toml::ser::to_string_pretty(&Settings::default()) {
        Ok(settings_str) => settings_str,
        Err(err) => {
            error!("Failed to serialize default configuration! Reason: {:#?}", err);
            return;
        }
    };

    if let Some(parent) = config_path.parent() {
        let _ = create_dir_all(parent);
    }

    match FsFile::create(config_path) {
        Ok(mut file) => {
            file.write_all(settings_str.as_bytes()).unwrap_or(());
        }
        Err(err) => {
            // If this fails, do nothing and fall back to envionment variables
            error!("Failed to create configuration! Reason: {:#?}", err);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FieldNamesAsArray)]
pub struct Ledger {
    /// Application id records are written under. Generated from the prefix when absent.
    #[serde(alias = "applicationid")]
    pub application_id: Option<String>,

    /// Prefix of generated application ids.
    #[serde(alias = "applicationprefix")]
    pub application_prefix: String,

    /// Ledger universe to bootstrap from.
    ///
    /// One of `sunstone`, `highgarden`, `alphanet` or `alphanet2`.
    pub universe: String,

    /// Seconds after which a history read without any record times out.
    ///
    /// 0 means history reads only end after a quiet period.
    #[serde(alias = "timeoutsecs")]
    pub timeout_secs: u64,

    /// Milliseconds of inactivity after which a channel closes itself.
    ///
    /// 0 keeps channels open until closed explicitly.
    #[serde(alias = "connectionlifetimems")]
    pub connection_lifetime_ms: u64,

    /// Milliseconds of silence after which a history read is considered complete.
    #[serde(alias = "quietperiodms")]
    pub quiet_period_ms: u64,

    /// Address of the root user.
    #[serde(alias = "rootaddress")]
    pub root_address: Option<String>,

    /// Refuse all writes, as a remote client does.
    #[serde(alias = "readonly")]
    pub read_only: bool,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            application_id: None,
            application_prefix: "podium".to_owned(),
            universe: "alphanet2".to_owned(),
            timeout_secs: 10,
            connection_lifetime_ms: 60_000,
            quiet_period_ms: 1000,
            root_address: None,
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FieldNamesAsArray)]
pub struct Media {
    /// Bucket media objects are stored in.
    #[serde(alias = "mediastore")]
    pub media_store: String,

    /// Region of the object store.
    pub region: String,
}

impl Default for Media {
    fn default() -> Self {
        Self {
            media_store: "media.podium-network.com/".to_owned(),
            region: "eu-west-1".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FieldNamesAsArray)]
pub struct Server {
    /// Serve the http interface.
    #[serde(alias = "httpenabled")]
    pub http_enabled: bool,

    /// Http listen address.
    #[serde(alias = "listenaddr")]
    pub listen_addr: String,

    /// Http listen port.
    #[serde(alias = "listenport")]
    pub listen_port: u16,

    /// Passphrase under which clients encrypt identities sent to the server.
    #[serde(alias = "publickey")]
    pub public_key: String,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            http_enabled: true,
            listen_addr: "127.0.0.1".to_owned(),
            listen_port: 3000,
            public_key: "podium".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FieldNamesAsArray)]
pub struct Node {
    /// Log debug output of the podium crate.
    #[serde(alias = "debugmode")]
    pub debug_mode: bool,

    /// Number of runtime worker threads.
    ///
    /// Default is 0 which means the number of cores of the system
    #[serde(alias = "workerthreads")]
    pub worker_threads: u16,

    /// Export traces to a local jaeger agent.
    #[serde(alias = "jaegertracing")]
    pub jaeger_tracing: bool,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            debug_mode: false,
            worker_threads: 0,
            jaeger_tracing: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum DynamicConfVal {
    String(String),
    Option(Option<String>),
    Bool(bool),
    U16(u16),
    U64(u64),
}
