// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Binary object storage used for profile pictures and post media.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageErr>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Object store kept in process memory.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<(String, String), StoredObject>>>,
}

impl MemoryObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .read()
            .get(&(bucket.to_owned(), key.to_owned()))
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageErr> {
        if bucket.is_empty() {
            return Err(StorageErr::InvalidBucket);
        }

        if key.is_empty() {
            return Err(StorageErr::InvalidKey);
        }

        self.objects.write().insert(
            (bucket.to_owned(), key.to_owned()),
            StoredObject {
                bytes,
                content_type: content_type.to_owned(),
            },
        );

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageErr {
    InvalidBucket,
    InvalidKey,

    /// Object data could not be decoded
    InvalidData,

    /// Backend failure
    Backend(String),
}

impl fmt::Display for StorageErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBucket => write!(f, "invalid bucket"),
            Self::InvalidKey => write!(f, "invalid object key"),
            Self::InvalidData => write!(f, "invalid object data"),
            Self::Backend(reason) => write!(f, "{reason}"),
        }
    }
}

/// Content type for an image stored under `key`, taken from its extension.
#[must_use]
pub fn image_content_type(key: &str) -> String {
    let ext = key.rsplit_once('.').map_or("", |(_, ext)| ext);
    format!("image/{ext}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_and_overwrites() {
        let store = MemoryObjectStore::new();
        store
            .put_object("bucket", "a.png", vec![1, 2], "image/png")
            .await
            .unwrap();
        store
            .put_object("bucket", "a.png", vec![3], "image/png")
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("bucket", "a.png").unwrap().bytes, vec![3]);
        assert!(store.get("other", "a.png").is_none());
    }

    #[tokio::test]
    async fn rejects_empty_names() {
        let store = MemoryObjectStore::new();
        assert_eq!(
            store.put_object("", "a", vec![], "x").await,
            Err(StorageErr::InvalidBucket)
        );
        assert_eq!(
            store.put_object("b", "", vec![], "x").await,
            Err(StorageErr::InvalidKey)
        );
        assert!(store.is_empty());
    }

    #[test]
    fn content_type_from_extension() {
        assert_eq!(image_content_type("abc.jpeg"), "image/jpeg");
        assert_eq!(image_content_type("x.y.png"), "image/png");
        assert_eq!(image_content_type("noext"), "image/");
    }
}
