//! Pluggable document-store client used by the agent pool's `Repository`.
//!
//! `Persistable` is the low-level single-document save/load primitive, backed by one or more
//! `opendal::Operator` profiles in speed order with cache write-back on fallback reads. The
//! `collection` module builds a small indexed document store on top of it, since `Persistable`
//! alone has no notion of secondary indexes or queries.

pub mod collection;
pub mod compression;
pub mod error;
pub mod memory;
pub mod settings;

use async_once_cell::OnceCell as AsyncOnceCell;
use async_trait::async_trait;
use opendal::Operator;
use pool_settings::PoolSettings;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug_span, Instrument};

use std::collections::HashMap;
use std::sync::Arc;

use crate::compression::{maybe_compress, maybe_decompress};

pub use collection::{DocumentStore, IndexSpec, MemoryIndexedStore, Query, SortOrder};
pub use error::{Error, Result};

static STORE_BACKEND: AsyncOnceCell<StoreBackend> = AsyncOnceCell::new();

/// The resolved set of document-store operators, ranked by measured speed.
#[derive(Debug)]
pub struct StoreBackend {
    pub ops: HashMap<String, (Operator, u128)>,
    pub fastest_op: Operator,
}

impl StoreBackend {
    pub async fn instance() -> Result<&'static StoreBackend> {
        STORE_BACKEND
            .get_or_try_init(async {
                let settings = PoolSettings::new();
                init_store_backend(settings).await
            })
            .await
    }

    /// Memory-only backend, for tests and offline deployments with no durable storage.
    pub async fn init_memory_only() -> Result<&'static StoreBackend> {
        STORE_BACKEND
            .get_or_try_init(async {
                let settings = memory::create_memory_only_settings()?;
                init_store_backend(settings).await
            })
            .await
    }

    /// A cloned `Arc<StoreBackend>`, safe to hand to callers that need ownership.
    pub async fn arc_instance() -> Result<Arc<StoreBackend>> {
        let backend = Self::instance().await?;
        Ok(Arc::new(StoreBackend {
            ops: backend.ops.clone(),
            fastest_op: backend.fastest_op.clone(),
        }))
    }

    pub async fn arc_memory_only() -> Result<Arc<StoreBackend>> {
        let backend = Self::init_memory_only().await?;
        Ok(Arc::new(StoreBackend {
            ops: backend.ops.clone(),
            fastest_op: backend.fastest_op.clone(),
        }))
    }
}

async fn init_store_backend(settings: PoolSettings) -> Result<StoreBackend> {
    tracing::debug!(
        profiles = settings.profiles.len(),
        path = %settings.default_data_path,
        "initializing document-store backend"
    );

    for profile in settings.profiles.values() {
        if profile.get("type").map(String::as_str) == Some("dashmap") {
            if let Some(root) = profile.get("root") {
                if !root.is_empty() {
                    if let Err(e) = std::fs::create_dir_all(root) {
                        tracing::warn!(root = %root, error = %e, "failed to pre-create dashmap directory");
                    }
                }
            }
        }
    }

    let operators = settings::parse_profiles(&settings).await?;
    let mut ops_vec: Vec<(&String, &(Operator, u128))> = operators.iter().collect();
    ops_vec.sort_by_key(|&(_, (_, speed))| *speed);

    let ops: HashMap<String, (Operator, u128)> = ops_vec
        .into_iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let fastest_op = match ops.values().min_by_key(|(_, speed)| *speed) {
        Some((op, _)) => op.clone(),
        None => return Err(Error::NoOperator),
    };

    Ok(StoreBackend { ops, fastest_op })
}

/// Save and load a single object to and from the fastest configured document-store operator,
/// falling back across the remaining profiles in speed order on read.
#[async_trait]
pub trait Persistable: Serialize + DeserializeOwned {
    fn new(key: String) -> Self;

    async fn save(&self) -> Result<()>;

    async fn save_to_one(&self, profile_name: &str) -> Result<()>;

    async fn load(&mut self) -> Result<Self>
    where
        Self: Sized;

    async fn load_config(&self) -> Result<(HashMap<String, (Operator, u128)>, Operator)> {
        let state = StoreBackend::instance().await?;
        Ok((state.ops.clone(), state.fastest_op.clone()))
    }

    async fn save_to_all(&self) -> Result<()> {
        let (ops, _fastest_op) = &self.load_config().await?;
        let key = self.get_key();
        let serde_str = serde_json::to_string(&self)?;
        for (op, _time) in ops.values() {
            tracing::debug!(?op, "saving to operator");
            op.write(&key, serde_str.clone()).await?;
        }
        Ok(())
    }

    async fn save_to_profile(&self, profile_name: &str) -> Result<()> {
        let (ops, _fastest_op) = &self.load_config().await?;
        let key = self.get_key();
        let serde_str = serde_json::to_string(&self)?;

        ops.get(profile_name)
            .ok_or_else(|| {
                Error::Profile(format!(
                    "unknown profile name: {profile_name}. available profiles: {}",
                    ops.keys().map(String::as_str).collect::<Vec<_>>().join(", ")
                ))
            })?
            .0
            .write(&key, serde_str.clone())
            .await
            .map_err(|e| Error::OpenDal(Box::new(e)))?;

        Ok(())
    }

    /// Load from operators in speed order, with non-blocking cache write-back to the fastest
    /// operator on a fallback hit, and schema-evolution handling (a failed deserialize clears
    /// the stale cache entry and falls through to the next operator).
    async fn load_from_operator(&self, key: &str, _op: &Operator) -> Result<Self>
    where
        Self: Sized,
    {
        let span = debug_span!("load_from_operator", key = %key);
        async {
            let (ops, fastest_op) = &self.load_config().await?;

            async fn try_read_from_op<T: DeserializeOwned>(
                op: &Operator,
                key: &str,
                profile_name: Option<&str>,
            ) -> Option<std::result::Result<T, Error>> {
                let span = debug_span!("try_read", profile = ?profile_name);
                async {
                    match op.stat(key).await {
                        Ok(_) => match op.read(key).await {
                            Ok(bs) => {
                                let data = match maybe_decompress(&bs.to_vec()) {
                                    Ok(decompressed) => decompressed,
                                    Err(e) => {
                                        tracing::debug!(key, error = %e, "decompression failed, using raw bytes");
                                        bs.to_vec()
                                    }
                                };

                                match serde_json::from_slice(&data) {
                                    Ok(obj) => {
                                        tracing::debug!(key, profile = ?profile_name, "loaded");
                                        Some(Ok(obj))
                                    }
                                    Err(e) => {
                                        tracing::warn!(key, error = %e, "failed to deserialize");
                                        Some(Err(Error::Json(e)))
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::debug!(key, error = %e, "failed to read after stat");
                                Some(Err(e.into()))
                            }
                        },
                        Err(e) if e.kind() == opendal::ErrorKind::NotFound => None,
                        Err(e) => {
                            tracing::debug!(key, error = %e, "failed to stat");
                            Some(Err(e.into()))
                        }
                    }
                }
                .instrument(span)
                .await
            }

            let schema_evolution_detected = {
                match try_read_from_op::<Self>(fastest_op, key, None).await {
                    Some(Ok(obj)) => return Ok(obj),
                    Some(Err(Error::Json(_))) => true,
                    Some(Err(_)) => false,
                    None => false,
                }
            };

            if schema_evolution_detected {
                tracing::info!(key, "schema evolution detected, clearing cache entry");
                if let Err(e) = fastest_op.delete(key).await {
                    tracing::debug!(key, error = %e, "failed to delete stale cache entry");
                }
            }

            let mut ops_vec: Vec<(&String, &(Operator, u128))> = ops.iter().collect();
            ops_vec.sort_by_key(|&(_, (_, speed))| *speed);

            for (profile_name, (op, _speed)) in ops_vec {
                if std::ptr::eq(op as *const Operator, fastest_op as *const Operator) {
                    continue;
                }

                if let Some(result) = try_read_from_op::<Self>(op, key, Some(profile_name)).await {
                    match result {
                        Ok(obj) => {
                            tracing::info!(key, profile = profile_name, "loaded from fallback profile");

                            if let Ok(serialized) = serde_json::to_vec(&obj) {
                                let fastest = fastest_op.clone();
                                let k = key.to_string();
                                tokio::spawn(async move {
                                    let data = maybe_compress(&serialized);
                                    if let Err(e) = fastest.write(&k, data).await {
                                        tracing::debug!(key = %k, error = %e, "cache write-back failed");
                                    }
                                });
                            }

                            return Ok(obj);
                        }
                        Err(Error::Json(_)) | Err(_) => continue,
                    }
                }
            }

            tracing::debug!(key, "not found in any storage backend");
            Err(Error::NotFound(key.to_string()))
        }
        .instrument(span)
        .await
    }

    fn get_key(&self) -> String;

    fn normalize_key(&self, key: &str) -> String {
        let re = regex::Regex::new(r"[^a-zA-Z0-9]+").expect("static pattern is valid");
        let normalized = re.replace_all(key, "_").to_lowercase();

        let cleaned = normalized.trim_matches('_').to_string();
        let re_multi = regex::Regex::new(r"_+").expect("static pattern is valid");
        let final_key = re_multi.replace_all(&cleaned, "_").to_string();

        if final_key.is_empty() {
            tracing::warn!(key, "key normalization produced an empty string, hashing instead");
            use std::collections::hash_map::DefaultHasher;
            use std::hash::{Hash, Hasher};
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            return format!("fallback_{:x}", hasher.finish());
        }

        final_key
    }
}
