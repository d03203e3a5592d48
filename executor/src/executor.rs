use crate::cache::{CacheEntry, VersionedCache, cache_key};
use crate::loader::{LoadError, PolicyLoader};
use crate::metrics_defs::{CACHE_HIT, CACHE_MISS, LOADER_CALLS, LOADER_DURATION, LOADS_COALESCED};
use crate::single_flight::SingleFlight;
use async_trait::async_trait;
use policy_store::{CanaryRouter, PolicyRef};
use serde::Serialize;
use shared::{counter, histogram};
use signing::signature::normalize_hash;
use signing::{ArtifactVerifier, Candidate, VerifyError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Clone, Debug, PartialEq)]
pub enum ExecutorError {
    #[error("no policy loader configured")]
    LoaderUnavailable,
    #[error("policy {0} not found")]
    PolicyNotFound(String),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Verification(#[from] VerifyError),
    #[error("evaluation failed: {0}")]
    Engine(String),
    #[error("no policy engine configured")]
    EngineUnavailable,
}

impl From<JoinError> for ExecutorError {
    fn from(_: JoinError) -> Self {
        ExecutorError::Load(LoadError::Cancelled)
    }
}

/// Supplies the expected artifact hash for a version when the caller did
/// not provide one.
#[async_trait]
pub trait HashResolver: Send + Sync {
    async fn resolve_hash(&self, name: &str, version: &str) -> Option<String>;
}

#[async_trait]
impl HashResolver for CanaryRouter {
    async fn resolve_hash(&self, name: &str, version: &str) -> Option<String> {
        match self.get(&PolicyRef::new(name, version)).await {
            Ok(bundle) => Some(bundle.hash.clone()),
            Err(e) => {
                tracing::debug!(policy = %name, version = %version, error = %e, "cannot resolve hash");
                None
            }
        }
    }
}

/// Evaluates a verified artifact against request input. The decision is
/// passed through to the caller untouched.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn evaluate(
        &self,
        entry: &CacheEntry,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value, String>;
}

#[derive(Debug)]
pub struct Evaluation {
    pub entry: Arc<CacheEntry>,
    pub cache_hit: bool,
    pub decision: serde_json::Value,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub keys: Vec<String>,
}

/// Owns the verified artifact cache. Every insert goes through a verified
/// load, so anything a caller gets back has passed [`ArtifactVerifier`].
pub struct Executor {
    cache: Arc<VersionedCache>,
    verifier: Arc<ArtifactVerifier>,
    loader: Option<Arc<dyn PolicyLoader>>,
    resolver: Option<Arc<dyn HashResolver>>,
    engine: Option<Arc<dyn PolicyEngine>>,
    fetch_timeout: Duration,
    flights: SingleFlight<Arc<CacheEntry>, ExecutorError>,
}

impl Executor {
    pub fn new(verifier: Arc<ArtifactVerifier>, cache: VersionedCache) -> Self {
        Executor {
            cache: Arc::new(cache),
            verifier,
            loader: None,
            resolver: None,
            engine: None,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            flights: SingleFlight::new(),
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn PolicyLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HashResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn PolicyEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    pub async fn execute(
        &self,
        name: &str,
        version: &str,
        input: &serde_json::Value,
    ) -> Result<Evaluation, ExecutorError> {
        let (entry, cache_hit) = self.lookup(name, version).await?;
        self.evaluate(entry, cache_hit, input).await
    }

    pub async fn execute_with_hash(
        &self,
        name: &str,
        version: &str,
        hash: &str,
        input: &serde_json::Value,
    ) -> Result<Evaluation, ExecutorError> {
        let (entry, cache_hit) = self.lookup_with_hash(name, version, hash).await?;
        self.evaluate(entry, cache_hit, input).await
    }

    pub async fn fetch(&self, name: &str, version: &str) -> Result<Arc<CacheEntry>, ExecutorError> {
        self.lookup(name, version).await.map(|(entry, _)| entry)
    }

    pub async fn fetch_with_hash(
        &self,
        name: &str,
        version: &str,
        hash: &str,
    ) -> Result<Arc<CacheEntry>, ExecutorError> {
        self.lookup_with_hash(name, version, hash)
            .await
            .map(|(entry, _)| entry)
    }

    /// Warms the cache with the current version and, when given, the one
    /// before it. Only a failure on the current version is an error.
    pub async fn preload(
        &self,
        name: &str,
        version: &str,
        previous: Option<&str>,
    ) -> Result<(), ExecutorError> {
        self.fetch(name, version).await?;
        tracing::info!(policy = %name, version = %version, "preloaded policy");

        if let Some(previous) = previous {
            match self.fetch(name, previous).await {
                Ok(_) => {
                    tracing::info!(policy = %name, version = %previous, "preloaded previous version")
                }
                Err(e) => tracing::warn!(
                    policy = %name,
                    version = %previous,
                    error = %e,
                    "failed to preload previous version"
                ),
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.cache.size(),
            keys: self.cache.keys(),
        }
    }

    pub fn evict_expired(&self) -> usize {
        self.cache.evict()
    }

    /// Sweeps expired entries every `interval` until the handle is aborted.
    pub fn spawn_eviction_task(&self, interval: Duration) -> JoinHandle<()> {
        let cache = self.cache.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = cache.evict();
                if removed > 0 {
                    tracing::info!(removed, remaining = cache.size(), "evicted expired policies");
                }
            }
        })
    }

    async fn lookup(
        &self,
        name: &str,
        version: &str,
    ) -> Result<(Arc<CacheEntry>, bool), ExecutorError> {
        if let Some(entry) = self.cache.get(name, version) {
            counter!(CACHE_HIT).increment(1);
            return Ok((entry, true));
        }
        if self.loader.is_none() {
            return Err(ExecutorError::LoaderUnavailable);
        }

        let hash = match &self.resolver {
            Some(resolver) => resolver.resolve_hash(name, version).await,
            None => None,
        }
        .ok_or_else(|| ExecutorError::PolicyNotFound(cache_key(name, version)))?;

        counter!(CACHE_MISS).increment(1);
        self.load(name, version, &hash).await.map(|entry| (entry, false))
    }

    async fn lookup_with_hash(
        &self,
        name: &str,
        version: &str,
        hash: &str,
    ) -> Result<(Arc<CacheEntry>, bool), ExecutorError> {
        if let Some(entry) = self.cache.get(name, version) {
            if entry.hash == normalize_hash(hash) {
                counter!(CACHE_HIT).increment(1);
                return Ok((entry, true));
            }
            tracing::info!(
                policy = %name,
                version = %version,
                cached = %entry.hash,
                requested = %hash,
                "cached artifact has a stale hash, reloading"
            );
        }

        counter!(CACHE_MISS).increment(1);
        self.load(name, version, hash).await.map(|entry| (entry, false))
    }

    async fn load(
        &self,
        name: &str,
        version: &str,
        hash: &str,
    ) -> Result<Arc<CacheEntry>, ExecutorError> {
        let loader = self.loader.clone().ok_or(ExecutorError::LoaderUnavailable)?;
        let hash = normalize_hash(hash);
        let key = format!("{}#{hash}", cache_key(name, version));

        let work = load_verified(
            self.cache.clone(),
            self.verifier.clone(),
            loader,
            self.fetch_timeout,
            name.to_string(),
            version.to_string(),
            hash,
        );
        let joined = self.flights.run(&key, work).await;
        if !joined.leader {
            counter!(LOADS_COALESCED).increment(1);
        }
        joined.result
    }

    async fn evaluate(
        &self,
        entry: Arc<CacheEntry>,
        cache_hit: bool,
        input: &serde_json::Value,
    ) -> Result<Evaluation, ExecutorError> {
        let engine = self.engine.as_ref().ok_or(ExecutorError::EngineUnavailable)?;
        let decision = engine
            .evaluate(&entry, input)
            .await
            .map_err(ExecutorError::Engine)?;
        Ok(Evaluation {
            entry,
            cache_hit,
            decision,
        })
    }
}

/// Fetch, verify, then insert. Nothing touches the cache unless every step
/// succeeded.
async fn load_verified(
    cache: Arc<VersionedCache>,
    verifier: Arc<ArtifactVerifier>,
    loader: Arc<dyn PolicyLoader>,
    fetch_timeout: Duration,
    name: String,
    version: String,
    hash: String,
) -> Result<Arc<CacheEntry>, ExecutorError> {
    // A flight for this key may have finished between our miss and now.
    if let Some(entry) = cache.get(&name, &version) {
        if entry.hash == hash {
            return Ok(entry);
        }
    }

    let start = Instant::now();
    let fetch = loader.load(&name, &version, &hash);
    let loaded = match tokio::time::timeout(fetch_timeout, fetch).await {
        Ok(Ok(loaded)) => loaded,
        Ok(Err(e)) => {
            counter!(LOADER_CALLS, "outcome" => "error").increment(1);
            tracing::warn!(
                policy = %name,
                version = %version,
                loader = %loader.describe(),
                error = %e,
                "failed to load policy"
            );
            return Err(e.into());
        }
        Err(_) => {
            counter!(LOADER_CALLS, "outcome" => "timeout").increment(1);
            tracing::warn!(
                policy = %name,
                version = %version,
                timeout = ?fetch_timeout,
                "policy load timed out"
            );
            return Err(LoadError::Timeout(fetch_timeout).into());
        }
    };

    let verified = verifier.verify(&Candidate {
        name: &name,
        version: &version,
        expected_hash: Some(&hash),
        bytes: &loaded.bytes,
        sidecar: loaded.sidecar.as_deref(),
    });
    let verified = match verified {
        Ok(verified) => verified,
        Err(e) => {
            counter!(LOADER_CALLS, "outcome" => "rejected").increment(1);
            return Err(e.into());
        }
    };

    counter!(LOADER_CALLS, "outcome" => "ok").increment(1);
    histogram!(LOADER_DURATION).record(start.elapsed().as_secs_f64());
    let entry = cache.set(CacheEntry::new(
        &name,
        &version,
        &hash,
        loaded.bytes,
        verified.signed,
    ));
    tracing::info!(
        policy = %name,
        version = %version,
        hash = %hash,
        signed = verified.signed,
        "loaded verified policy"
    );
    Ok(entry)
}
