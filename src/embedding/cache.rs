//! Persistent embedding cache and the cache-aware embedder.
//!
//! Vectors are keyed by `(namespace, content_hash)` where the namespace is
//! [`EmbeddingProvider::cache_namespace`], so switching models can never
//! serve a stale vector. The cache is append-only: the first vector written
//! for a key wins and nothing is evicted except by an explicit [`clear`].
//!
//! [`CachedEmbedder`] serializes work per key: concurrent callers asking for
//! the same uncached text wait for one external call instead of each making
//! their own.
//!
//! [`clear`]: EmbeddingCache::clear

use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

use super::{vec_to_blob, blob_to_vec, EmbeddingProvider};
use crate::chunk::content_hash;
use crate::error::{Error, Result};

enum Backend {
    Sqlite(SqlitePool),
    Memory(RwLock<HashMap<(String, String), Vec<f32>>>),
}

/// Content-addressed vector cache.
pub struct EmbeddingCache {
    backend: Backend,
}

impl EmbeddingCache {
    /// Cache stored in the `embedding_cache` table of an initialized database.
    pub fn sqlite(pool: SqlitePool) -> Self {
        Self {
            backend: Backend::Sqlite(pool),
        }
    }

    /// Process-local cache, for tests and one-shot runs.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get(&self, namespace: &str, hash: &str) -> Result<Option<Vec<f32>>> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let blob: Option<Vec<u8>> = sqlx::query_scalar(
                    "SELECT embedding FROM embedding_cache WHERE model = ? AND content_hash = ?",
                )
                .bind(namespace)
                .bind(hash)
                .fetch_optional(pool)
                .await?;
                Ok(blob.map(|b| blob_to_vec(&b)))
            }
            Backend::Memory(map) => Ok(read(map)?
                .get(&(namespace.to_string(), hash.to_string()))
                .cloned()),
        }
    }

    /// Store a vector unless the key is already present.
    pub async fn put(&self, namespace: &str, hash: &str, vector: &[f32]) -> Result<()> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO embedding_cache (model, content_hash, dims, embedding, created_at)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(namespace)
                .bind(hash)
                .bind(vector.len() as i64)
                .bind(vec_to_blob(vector))
                .bind(chrono::Utc::now().timestamp())
                .execute(pool)
                .await?;
            }
            Backend::Memory(map) => {
                write(map)?
                    .entry((namespace.to_string(), hash.to_string()))
                    .or_insert_with(|| vector.to_vec());
            }
        }
        Ok(())
    }

    /// Cached vector count per namespace, sorted by namespace.
    pub async fn counts(&self) -> Result<Vec<(String, u64)>> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let rows = sqlx::query(
                    "SELECT model, COUNT(*) AS n FROM embedding_cache GROUP BY model ORDER BY model",
                )
                .fetch_all(pool)
                .await?;
                Ok(rows
                    .iter()
                    .map(|r| (r.get::<String, _>("model"), r.get::<i64, _>("n") as u64))
                    .collect())
            }
            Backend::Memory(map) => {
                let mut counts: BTreeMap<String, u64> = BTreeMap::new();
                for (ns, _) in read(map)?.keys() {
                    *counts.entry(ns.clone()).or_default() += 1;
                }
                Ok(counts.into_iter().collect())
            }
        }
    }

    pub async fn len(&self) -> Result<u64> {
        Ok(self.counts().await?.iter().map(|(_, n)| n).sum())
    }

    /// Drop every cached vector. Returns how many were removed.
    pub async fn clear(&self) -> Result<u64> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let res = sqlx::query("DELETE FROM embedding_cache")
                    .execute(pool)
                    .await?;
                Ok(res.rows_affected())
            }
            Backend::Memory(map) => {
                let mut guard = write(map)?;
                let n = guard.len() as u64;
                guard.clear();
                Ok(n)
            }
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<std::sync::RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| Error::Index("embedding cache lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<std::sync::RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| Error::Index("embedding cache lock poisoned".to_string()))
}

/// Result of a cache-aware embedding call.
#[derive(Debug, Clone)]
pub struct EmbedOutcome {
    /// One vector per input text, in input order.
    pub vectors: Vec<Vec<f32>>,
    /// Distinct texts served from the cache.
    pub cache_hits: usize,
    /// Distinct texts sent to the provider.
    pub computed: usize,
}

/// An [`EmbeddingProvider`] fronted by an [`EmbeddingCache`].
pub struct CachedEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<EmbeddingCache>,
    batch_size: usize,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CachedEmbedder {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<EmbeddingCache>,
        batch_size: usize,
    ) -> Self {
        Self {
            provider,
            cache,
            batch_size: batch_size.max(1),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    fn key_lock(&self, hash: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| Error::Index("embedding key lock table poisoned".to_string()))?;
        Ok(Arc::clone(locks.entry(hash.to_string()).or_default()))
    }

    fn release_idle_locks(&self) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.retain(|_, l| Arc::strong_count(l) > 1);
        }
    }

    /// Embed `texts`, consulting the cache first.
    ///
    /// On a provider failure the error is returned as-is; vectors computed
    /// by earlier batches of the same call stay cached.
    pub async fn embed(&self, texts: &[String]) -> Result<EmbedOutcome> {
        let namespace = self.provider.cache_namespace();
        let hashes: Vec<String> = texts.iter().map(|t| content_hash(t)).collect();

        let mut found: HashMap<String, Vec<f32>> = HashMap::new();
        // BTreeMap keeps key-lock acquisition in a global order.
        let mut missing: BTreeMap<String, String> = BTreeMap::new();
        for (hash, text) in hashes.iter().zip(texts) {
            if found.contains_key(hash) || missing.contains_key(hash) {
                continue;
            }
            match self.cache.get(&namespace, hash).await? {
                Some(v) => {
                    found.insert(hash.clone(), v);
                }
                None => {
                    missing.insert(hash.clone(), text.clone());
                }
            }
        }
        let mut cache_hits = found.len();
        let mut computed = 0;

        if !missing.is_empty() {
            let mut guards = Vec::with_capacity(missing.len());
            for hash in missing.keys() {
                guards.push(self.key_lock(hash)?.lock_owned().await);
            }

            // Another writer may have filled keys while we waited.
            let mut todo: Vec<(String, String)> = Vec::new();
            for (hash, text) in missing {
                match self.cache.get(&namespace, &hash).await? {
                    Some(v) => {
                        cache_hits += 1;
                        found.insert(hash, v);
                    }
                    None => todo.push((hash, text)),
                }
            }

            let result = self.compute(&namespace, &todo, &mut found).await;
            drop(guards);
            self.release_idle_locks();
            computed = result?;
        }

        let vectors = hashes
            .iter()
            .map(|h| {
                found.get(h).cloned().ok_or_else(|| {
                    Error::ProviderUnavailable(format!("no vector produced for {}", h))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            texts = texts.len(),
            cache_hits,
            computed,
            namespace = %namespace,
            "embedded batch"
        );

        Ok(EmbedOutcome {
            vectors,
            cache_hits,
            computed,
        })
    }

    async fn compute(
        &self,
        namespace: &str,
        todo: &[(String, String)],
        found: &mut HashMap<String, Vec<f32>>,
    ) -> Result<usize> {
        let mut computed = 0;
        for batch in todo.chunks(self.batch_size) {
            let inputs: Vec<String> = batch.iter().map(|(_, t)| t.clone()).collect();
            let vectors = self.provider.embed(&inputs).await?;
            if vectors.len() != inputs.len() {
                return Err(Error::ProviderUnavailable(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    inputs.len()
                )));
            }
            for ((hash, _), vector) in batch.iter().zip(vectors) {
                self.cache.put(namespace, hash, &vector).await?;
                found.insert(hash.clone(), vector);
                computed += 1;
            }
        }
        Ok(computed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashProvider;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts texts it is asked to embed.
    struct CountingProvider {
        inner: HashProvider,
        calls: AtomicUsize,
        texts: AtomicUsize,
    }

    impl CountingProvider {
        fn new() -> Self {
            Self {
                inner: HashProvider::new(16),
                calls: AtomicUsize::new(0),
                texts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            16
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            self.inner.embed(texts).await
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn second_call_is_served_from_cache() {
        let provider = Arc::new(CountingProvider::new());
        let embedder = CachedEmbedder::new(
            provider.clone(),
            Arc::new(EmbeddingCache::in_memory()),
            8,
        );

        let first = embedder.embed(&strings(&["alpha", "beta"])).await.unwrap();
        assert_eq!(first.computed, 2);
        assert_eq!(first.cache_hits, 0);

        let second = embedder.embed(&strings(&["beta", "alpha"])).await.unwrap();
        assert_eq!(second.computed, 0);
        assert_eq!(second.cache_hits, 2);
        assert_eq!(second.vectors[0], first.vectors[1]);
        assert_eq!(second.vectors[1], first.vectors[0]);
        assert_eq!(provider.texts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn duplicates_within_a_call_are_embedded_once() {
        let provider = Arc::new(CountingProvider::new());
        let embedder =
            CachedEmbedder::new(provider.clone(), Arc::new(EmbeddingCache::in_memory()), 8);
        let out = embedder.embed(&strings(&["x", "x", "y", "x"])).await.unwrap();
        assert_eq!(out.vectors.len(), 4);
        assert_eq!(out.vectors[0], out.vectors[3]);
        assert_eq!(provider.texts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_computation() {
        let provider = Arc::new(CountingProvider::new());
        let embedder = Arc::new(CachedEmbedder::new(
            provider.clone(),
            Arc::new(EmbeddingCache::in_memory()),
            8,
        ));
        let texts = strings(&["shared text", "other text"]);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let e = Arc::clone(&embedder);
            let t = texts.clone();
            handles.push(tokio::spawn(async move { e.embed(&t).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(provider.texts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn batches_respect_batch_size() {
        let provider = Arc::new(CountingProvider::new());
        let embedder =
            CachedEmbedder::new(provider.clone(), Arc::new(EmbeddingCache::in_memory()), 2);
        embedder
            .embed(&strings(&["a", "b", "c", "d", "e"]))
            .await
            .unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn namespaces_do_not_collide() {
        let cache = EmbeddingCache::in_memory();
        cache.put("m1@2", "h", &[1.0, 0.0]).await.unwrap();
        assert!(cache.get("m2@2", "h").await.unwrap().is_none());
        cache.put("m1@2", "h", &[0.0, 1.0]).await.unwrap();
        assert_eq!(cache.get("m1@2", "h").await.unwrap().unwrap(), vec![1.0, 0.0]);
        assert_eq!(cache.len().await.unwrap(), 1);
        assert_eq!(cache.clear().await.unwrap(), 1);
        assert_eq!(cache.len().await.unwrap(), 0);
    }
}
