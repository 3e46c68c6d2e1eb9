use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use drover_config::{JitterMode, RetrySettings};

use crate::task::{digest, digest_str};

/// Error shape the executor retries on. `transient` mirrors the taxonomy:
/// network trouble and 5xx/429 are transient, caller bugs are not.
#[derive(Debug, Clone)]
pub struct InvokeError {
    pub message: String,
    pub transient: bool,
}

impl InvokeError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecOutcome<T> {
    pub success: bool,
    pub attempts: u32,
    pub total_time_ms: u64,
    pub result: Option<T>,
    pub error: Option<String>,
    pub idempotency_key: String,
    pub cached: bool,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: JitterMode,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_backoff_ms: settings.base_backoff_ms,
            max_backoff_ms: settings.max_backoff_ms,
            jitter: settings.jitter,
        }
    }

    /// Delay before retry number `attempt` (1-based). `prev_delay_ms` feeds
    /// the decorrelated strategy.
    pub fn delay_ms(&self, attempt: u32, prev_delay_ms: u64) -> u64 {
        let exp = self
            .base_backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_backoff_ms);

        let mut rng = rand::rng();
        match self.jitter {
            JitterMode::None => exp,
            JitterMode::Full => rng.random_range(0..=exp),
            JitterMode::Equal => exp / 2 + rng.random_range(0..=exp / 2),
            JitterMode::Decorrelated => {
                let upper = prev_delay_ms
                    .saturating_mul(3)
                    .max(self.base_backoff_ms + 1)
                    .min(self.max_backoff_ms);
                rng.random_range(self.base_backoff_ms..=upper.max(self.base_backoff_ms))
            }
        }
    }
}

/// Successful results keyed by idempotency key. Optionally persisted as JSON
/// next to the session data, written atomically (temp file + rename).
pub struct IdempotencyCache {
    entries: Mutex<HashMap<String, Value>>,
    path: Option<PathBuf>,
}

impl IdempotencyCache {
    pub fn in_memory() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            path: None,
        }
    }

    pub fn persistent(path: PathBuf) -> Self {
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        Self {
            entries: Mutex::new(entries),
            path: Some(path),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().expect("cache lock").get(key).cloned()
    }

    pub fn put(&self, key: &str, value: Value) {
        let snapshot = {
            let mut entries = self.entries.lock().expect("cache lock");
            entries.insert(key.to_string(), value);
            self.path.as_ref().map(|_| entries.clone())
        };
        if let (Some(path), Some(entries)) = (&self.path, snapshot) {
            if let Err(e) = write_atomic(path, &entries) {
                tracing::warn!(error = %e, "failed to persist idempotency cache");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn write_atomic(path: &PathBuf, entries: &HashMap<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(entries)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Wraps fallible calls with retry, backoff + jitter, and idempotency
/// caching keyed by a stable hash of `(function_id, args)`.
pub struct ResilientExecutor {
    policy: RetryPolicy,
    cache: IdempotencyCache,
    /// Per-key guards so concurrent calls with the same key cannot both
    /// execute; the loser finds the winner's cached result.
    in_flight: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ResilientExecutor {
    pub fn new(policy: RetryPolicy, cache: IdempotencyCache) -> Self {
        Self {
            policy,
            cache,
            in_flight: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn idempotency_key(function_id: &str, args: &Value) -> String {
        digest_str(&format!("{function_id}\u{1f}{}", digest(args)))
    }

    pub async fn invoke<T, F, Fut>(&self, function_id: &str, args: &Value, f: F) -> ExecOutcome<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, InvokeError>>,
    {
        let key = Self::idempotency_key(function_id, args);
        self.invoke_with_key(key, f).await
    }

    pub async fn invoke_with_key<T, F, Fut>(&self, key: String, mut f: F) -> ExecOutcome<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, InvokeError>>,
    {
        let start = Instant::now();

        let guard = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _held = guard.lock().await;

        if let Some(cached) = self.cache.get(&key) {
            if let Ok(result) = serde_json::from_value::<T>(cached) {
                return ExecOutcome {
                    success: true,
                    attempts: 0,
                    total_time_ms: start.elapsed().as_millis() as u64,
                    result: Some(result),
                    error: None,
                    idempotency_key: key,
                    cached: true,
                };
            }
        }

        let mut attempts = 0u32;
        let mut prev_delay = 0u64;
        loop {
            attempts += 1;
            match f().await {
                Ok(result) => {
                    if let Ok(value) = serde_json::to_value(&result) {
                        self.cache.put(&key, value);
                    }
                    return ExecOutcome {
                        success: true,
                        attempts,
                        total_time_ms: start.elapsed().as_millis() as u64,
                        result: Some(result),
                        error: None,
                        idempotency_key: key,
                        cached: false,
                    };
                }
                Err(error) => {
                    let retries_left = attempts <= self.policy.max_retries;
                    if !error.transient || !retries_left {
                        return ExecOutcome {
                            success: false,
                            attempts,
                            total_time_ms: start.elapsed().as_millis() as u64,
                            result: None,
                            error: Some(error.message),
                            idempotency_key: key,
                            cached: false,
                        };
                    }
                    let delay = self.policy.delay_ms(attempts, prev_delay);
                    tracing::debug!(attempts, delay_ms = delay, error = %error.message, "retrying");
                    prev_delay = delay;
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
            }
        }
    }
}
