//! Short-TTL WebSocket side-channel metadata (spec.md §3 "Meta Record",
//! §4.E, §6.3).
//!
//! The store interface is intentionally narrow (`get`/`set`/`delete`/
//! `has`/`keys`, string values) so a single-process map, a coordinator,
//! or a remote KV can all satisfy it; a JSON adapter on top serializes
//! the typed [`MetaRecord`]. Locking follows the same `mea`-mutex idiom
//! the teacher uses for `GracefulShutdown`'s gate (`shutdown.rs`).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use mea::mutex::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::BareError;
use crate::headers::HeaderValue;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub const META_TTL_MS: i64 = 30_000;
const REAP_INTERVAL_MS: u64 = 1_000;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Pluggable backing store (spec.md §6.3). Any operation may be
/// synchronous or asynchronous; methods return boxed futures (rather than
/// depending on an `async fn`-in-trait macro) so a remote KV
/// implementation is possible behind the same `dyn MetaBackend`.
pub trait MetaBackend: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<String>>;
    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, ()>;
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, bool>;
    fn has<'a>(&'a self, key: &'a str) -> BoxFuture<'a, bool>;
    fn keys<'a>(&'a self) -> BoxFuture<'a, Vec<String>>;
}

/// Default in-memory implementation.
#[derive(Default)]
pub struct InMemoryMetaBackend {
    map: Mutex<HashMap<String, String>>,
}

impl MetaBackend for InMemoryMetaBackend {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move { self.map.lock().await.get(key).cloned() })
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.map.lock().await.insert(key.to_string(), value);
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move { self.map.lock().await.remove(key).is_some() })
    }

    fn has<'a>(&'a self, key: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move { self.map.lock().await.contains_key(key) })
    }

    fn keys<'a>(&'a self) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move { self.map.lock().await.keys().cloned().collect() })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaResponse {
    pub headers: HashMap<String, HeaderValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "statusText")]
    pub status_text: Option<String>,
}

/// `(protocol, host, port, path)`, stored alongside a meta record so the
/// v2 WebSocket handler can recover the envelope a prior `ws-new-meta`
/// call registered (spec.md §3 "value: {..., remote?, sendHeaders?,
/// forwardHeaders?}").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeRemote {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaValue {
    pub v: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<MetaResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<EnvelopeRemote>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "sendHeaders")]
    pub send_headers: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "forwardHeaders")]
    pub forward_headers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaRecord {
    pub id: String,
    pub expires: i64,
    pub value: MetaValue,
}

/// JSON adapter over a [`MetaBackend`], plus the reaper loop.
pub struct MetaStore {
    backend: std::sync::Arc<dyn MetaBackend>,
}

impl MetaStore {
    pub fn new(backend: std::sync::Arc<dyn MetaBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(std::sync::Arc::new(InMemoryMetaBackend::default()))
    }

    fn new_id() -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// `ws-new-meta`: creates a record with `value.v` set, no response
    /// recorded yet.
    pub async fn new_meta(&self, version: u8) -> String {
        let id = Self::new_id();
        let record = MetaRecord {
            id: id.clone(),
            expires: now_ms() + META_TTL_MS,
            value: MetaValue { v: version, response: None, remote: None, send_headers: None, forward_headers: None },
        };
        let json = serde_json::to_string(&record).expect("MetaRecord always serializes");
        self.backend.set(&id, json).await;
        id
    }

    /// v2's `ws-new-meta`: registers the envelope (remote, send headers,
    /// forward-header names) a subsequent WebSocket upgrade will recover
    /// by id (spec.md §6.2 v2).
    pub async fn new_meta_with_envelope(
        &self,
        version: u8,
        remote: EnvelopeRemote,
        send_headers: serde_json::Value,
        forward_headers: Vec<String>,
    ) -> String {
        let id = Self::new_id();
        let record = MetaRecord {
            id: id.clone(),
            expires: now_ms() + META_TTL_MS,
            value: MetaValue {
                v: version,
                response: None,
                remote: Some(remote),
                send_headers: Some(send_headers),
                forward_headers: Some(forward_headers),
            },
        };
        let json = serde_json::to_string(&record).expect("MetaRecord always serializes");
        self.backend.set(&id, json).await;
        id
    }

    /// Reads (without deleting) the envelope a v2 WebSocket upgrade
    /// needs to perform the outbound dial.
    pub async fn load_envelope(&self, id: &str, expected_version: u8) -> Result<(EnvelopeRemote, serde_json::Value, Vec<String>), BareError> {
        let raw = self.backend.get(id).await.ok_or_else(|| BareError::invalid("unknown or expired meta id"))?;
        let record: MetaRecord =
            serde_json::from_str(&raw).map_err(|e| BareError::invalid(format!("corrupt meta record: {e}")))?;
        if record.value.v != expected_version {
            return Err(BareError::invalid("meta record version mismatch"));
        }
        let remote = record.value.remote.ok_or_else(|| BareError::invalid("meta record has no remote"))?;
        let send_headers = record.value.send_headers.unwrap_or(serde_json::Value::Object(Default::default()));
        let forward_headers = record.value.forward_headers.unwrap_or_default();
        Ok((remote, send_headers, forward_headers))
    }

    /// Mutated exactly once by the WebSocket relay after the remote
    /// handshake completes.
    pub async fn set_response(&self, id: &str, version: u8, response: MetaResponse) -> Result<(), BareError> {
        let record = MetaRecord {
            id: id.to_string(),
            expires: now_ms() + META_TTL_MS,
            value: MetaValue { v: version, response: Some(response), remote: None, send_headers: None, forward_headers: None },
        };
        let json = serde_json::to_string(&record).expect("MetaRecord always serializes");
        self.backend.set(id, json).await;
        Ok(())
    }

    /// `ws-meta`: returns the recorded response iff `v` matches the
    /// expected version, then deletes the record regardless of outcome.
    pub async fn take_response(&self, id: &str, expected_version: u8) -> Result<MetaResponse, BareError> {
        let raw = self.backend.get(id).await;
        self.backend.delete(id).await;
        let raw = raw.ok_or_else(|| BareError::invalid("unknown or expired meta id"))?;
        let record: MetaRecord = serde_json::from_str(&raw)
            .map_err(|e| BareError::invalid(format!("corrupt meta record: {e}")))?;
        if record.value.v != expected_version {
            return Err(BareError::invalid("meta record version mismatch"));
        }
        record
            .value
            .response
            .ok_or_else(|| BareError::invalid("meta record has no response yet"))
    }

    /// Background task: deletes every record whose `expires < now`.
    /// Intended to be spawned once at server startup and run until
    /// shutdown (cadence: [`REAP_INTERVAL_MS`]).
    pub async fn run_reaper(&self, shutdown: crate::shutdown::GracefulShutdown) {
        loop {
            let sleep = smol::Timer::after(std::time::Duration::from_millis(REAP_INTERVAL_MS));
            let stop = shutdown.wait_shutting_down();
            futures_lite::future::or(
                async {
                    sleep.await;
                    false
                },
                async {
                    stop.await;
                    true
                },
            )
            .await;
            if shutdown.is_shutting_down() {
                return;
            }
            self.reap_once().await;
        }
    }

    pub async fn reap_once(&self) {
        let now = now_ms();
        for key in self.backend.keys().await {
            let Some(raw) = self.backend.get(&key).await else { continue };
            let Ok(record) = serde_json::from_str::<MetaRecord>(&raw) else {
                self.backend.delete(&key).await;
                continue;
            };
            if record.expires < now {
                self.backend.delete(&key).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_meta_then_take_response_round_trips() {
        smol::block_on(async {
            let store = MetaStore::in_memory();
            let id = store.new_meta(1).await;
            assert_eq!(id.len(), 32);

            let mut headers = HashMap::new();
            headers.insert("x-foo".to_string(), HeaderValue::Single("bar".to_string()));
            store
                .set_response(&id, 1, MetaResponse { headers, status: Some(200), status_text: None })
                .await
                .unwrap();

            let resp = store.take_response(&id, 1).await.unwrap();
            assert_eq!(resp.status, Some(200));

            // consumed exactly once.
            assert!(store.take_response(&id, 1).await.is_err());
        });
    }

    #[test]
    fn version_mismatch_is_invalid() {
        smol::block_on(async {
            let store = MetaStore::in_memory();
            let id = store.new_meta(2).await;
            store
                .set_response(&id, 2, MetaResponse { headers: HashMap::new(), status: None, status_text: None })
                .await
                .unwrap();
            assert!(store.take_response(&id, 1).await.is_err());
        });
    }

    #[test]
    fn new_meta_with_envelope_round_trips_without_consuming() {
        smol::block_on(async {
            let store = MetaStore::in_memory();
            let remote = EnvelopeRemote { protocol: "https:".to_string(), host: "example.com".to_string(), port: 443, path: "/".to_string() };
            let id = store.new_meta_with_envelope(2, remote, serde_json::json!({}), vec!["x-custom".to_string()]).await;

            let (loaded_remote, _headers, forward) = store.load_envelope(&id, 2).await.unwrap();
            assert_eq!(loaded_remote.host, "example.com");
            assert_eq!(forward, vec!["x-custom".to_string()]);

            // peeking does not consume the record.
            assert!(store.load_envelope(&id, 2).await.is_ok());
        });
    }

    #[test]
    fn reaper_sweeps_expired_records() {
        smol::block_on(async {
            let store = MetaStore::in_memory();
            let id = "0123456789abcdef0123456789abcdef".to_string();
            let expired = MetaRecord {
                id: id.clone(),
                expires: now_ms() - 2_000,
                value: MetaValue { v: 1, response: None, remote: None, send_headers: None, forward_headers: None },
            };
            store.backend.set(&id, serde_json::to_string(&expired).unwrap()).await;
            store.reap_once().await;
            assert!(!store.backend.has(&id).await);
        });
    }
}
