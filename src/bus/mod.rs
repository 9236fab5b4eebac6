//! Bus client - blocking facade over the NATS message bus
//!
//! Workers are plain OS threads, so the client owns a small shared Tokio
//! runtime and exposes blocking publish/subscribe/KV calls. Presence is a
//! TTL'd record in a JetStream KV bucket: `connect` upserts it, heartbeats
//! refresh it, and the bucket max-age expires stale agents.

pub mod protocol;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

pub use protocol::{
    agent_request_subject, generate_request_id, presence_key, presence_name, NatsRequest,
    NatsResponse, NatsStatusUpdate, PRESENCE_BUCKET, RESPONSE_SUBJECT, STATUS_SUBJECT,
};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Bus unavailable: {0}")]
    Connect(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Presence store error: {0}")]
    Presence(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

pub type BusResult<T> = std::result::Result<T, BusError>;

/// Connected bus client bound to one client id
#[derive(Clone)]
pub struct BusClient {
    rt: Arc<tokio::runtime::Runtime>,
    client: async_nats::Client,
    kv: async_nats::jetstream::kv::Store,
    client_id: String,
}

impl BusClient {
    /// Connect, ensure the presence bucket exists, and upsert our record
    pub fn connect(url: &str, client_id: &str, presence_ttl: Duration) -> BusResult<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("bus-runtime")
            .enable_all()
            .build()
            .map_err(|e| BusError::Runtime(e.to_string()))?;
        let rt = Arc::new(rt);

        let client = rt
            .block_on(async_nats::connect(url))
            .map_err(|e| BusError::Connect(e.to_string()))?;

        let jetstream = async_nats::jetstream::new(client.clone());
        let kv = rt
            .block_on(async {
                if let Ok(store) = jetstream.get_key_value(PRESENCE_BUCKET).await {
                    return Ok(store);
                }
                jetstream
                    .create_key_value(async_nats::jetstream::kv::Config {
                        bucket: PRESENCE_BUCKET.to_string(),
                        max_age: presence_ttl,
                        ..Default::default()
                    })
                    .await
            })
            .map_err(|e| BusError::Presence(e.to_string()))?;

        let bus = Self {
            rt,
            client,
            kv,
            client_id: client_id.to_string(),
        };
        bus.send_heartbeat()?;
        tracing::info!(url, client_id, "connected to bus");
        Ok(bus)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Fire-and-forget publish of a JSON payload
    pub fn publish(&self, subject: &str, payload: &str) -> BusResult<()> {
        let subject = subject.to_string();
        let bytes = bytes::Bytes::copy_from_slice(payload.as_bytes());
        self.rt.block_on(async {
            self.client
                .publish(subject, bytes)
                .await
                .map_err(|e| BusError::Publish(e.to_string()))?;
            self.client
                .flush()
                .await
                .map_err(|e| BusError::Publish(e.to_string()))
        })
    }

    pub fn subscribe(&self, subject: &str) -> BusResult<BusSubscription> {
        let subscriber = self
            .rt
            .block_on(self.client.subscribe(subject.to_string()))
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        Ok(BusSubscription {
            rt: self.rt.clone(),
            subscriber,
        })
    }

    /// Refresh our presence record, resetting its TTL
    pub fn send_heartbeat(&self) -> BusResult<()> {
        let key = presence_key(&self.client_id);
        let value = bytes::Bytes::from(chrono::Utc::now().to_rfc3339());
        self.rt
            .block_on(self.kv.put(key, value))
            .map(|_| ())
            .map_err(|e| BusError::Presence(e.to_string()))
    }

    /// Names with a live presence record
    pub fn list_present(&self) -> BusResult<Vec<String>> {
        self.rt
            .block_on(async {
                let mut keys = Box::pin(self.kv.keys().await?);
                let mut names = Vec::new();
                while let Some(key) = keys.next().await {
                    let key = key?;
                    if let Some(name) = presence_name(&key) {
                        names.push(name.to_string());
                    }
                }
                names.sort();
                Ok::<_, Box<dyn std::error::Error + Send + Sync>>(names)
            })
            .map_err(|e| BusError::Presence(e.to_string()))
    }

    pub fn is_present(&self, name: &str) -> bool {
        let key = presence_key(name);
        self.rt
            .block_on(self.kv.entry(key))
            .ok()
            .flatten()
            .is_some()
    }

    /// Delete our presence record (clean shutdown)
    pub fn remove_presence(&self) -> BusResult<()> {
        let key = presence_key(&self.client_id);
        self.rt
            .block_on(self.kv.delete(key))
            .map_err(|e| BusError::Presence(e.to_string()))
    }

    pub fn close(self) {
        let _ = self.rt.block_on(self.client.flush());
    }
}

/// One subject subscription with blocking receive
pub struct BusSubscription {
    rt: Arc<tokio::runtime::Runtime>,
    subscriber: async_nats::Subscriber,
}

impl BusSubscription {
    /// Next message payload, or None on timeout
    pub fn next_msg(&mut self, timeout: Duration) -> Option<String> {
        self.rt
            .block_on(async {
                tokio::time::timeout(timeout, self.subscriber.next())
                    .await
                    .ok()
                    .flatten()
            })
            .map(|message| String::from_utf8_lossy(&message.payload).to_string())
    }

    pub fn unsubscribe(mut self) {
        let _ = self.rt.block_on(self.subscriber.unsubscribe());
    }
}
