//! # Request / Response Correlation
//!
//! Two halves:
//! - [`ResponseProviders`]: value-provider functions keyed by request ID, shared by
//!   every connection of a process. The responding side answers inbound requests
//!   from this map.
//! - [`RequestCorrelator`]: per connection, one completion handle per outstanding
//!   request, grouped by request ID.
//!
//! Responses for one request ID arrive in the order their requests were sent, so
//! each ID keeps a FIFO of waiters. A waiter that gives up, for example on a
//! timeout, drops its [`PendingRequest`] and leaves the queue, so the next
//! response for that ID goes to the oldest waiter still listening.
//!
//! ## Wire layout
//! ```text
//! request:  [RequestId(1)]
//! response: [RequestId(1)] [Value(N)]
//! ```

use bytes::Bytes;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::core::serialization::{type_tag, SerializationConfig};
use crate::error::{constants, ProtocolError, Result};

type ProviderFn = dyn Fn(&SerializationConfig) -> Result<Vec<u8>> + Send + Sync + 'static;

struct ProviderEntry {
    type_tag: String,
    provider: Arc<ProviderFn>,
}

pub type SharedResponseProviders = Arc<ResponseProviders>;

/// Value providers answering inbound requests
#[derive(Default)]
pub struct ResponseProviders {
    providers: RwLock<HashMap<u8, ProviderEntry>>,
}

impl ResponseProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedResponseProviders {
        Arc::new(Self::new())
    }

    /// Register `provider` as the answer to `request_id`
    pub fn register<T, F>(&self, request_id: u8, provider: F) -> Result<()>
    where
        T: Serialize + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let mut providers = self
            .providers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_PROVIDER_LOCK.to_string()))?;
        if providers.contains_key(&request_id) {
            return Err(ProtocolError::ProviderIdInUse(request_id));
        }
        providers.insert(
            request_id,
            ProviderEntry {
                type_tag: type_tag::<T>(),
                provider: Arc::new(move |config: &SerializationConfig| config.serialize(&provider())),
            },
        );
        debug!(request_id, "Response provider registered");
        Ok(())
    }

    pub fn unregister(&self, request_id: u8) -> Result<bool> {
        let mut providers = self
            .providers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_PROVIDER_LOCK.to_string()))?;
        Ok(providers.remove(&request_id).is_some())
    }

    pub fn contains(&self, request_id: u8) -> bool {
        self.providers
            .read()
            .map(|providers| providers.contains_key(&request_id))
            .unwrap_or(false)
    }

    /// Type tag of the value `request_id` answers with
    pub fn type_tag(&self, request_id: u8) -> Option<String> {
        self.providers
            .read()
            .ok()
            .and_then(|providers| providers.get(&request_id).map(|e| e.type_tag.clone()))
    }

    /// Invoke the provider for `request_id` and serialize its value.
    ///
    /// Returns `NotImplemented` when no provider is registered.
    pub fn handle_request(&self, request_id: u8, config: &SerializationConfig) -> Result<Vec<u8>> {
        let provider = {
            let providers = self
                .providers
                .read()
                .map_err(|_| ProtocolError::Custom(constants::ERR_PROVIDER_LOCK.to_string()))?;
            providers
                .get(&request_id)
                .map(|entry| Arc::clone(&entry.provider))
                .ok_or(ProtocolError::NotImplemented(request_id))?
        };
        provider(config)
    }
}

type WaiterQueues = HashMap<u8, VecDeque<(u64, oneshot::Sender<Bytes>)>>;

/// Receiving end of one outstanding request.
///
/// Dropping it before the response arrives removes its waiter from the queue.
#[derive(Debug)]
pub struct PendingRequest {
    request_id: u8,
    token: u64,
    rx: oneshot::Receiver<Bytes>,
    queues: Weak<Mutex<WaiterQueues>>,
}

impl PendingRequest {
    pub fn request_id(&self) -> u8 {
        self.request_id
    }

    /// Wait for the response payload (without the request ID prefix)
    pub async fn wait(mut self) -> Result<Bytes> {
        let request_id = self.request_id;
        (&mut self.rx)
            .await
            .map_err(|_| ProtocolError::RequestCancelled(request_id))
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        let Some(queues) = self.queues.upgrade() else {
            return;
        };
        let Ok(mut pending) = queues.lock() else {
            return;
        };
        let Some(queue) = pending.get_mut(&self.request_id) else {
            return;
        };
        let before = queue.len();
        queue.retain(|(token, _)| *token != self.token);
        if queue.len() < before {
            trace!(request_id = self.request_id, "Abandoned request withdrawn");
        }
        if queue.is_empty() {
            pending.remove(&self.request_id);
        }
    }
}

/// Outstanding requests of one connection
#[derive(Debug, Default)]
pub struct RequestCorrelator {
    pending: Arc<Mutex<WaiterQueues>>,
    next_token: AtomicU64,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the completion handle for a request about to be sent
    pub fn register(&self, request_id: u8) -> Result<PendingRequest> {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_PENDING_LOCK.to_string()))?;
        pending.entry(request_id).or_default().push_back((token, tx));
        Ok(PendingRequest {
            request_id,
            token,
            rx,
            queues: Arc::downgrade(&self.pending),
        })
    }

    /// Hand a response to the oldest waiter for `request_id`.
    ///
    /// Returns `false` when nobody was waiting or the waiter has gone away.
    pub fn complete(&self, request_id: u8, payload: Bytes) -> Result<bool> {
        let waiter = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| ProtocolError::Custom(constants::ERR_PENDING_LOCK.to_string()))?;
            let Some(queue) = pending.get_mut(&request_id) else {
                return Ok(false);
            };
            let waiter = queue.pop_front();
            if queue.is_empty() {
                pending.remove(&request_id);
            }
            waiter
        };

        match waiter {
            Some((_, tx)) => {
                let delivered = tx.send(payload).is_ok();
                trace!(request_id, delivered, "Response correlated");
                Ok(delivered)
            }
            None => Ok(false),
        }
    }

    /// Drop every completion handle; waiters see `RequestCancelled`
    pub fn cancel_all(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            let count: usize = pending.values().map(VecDeque::len).sum();
            if count > 0 {
                debug!(count, "Cancelling outstanding requests");
            }
            pending.clear();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .map(|pending| pending.values().map(VecDeque::len).sum())
            .unwrap_or(0)
    }
}
