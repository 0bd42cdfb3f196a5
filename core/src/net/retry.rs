//! Parked fetch invocations awaiting interactive user remediation.
//!
//! When the guard blocks in interactive mode it registers the original call
//! as a cloned closure and hands back a pending future. An "allow this once"
//! action re-invokes the closure; a deny or the safety timeout resolves with
//! the block payload instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::net::block::BlockPayload;
use crate::net::guard::FetchResponse;

/// How long a parked retry waits for the user before resolving with the
/// original block payload.
pub const RETRY_SAFETY_TIMEOUT: Duration = Duration::from_secs(15);

pub type RetryInvoke = Arc<dyn Fn() -> BoxFuture<'static, Result<FetchResponse>> + Send + Sync>;

#[derive(Debug)]
pub enum RetryResolution {
    /// The user allowed the call once; carries the re-invocation outcome.
    Retried(Result<FetchResponse>),
    Denied(Box<BlockPayload>),
    TimedOut(Box<BlockPayload>),
}

struct PendingRetry {
    payload: BlockPayload,
    invoke: RetryInvoke,
    resolver: oneshot::Sender<RetryResolution>,
    timeout: JoinHandle<()>,
}

pub struct RetryTable {
    entries: Mutex<HashMap<String, PendingRetry>>,
    ttl: Duration,
}

impl Default for RetryTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: RETRY_SAFETY_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_timeout(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Parks one blocked invocation. The returned receiver resolves on retry,
    /// deny, or safety timeout; the entry is removed on every path.
    pub fn register(
        self: &Arc<Self>,
        payload: BlockPayload,
        invoke: RetryInvoke,
    ) -> (String, oneshot::Receiver<RetryResolution>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        let timeout = {
            let table = Arc::clone(self);
            let entry_id = id.clone();
            let ttl = self.ttl;
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                table.expire(&entry_id);
            })
        };

        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(
            id.clone(),
            PendingRetry {
                payload,
                invoke,
                resolver: tx,
                timeout,
            },
        );
        (id, rx)
    }

    /// Re-invokes the original call. Returns false when the entry is gone
    /// (already resolved or timed out).
    pub fn allow_once(&self, id: &str) -> bool {
        let Some(entry) = self.take(id) else {
            return false;
        };
        entry.timeout.abort();
        let invoke = Arc::clone(&entry.invoke);
        let resolver = entry.resolver;
        tokio::spawn(async move {
            let outcome = invoke().await;
            let _ = resolver.send(RetryResolution::Retried(outcome));
        });
        true
    }

    pub fn deny(&self, id: &str) -> bool {
        let Some(entry) = self.take(id) else {
            return false;
        };
        entry.timeout.abort();
        let _ = entry
            .resolver
            .send(RetryResolution::Denied(Box::new(entry.payload)));
        true
    }

    /// Resolves every parked entry with its block payload. Used when the
    /// rollout controller disables interactive mode.
    pub fn cancel_all(&self) {
        let drained: Vec<PendingRetry> = {
            let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.timeout.abort();
            let _ = entry
                .resolver
                .send(RetryResolution::Denied(Box::new(entry.payload)));
        }
    }

    pub fn pending(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn expire(&self, id: &str) {
        if let Some(entry) = self.take(id) {
            debug!("parked retry {id} timed out");
            let _ = entry
                .resolver
                .send(RetryResolution::TimedOut(Box::new(entry.payload)));
        }
    }

    fn take(&self, id: &str) -> Option<PendingRetry> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::net::block::BlockContext;
    use crate::net::block::BlockReason;
    use crate::policy::PolicyMode;

    fn payload() -> BlockPayload {
        BlockPayload::new(
            BlockReason::PrivateLanBlocked,
            "private_lan:ask",
            Some("192.168.1.4".to_string()),
            PolicyMode::DefaultAllow,
            BlockContext {
                api: "fetch".to_string(),
                method: Some("GET".to_string()),
                url: "http://192.168.1.4/status".to_string(),
            },
        )
    }

    fn ok_invoke() -> RetryInvoke {
        Arc::new(|| {
            Box::pin(async {
                Ok(FetchResponse {
                    status: 200,
                    redirected: false,
                    blocked: false,
                    body: bytes::Bytes::from_static(b"ok"),
                })
            })
        })
    }

    #[tokio::test]
    async fn allow_once_reinvokes_and_resolves() {
        let table = Arc::new(RetryTable::new());
        let (id, rx) = table.register(payload(), ok_invoke());
        assert_eq!(table.pending(), 1);
        assert!(table.allow_once(&id));
        match rx.await.unwrap() {
            RetryResolution::Retried(Ok(response)) => assert_eq!(response.status, 200),
            other => panic!("unexpected resolution: {other:?}"),
        }
        assert_eq!(table.pending(), 0);
    }

    #[tokio::test]
    async fn deny_resolves_with_block_payload() {
        let table = Arc::new(RetryTable::new());
        let (id, rx) = table.register(payload(), ok_invoke());
        assert!(table.deny(&id));
        match rx.await.unwrap() {
            RetryResolution::Denied(p) => {
                assert_eq!(p.reason, BlockReason::PrivateLanBlocked)
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
        assert!(!table.deny(&id));
    }

    #[tokio::test]
    async fn safety_timeout_resolves_entry() {
        let table = Arc::new(RetryTable::with_timeout(Duration::from_millis(20)));
        let (_id, rx) = table.register(payload(), ok_invoke());
        match rx.await.unwrap() {
            RetryResolution::TimedOut(p) => {
                assert_eq!(p.reason, BlockReason::PrivateLanBlocked)
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
        assert_eq!(table.pending(), 0);
    }

    #[tokio::test]
    async fn cancel_all_drains_every_entry() {
        let table = Arc::new(RetryTable::new());
        let (_a, rx_a) = table.register(payload(), ok_invoke());
        let (_b, rx_b) = table.register(payload(), ok_invoke());
        table.cancel_all();
        assert!(matches!(rx_a.await.unwrap(), RetryResolution::Denied(_)));
        assert!(matches!(rx_b.await.unwrap(), RetryResolution::Denied(_)));
    }
}
