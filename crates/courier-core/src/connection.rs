use crate::error::{CoreError, TransportError};
use async_trait::async_trait;
use courier_types::Stanza;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// The single logical connection to the server. Framing and node encoding
/// live behind this trait.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn query(&self, request: Stanza, timeout: Duration) -> Result<Stanza, CoreError>;
    async fn send_node(&self, node: Stanza) -> Result<(), CoreError>;
    fn is_open(&self) -> bool;

    /// `query`, turning an `error` child of the response into a transport error.
    async fn query_ok(&self, request: Stanza, timeout: Duration) -> Result<Stanza, CoreError> {
        let response = self.query(request, timeout).await?;
        match response.error() {
            Some(err) => Err(TransportError::Status(err.code, err.text).into()),
            None => Ok(response),
        }
    }
}

pub type QueryHandler = Arc<dyn Fn(&Stanza) -> Result<Stanza, CoreError> + Send + Sync>;

/// Loopback connection that records everything sent and answers queries
/// through a replaceable handler.
#[derive(Clone)]
pub struct MockConnection {
    sent: Arc<Mutex<Vec<Stanza>>>,
    queries: Arc<Mutex<Vec<Stanza>>>,
    handler: Arc<Mutex<Option<QueryHandler>>>,
    send_failures: Arc<Mutex<VecDeque<CoreError>>>,
    open: Arc<AtomicBool>,
}

impl Default for MockConnection {
    fn default() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            queries: Arc::new(Mutex::new(Vec::new())),
            handler: Arc::new(Mutex::new(None)),
            send_failures: Arc::new(Mutex::new(VecDeque::new())),
            open: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_handler(&self, handler: QueryHandler) {
        *self.handler.lock().await = Some(handler);
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// The next `send_node` calls fail with these errors, in order.
    pub async fn fail_next_sends(&self, errors: Vec<CoreError>) {
        self.send_failures.lock().await.extend(errors);
    }

    pub async fn sent(&self) -> Vec<Stanza> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_with_tag(&self, tag: &str) -> Vec<Stanza> {
        let guard = self.sent.lock().await;
        guard.iter().filter(|s| s.tag == tag).cloned().collect()
    }

    pub async fn queries(&self) -> Vec<Stanza> {
        self.queries.lock().await.clone()
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(&self, request: Stanza, _timeout: Duration) -> Result<Stanza, CoreError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed.into());
        }
        self.queries.lock().await.push(request.clone());
        let handler = self.handler.lock().await.clone();
        match handler {
            Some(handler) => handler(&request),
            None => Ok(Stanza::new("iq").attr("type", "result")),
        }
    }

    async fn send_node(&self, node: Stanza) -> Result<(), CoreError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed.into());
        }
        if let Some(err) = self.send_failures.lock().await.pop_front() {
            return Err(err);
        }
        self.sent.lock().await.push(node);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
