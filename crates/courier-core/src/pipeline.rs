use crate::connection::Connection;
use crate::events::EventBus;
use crate::inbound::InboundHandler;
use courier_types::Stanza;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct OfflineQueue {
    nodes: VecDeque<Stanza>,
    draining: bool,
}

/// Serializes inbound stanzas behind the ordering lock. Live stanzas are
/// handled on arrival; stanzas flagged `offline` are queued and replayed by
/// a single drainer in arrival order.
#[derive(Clone)]
pub struct EventPipeline {
    handler: InboundHandler,
    conn: Arc<dyn Connection>,
    events: EventBus,
    ordering: Arc<Mutex<()>>,
    offline: Arc<Mutex<OfflineQueue>>,
}

impl EventPipeline {
    pub fn new(
        handler: InboundHandler,
        conn: Arc<dyn Connection>,
        events: EventBus,
        ordering: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            handler,
            conn,
            events,
            ordering,
            offline: Arc::new(Mutex::new(OfflineQueue::default())),
        }
    }

    pub async fn process_node(&self, node: Stanza) {
        if node.get_attr("offline").is_none() {
            self.dispatch(&node, false).await;
            return;
        }
        let start = {
            let mut queue = self.offline.lock().await;
            queue.nodes.push_back(node);
            !std::mem::replace(&mut queue.draining, true)
        };
        if start {
            self.spawn_drainer();
        }
    }

    /// Restarts draining after a reconnect. Returns whether a drainer was started.
    pub async fn resume(&self) -> bool {
        let start = {
            let mut queue = self.offline.lock().await;
            if queue.draining || queue.nodes.is_empty() {
                false
            } else {
                queue.draining = true;
                true
            }
        };
        if start {
            self.spawn_drainer();
        }
        start
    }

    pub async fn pending_offline(&self) -> usize {
        self.offline.lock().await.nodes.len()
    }

    pub async fn is_draining(&self) -> bool {
        self.offline.lock().await.draining
    }

    fn spawn_drainer(&self) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.drain().await;
        });
    }

    async fn drain(&self) {
        let mut handled = 0usize;
        loop {
            let node = {
                let mut queue = self.offline.lock().await;
                if !self.conn.is_open() {
                    warn!(
                        "connection closed, {} offline stanzas left undrained",
                        queue.nodes.len()
                    );
                    queue.draining = false;
                    return;
                }
                match queue.nodes.pop_front() {
                    Some(node) => node,
                    None => {
                        queue.draining = false;
                        break;
                    }
                }
            };
            self.dispatch(&node, true).await;
            handled += 1;
        }
        info!("drained {} offline stanzas", handled);
    }

    async fn dispatch(&self, node: &Stanza, offline: bool) {
        let _ordering = self.ordering.lock().await;
        let mut batch = self.events.batch();
        self.handler.handle(node, offline, &mut batch).await;
        debug!(
            "{} {} produced {} events",
            node.tag,
            node.get_attr("id").unwrap_or_default(),
            batch.len()
        );
        batch.commit();
    }
}
