use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use roam_db::{Database, views};
use roam_types::events::{GatewayEvent, QueryShape, Snapshot};
use roam_types::models::UserId;

/// Default bound on a single snapshot recompute.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// What kind of committed mutation a [`Change`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Media items or moments changed. Only the trip detail is affected.
    Content,
    /// Trip fields changed (title, dates, cover, share link).
    Trip,
    /// A permission record was added, changed or removed.
    Membership,
    /// The trip and everything under it is gone.
    Deleted,
}

/// A committed mutation on one trip.
#[derive(Debug, Clone)]
pub struct Change {
    pub trip_id: String,
    pub kind: ChangeKind,
    /// Users whose trip lists may have changed.
    pub users: Vec<UserId>,
}

impl Change {
    pub fn new(trip_id: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            trip_id: trip_id.into(),
            kind,
            users: Vec::new(),
        }
    }

    pub fn with_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<UserId>,
    {
        self.users.extend(users.into_iter().map(Into::into));
        self
    }

    /// Whether a subscription of `user_id` on `shape` must be recomputed.
    pub fn affects(&self, user_id: &str, shape: &QueryShape) -> bool {
        match shape {
            QueryShape::TripDetail { trip_id } => *trip_id == self.trip_id,
            QueryShape::TripPermissions { trip_id } => {
                *trip_id == self.trip_id
                    && matches!(self.kind, ChangeKind::Membership | ChangeKind::Deleted)
            }
            QueryShape::AllTrips | QueryShape::SharedTrips => {
                self.kind != ChangeKind::Content && self.users.iter().any(|u| u == user_id)
            }
        }
    }
}

/// Outbound half of a connection. The mutex serializes recompute-and-send
/// per connection, so a later push always carries a later snapshot.
type Outbox = Arc<Mutex<mpsc::UnboundedSender<GatewayEvent>>>;

struct ConnectionEntry {
    user_id: UserId,
    outbox: Outbox,
    /// Client-chosen subscription id -> shape
    subscriptions: HashMap<String, QueryShape>,
}

/// Tracks live subscriptions and pushes fresh authorized snapshots to them
/// after every committed mutation.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    db: Arc<Database>,
    read_timeout: Duration,
    connections: RwLock<HashMap<Uuid, ConnectionEntry>>,
}

struct Target {
    conn_id: Uuid,
    user_id: UserId,
    subscription_id: String,
    shape: QueryShape,
    outbox: Outbox,
}

impl Dispatcher {
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_read_timeout(db, DEFAULT_READ_TIMEOUT)
    }

    pub fn with_read_timeout(db: Arc<Database>, read_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                db,
                read_timeout,
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a client connection. Returns (conn_id, receiver); the
    /// receiver carries every push for this connection, in order.
    pub async fn register_connection(
        &self,
        user_id: impl Into<UserId>,
    ) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.connections.write().await.insert(
            conn_id,
            ConnectionEntry {
                user_id: user_id.into(),
                outbox: Arc::new(Mutex::new(tx)),
                subscriptions: HashMap::new(),
            },
        );
        (conn_id, rx)
    }

    /// Drop a connection and all of its subscriptions.
    pub async fn unregister_connection(&self, conn_id: Uuid) {
        if let Some(entry) = self.inner.connections.write().await.remove(&conn_id) {
            debug!(
                "Connection {} for {} unregistered ({} subscriptions)",
                conn_id,
                entry.user_id,
                entry.subscriptions.len()
            );
        }
    }

    /// Open (or replace) a subscription and push its current snapshot.
    /// Returns false if the connection is unknown.
    pub async fn subscribe(&self, conn_id: Uuid, subscription_id: String, shape: QueryShape) -> bool {
        // Register before computing, so no commit between the two is missed.
        let target = {
            let mut conns = self.inner.connections.write().await;
            let Some(entry) = conns.get_mut(&conn_id) else {
                return false;
            };
            entry.subscriptions.insert(subscription_id.clone(), shape.clone());
            Target {
                conn_id,
                user_id: entry.user_id.clone(),
                subscription_id,
                shape,
                outbox: entry.outbox.clone(),
            }
        };

        self.push(&target).await;
        true
    }

    pub async fn unsubscribe(&self, conn_id: Uuid, subscription_id: &str) -> bool {
        self.inner
            .connections
            .write()
            .await
            .get_mut(&conn_id)
            .is_some_and(|entry| entry.subscriptions.remove(subscription_id).is_some())
    }

    /// Send an event that is not tied to a subscription.
    pub async fn send_to_connection(&self, conn_id: Uuid, event: GatewayEvent) {
        let outbox = {
            let conns = self.inner.connections.read().await;
            match conns.get(&conn_id) {
                Some(entry) => entry.outbox.clone(),
                None => return,
            }
        };
        if outbox.lock().await.send(event).is_err() {
            self.unregister_connection(conn_id).await;
        }
    }

    /// Fan a committed change out to every affected subscription. Callers
    /// hold the trip's lock, so pushes for one trip follow commit order.
    pub async fn publish(&self, change: &Change) {
        let targets: Vec<Target> = {
            let conns = self.inner.connections.read().await;
            conns
                .iter()
                .flat_map(|(conn_id, entry)| {
                    entry
                        .subscriptions
                        .iter()
                        .filter(|(_, shape)| change.affects(&entry.user_id, shape))
                        .map(move |(sub_id, shape)| Target {
                            conn_id: *conn_id,
                            user_id: entry.user_id.clone(),
                            subscription_id: sub_id.clone(),
                            shape: shape.clone(),
                            outbox: entry.outbox.clone(),
                        })
                })
                .collect()
        };

        debug!(
            "Change {:?} on trip {} affects {} subscriptions",
            change.kind,
            change.trip_id,
            targets.len()
        );

        for target in &targets {
            self.push(target).await;
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    pub async fn subscription_count(&self) -> usize {
        self.inner
            .connections
            .read()
            .await
            .values()
            .map(|entry| entry.subscriptions.len())
            .sum()
    }

    /// Recompute one subscription as its owner and send the result.
    async fn push(&self, target: &Target) {
        let tx = target.outbox.lock().await;

        // Unsubscribed or replaced while we waited for the outbox.
        if !self.is_current(target).await {
            return;
        }

        let event = match self.recompute(&target.user_id, &target.shape).await {
            Ok(Some(snapshot)) => GatewayEvent::Snapshot {
                subscription_id: target.subscription_id.clone(),
                shape: target.shape.clone(),
                snapshot,
            },
            Ok(None) => {
                debug!(
                    "{} lost access to {:?}, dropping subscription {}",
                    target.user_id, target.shape, target.subscription_id
                );
                self.drop_subscription(target).await;
                GatewayEvent::Denied {
                    subscription_id: target.subscription_id.clone(),
                    shape: target.shape.clone(),
                }
            }
            Err(e) => {
                warn!(
                    "Recompute of {:?} for {} failed: {}",
                    target.shape, target.user_id, e
                );
                self.drop_subscription(target).await;
                GatewayEvent::SubscriptionError {
                    subscription_id: target.subscription_id.clone(),
                    shape: target.shape.clone(),
                    message: "subscription failed, resubscribe".to_string(),
                }
            }
        };

        if tx.send(event).is_err() {
            drop(tx);
            debug!("Connection {} is gone, cleaning up", target.conn_id);
            self.unregister_connection(target.conn_id).await;
        }
    }

    async fn is_current(&self, target: &Target) -> bool {
        let conns = self.inner.connections.read().await;
        conns
            .get(&target.conn_id)
            .and_then(|entry| entry.subscriptions.get(&target.subscription_id))
            .is_some_and(|shape| *shape == target.shape)
    }

    async fn drop_subscription(&self, target: &Target) {
        let mut conns = self.inner.connections.write().await;
        if let Some(entry) = conns.get_mut(&target.conn_id) {
            if entry.subscriptions.get(&target.subscription_id) == Some(&target.shape) {
                entry.subscriptions.remove(&target.subscription_id);
            }
        }
    }

    async fn recompute(&self, user_id: &str, shape: &QueryShape) -> anyhow::Result<Option<Snapshot>> {
        let db = self.inner.db.clone();
        let user_id = user_id.to_string();
        let shape = shape.clone();
        let task =
            tokio::task::spawn_blocking(move || db.with_conn(|conn| views::snapshot(conn, &user_id, &shape)));

        match tokio::time::timeout(self.inner.read_timeout, task).await {
            Ok(joined) => joined.map_err(|e| anyhow!("spawn_blocking join error: {}", e))?,
            Err(_) => Err(anyhow!("snapshot recompute timed out")),
        }
    }
}
