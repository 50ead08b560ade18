use std::sync::Arc;
use std::time::Duration;

use roam_db::Database;
use roam_gateway::dispatcher::Dispatcher;
use roam_types::models::Role;

use crate::identity::Identity;
use crate::locks::TripLocks;
use crate::share::ShareLinks;
use crate::storage::{BlobStore, RetryPolicy};
use crate::store::Store;
use crate::trips::TripRepository;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub trips: TripRepository,
    pub shares: ShareLinks,
    pub identity: Identity,
    pub dispatcher: Dispatcher,
}

/// Tunables for the services, filled from the server config.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub db_timeout: Duration,
    pub storage_retry: RetryPolicy,
    pub share_default_role: Role,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            db_timeout: Duration::from_secs(5),
            storage_retry: RetryPolicy::default(),
            share_default_role: Role::Collaborator,
        }
    }
}

impl AppStateInner {
    /// Wire the services together. Trip mutations and share link joins share
    /// one lock table so both serialize on the same trip.
    pub fn build(
        db: Arc<Database>,
        blobs: Arc<dyn BlobStore>,
        identity: Identity,
        settings: ServiceSettings,
    ) -> AppState {
        let store = Store::new(db.clone(), settings.db_timeout);
        let dispatcher = Dispatcher::with_read_timeout(db, settings.db_timeout);
        let locks = TripLocks::new();

        let trips = TripRepository::new(
            store.clone(),
            blobs,
            settings.storage_retry,
            dispatcher.clone(),
            locks.clone(),
        );
        let shares = ShareLinks::new(store, dispatcher.clone(), locks, settings.share_default_role);

        Arc::new(Self {
            trips,
            shares,
            identity,
            dispatcher,
        })
    }
}
