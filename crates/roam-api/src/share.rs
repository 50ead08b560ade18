use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use rand::{Rng, RngCore};
use tracing::info;

use roam_db::access::Action;
use roam_db::queries;
use roam_gateway::dispatcher::{Change, ChangeKind, Dispatcher};
use roam_types::api::JoinResponse;
use roam_types::models::{GrantedVia, Role, ShareLink, TripPermission};

use crate::error::{ApiError, ApiResult};
use crate::locks::TripLocks;
use crate::store::Store;
use crate::trips::authorize;

const SLUG_BYTES: usize = 16;
const MAX_SLUG_ATTEMPTS: usize = 5;

/// Enables, disables and redeems share links.
#[derive(Clone)]
pub struct ShareLinks {
    store: Store,
    dispatcher: Dispatcher,
    locks: TripLocks,
    default_role: Role,
}

impl ShareLinks {
    /// `default_role` is what joining through a link grants. Ownership is
    /// never granted this way, so an owner role falls back to collaborator.
    pub fn new(store: Store, dispatcher: Dispatcher, locks: TripLocks, default_role: Role) -> Self {
        let default_role = if default_role.is_owner() {
            Role::Collaborator
        } else {
            default_role
        };
        Self {
            store,
            dispatcher,
            locks,
            default_role,
        }
    }

    pub fn default_role(&self) -> Role {
        self.default_role
    }

    /// Mint a fresh slug (and optionally a code), replacing any previous link.
    pub async fn enable_share_link(
        &self,
        user_id: &str,
        trip_id: &str,
        with_code: bool,
    ) -> ApiResult<ShareLink> {
        let _guard = self.locks.lock(trip_id).await;
        let (uid, tid) = (user_id.to_string(), trip_id.to_string());
        let (link, members) = self
            .store
            .write(move |conn| {
                let tx = conn.transaction()?;
                authorize(&tx, &tid, &uid, Action::ManageAccess)?;
                let mut trip = queries::get_trip(&tx, &tid)?.ok_or(ApiError::NotFound)?;

                let mut slug = new_slug();
                let mut attempts = 1;
                while queries::slug_taken(&tx, &slug)? {
                    if attempts >= MAX_SLUG_ATTEMPTS {
                        return Err(ApiError::Unavailable("could not mint a share link".into()));
                    }
                    slug = new_slug();
                    attempts += 1;
                }

                let link = ShareLink {
                    slug,
                    code: with_code.then(new_code),
                    enabled: true,
                };
                trip.share_link = Some(link.clone());
                trip.updated_at = Utc::now();
                queries::update_trip(&tx, &trip)?;
                let members = queries::member_ids(&tx, &tid)?;
                tx.commit()?;
                Ok((link, members))
            })
            .await?;

        info!("Share link enabled for trip {} (code: {})", trip_id, with_code);
        self.dispatcher
            .publish(&Change::new(trip_id, ChangeKind::Trip).with_users(members))
            .await;
        Ok(link)
    }

    /// Turn the link off. The slug is kept but no longer redeemable.
    pub async fn disable_share_link(&self, user_id: &str, trip_id: &str) -> ApiResult<()> {
        let _guard = self.locks.lock(trip_id).await;
        let (uid, tid) = (user_id.to_string(), trip_id.to_string());
        let members = self
            .store
            .write(move |conn| {
                let tx = conn.transaction()?;
                authorize(&tx, &tid, &uid, Action::ManageAccess)?;
                let mut trip = queries::get_trip(&tx, &tid)?.ok_or(ApiError::NotFound)?;
                match trip.share_link.as_mut() {
                    Some(link) if link.enabled => link.enabled = false,
                    _ => return Ok(None),
                }
                trip.updated_at = Utc::now();
                queries::update_trip(&tx, &trip)?;
                let members = queries::member_ids(&tx, &tid)?;
                tx.commit()?;
                Ok(Some(members))
            })
            .await?;

        if let Some(members) = members {
            info!("Share link disabled for trip {}", trip_id);
            self.dispatcher
                .publish(&Change::new(trip_id, ChangeKind::Trip).with_users(members))
                .await;
        }
        Ok(())
    }

    /// Redeem a link. Idempotent: an existing member keeps their role and
    /// gets `already_member: true`.
    pub async fn join_via_link(
        &self,
        user_id: &str,
        slug: &str,
        code: Option<&str>,
    ) -> ApiResult<JoinResponse> {
        let s = slug.to_string();
        let trip = self
            .store
            .read(move |conn| queries::get_trip_by_slug(conn, &s).map_err(ApiError::from))
            .await?
            .ok_or(ApiError::NotFound)?;

        // The link may change between lookup and lock; re-check under both.
        let _guard = self.locks.lock(&trip.id).await;
        let (uid, s, tid) = (user_id.to_string(), slug.to_string(), trip.id.clone());
        let code = code.map(str::to_string);
        let default_role = self.default_role;
        let response = self
            .store
            .write(move |conn| {
                let tx = conn.transaction()?;
                let trip = queries::get_trip(&tx, &tid)?.ok_or(ApiError::NotFound)?;
                let link = match trip.share_link {
                    Some(link) if link.enabled && link.slug == s => link,
                    _ => return Err(ApiError::NotFound),
                };
                if let Some(expected) = link.code.as_deref() {
                    if code.as_deref() != Some(expected) {
                        return Err(ApiError::Forbidden);
                    }
                }

                if let Some(existing) = queries::get_permission(&tx, &tid, &uid)? {
                    return Ok(JoinResponse {
                        trip_id: tid,
                        already_member: true,
                        role: existing.role,
                    });
                }

                let now = Utc::now();
                queries::insert_permission(
                    &tx,
                    &TripPermission {
                        trip_id: tid.clone(),
                        user_id: uid,
                        role: default_role,
                        granted_via: GrantedVia::ShareLink,
                        invited_by: trip.owner_id,
                        invited_at: now,
                        accepted_at: Some(now),
                    },
                )?;
                tx.commit()?;
                Ok(JoinResponse {
                    trip_id: tid,
                    already_member: false,
                    role: default_role,
                })
            })
            .await?;

        if !response.already_member {
            info!("{} joined trip {} via share link", user_id, response.trip_id);
            self.dispatcher
                .publish(&Change::new(&response.trip_id, ChangeKind::Membership).with_users([user_id]))
                .await;
        }
        Ok(response)
    }
}

fn new_slug() -> String {
    let mut bytes = [0u8; SLUG_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn new_code() -> String {
    format!("{:06}", rand::rng().random_range(0..1_000_000))
}
