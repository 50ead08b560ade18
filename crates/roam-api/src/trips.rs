//! Trip repository: the lifecycle of trips, their media items, moments and
//! permission records. Every operation goes through the access gate, and
//! every committed mutation is handed to the dispatcher before returning.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{info, warn};

use roam_db::access::{Access, Action, Decision};
use roam_db::{queries, views};
use roam_gateway::dispatcher::{Change, ChangeKind, Dispatcher};
use roam_types::api::{
    AddMediaItemRequest, AddMomentRequest, CreateTripRequest, InviteMemberRequest,
    UpdateTripRequest,
};
use roam_types::models::{
    GrantedVia, MediaItem, Moment, Role, Trip, TripDetail, TripPermission, TripSummary,
};

use crate::error::{ApiError, ApiResult};
use crate::locks::TripLocks;
use crate::storage::{BlobStore, RetryPolicy};
use crate::store::Store;

const MAX_ID_LEN: usize = 128;
const MAX_TITLE_LEN: usize = 200;

/// Resolve the caller's role for `action`, distinguishing a missing trip
/// (`NotFound`) from an insufficient or absent role (`Forbidden`).
pub(crate) fn authorize(
    conn: &Connection,
    trip_id: &str,
    user_id: &str,
    action: Action,
) -> ApiResult<Role> {
    if !queries::trip_exists(conn, trip_id)? {
        return Err(ApiError::NotFound);
    }
    match Access::new(conn).check(trip_id, user_id, action)? {
        Decision::Granted(role) => Ok(role),
        Decision::NotMember | Decision::Insufficient(_) => Err(ApiError::Forbidden),
    }
}

pub(crate) fn validate_id(kind: &str, id: &str) -> ApiResult<()> {
    if id.trim().is_empty() || id.len() > MAX_ID_LEN {
        return Err(ApiError::Validation(format!(
            "{kind} id must be 1-{MAX_ID_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_title(title: &str) -> ApiResult<String> {
    let title = title.trim();
    if title.is_empty() || title.chars().count() > MAX_TITLE_LEN {
        return Err(ApiError::Validation(format!(
            "title must be 1-{MAX_TITLE_LEN} characters"
        )));
    }
    Ok(title.to_string())
}

fn validate_dates(start: DateTime<Utc>, end: DateTime<Utc>) -> ApiResult<()> {
    if end < start {
        return Err(ApiError::Validation("end date is before start date".into()));
    }
    Ok(())
}

#[derive(Clone)]
pub struct TripRepository {
    store: Store,
    blobs: Arc<dyn BlobStore>,
    retry: RetryPolicy,
    dispatcher: Dispatcher,
    locks: TripLocks,
}

impl TripRepository {
    pub fn new(
        store: Store,
        blobs: Arc<dyn BlobStore>,
        retry: RetryPolicy,
        dispatcher: Dispatcher,
        locks: TripLocks,
    ) -> Self {
        Self {
            store,
            blobs,
            retry,
            dispatcher,
            locks,
        }
    }

    // -- Trips --

    /// Insert the trip and its owner permission in one transaction.
    pub async fn create_trip(&self, user_id: &str, req: CreateTripRequest) -> ApiResult<Trip> {
        validate_id("trip", &req.id)?;
        let title = validate_title(&req.title)?;
        validate_dates(req.start_date, req.end_date)?;

        let _guard = self.locks.lock(&req.id).await;
        let owner = user_id.to_string();
        let trip = self
            .store
            .write(move |conn| {
                let tx = conn.transaction()?;
                if queries::trip_exists(&tx, &req.id)? {
                    return Err(ApiError::Conflict(format!("trip {} already exists", req.id)));
                }

                let now = Utc::now();
                let trip = Trip {
                    id: req.id,
                    title,
                    start_date: req.start_date,
                    end_date: req.end_date,
                    cover_image: req.cover_image,
                    owner_id: owner.clone(),
                    share_link: None,
                    created_at: now,
                    updated_at: now,
                };
                queries::insert_trip(&tx, &trip)?;
                queries::insert_permission(
                    &tx,
                    &TripPermission {
                        trip_id: trip.id.clone(),
                        user_id: owner.clone(),
                        role: Role::Owner,
                        granted_via: GrantedVia::Direct,
                        invited_by: owner,
                        invited_at: now,
                        accepted_at: Some(now),
                    },
                )?;
                tx.commit()?;
                Ok(trip)
            })
            .await?;

        info!("{} created trip {}", user_id, trip.id);
        self.dispatcher
            .publish(&Change::new(&trip.id, ChangeKind::Membership).with_users([user_id]))
            .await;
        Ok(trip)
    }

    /// Apply only the supplied fields. Requires edit rights.
    pub async fn update_trip(
        &self,
        user_id: &str,
        trip_id: &str,
        patch: UpdateTripRequest,
    ) -> ApiResult<Trip> {
        let title = patch.title.as_deref().map(validate_title).transpose()?;

        let _guard = self.locks.lock(trip_id).await;
        let (uid, tid) = (user_id.to_string(), trip_id.to_string());
        let (trip, members) = self
            .store
            .write(move |conn| {
                let tx = conn.transaction()?;
                let role = authorize(&tx, &tid, &uid, Action::Edit)?;
                let mut trip = queries::get_trip(&tx, &tid)?.ok_or(ApiError::NotFound)?;

                if let Some(title) = title {
                    trip.title = title;
                }
                if let Some(start) = patch.start_date {
                    trip.start_date = start;
                }
                if let Some(end) = patch.end_date {
                    trip.end_date = end;
                }
                if let Some(cover) = patch.cover_image {
                    trip.cover_image = cover;
                }
                validate_dates(trip.start_date, trip.end_date)?;
                trip.updated_at = Utc::now();

                queries::update_trip(&tx, &trip)?;
                let members = queries::member_ids(&tx, &tid)?;
                tx.commit()?;
                Ok((views::redact(trip, role), members))
            })
            .await?;

        self.dispatcher
            .publish(&Change::new(trip_id, ChangeKind::Trip).with_users(members))
            .await;
        Ok(trip)
    }

    /// Owner-only cascade: blobs first (retried, idempotent), then media,
    /// moments, permissions and the trip row in one transaction. If storage
    /// gives up, nothing in the database has changed and the delete can be
    /// retried.
    pub async fn delete_trip(&self, user_id: &str, trip_id: &str) -> ApiResult<()> {
        let _guard = self.locks.lock(trip_id).await;

        let (uid, tid) = (user_id.to_string(), trip_id.to_string());
        let blob_refs = self
            .store
            .read(move |conn| {
                authorize(conn, &tid, &uid, Action::Own)?;
                let media = queries::media_for_trip(conn, &tid)?;
                Ok(media
                    .iter()
                    .flat_map(|m| m.blob_refs().map(str::to_string))
                    .collect::<Vec<_>>())
            })
            .await?;

        self.release_blobs(trip_id, &blob_refs).await?;

        let (uid, tid) = (user_id.to_string(), trip_id.to_string());
        let (members, counts) = self
            .store
            .write(move |conn| {
                let tx = conn.transaction()?;
                authorize(&tx, &tid, &uid, Action::Own)?;
                let members = queries::member_ids(&tx, &tid)?;
                let counts = queries::delete_trip_cascade(&tx, &tid)?;
                tx.commit()?;
                Ok((members, counts))
            })
            .await?;

        info!(
            "{} deleted trip {} ({} media items, {} moments, {} permissions, {} blobs)",
            user_id,
            trip_id,
            counts.media_items,
            counts.moments,
            counts.permissions,
            blob_refs.len()
        );
        self.dispatcher
            .publish(&Change::new(trip_id, ChangeKind::Deleted).with_users(members))
            .await;
        Ok(())
    }

    pub async fn get_all_trips(&self, user_id: &str) -> ApiResult<Vec<TripSummary>> {
        let uid = user_id.to_string();
        self.store
            .read(move |conn| Ok(views::trip_list(conn, &uid)?))
            .await
    }

    /// Trips the caller is a member of but does not own.
    pub async fn get_shared_trips(&self, user_id: &str) -> ApiResult<Vec<TripSummary>> {
        let uid = user_id.to_string();
        self.store
            .read(move |conn| Ok(views::shared_trip_list(conn, &uid)?))
            .await
    }

    /// `NotFound` both when the trip is missing and when the caller cannot
    /// view it.
    pub async fn get_trip(&self, user_id: &str, trip_id: &str) -> ApiResult<TripDetail> {
        let (uid, tid) = (user_id.to_string(), trip_id.to_string());
        self.store
            .read(move |conn| views::trip_detail(conn, &tid, &uid)?.ok_or(ApiError::NotFound))
            .await
    }

    pub async fn get_trip_permissions(
        &self,
        user_id: &str,
        trip_id: &str,
    ) -> ApiResult<Vec<TripPermission>> {
        let (uid, tid) = (user_id.to_string(), trip_id.to_string());
        self.store
            .read(move |conn| views::trip_permissions(conn, &tid, &uid)?.ok_or(ApiError::NotFound))
            .await
    }

    // -- Media & moments --

    pub async fn add_media_item(
        &self,
        user_id: &str,
        trip_id: &str,
        req: AddMediaItemRequest,
    ) -> ApiResult<MediaItem> {
        validate_id("media item", &req.id)?;
        if req.storage_ref.trim().is_empty() {
            return Err(ApiError::Validation("storage_ref is required".into()));
        }

        let _guard = self.locks.lock(trip_id).await;
        let (uid, tid) = (user_id.to_string(), trip_id.to_string());
        let item = self
            .store
            .write(move |conn| {
                let tx = conn.transaction()?;
                authorize(&tx, &tid, &uid, Action::Edit)?;
                if queries::media_item_exists(&tx, &req.id)? {
                    return Err(ApiError::Conflict(format!("media item {} already exists", req.id)));
                }

                let item = MediaItem {
                    id: req.id,
                    trip_id: tid,
                    storage_ref: req.storage_ref,
                    thumbnail_ref: req.thumbnail_ref,
                    note: req.note,
                    uploaded_by: uid,
                    created_at: Utc::now(),
                };
                queries::insert_media_item(&tx, &item)?;
                tx.commit()?;
                Ok(item)
            })
            .await?;

        self.dispatcher
            .publish(&Change::new(trip_id, ChangeKind::Content))
            .await;
        Ok(item)
    }

    /// Remove one media item, release its blobs and drop it from any moment
    /// that referenced it.
    pub async fn remove_media_item(&self, user_id: &str, trip_id: &str, media_id: &str) -> ApiResult<()> {
        let _guard = self.locks.lock(trip_id).await;

        let (uid, tid, mid) = (user_id.to_string(), trip_id.to_string(), media_id.to_string());
        let item = self
            .store
            .read(move |conn| {
                authorize(conn, &tid, &uid, Action::Edit)?;
                queries::get_media_item(conn, &tid, &mid)?.ok_or(ApiError::NotFound)
            })
            .await?;

        let refs: Vec<String> = item.blob_refs().map(str::to_string).collect();
        self.release_blobs(trip_id, &refs).await?;

        let (uid, tid, mid) = (user_id.to_string(), trip_id.to_string(), media_id.to_string());
        self.store
            .write(move |conn| {
                let tx = conn.transaction()?;
                authorize(&tx, &tid, &uid, Action::Edit)?;
                if !queries::delete_media_item(&tx, &tid, &mid)? {
                    return Err(ApiError::NotFound);
                }
                queries::remove_media_from_moments(&tx, &tid, &mid, &Utc::now())?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        self.dispatcher
            .publish(&Change::new(trip_id, ChangeKind::Content))
            .await;
        Ok(())
    }

    pub async fn add_moment(
        &self,
        user_id: &str,
        trip_id: &str,
        req: AddMomentRequest,
    ) -> ApiResult<Moment> {
        validate_id("moment", &req.id)?;
        let mut seen = HashSet::new();
        if let Some(dup) = req.media_ids.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(ApiError::Validation(format!("media item {dup} listed twice")));
        }

        let _guard = self.locks.lock(trip_id).await;
        let (uid, tid) = (user_id.to_string(), trip_id.to_string());
        let moment = self
            .store
            .write(move |conn| {
                let tx = conn.transaction()?;
                authorize(&tx, &tid, &uid, Action::Edit)?;
                if queries::moment_exists(&tx, &req.id)? {
                    return Err(ApiError::Conflict(format!("moment {} already exists", req.id)));
                }

                let on_trip: HashSet<String> = queries::media_for_trip(&tx, &tid)?
                    .into_iter()
                    .map(|m| m.id)
                    .collect();
                if let Some(foreign) = req.media_ids.iter().find(|id| !on_trip.contains(*id)) {
                    return Err(ApiError::Validation(format!(
                        "media item {foreign} does not belong to this trip"
                    )));
                }

                let now = Utc::now();
                let moment = Moment {
                    id: req.id,
                    trip_id: tid,
                    title: req.title.trim().to_string(),
                    media_ids: req.media_ids,
                    layout: req.layout,
                    created_by: uid,
                    created_at: now,
                    updated_at: now,
                };
                queries::insert_moment(&tx, &moment)?;
                tx.commit()?;
                Ok(moment)
            })
            .await?;

        self.dispatcher
            .publish(&Change::new(trip_id, ChangeKind::Content))
            .await;
        Ok(moment)
    }

    pub async fn delete_moment(&self, user_id: &str, trip_id: &str, moment_id: &str) -> ApiResult<()> {
        let _guard = self.locks.lock(trip_id).await;
        let (uid, tid, mid) = (user_id.to_string(), trip_id.to_string(), moment_id.to_string());
        self.store
            .write(move |conn| {
                let tx = conn.transaction()?;
                authorize(&tx, &tid, &uid, Action::Edit)?;
                if !queries::delete_moment(&tx, &tid, &mid)? {
                    return Err(ApiError::NotFound);
                }
                tx.commit()?;
                Ok(())
            })
            .await?;

        self.dispatcher
            .publish(&Change::new(trip_id, ChangeKind::Content))
            .await;
        Ok(())
    }

    // -- Membership --

    /// Grant a role directly. Ownership is never granted this way.
    pub async fn invite_member(
        &self,
        user_id: &str,
        trip_id: &str,
        req: InviteMemberRequest,
    ) -> ApiResult<TripPermission> {
        if req.role.is_owner() {
            return Err(ApiError::Validation("ownership cannot be granted".into()));
        }
        validate_id("user", &req.user_id)?;

        let _guard = self.locks.lock(trip_id).await;
        let (uid, tid) = (user_id.to_string(), trip_id.to_string());
        let perm = self
            .store
            .write(move |conn| {
                let tx = conn.transaction()?;
                authorize(&tx, &tid, &uid, Action::ManageAccess)?;
                if queries::get_permission(&tx, &tid, &req.user_id)?.is_some() {
                    return Err(ApiError::Conflict(format!(
                        "{} is already a member",
                        req.user_id
                    )));
                }

                let perm = TripPermission {
                    trip_id: tid,
                    user_id: req.user_id,
                    role: req.role,
                    granted_via: GrantedVia::Direct,
                    invited_by: uid,
                    invited_at: Utc::now(),
                    accepted_at: None,
                };
                queries::insert_permission(&tx, &perm)?;
                tx.commit()?;
                Ok(perm)
            })
            .await?;

        info!("{} invited {} to {} as {}", user_id, perm.user_id, trip_id, perm.role);
        self.dispatcher
            .publish(&Change::new(trip_id, ChangeKind::Membership).with_users([perm.user_id.as_str()]))
            .await;
        Ok(perm)
    }

    pub async fn set_member_role(
        &self,
        user_id: &str,
        trip_id: &str,
        member_id: &str,
        role: Role,
    ) -> ApiResult<TripPermission> {
        if role.is_owner() {
            return Err(ApiError::Validation("ownership cannot be granted".into()));
        }

        let _guard = self.locks.lock(trip_id).await;
        let (uid, tid, member) = (user_id.to_string(), trip_id.to_string(), member_id.to_string());
        let perm = self
            .store
            .write(move |conn| {
                let tx = conn.transaction()?;
                authorize(&tx, &tid, &uid, Action::ManageAccess)?;
                let mut perm = queries::get_permission(&tx, &tid, &member)?.ok_or(ApiError::NotFound)?;
                if perm.role.is_owner() {
                    return Err(ApiError::Forbidden);
                }
                queries::set_role(&tx, &tid, &member, role)?;
                tx.commit()?;
                perm.role = role;
                Ok(perm)
            })
            .await?;

        self.dispatcher
            .publish(&Change::new(trip_id, ChangeKind::Membership).with_users([member_id]))
            .await;
        Ok(perm)
    }

    /// Remove a member. The owner record can only go away with the trip.
    pub async fn revoke_member(&self, user_id: &str, trip_id: &str, member_id: &str) -> ApiResult<()> {
        let _guard = self.locks.lock(trip_id).await;
        let (uid, tid, member) = (user_id.to_string(), trip_id.to_string(), member_id.to_string());
        self.store
            .write(move |conn| {
                let tx = conn.transaction()?;
                authorize(&tx, &tid, &uid, Action::ManageAccess)?;
                let perm = queries::get_permission(&tx, &tid, &member)?.ok_or(ApiError::NotFound)?;
                if perm.role.is_owner() {
                    return Err(ApiError::Forbidden);
                }
                queries::delete_permission(&tx, &tid, &member)?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        info!("{} revoked {} from {}", user_id, member_id, trip_id);
        self.dispatcher
            .publish(&Change::new(trip_id, ChangeKind::Membership).with_users([member_id]))
            .await;
        Ok(())
    }

    /// A non-owner member drops their own permission.
    pub async fn leave_trip(&self, user_id: &str, trip_id: &str) -> ApiResult<()> {
        let _guard = self.locks.lock(trip_id).await;
        let (uid, tid) = (user_id.to_string(), trip_id.to_string());
        self.store
            .write(move |conn| {
                let tx = conn.transaction()?;
                let perm = queries::get_permission(&tx, &tid, &uid)?.ok_or(ApiError::NotFound)?;
                if perm.role.is_owner() {
                    return Err(ApiError::Forbidden);
                }
                queries::delete_permission(&tx, &tid, &uid)?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        self.dispatcher
            .publish(&Change::new(trip_id, ChangeKind::Membership).with_users([user_id]))
            .await;
        Ok(())
    }

    async fn release_blobs(&self, trip_id: &str, refs: &[String]) -> ApiResult<()> {
        self.retry
            .delete_all(self.blobs.as_ref(), refs.iter().map(String::as_str))
            .await
            .map(|_| ())
            .map_err(|e| {
                warn!("Blob cleanup for trip {} failed: {}", trip_id, e);
                ApiError::Unavailable("storage unavailable, retry the delete".to_string())
            })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::tests::{MemoryBlobStore, fast_policy};
    use chrono::TimeZone;
    use roam_db::Database;
    use roam_types::events::{GatewayEvent, QueryShape, Snapshot};
    use std::time::Duration;

    pub(crate) struct Fixture {
        pub repo: TripRepository,
        pub blobs: Arc<MemoryBlobStore>,
        pub dispatcher: Dispatcher,
        pub store: Store,
        pub locks: TripLocks,
    }

    pub(crate) fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = Store::new(db.clone(), Duration::from_secs(5));
        let blobs = Arc::new(MemoryBlobStore::default());
        let dispatcher = Dispatcher::new(db);
        let locks = TripLocks::new();
        let repo = TripRepository::new(
            store.clone(),
            blobs.clone(),
            fast_policy(),
            dispatcher.clone(),
            locks.clone(),
        );
        Fixture {
            repo,
            blobs,
            dispatcher,
            store,
            locks,
        }
    }

    pub(crate) fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, d, 0, 0, 0).unwrap()
    }

    pub(crate) fn new_trip(id: &str, title: &str, start: u32, end: u32) -> CreateTripRequest {
        CreateTripRequest {
            id: id.into(),
            title: title.into(),
            start_date: day(start),
            end_date: day(end),
            cover_image: None,
        }
    }

    fn media(id: &str, blobs: &MemoryBlobStore) -> AddMediaItemRequest {
        let full = format!("{id}-full");
        let thumb = format!("{id}-thumb");
        blobs.insert(&full);
        blobs.insert(&thumb);
        AddMediaItemRequest {
            id: id.into(),
            storage_ref: full,
            thumbnail_ref: Some(thumb),
            note: "sunset".into(),
        }
    }

    fn moment(id: &str, media_ids: &[&str]) -> AddMomentRequest {
        AddMomentRequest {
            id: id.into(),
            title: "Day one".into(),
            media_ids: media_ids.iter().map(|s| s.to_string()).collect(),
            layout: serde_json::json!({ "grid": 2 }),
        }
    }

    async fn invite(f: &Fixture, trip: &str, user: &str, role: Role) {
        f.repo
            .invite_member(
                "alice",
                trip,
                InviteMemberRequest {
                    user_id: user.into(),
                    role,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_yields_exactly_one_owner() {
        let f = fixture();
        f.repo
            .create_trip("alice", new_trip("T1", "Paris", 1, 5))
            .await
            .unwrap();

        let perms = f.repo.get_trip_permissions("alice", "T1").await.unwrap();
        assert_eq!(perms.len(), 1);
        assert_eq!(perms[0].user_id, "alice");
        assert_eq!(perms[0].role, Role::Owner);
    }

    #[tokio::test]
    async fn duplicate_id_conflicts() {
        let f = fixture();
        f.repo
            .create_trip("alice", new_trip("T1", "Paris", 1, 5))
            .await
            .unwrap();
        let err = f
            .repo
            .create_trip("bob", new_trip("T1", "Rome", 1, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
        assert!(f.repo.get_trip("bob", "T1").await.is_err());
    }

    #[tokio::test]
    async fn create_validates_input() {
        let f = fixture();
        let blank = f.repo.create_trip("alice", new_trip("T1", "  ", 1, 5)).await;
        assert!(matches!(blank, Err(ApiError::Validation(_))));
        let backwards = f.repo.create_trip("alice", new_trip("T1", "Paris", 5, 1)).await;
        assert!(matches!(backwards, Err(ApiError::Validation(_))));
    }

    #[tokio::test]
    async fn partial_update_touches_only_supplied_fields() {
        let f = fixture();
        let mut req = new_trip("T1", "Paris", 1, 5);
        req.cover_image = Some("cover-1".into());
        let created = f.repo.create_trip("alice", req).await.unwrap();

        let updated = f
            .repo
            .update_trip(
                "alice",
                "T1",
                UpdateTripRequest {
                    title: Some("Paris Trip".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.title, "Paris Trip");
        assert_eq!(updated.start_date, created.start_date);
        assert_eq!(updated.cover_image.as_deref(), Some("cover-1"));
        assert!(updated.updated_at >= created.updated_at);

        let cleared = f
            .repo
            .update_trip(
                "alice",
                "T1",
                UpdateTripRequest {
                    cover_image: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(cleared.cover_image, None);
        assert_eq!(cleared.title, "Paris Trip");
    }

    #[tokio::test]
    async fn empty_patch_only_refreshes_updated_at() {
        let f = fixture();
        let created = f
            .repo
            .create_trip("alice", new_trip("T1", "Paris", 1, 5))
            .await
            .unwrap();

        let touched = f
            .repo
            .update_trip("alice", "T1", UpdateTripRequest::default())
            .await
            .unwrap();
        assert_eq!(touched.title, created.title);
        assert_eq!(touched.end_date, created.end_date);
        assert!(touched.updated_at >= created.updated_at);

        assert!(matches!(
            f.repo.update_trip("alice", "nope", UpdateTripRequest::default()).await,
            Err(ApiError::NotFound)
        ));
    }

    #[tokio::test]
    async fn update_enforces_edit_rights() {
        let f = fixture();
        f.repo
            .create_trip("alice", new_trip("T1", "Paris", 1, 5))
            .await
            .unwrap();
        invite(&f, "T1", "bob", Role::Collaborator).await;
        invite(&f, "T1", "carol", Role::Viewer).await;
        let rename = || UpdateTripRequest {
            title: Some("Renamed".into()),
            ..Default::default()
        };

        assert!(f.repo.update_trip("bob", "T1", rename()).await.is_ok());
        assert!(matches!(
            f.repo.update_trip("carol", "T1", rename()).await,
            Err(ApiError::Forbidden)
        ));
        assert!(matches!(
            f.repo.update_trip("mallory", "T1", rename()).await,
            Err(ApiError::Forbidden)
        ));
        assert!(matches!(
            f.repo.update_trip("alice", "nope", rename()).await,
            Err(ApiError::NotFound)
        ));
    }

    #[tokio::test]
    async fn update_rejects_dates_out_of_order() {
        let f = fixture();
        f.repo
            .create_trip("alice", new_trip("T1", "Paris", 1, 5))
            .await
            .unwrap();
        let err = f
            .repo
            .update_trip(
                "alice",
                "T1",
                UpdateTripRequest {
                    end_date: Some(day(1) - chrono::Duration::days(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn delete_cascades_everything() {
        let f = fixture();
        f.repo
            .create_trip("alice", new_trip("T1", "Paris", 1, 5))
            .await
            .unwrap();
        invite(&f, "T1", "bob", Role::Collaborator).await;
        f.repo
            .add_media_item("bob", "T1", media("m1", &f.blobs))
            .await
            .unwrap();
        f.repo
            .add_moment("bob", "T1", moment("mo1", &["m1"]))
            .await
            .unwrap();

        f.repo.delete_trip("alice", "T1").await.unwrap();

        for user in ["alice", "bob"] {
            assert!(matches!(f.repo.get_trip(user, "T1").await, Err(ApiError::NotFound)));
        }
        assert!(!f.blobs.contains("m1-full"));
        assert!(!f.blobs.contains("m1-thumb"));
        let leftovers: i64 = f
            .store
            .read(|conn| {
                Ok(conn.query_row(
                    "SELECT (SELECT COUNT(*) FROM media_items WHERE trip_id = 'T1')
                          + (SELECT COUNT(*) FROM moments WHERE trip_id = 'T1')
                          + (SELECT COUNT(*) FROM trip_permissions WHERE trip_id = 'T1')",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn failed_storage_leaves_trip_intact_and_retry_completes() {
        let f = fixture();
        f.repo
            .create_trip("alice", new_trip("T1", "Paris", 1, 5))
            .await
            .unwrap();
        f.repo
            .add_media_item("alice", "T1", media("m1", &f.blobs))
            .await
            .unwrap();

        f.blobs.fail_next_deletes(100);
        let err = f.repo.delete_trip("alice", "T1").await.unwrap_err();
        assert!(err.is_retryable());
        let detail = f.repo.get_trip("alice", "T1").await.unwrap();
        assert_eq!(detail.media_items.len(), 1);

        f.blobs.fail_next_deletes(0);
        f.repo.delete_trip("alice", "T1").await.unwrap();
        assert!(matches!(f.repo.get_trip("alice", "T1").await, Err(ApiError::NotFound)));
        assert!(f.locks.is_empty());
    }

    #[tokio::test]
    async fn only_owner_deletes() {
        let f = fixture();
        f.repo
            .create_trip("alice", new_trip("T1", "Paris", 1, 5))
            .await
            .unwrap();
        invite(&f, "T1", "bob", Role::Collaborator).await;

        assert!(matches!(f.repo.delete_trip("bob", "T1").await, Err(ApiError::Forbidden)));
        assert!(matches!(f.repo.delete_trip("mallory", "T1").await, Err(ApiError::Forbidden)));
        assert!(matches!(f.repo.delete_trip("alice", "nope").await, Err(ApiError::NotFound)));
        assert!(f.repo.get_trip("bob", "T1").await.is_ok());
    }

    #[tokio::test]
    async fn trip_list_is_scoped_and_ordered() {
        let f = fixture();
        f.repo.create_trip("alice", new_trip("old", "Old", 1, 2)).await.unwrap();
        f.repo.create_trip("alice", new_trip("new", "New", 20, 22)).await.unwrap();
        f.repo.create_trip("alice", new_trip("old-2", "Old too", 1, 3)).await.unwrap();
        f.repo.create_trip("bob", new_trip("bobs", "Bob's", 10, 12)).await.unwrap();

        let ids: Vec<String> = f
            .repo
            .get_all_trips("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.trip.id)
            .collect();
        assert_eq!(ids, vec!["new", "old", "old-2"]);

        f.repo
            .invite_member(
                "bob",
                "bobs",
                InviteMemberRequest {
                    user_id: "alice".into(),
                    role: Role::Viewer,
                },
            )
            .await
            .unwrap();
        let shared = f.repo.get_shared_trips("alice").await.unwrap();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].trip.id, "bobs");
        assert_eq!(shared[0].role, Role::Viewer);
    }

    #[tokio::test]
    async fn trip_detail_hides_existence_from_outsiders() {
        let f = fixture();
        f.repo
            .create_trip("alice", new_trip("T1", "Paris", 1, 5))
            .await
            .unwrap();
        assert!(matches!(f.repo.get_trip("mallory", "T1").await, Err(ApiError::NotFound)));
        assert!(matches!(
            f.repo.get_trip_permissions("mallory", "T1").await,
            Err(ApiError::NotFound)
        ));
    }

    #[tokio::test]
    async fn viewers_cannot_add_content() {
        let f = fixture();
        f.repo
            .create_trip("alice", new_trip("T1", "Paris", 1, 5))
            .await
            .unwrap();
        invite(&f, "T1", "carol", Role::Viewer).await;

        let err = f
            .repo
            .add_media_item("carol", "T1", media("m1", &f.blobs))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden));
        let err = f
            .repo
            .add_moment("carol", "T1", moment("mo1", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden));
    }

    #[tokio::test]
    async fn moments_only_reference_own_media() {
        let f = fixture();
        f.repo.create_trip("alice", new_trip("T1", "Paris", 1, 5)).await.unwrap();
        f.repo.create_trip("alice", new_trip("T2", "Rome", 6, 9)).await.unwrap();
        f.repo
            .add_media_item("alice", "T2", media("rome-1", &f.blobs))
            .await
            .unwrap();

        let err = f
            .repo
            .add_moment("alice", "T1", moment("mo1", &["rome-1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn removing_media_releases_blobs_and_moment_refs() {
        let f = fixture();
        f.repo.create_trip("alice", new_trip("T1", "Paris", 1, 5)).await.unwrap();
        f.repo.add_media_item("alice", "T1", media("m1", &f.blobs)).await.unwrap();
        f.repo.add_media_item("alice", "T1", media("m2", &f.blobs)).await.unwrap();
        f.repo
            .add_moment("alice", "T1", moment("mo1", &["m1", "m2"]))
            .await
            .unwrap();

        f.repo.remove_media_item("alice", "T1", "m1").await.unwrap();

        let detail = f.repo.get_trip("alice", "T1").await.unwrap();
        assert_eq!(detail.media_items.len(), 1);
        assert_eq!(detail.moments[0].media_ids, vec!["m2".to_string()]);
        assert!(!f.blobs.contains("m1-full"));
        assert!(f.blobs.contains("m2-full"));
        assert!(matches!(
            f.repo.remove_media_item("alice", "T1", "m1").await,
            Err(ApiError::NotFound)
        ));
    }

    #[tokio::test]
    async fn owner_record_cannot_be_revoked_or_demoted() {
        let f = fixture();
        f.repo.create_trip("alice", new_trip("T1", "Paris", 1, 5)).await.unwrap();

        assert!(matches!(
            f.repo.revoke_member("alice", "T1", "alice").await,
            Err(ApiError::Forbidden)
        ));
        assert!(matches!(
            f.repo.set_member_role("alice", "T1", "alice", Role::Viewer).await,
            Err(ApiError::Forbidden)
        ));
        assert!(matches!(
            f.repo.leave_trip("alice", "T1").await,
            Err(ApiError::Forbidden)
        ));
        invite(&f, "T1", "bob", Role::Viewer).await;
        assert!(matches!(
            f.repo.set_member_role("alice", "T1", "bob", Role::Owner).await,
            Err(ApiError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn membership_changes_take_effect_immediately() {
        let f = fixture();
        f.repo.create_trip("alice", new_trip("T1", "Paris", 1, 5)).await.unwrap();
        invite(&f, "T1", "bob", Role::Viewer).await;

        let promoted = f
            .repo
            .set_member_role("alice", "T1", "bob", Role::Collaborator)
            .await
            .unwrap();
        assert_eq!(promoted.role, Role::Collaborator);
        assert_eq!(promoted.granted_via, GrantedVia::Direct);

        f.repo.revoke_member("alice", "T1", "bob").await.unwrap();
        assert!(matches!(f.repo.get_trip("bob", "T1").await, Err(ApiError::NotFound)));

        invite(&f, "T1", "carol", Role::Viewer).await;
        f.repo.leave_trip("carol", "T1").await.unwrap();
        assert!(f.repo.get_all_trips("carol").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_owner_cannot_invite() {
        let f = fixture();
        f.repo.create_trip("alice", new_trip("T1", "Paris", 1, 5)).await.unwrap();
        invite(&f, "T1", "bob", Role::Collaborator).await;

        let err = f
            .repo
            .invite_member(
                "bob",
                "T1",
                InviteMemberRequest {
                    user_id: "carol".into(),
                    role: Role::Viewer,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden));
    }

    #[tokio::test]
    async fn update_racing_delete_never_resurrects_the_trip() {
        let f = fixture();
        f.repo.create_trip("alice", new_trip("T1", "Paris", 1, 5)).await.unwrap();
        invite(&f, "T1", "bob", Role::Collaborator).await;
        f.repo.add_media_item("bob", "T1", media("m1", &f.blobs)).await.unwrap();

        let (updated, deleted) = tokio::join!(
            f.repo.update_trip(
                "bob",
                "T1",
                UpdateTripRequest {
                    title: Some("Paris Trip".into()),
                    ..Default::default()
                },
            ),
            f.repo.delete_trip("alice", "T1"),
        );
        deleted.unwrap();
        assert!(matches!(updated, Ok(_) | Err(ApiError::NotFound)));

        for user in ["alice", "bob"] {
            assert!(matches!(f.repo.get_trip(user, "T1").await, Err(ApiError::NotFound)));
        }
        assert!(!f.blobs.contains("m1-full"));
        assert!(f.locks.is_empty());
    }

    #[tokio::test]
    async fn title_update_pushes_exactly_once() {
        let f = fixture();
        f.repo.create_trip("alice", new_trip("T1", "Paris", 1, 5)).await.unwrap();
        f.repo.create_trip("alice", new_trip("T2", "Rome", 6, 9)).await.unwrap();

        let (conn_id, mut rx) = f.dispatcher.register_connection("alice").await;
        f.dispatcher
            .subscribe(conn_id, "detail".into(), QueryShape::TripDetail { trip_id: "T1".into() })
            .await;
        rx.try_recv().unwrap();

        f.repo
            .update_trip(
                "alice",
                "T1",
                UpdateTripRequest {
                    title: Some("Paris Trip".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        f.repo
            .update_trip(
                "alice",
                "T2",
                UpdateTripRequest {
                    title: Some("Roma".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        match rx.try_recv().unwrap() {
            GatewayEvent::Snapshot {
                snapshot: Snapshot::TripDetail(detail),
                ..
            } => assert_eq!(detail.trip.title, "Paris Trip"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn revoked_member_receives_denied() {
        let f = fixture();
        f.repo.create_trip("alice", new_trip("T1", "Paris", 1, 5)).await.unwrap();
        invite(&f, "T1", "bob", Role::Collaborator).await;

        let (conn_id, mut rx) = f.dispatcher.register_connection("bob").await;
        f.dispatcher
            .subscribe(conn_id, "detail".into(), QueryShape::TripDetail { trip_id: "T1".into() })
            .await;
        f.dispatcher.subscribe(conn_id, "all".into(), QueryShape::AllTrips).await;
        rx.try_recv().unwrap();
        rx.try_recv().unwrap();

        f.repo.revoke_member("alice", "T1", "bob").await.unwrap();

        let mut denied = false;
        let mut emptied = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                GatewayEvent::Denied { subscription_id, .. } => denied = subscription_id == "detail",
                GatewayEvent::Snapshot {
                    snapshot: Snapshot::Trips(trips),
                    ..
                } => emptied = trips.is_empty(),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(denied && emptied);
    }
}
