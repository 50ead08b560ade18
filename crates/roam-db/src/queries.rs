//! Statement-level access to the four trip tables.
//!
//! Every function takes a plain `&Connection` so callers can compose them
//! inside a single transaction (`Transaction` derefs to `Connection`).

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use roam_types::models::{MediaItem, Moment, Role, Trip, TripPermission};

use crate::models::{
    MediaItemRow, MomentRow, PermissionRow, TRIP_COLUMNS, TripRow, to_db_time,
};

// -- Trips --

pub fn trip_exists(conn: &Connection, trip_id: &str) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM trips WHERE id = ?1", [trip_id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

pub fn get_trip(conn: &Connection, trip_id: &str) -> Result<Option<Trip>> {
    let sql = format!("SELECT {} FROM trips t WHERE t.id = ?1", TRIP_COLUMNS);
    let row = conn
        .query_row(&sql, [trip_id], |row| TripRow::from_row(row, 0))
        .optional()?;
    row.map(Trip::try_from).transpose()
}

pub fn get_trip_by_slug(conn: &Connection, slug: &str) -> Result<Option<Trip>> {
    let sql = format!("SELECT {} FROM trips t WHERE t.share_slug = ?1", TRIP_COLUMNS);
    let row = conn
        .query_row(&sql, [slug], |row| TripRow::from_row(row, 0))
        .optional()?;
    row.map(Trip::try_from).transpose()
}

pub fn slug_taken(conn: &Connection, slug: &str) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM trips WHERE share_slug = ?1", [slug], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

pub fn insert_trip(conn: &Connection, trip: &Trip) -> Result<()> {
    let (slug, code, enabled) = match &trip.share_link {
        Some(link) => (Some(link.slug.as_str()), link.code.as_deref(), link.enabled),
        None => (None, None, false),
    };
    conn.execute(
        "INSERT INTO trips (id, title, start_date, end_date, cover_image, owner_id,
                            share_slug, share_code, share_enabled, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            trip.id,
            trip.title,
            to_db_time(&trip.start_date),
            to_db_time(&trip.end_date),
            trip.cover_image,
            trip.owner_id,
            slug,
            code,
            enabled,
            to_db_time(&trip.created_at),
            to_db_time(&trip.updated_at),
        ],
    )?;
    Ok(())
}

/// Writes every mutable trip column. Ownership and creation time are fixed.
pub fn update_trip(conn: &Connection, trip: &Trip) -> Result<()> {
    let (slug, code, enabled) = match &trip.share_link {
        Some(link) => (Some(link.slug.as_str()), link.code.as_deref(), link.enabled),
        None => (None, None, false),
    };
    conn.execute(
        "UPDATE trips
         SET title = ?2, start_date = ?3, end_date = ?4, cover_image = ?5,
             share_slug = ?6, share_code = ?7, share_enabled = ?8, updated_at = ?9
         WHERE id = ?1",
        params![
            trip.id,
            trip.title,
            to_db_time(&trip.start_date),
            to_db_time(&trip.end_date),
            trip.cover_image,
            slug,
            code,
            enabled,
            to_db_time(&trip.updated_at),
        ],
    )?;
    Ok(())
}

/// Trips the user holds a permission on, with that permission's role.
/// Newest start date first; equal start dates keep insertion order.
pub fn trips_for_user(conn: &Connection, user_id: &str) -> Result<Vec<(Trip, Role)>> {
    let sql = format!(
        "SELECT {}, p.role
         FROM trip_permissions p
         JOIN trips t ON t.id = p.trip_id
         WHERE p.user_id = ?1
         ORDER BY t.start_date DESC, t.rowid ASC",
        TRIP_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([user_id], |row| {
            Ok((TripRow::from_row(row, 0)?, row.get::<_, String>(11)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(trip, role)| Ok((Trip::try_from(trip)?, role.parse()?)))
        .collect()
}

/// Removes a trip and everything it owns, children first. Callers run this
/// inside a transaction.
pub fn delete_trip_cascade(conn: &Connection, trip_id: &str) -> Result<CascadeCounts> {
    let media_items = conn.execute("DELETE FROM media_items WHERE trip_id = ?1", [trip_id])?;
    let moments = conn.execute("DELETE FROM moments WHERE trip_id = ?1", [trip_id])?;
    let permissions = conn.execute("DELETE FROM trip_permissions WHERE trip_id = ?1", [trip_id])?;
    let trips = conn.execute("DELETE FROM trips WHERE id = ?1", [trip_id])?;
    Ok(CascadeCounts {
        media_items,
        moments,
        permissions,
        trips,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeCounts {
    pub media_items: usize,
    pub moments: usize,
    pub permissions: usize,
    pub trips: usize,
}

// -- Permissions --

pub fn get_permission(
    conn: &Connection,
    trip_id: &str,
    user_id: &str,
) -> Result<Option<TripPermission>> {
    let row = conn
        .query_row(
            "SELECT trip_id, user_id, role, granted_via, invited_by, invited_at, accepted_at
             FROM trip_permissions WHERE trip_id = ?1 AND user_id = ?2",
            [trip_id, user_id],
            permission_row,
        )
        .optional()?;
    row.map(TripPermission::try_from).transpose()
}

/// Just the role column, for authorization checks.
pub fn get_role(conn: &Connection, trip_id: &str, user_id: &str) -> Result<Option<Role>> {
    let role: Option<String> = conn
        .query_row(
            "SELECT role FROM trip_permissions WHERE trip_id = ?1 AND user_id = ?2",
            [trip_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(role.map(|r| r.parse()).transpose()?)
}

/// All permission records on a trip: owner first, then by grant time.
pub fn permissions_for_trip(conn: &Connection, trip_id: &str) -> Result<Vec<TripPermission>> {
    let mut stmt = conn.prepare(
        "SELECT trip_id, user_id, role, granted_via, invited_by, invited_at, accepted_at
         FROM trip_permissions
         WHERE trip_id = ?1
         ORDER BY (role = 'owner') DESC, invited_at ASC, rowid ASC",
    )?;
    let rows = stmt
        .query_map([trip_id], permission_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(TripPermission::try_from).collect()
}

pub fn member_ids(conn: &Connection, trip_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT user_id FROM trip_permissions WHERE trip_id = ?1")?;
    let ids = stmt
        .query_map([trip_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub fn insert_permission(conn: &Connection, perm: &TripPermission) -> Result<()> {
    conn.execute(
        "INSERT INTO trip_permissions
            (trip_id, user_id, role, granted_via, invited_by, invited_at, accepted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            perm.trip_id,
            perm.user_id,
            perm.role.as_str(),
            perm.granted_via.as_str(),
            perm.invited_by,
            to_db_time(&perm.invited_at),
            perm.accepted_at.as_ref().map(to_db_time),
        ],
    )?;
    Ok(())
}

pub fn set_role(conn: &Connection, trip_id: &str, user_id: &str, role: Role) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE trip_permissions SET role = ?3 WHERE trip_id = ?1 AND user_id = ?2",
        params![trip_id, user_id, role.as_str()],
    )?;
    Ok(changed > 0)
}

pub fn delete_permission(conn: &Connection, trip_id: &str, user_id: &str) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM trip_permissions WHERE trip_id = ?1 AND user_id = ?2",
        [trip_id, user_id],
    )?;
    Ok(changed > 0)
}

fn permission_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PermissionRow> {
    Ok(PermissionRow {
        trip_id: row.get(0)?,
        user_id: row.get(1)?,
        role: row.get(2)?,
        granted_via: row.get(3)?,
        invited_by: row.get(4)?,
        invited_at: row.get(5)?,
        accepted_at: row.get(6)?,
    })
}

// -- Media items --

pub fn media_item_exists(conn: &Connection, media_id: &str) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM media_items WHERE id = ?1", [media_id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

pub fn get_media_item(conn: &Connection, trip_id: &str, media_id: &str) -> Result<Option<MediaItem>> {
    let row = conn
        .query_row(
            "SELECT id, trip_id, storage_ref, thumbnail_ref, note, uploaded_by, created_at
             FROM media_items WHERE trip_id = ?1 AND id = ?2",
            [trip_id, media_id],
            media_item_row,
        )
        .optional()?;
    row.map(MediaItem::try_from).transpose()
}

pub fn media_for_trip(conn: &Connection, trip_id: &str) -> Result<Vec<MediaItem>> {
    let mut stmt = conn.prepare(
        "SELECT id, trip_id, storage_ref, thumbnail_ref, note, uploaded_by, created_at
         FROM media_items
         WHERE trip_id = ?1
         ORDER BY created_at ASC, rowid ASC",
    )?;
    let rows = stmt
        .query_map([trip_id], media_item_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(MediaItem::try_from).collect()
}

pub fn insert_media_item(conn: &Connection, item: &MediaItem) -> Result<()> {
    conn.execute(
        "INSERT INTO media_items (id, trip_id, storage_ref, thumbnail_ref, note, uploaded_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            item.id,
            item.trip_id,
            item.storage_ref,
            item.thumbnail_ref,
            item.note,
            item.uploaded_by,
            to_db_time(&item.created_at),
        ],
    )?;
    Ok(())
}

pub fn delete_media_item(conn: &Connection, trip_id: &str, media_id: &str) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM media_items WHERE trip_id = ?1 AND id = ?2",
        [trip_id, media_id],
    )?;
    Ok(changed > 0)
}

fn media_item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MediaItemRow> {
    Ok(MediaItemRow {
        id: row.get(0)?,
        trip_id: row.get(1)?,
        storage_ref: row.get(2)?,
        thumbnail_ref: row.get(3)?,
        note: row.get(4)?,
        uploaded_by: row.get(5)?,
        created_at: row.get(6)?,
    })
}

// -- Moments --

pub fn moment_exists(conn: &Connection, moment_id: &str) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM moments WHERE id = ?1", [moment_id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

pub fn moments_for_trip(conn: &Connection, trip_id: &str) -> Result<Vec<Moment>> {
    let mut stmt = conn.prepare(
        "SELECT id, trip_id, title, media_ids, layout, created_by, created_at, updated_at
         FROM moments
         WHERE trip_id = ?1
         ORDER BY created_at ASC, rowid ASC",
    )?;
    let rows = stmt
        .query_map([trip_id], |row| {
            Ok(MomentRow {
                id: row.get(0)?,
                trip_id: row.get(1)?,
                title: row.get(2)?,
                media_ids: row.get(3)?,
                layout: row.get(4)?,
                created_by: row.get(5)?,
                created_at: row.get(6)?,
                updated_at: row.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(Moment::try_from).collect()
}

pub fn insert_moment(conn: &Connection, moment: &Moment) -> Result<()> {
    conn.execute(
        "INSERT INTO moments (id, trip_id, title, media_ids, layout, created_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            moment.id,
            moment.trip_id,
            moment.title,
            serde_json::to_string(&moment.media_ids)?,
            serde_json::to_string(&moment.layout)?,
            moment.created_by,
            to_db_time(&moment.created_at),
            to_db_time(&moment.updated_at),
        ],
    )?;
    Ok(())
}

pub fn delete_moment(conn: &Connection, trip_id: &str, moment_id: &str) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM moments WHERE trip_id = ?1 AND id = ?2",
        [trip_id, moment_id],
    )?;
    Ok(changed > 0)
}

/// Drops `media_id` from every moment on the trip that references it.
/// Returns the number of moments rewritten.
pub fn remove_media_from_moments(
    conn: &Connection,
    trip_id: &str,
    media_id: &str,
    now: &DateTime<Utc>,
) -> Result<usize> {
    let mut rewritten = 0;
    for mut moment in moments_for_trip(conn, trip_id)? {
        let before = moment.media_ids.len();
        moment.media_ids.retain(|id| id != media_id);
        if moment.media_ids.len() == before {
            continue;
        }
        conn.execute(
            "UPDATE moments SET media_ids = ?2, updated_at = ?3 WHERE id = ?1",
            params![moment.id, serde_json::to_string(&moment.media_ids)?, to_db_time(now)],
        )?;
        rewritten += 1;
    }
    Ok(rewritten)
}
