/// Database row types. Each maps directly to one SQLite row.
/// Conversions into roam-types models parse timestamps and enums, so a
/// corrupt row surfaces as an error instead of a default value.
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;

use roam_types::models::{MediaItem, Moment, ShareLink, Trip, TripPermission};

/// Fixed-width RFC 3339 so lexical order in SQLite matches time order.
pub fn to_db_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn from_db_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Corrupt timestamp '{}'", s))?
        .with_timezone(&Utc))
}

pub struct TripRow {
    pub id: String,
    pub title: String,
    pub start_date: String,
    pub end_date: String,
    pub cover_image: Option<String>,
    pub owner_id: String,
    pub share_slug: Option<String>,
    pub share_code: Option<String>,
    pub share_enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

pub const TRIP_COLUMNS: &str = "t.id, t.title, t.start_date, t.end_date, t.cover_image, t.owner_id, \
     t.share_slug, t.share_code, t.share_enabled, t.created_at, t.updated_at";

impl TripRow {
    /// Reads the columns listed in [`TRIP_COLUMNS`], starting at `offset`.
    pub fn from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(offset)?,
            title: row.get(offset + 1)?,
            start_date: row.get(offset + 2)?,
            end_date: row.get(offset + 3)?,
            cover_image: row.get(offset + 4)?,
            owner_id: row.get(offset + 5)?,
            share_slug: row.get(offset + 6)?,
            share_code: row.get(offset + 7)?,
            share_enabled: row.get(offset + 8)?,
            created_at: row.get(offset + 9)?,
            updated_at: row.get(offset + 10)?,
        })
    }
}

impl TryFrom<TripRow> for Trip {
    type Error = anyhow::Error;

    fn try_from(row: TripRow) -> Result<Self> {
        let share_link = row.share_slug.map(|slug| ShareLink {
            slug,
            code: row.share_code,
            enabled: row.share_enabled,
        });

        Ok(Trip {
            start_date: from_db_time(&row.start_date)?,
            end_date: from_db_time(&row.end_date)?,
            created_at: from_db_time(&row.created_at)?,
            updated_at: from_db_time(&row.updated_at)?,
            id: row.id,
            title: row.title,
            cover_image: row.cover_image,
            owner_id: row.owner_id,
            share_link,
        })
    }
}

pub struct MediaItemRow {
    pub id: String,
    pub trip_id: String,
    pub storage_ref: String,
    pub thumbnail_ref: Option<String>,
    pub note: String,
    pub uploaded_by: String,
    pub created_at: String,
}

impl TryFrom<MediaItemRow> for MediaItem {
    type Error = anyhow::Error;

    fn try_from(row: MediaItemRow) -> Result<Self> {
        Ok(MediaItem {
            created_at: from_db_time(&row.created_at)?,
            id: row.id,
            trip_id: row.trip_id,
            storage_ref: row.storage_ref,
            thumbnail_ref: row.thumbnail_ref,
            note: row.note,
            uploaded_by: row.uploaded_by,
        })
    }
}

pub struct MomentRow {
    pub id: String,
    pub trip_id: String,
    pub title: String,
    pub media_ids: String,
    pub layout: String,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<MomentRow> for Moment {
    type Error = anyhow::Error;

    fn try_from(row: MomentRow) -> Result<Self> {
        let media_ids = serde_json::from_str(&row.media_ids)
            .with_context(|| format!("Corrupt media_ids on moment '{}'", row.id))?;
        let layout = serde_json::from_str(&row.layout)
            .with_context(|| format!("Corrupt layout on moment '{}'", row.id))?;

        Ok(Moment {
            created_at: from_db_time(&row.created_at)?,
            updated_at: from_db_time(&row.updated_at)?,
            id: row.id,
            trip_id: row.trip_id,
            title: row.title,
            media_ids,
            layout,
            created_by: row.created_by,
        })
    }
}

pub struct PermissionRow {
    pub trip_id: String,
    pub user_id: String,
    pub role: String,
    pub granted_via: String,
    pub invited_by: String,
    pub invited_at: String,
    pub accepted_at: Option<String>,
}

impl TryFrom<PermissionRow> for TripPermission {
    type Error = anyhow::Error;

    fn try_from(row: PermissionRow) -> Result<Self> {
        Ok(TripPermission {
            role: row
                .role
                .parse()
                .with_context(|| format!("Corrupt role on ({}, {})", row.trip_id, row.user_id))?,
            granted_via: row.granted_via.parse().with_context(|| {
                format!("Corrupt granted_via on ({}, {})", row.trip_id, row.user_id)
            })?,
            invited_at: from_db_time(&row.invited_at)?,
            accepted_at: row.accepted_at.as_deref().map(from_db_time).transpose()?,
            trip_id: row.trip_id,
            user_id: row.user_id,
            invited_by: row.invited_by,
        })
    }
}
