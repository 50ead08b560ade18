use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable internal user id, as produced by the identity adapter.
pub type UserId = String;

/// A member's role on a single trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Collaborator,
    Viewer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Collaborator => "collaborator",
            Self::Viewer => "viewer",
        }
    }

    /// Every role may read the trip.
    pub fn can_view(self) -> bool {
        true
    }

    pub fn can_edit(self) -> bool {
        matches!(self, Self::Owner | Self::Collaborator)
    }

    pub fn is_owner(self) -> bool {
        matches!(self, Self::Owner)
    }

    /// Managing members and share links. There is no delegated admin role,
    /// so this is the owner alone.
    pub fn can_manage_access(self) -> bool {
        self.is_owner()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant '{}'", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Self::Owner),
            "collaborator" => Ok(Self::Collaborator),
            "viewer" => Ok(Self::Viewer),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// How a permission record came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantedVia {
    /// Trip creation or an explicit invite by the owner.
    Direct,
    ShareLink,
}

impl GrantedVia {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::ShareLink => "share_link",
        }
    }
}

impl FromStr for GrantedVia {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "share_link" => Ok(Self::ShareLink),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Share link state embedded in a trip. Only disclosed to members who can
/// manage access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareLink {
    pub slug: String,
    pub code: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub id: String,
    pub title: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub cover_image: Option<String>,
    pub owner_id: UserId,
    pub share_link: Option<ShareLink>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub trip_id: String,
    pub storage_ref: String,
    pub thumbnail_ref: Option<String>,
    pub note: String,
    pub uploaded_by: UserId,
    pub created_at: DateTime<Utc>,
}

impl MediaItem {
    /// Every blob reference this item holds in the storage collaborator.
    pub fn blob_refs(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.storage_ref.as_str()).chain(self.thumbnail_ref.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Moment {
    pub id: String,
    pub trip_id: String,
    pub title: String,
    /// Ordered media item ids, all belonging to `trip_id`.
    pub media_ids: Vec<String>,
    /// Client-defined positioning data; stored and returned untouched.
    pub layout: serde_json::Value,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripPermission {
    pub trip_id: String,
    pub user_id: UserId,
    pub role: Role,
    pub granted_via: GrantedVia,
    pub invited_by: UserId,
    pub invited_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
}

/// A trip as it appears in a member's trip list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripSummary {
    #[serde(flatten)]
    pub trip: Trip,
    pub role: Role,
}

/// Full trip view for a single member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripDetail {
    pub trip: Trip,
    pub role: Role,
    pub media_items: Vec<MediaItem>,
    pub moments: Vec<Moment>,
}
