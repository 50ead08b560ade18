//! Authorized read models. Each function answers a query shape as a given
//! user sees it, or `None` when the user may not see it at all. Used both
//! for one-shot queries and for subscription snapshots.

use anyhow::Result;
use rusqlite::Connection;

use roam_types::events::{QueryShape, Snapshot};
use roam_types::models::{Role, Trip, TripDetail, TripPermission, TripSummary};

use crate::access::{Access, Action, Decision};
use crate::queries;

/// Share link details are only visible to members who can manage access.
pub fn redact(mut trip: Trip, role: Role) -> Trip {
    if !role.can_manage_access() {
        trip.share_link = None;
    }
    trip
}

pub fn trip_list(conn: &Connection, user_id: &str) -> Result<Vec<TripSummary>> {
    Ok(queries::trips_for_user(conn, user_id)?
        .into_iter()
        .map(|(trip, role)| TripSummary {
            trip: redact(trip, role),
            role,
        })
        .collect())
}

pub fn shared_trip_list(conn: &Connection, user_id: &str) -> Result<Vec<TripSummary>> {
    Ok(trip_list(conn, user_id)?
        .into_iter()
        .filter(|summary| !summary.role.is_owner())
        .collect())
}

/// `None` covers both a missing trip and one the user cannot view.
pub fn trip_detail(conn: &Connection, trip_id: &str, user_id: &str) -> Result<Option<TripDetail>> {
    let role = match Access::new(conn).check(trip_id, user_id, Action::View)? {
        Decision::Granted(role) => role,
        _ => return Ok(None),
    };
    let Some(trip) = queries::get_trip(conn, trip_id)? else {
        return Ok(None);
    };

    Ok(Some(TripDetail {
        trip: redact(trip, role),
        role,
        media_items: queries::media_for_trip(conn, trip_id)?,
        moments: queries::moments_for_trip(conn, trip_id)?,
    }))
}

pub fn trip_permissions(
    conn: &Connection,
    trip_id: &str,
    user_id: &str,
) -> Result<Option<Vec<TripPermission>>> {
    if !Access::new(conn).can_view(trip_id, user_id)? {
        return Ok(None);
    }
    Ok(Some(queries::permissions_for_trip(conn, trip_id)?))
}

/// Resolve a subscription shape for `user_id`. `None` means denied.
pub fn snapshot(conn: &Connection, user_id: &str, shape: &QueryShape) -> Result<Option<Snapshot>> {
    Ok(match shape {
        QueryShape::AllTrips => Some(Snapshot::Trips(trip_list(conn, user_id)?)),
        QueryShape::SharedTrips => Some(Snapshot::Trips(shared_trip_list(conn, user_id)?)),
        QueryShape::TripDetail { trip_id } => {
            trip_detail(conn, trip_id, user_id)?.map(|d| Snapshot::TripDetail(Box::new(d)))
        }
        QueryShape::TripPermissions { trip_id } => {
            trip_permissions(conn, trip_id, user_id)?.map(Snapshot::Permissions)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::tests::{conn, grant, seed_trip};
    use crate::queries::{get_trip, insert_permission, update_trip};
    use roam_types::models::ShareLink;

    #[test]
    fn detail_hides_unknown_and_unauthorized_alike() {
        let conn = conn();
        seed_trip(&conn, "t1", "alice", 1);

        assert!(trip_detail(&conn, "t1", "mallory").unwrap().is_none());
        assert!(trip_detail(&conn, "nope", "mallory").unwrap().is_none());
        let detail = trip_detail(&conn, "t1", "alice").unwrap().unwrap();
        assert_eq!(detail.role, Role::Owner);
    }

    #[test]
    fn share_link_only_visible_to_owner() {
        let conn = conn();
        seed_trip(&conn, "t1", "alice", 1);
        insert_permission(&conn, &grant("t1", "bob", Role::Collaborator, "alice")).unwrap();
        let mut trip = get_trip(&conn, "t1").unwrap().unwrap();
        trip.share_link = Some(ShareLink {
            slug: "abc".into(),
            code: Some("123456".into()),
            enabled: true,
        });
        update_trip(&conn, &trip).unwrap();

        let owner_view = trip_detail(&conn, "t1", "alice").unwrap().unwrap();
        assert!(owner_view.trip.share_link.is_some());
        let member_view = trip_detail(&conn, "t1", "bob").unwrap().unwrap();
        assert!(member_view.trip.share_link.is_none());
    }

    #[test]
    fn shared_list_excludes_owned_trips() {
        let conn = conn();
        seed_trip(&conn, "mine", "alice", 1);
        seed_trip(&conn, "theirs", "bob", 2);
        insert_permission(&conn, &grant("theirs", "alice", Role::Viewer, "bob")).unwrap();

        let all = trip_list(&conn, "alice").unwrap();
        assert_eq!(all.len(), 2);
        let shared = shared_trip_list(&conn, "alice").unwrap();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].trip.id, "theirs");
        assert_eq!(shared[0].role, Role::Viewer);
    }

    #[test]
    fn permission_snapshot_denied_for_outsiders() {
        let conn = conn();
        seed_trip(&conn, "t1", "alice", 1);
        let shape = QueryShape::TripPermissions { trip_id: "t1".into() };

        assert!(snapshot(&conn, "mallory", &shape).unwrap().is_none());
        match snapshot(&conn, "alice", &shape).unwrap() {
            Some(Snapshot::Permissions(perms)) => assert_eq!(perms.len(), 1),
            other => panic!("unexpected snapshot: {other:?}"),
        }
    }

    #[test]
    fn list_snapshot_is_never_denied() {
        let conn = conn();
        assert_eq!(
            snapshot(&conn, "nobody", &QueryShape::AllTrips).unwrap(),
            Some(Snapshot::Trips(vec![]))
        );
    }
}
