//! The authorization gate. Every read and write path asks this module for a
//! decision; nothing else interprets roles.
//!
//! Decisions are made against the connection the caller is already using,
//! so a write transaction can check and mutate atomically. Nothing is cached:
//! roles can change between requests.

use anyhow::Result;
use rusqlite::Connection;

use roam_types::models::Role;

use crate::queries;

/// What a caller is trying to do with a trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    View,
    Edit,
    ManageAccess,
    Own,
}

impl Action {
    pub fn permits(self, role: Role) -> bool {
        match self {
            Self::View => role.can_view(),
            Self::Edit => role.can_edit(),
            Self::ManageAccess => role.can_manage_access(),
            Self::Own => role.is_owner(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Granted(Role),
    /// The user holds no permission record on the trip.
    NotMember,
    /// The user is a member, but their role does not cover the action.
    Insufficient(Role),
}

impl Decision {
    pub fn is_granted(self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

pub struct Access<'c> {
    conn: &'c Connection,
}

impl<'c> Access<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn role(&self, trip_id: &str, user_id: &str) -> Result<Option<Role>> {
        queries::get_role(self.conn, trip_id, user_id)
    }

    pub fn check(&self, trip_id: &str, user_id: &str, action: Action) -> Result<Decision> {
        Ok(match self.role(trip_id, user_id)? {
            None => Decision::NotMember,
            Some(role) if action.permits(role) => Decision::Granted(role),
            Some(role) => Decision::Insufficient(role),
        })
    }

    pub fn can_view(&self, trip_id: &str, user_id: &str) -> Result<bool> {
        Ok(self.check(trip_id, user_id, Action::View)?.is_granted())
    }

    pub fn can_edit(&self, trip_id: &str, user_id: &str) -> Result<bool> {
        Ok(self.check(trip_id, user_id, Action::Edit)?.is_granted())
    }

    pub fn is_owner(&self, trip_id: &str, user_id: &str) -> Result<bool> {
        Ok(self.check(trip_id, user_id, Action::Own)?.is_granted())
    }

    pub fn can_manage_access(&self, trip_id: &str, user_id: &str) -> Result<bool> {
        Ok(self.check(trip_id, user_id, Action::ManageAccess)?.is_granted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::tests::{conn, grant, seed_trip};
    use crate::queries::{delete_permission, insert_permission};

    #[test]
    fn predicates_follow_role() {
        let conn = conn();
        seed_trip(&conn, "t1", "alice", 1);
        insert_permission(&conn, &grant("t1", "bob", Role::Collaborator, "alice")).unwrap();
        insert_permission(&conn, &grant("t1", "carol", Role::Viewer, "alice")).unwrap();
        let access = Access::new(&conn);

        assert!(access.is_owner("t1", "alice").unwrap());
        assert!(access.can_edit("t1", "bob").unwrap());
        assert!(!access.is_owner("t1", "bob").unwrap());
        assert!(access.can_view("t1", "carol").unwrap());
        assert!(!access.can_edit("t1", "carol").unwrap());
        assert!(!access.can_view("t1", "mallory").unwrap());
    }

    #[test]
    fn hierarchy_holds_for_every_member() {
        let conn = conn();
        seed_trip(&conn, "t1", "alice", 1);
        insert_permission(&conn, &grant("t1", "bob", Role::Collaborator, "alice")).unwrap();
        insert_permission(&conn, &grant("t1", "carol", Role::Viewer, "alice")).unwrap();
        let access = Access::new(&conn);

        for user in ["alice", "bob", "carol", "mallory"] {
            if access.can_edit("t1", user).unwrap() {
                assert!(access.can_view("t1", user).unwrap());
            }
            if access.is_owner("t1", user).unwrap() {
                assert!(access.can_edit("t1", user).unwrap());
            }
        }
    }

    #[test]
    fn decision_distinguishes_non_members() {
        let conn = conn();
        seed_trip(&conn, "t1", "alice", 1);
        insert_permission(&conn, &grant("t1", "carol", Role::Viewer, "alice")).unwrap();
        let access = Access::new(&conn);

        assert_eq!(access.check("t1", "mallory", Action::View).unwrap(), Decision::NotMember);
        assert_eq!(
            access.check("t1", "carol", Action::Edit).unwrap(),
            Decision::Insufficient(Role::Viewer)
        );
        assert_eq!(
            access.check("t1", "alice", Action::ManageAccess).unwrap(),
            Decision::Granted(Role::Owner)
        );
    }

    #[test]
    fn revocation_is_seen_immediately() {
        let conn = conn();
        seed_trip(&conn, "t1", "alice", 1);
        insert_permission(&conn, &grant("t1", "bob", Role::Collaborator, "alice")).unwrap();
        let access = Access::new(&conn);
        assert!(access.can_edit("t1", "bob").unwrap());

        delete_permission(&conn, "t1", "bob").unwrap();
        assert!(!access.can_view("t1", "bob").unwrap());
    }
}
