use serde::{Deserialize, Serialize};

use crate::models::{TripDetail, TripPermission, TripSummary, UserId};

/// The parameterized class of a read, used as the subscription unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryShape {
    /// Every trip the user holds a permission on.
    AllTrips,
    /// Trips the user is a member of but does not own.
    SharedTrips,
    TripDetail { trip_id: String },
    TripPermissions { trip_id: String },
}

/// The complete authorized result of a query shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Snapshot {
    Trips(Vec<TripSummary>),
    TripDetail(Box<TripDetail>),
    Permissions(Vec<TripPermission>),
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms the connection is authenticated
    Ready { user_id: UserId },

    /// Current authorized state for a subscription. Always a full snapshot.
    Snapshot {
        subscription_id: String,
        shape: QueryShape,
        snapshot: Snapshot,
    },

    /// The subscriber can no longer see this shape. The subscription is gone.
    Denied {
        subscription_id: String,
        shape: QueryShape,
    },

    /// The subscription failed server-side and was dropped; resubscribe.
    SubscriptionError {
        subscription_id: String,
        shape: QueryShape,
        message: String,
    },

    /// A command could not be processed
    Error { message: String },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Open a subscription. `id` is chosen by the client and echoed back on
    /// every push for it.
    Subscribe { id: String, shape: QueryShape },

    Unsubscribe { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_command_wire_format() {
        let raw = r#"{"type":"Subscribe","data":{"id":"s1","shape":{"kind":"trip_detail","trip_id":"T1"}}}"#;
        let cmd: GatewayCommand = serde_json::from_str(raw).unwrap();
        match cmd {
            GatewayCommand::Subscribe { id, shape } => {
                assert_eq!(id, "s1");
                assert_eq!(
                    shape,
                    QueryShape::TripDetail {
                        trip_id: "T1".into()
                    }
                );
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn denied_event_is_tagged() {
        let event = GatewayEvent::Denied {
            subscription_id: "s1".into(),
            shape: QueryShape::AllTrips,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Denied");
        assert_eq!(json["data"]["shape"]["kind"], "all_trips");
    }
}
