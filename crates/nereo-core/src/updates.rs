//! Speculative updates for the write actions of the admin and kiosk views.
//!
//! Each variant knows which cache entries it touches and how to rewrite them
//! before the server has answered. The values are plain JSON, so the rewrites
//! only touch the fields they own and leave everything else the server sent
//! untouched.

use nereo_proto::{BookingStatus, NewSubscriber, Subscriber, SubscriberAction};
use serde_json::Value;

use crate::{CacheKey, MutationRequest, Scope, scope::keys};

/// A write whose effect is shown before the server confirms it.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeculativeUpdate {
    /// Renew, pause or cancel a membership
    SubscriberStatus {
        /// View scope, selects the list entry
        scope: Scope,
        /// Subscriber to change
        subscriber_id: String,
        /// Requested action
        action: SubscriberAction,
    },

    /// Insert a placeholder for a subscriber being created
    CreateSubscriber {
        /// View scope, selects the list entry
        scope: Scope,
        /// Placeholder record with a `temp-` id
        record: Box<Subscriber>,
    },

    /// Move a booking to another kanban column
    BookingStatus {
        /// View scope, selects the board entry
        scope: Scope,
        /// Booking to move
        booking_id: String,
        /// Target column
        status: BookingStatus,
    },
}

impl SpeculativeUpdate {
    /// Membership action on one subscriber.
    pub fn subscriber_status(
        scope: Scope,
        subscriber_id: impl Into<String>,
        action: SubscriberAction,
    ) -> Self {
        Self::SubscriberStatus { scope, subscriber_id: subscriber_id.into(), action }
    }

    /// Subscriber creation. `temp_id` identifies the placeholder until the
    /// list is refetched.
    pub fn create_subscriber(scope: Scope, request: &NewSubscriber, temp_id: String) -> Self {
        let branch = scope.branch_id.clone().unwrap_or_default();
        let record = request.optimistic(temp_id, &branch);
        Self::CreateSubscriber { scope, record: Box::new(record) }
    }

    /// Kanban move.
    pub fn booking_status(
        scope: Scope,
        booking_id: impl Into<String>,
        status: BookingStatus,
    ) -> Self {
        Self::BookingStatus { scope, booking_id: booking_id.into(), status }
    }

    /// Entity the update targets.
    pub fn target(&self) -> &str {
        match self {
            Self::SubscriberStatus { subscriber_id, .. } => subscriber_id,
            Self::CreateSubscriber { record, .. } => &record.id,
            Self::BookingStatus { booking_id, .. } => booking_id,
        }
    }

    /// Entries the update touches, list first.
    pub fn affected(&self) -> Vec<CacheKey> {
        match self {
            Self::SubscriberStatus { scope, subscriber_id, .. } => vec![
                keys::subscriber_list(&scope.tenant_id, scope.branch_id.as_deref()),
                keys::subscriber(subscriber_id),
            ],
            Self::CreateSubscriber { scope, .. } => {
                vec![keys::subscriber_list(&scope.tenant_id, scope.branch_id.as_deref())]
            },
            Self::BookingStatus { scope, .. } => {
                vec![keys::booking_board(&scope.tenant_id, scope.branch_id.as_deref())]
            },
        }
    }

    /// Message shown if the server rejects the write.
    pub fn failure_notice(&self) -> &'static str {
        match self {
            Self::SubscriberStatus { action, .. } => action.failure_notice(),
            Self::CreateSubscriber { .. } => "could not create the subscriber",
            Self::BookingStatus { .. } => "could not move the booking",
        }
    }

    /// Mutation request for the coordinator.
    pub fn request(&self) -> MutationRequest {
        self.affected()
            .into_iter()
            .fold(MutationRequest::new(self.target(), self.failure_notice()), |req, key| {
                req.affecting(key)
            })
    }

    /// Speculative value for `key`, given its current value.
    ///
    /// `None` leaves the entry as it is. Status changes only rewrite entries
    /// that are cached; creation also seeds a missing list.
    pub fn apply(&self, key: &CacheKey, current: Option<&Value>) -> Option<Value> {
        match self {
            Self::SubscriberStatus { subscriber_id, action, .. } => {
                let status = action.optimistic_status().as_str();
                if *key == keys::subscriber(subscriber_id) {
                    set_field(current?, "status", status)
                } else {
                    set_field_where_id(current?, subscriber_id, "status", status)
                }
            },
            Self::CreateSubscriber { record, .. } => {
                let record = serde_json::to_value(record.as_ref()).ok()?;
                match current {
                    None => Some(Value::Array(vec![record])),
                    Some(Value::Array(list)) => {
                        let mut list = list.clone();
                        list.insert(0, record);
                        Some(Value::Array(list))
                    },
                    Some(_) => None,
                }
            },
            Self::BookingStatus { booking_id, status, .. } => {
                set_field_where_id(current?, booking_id, "status", status.as_str())
            },
        }
    }
}

/// Copy of an object with one string field replaced. `None` for non-objects.
fn set_field(current: &Value, field: &str, value: &str) -> Option<Value> {
    let mut object = current.as_object()?.clone();
    object.insert(field.to_owned(), Value::String(value.to_owned()));
    Some(Value::Object(object))
}

/// Copy of a list with `field` replaced in the element whose `id` is `id`.
/// `None` for non-lists.
fn set_field_where_id(current: &Value, id: &str, field: &str, value: &str) -> Option<Value> {
    let list = current.as_array()?;
    let updated = list
        .iter()
        .map(|item| {
            if item.get("id").and_then(Value::as_str) == Some(id) {
                set_field(item, field, value).unwrap_or_else(|| item.clone())
            } else {
                item.clone()
            }
        })
        .collect();
    Some(Value::Array(updated))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn scope() -> Scope {
        Scope::tenant("t1").with_branch("b1")
    }

    #[test]
    fn pause_touches_list_and_detail() {
        let update = SpeculativeUpdate::subscriber_status(scope(), "s1", SubscriberAction::Pause);
        let [list, detail] = update.affected().try_into().unwrap();
        assert_eq!(list.to_string(), "subscribers/t1/b1");
        assert_eq!(detail.to_string(), "subscriber/s1");

        let rows = json!([{"id": "s0", "status": "active"}, {"id": "s1", "status": "active"}]);
        assert_eq!(
            update.apply(&list, Some(&rows)),
            Some(json!([{"id": "s0", "status": "active"}, {"id": "s1", "status": "paused"}]))
        );
        assert_eq!(
            update.apply(&detail, Some(&json!({"id": "s1", "status": "active", "plate": "X"}))),
            Some(json!({"id": "s1", "status": "paused", "plate": "X"}))
        );
        assert_eq!(update.apply(&detail, None), None);
    }

    #[test]
    fn action_statuses() {
        let detail = keys::subscriber("s1");
        let current = json!({"status": "paused"});
        for (action, status) in [
            (SubscriberAction::Renew, "active"),
            (SubscriberAction::Pause, "paused"),
            (SubscriberAction::Cancel, "expired"),
        ] {
            let update = SpeculativeUpdate::subscriber_status(scope(), "s1", action);
            assert_eq!(update.apply(&detail, Some(&current)), Some(json!({"status": status})));
        }
    }

    #[test]
    fn create_prepends_placeholder() {
        let request = NewSubscriber {
            full_name: "Luis".into(),
            phone: "1".into(),
            plate: "XYZ".into(),
            plan_id: "p-2".into(),
            ..Default::default()
        };
        let update = SpeculativeUpdate::create_subscriber(scope(), &request, "temp-7".into());
        let list = keys::subscriber_list("t1", Some("b1"));
        assert_eq!(update.target(), "temp-7");

        let value = update.apply(&list, Some(&json!([{"id": "s1"}]))).unwrap();
        assert_eq!(value[0]["id"], "temp-7");
        assert_eq!(value[0]["branchId"], "b1");
        assert_eq!(value[1]["id"], "s1");

        let seeded = update.apply(&list, None).unwrap();
        assert_eq!(seeded.as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn booking_move_rewrites_board() {
        let update = SpeculativeUpdate::booking_status(scope(), "bk-2", BookingStatus::Washing);
        let board = keys::booking_board("t1", Some("b1"));
        assert_eq!(update.affected(), vec![board.clone()]);
        assert_eq!(update.failure_notice(), "could not move the booking");

        let rows =
            json!([{"id": "bk-1", "status": "waiting"}, {"id": "bk-2", "status": "waiting"}]);
        assert_eq!(
            update.apply(&board, Some(&rows)),
            Some(json!([{"id": "bk-1", "status": "waiting"}, {"id": "bk-2", "status": "washing"}]))
        );
        assert_eq!(update.apply(&board, None), None);
    }

    #[test]
    fn request_carries_notice_and_keys() {
        let update = SpeculativeUpdate::subscriber_status(scope(), "s1", SubscriberAction::Cancel);
        let request = update.request();
        assert_eq!(request.target, "s1");
        assert_eq!(request.failure_notice, "could not cancel the membership");
        assert_eq!(request.affected, update.affected());
    }
}
