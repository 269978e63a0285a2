//! Domain models the client builds speculative values from.
//!
//! The cache stores raw JSON, so these types are only needed where the client
//! has to produce a value itself (optimistic inserts, status changes) or send a
//! request body. Field names follow the backend's camelCase JSON.

use serde::{Deserialize, Serialize};

/// Membership state of a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    /// Paid up and washing.
    Active,
    /// Lapsed or cancelled.
    Expired,
    /// Awaiting first payment.
    Pending,
    /// Temporarily suspended by the subscriber.
    Paused,
}

impl MembershipStatus {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Pending => "pending",
            Self::Paused => "paused",
        }
    }
}

/// Membership action an admin can trigger on a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriberAction {
    /// Renew the membership.
    Renew,
    /// Pause the membership.
    Pause,
    /// Cancel the membership.
    Cancel,
}

impl SubscriberAction {
    /// Path segment of the action endpoint.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Renew => "renew",
            Self::Pause => "pause",
            Self::Cancel => "cancel",
        }
    }

    /// Status the subscriber is shown in while the request is in flight.
    pub fn optimistic_status(self) -> MembershipStatus {
        match self {
            Self::Renew => MembershipStatus::Active,
            Self::Pause => MembershipStatus::Paused,
            Self::Cancel => MembershipStatus::Expired,
        }
    }

    /// User-facing notice when the server rejects the action.
    pub fn failure_notice(self) -> &'static str {
        match self {
            Self::Renew => "could not renew the membership",
            Self::Pause => "could not pause the membership",
            Self::Cancel => "could not cancel the membership",
        }
    }
}

/// Billing interval of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanInterval {
    /// Billed monthly.
    #[default]
    Monthly,
    /// Billed every three months.
    Quarterly,
    /// Billed yearly.
    Annual,
}

/// Membership plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// Plan id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Price per interval.
    pub price: f64,
    /// Billing interval.
    pub interval: PlanInterval,
    /// Marketing feature list.
    #[serde(default)]
    pub features: Vec<String>,
}

/// Subscriber record as served by `/api/v1/subscribers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    /// Subscriber id. Optimistic records use a `temp-` prefix.
    pub id: String,
    /// Full name.
    pub full_name: String,
    /// Phone number.
    pub phone: String,
    /// Email address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// License plate.
    pub plate: String,
    /// Vehicle model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_model: Option<String>,
    /// Subscribed plan.
    pub plan: Plan,
    /// Membership state.
    pub status: MembershipStatus,
    /// Next renewal (RFC 3339). Unknown for optimistic records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewal_date: Option<String>,
    /// Last wash (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_wash_date: Option<String>,
    /// Creation time (RFC 3339). Unknown for optimistic records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Branch the subscriber belongs to.
    pub branch_id: String,
}

/// Request body for creating a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubscriber {
    /// Full name.
    pub full_name: String,
    /// Phone number.
    pub phone: String,
    /// Email address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// License plate.
    pub plate: String,
    /// Vehicle model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_model: Option<String>,
    /// Plan to subscribe to.
    pub plan_id: String,
}

impl NewSubscriber {
    /// Placeholder record shown in the list until the server answers.
    ///
    /// Plan details are unknown client-side, so the plan carries only its id.
    pub fn optimistic(&self, temp_id: String, branch_id: &str) -> Subscriber {
        Subscriber {
            id: temp_id,
            full_name: self.full_name.clone(),
            phone: self.phone.clone(),
            email: self.email.clone(),
            plate: self.plate.clone(),
            vehicle_model: self.vehicle_model.clone(),
            plan: Plan {
                id: self.plan_id.clone(),
                name: "...".to_owned(),
                price: 0.0,
                interval: PlanInterval::Monthly,
                features: Vec::new(),
            },
            status: MembershipStatus::Active,
            renewal_date: None,
            last_wash_date: None,
            created_at: None,
            branch_id: branch_id.to_owned(),
        }
    }
}

/// Kanban column of a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    /// Checked in, waiting for a bay.
    Waiting,
    /// In the wash bay.
    Washing,
    /// Ready for pickup.
    Ready,
}

impl BookingStatus {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Washing => "washing",
            Self::Ready => "ready",
        }
    }
}

/// Request body for `PATCH /api/v1/bookings/{id}/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingStatusUpdate {
    /// Target column.
    pub status: BookingStatus,
}

/// Error body returned with non-2xx responses.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Server-provided explanation.
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn subscriber_actions_map_to_statuses() {
        assert_eq!(SubscriberAction::Renew.optimistic_status(), MembershipStatus::Active);
        assert_eq!(SubscriberAction::Pause.optimistic_status(), MembershipStatus::Paused);
        assert_eq!(SubscriberAction::Cancel.optimistic_status(), MembershipStatus::Expired);
    }

    #[test]
    fn subscriber_uses_camel_case() {
        let value = json!({
            "id": "s-1",
            "fullName": "Ana Gómez",
            "phone": "555",
            "plate": "AB123CD",
            "plan": {"id": "p-1", "name": "Gold", "price": 30.0, "interval": "monthly"},
            "status": "active",
            "renewalDate": "2024-06-01T00:00:00Z",
            "createdAt": "2024-05-01T00:00:00Z",
            "branchId": "b-1"
        });

        let subscriber: Subscriber = serde_json::from_value(value).unwrap();
        assert_eq!(subscriber.full_name, "Ana Gómez");
        assert_eq!(subscriber.status, MembershipStatus::Active);
        assert!(subscriber.plan.features.is_empty());
    }

    #[test]
    fn optimistic_subscriber_is_active_in_branch() {
        let request = NewSubscriber {
            full_name: "Luis".into(),
            phone: "1".into(),
            plate: "XYZ".into(),
            plan_id: "p-2".into(),
            ..Default::default()
        };

        let record = request.optimistic("temp-1".into(), "b-3");
        assert_eq!(record.id, "temp-1");
        assert_eq!(record.status, MembershipStatus::Active);
        assert_eq!(record.branch_id, "b-3");
        assert_eq!(record.plan.id, "p-2");

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "active");
        assert!(value.get("renewalDate").is_none());
    }

    #[test]
    fn booking_status_body() {
        let body = serde_json::to_string(&BookingStatusUpdate { status: BookingStatus::Washing })
            .unwrap();
        assert_eq!(body, r#"{"status":"washing"}"#);
    }

    #[test]
    fn error_body_message_is_optional() {
        let body: ErrorBody = serde_json::from_str("{}").unwrap();
        assert_eq!(body.message, None);
        let body: ErrorBody = serde_json::from_str(r#"{"message":"nope"}"#).unwrap();
        assert_eq!(body.message.as_deref(), Some("nope"));
    }
}
