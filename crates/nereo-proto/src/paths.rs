//! REST and SSE paths of the backend API.
//!
//! All paths are relative to the configured base URL and start with
//! [`API_PREFIX`]. Identifiers are inserted verbatim; the backend only issues
//! URL-safe ids.

use crate::{SubscriberAction, Topic};

/// Prefix shared by every backend route.
pub const API_PREFIX: &str = "/api/v1";

/// Push stream for a topic and tenant: `/api/v1/sse/{topic}/{tenant}`.
pub fn sse(topic: Topic, tenant_id: &str) -> String {
    format!("{API_PREFIX}/sse/{topic}/{tenant_id}")
}

/// Subscriber collection (create via `POST`).
pub fn subscribers() -> String {
    format!("{API_PREFIX}/subscribers")
}

/// Subscriber list for a branch (`GET`).
pub fn subscriber_list(branch_id: Option<&str>) -> String {
    format!("{API_PREFIX}/subscribers?branch_id={}", branch_id.unwrap_or_default())
}

/// Membership action on one subscriber (`POST`).
pub fn subscriber_action(subscriber_id: &str, action: SubscriberAction) -> String {
    format!("{API_PREFIX}/subscribers/{subscriber_id}/{}", action.as_str())
}

/// Kanban status of a booking (`PATCH`).
pub fn booking_status(booking_id: &str) -> String {
    format!("{API_PREFIX}/bookings/{booking_id}/status")
}

/// Today's bookings for the kanban board (`GET`).
pub fn bookings_today(tenant_id: &str, branch_id: Option<&str>) -> String {
    format!(
        "{API_PREFIX}/bookings?tenant_id={tenant_id}&branch_id={}&date=today",
        branch_id.unwrap_or_default()
    )
}

/// Dashboard KPIs (`GET`).
pub fn analytics_kpis(branch_id: Option<&str>) -> String {
    format!("{API_PREFIX}/analytics/kpis?branch_id={}", branch_id.unwrap_or_default())
}
