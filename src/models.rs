//! Persisted entities and their enumerations.
//!
//! Every struct here maps 1:1 onto a row of the table of the same (plural) name,
//! and serializes to the camelCase JSON the API returns.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow};

use crate::geo::Point;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    Citizen,
    Volunteer,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum DisasterType {
    Flood,
    Earthquake,
    Fire,
    Cyclone,
    Tsunami,
    Drought,
    Landslide,
    Other,
}

impl std::fmt::Display for DisasterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Flood => "flood",
            Self::Earthquake => "earthquake",
            Self::Fire => "fire",
            Self::Cyclone => "cyclone",
            Self::Tsunami => "tsunami",
            Self::Drought => "drought",
            Self::Landslide => "landslide",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// Shared by disaster severity, help request urgency and alert priority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum DisasterStatus {
    Pending,
    /// Never left on a disaster after admin action; approval lands on `Active`.
    Verified,
    Active,
    Resolved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RequestType {
    Food,
    Water,
    Shelter,
    Medical,
    Rescue,
    Clothing,
    Other,
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Food => "food",
            Self::Water => "water",
            Self::Shelter => "shelter",
            Self::Medical => "medical",
            Self::Rescue => "rescue",
            Self::Clothing => "clothing",
            Self::Other => "other",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum HelpRequestStatus {
    Pending,
    Verified,
    Matched,
    InProgress,
    Completed,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AlertType {
    Sos,
    Disaster,
    Update,
    #[default]
    General,
}

/// Delivery channel an alert was sent through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    Email,
    Push,
    Sms,
    InApp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum DonationType {
    Money,
    Clothes,
    Medicine,
    Food,
    Other,
}

impl std::fmt::Display for DonationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Money => "money",
            Self::Clothes => "clothes",
            Self::Medicine => "medicine",
            Self::Food => "food",
            Self::Other => "other",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum DonationStatus {
    #[default]
    Pledged,
    Confirmed,
    Delivered,
    Cancelled,
}

impl std::fmt::Display for DonationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pledged => "pledged",
            Self::Confirmed => "confirmed",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EventStatus {
    Active,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FeedbackCategory {
    ResponseTime,
    Helpfulness,
    Communication,
    #[default]
    Overall,
    Service,
    Impact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AnnouncementCategory {
    SafetyGuidelines,
    GovernmentNotice,
    Update,
    #[default]
    General,
}

/// A point plus the free-form address fields stored next to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub longitude: f64,
    pub latitude: f64,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

impl Location {
    pub const fn point(&self) -> Point {
        Point::new(self.longitude, self.latitude)
    }

    /// The most specific human-readable place name, or `fallback`.
    pub fn describe<'a>(&'a self, fallback: &'a str) -> &'a str {
        let named = |s: &'a Option<String>| s.as_deref().filter(|s| !s.is_empty());
        named(&self.city)
            .or_else(|| named(&self.address))
            .unwrap_or(fallback)
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub is_active: bool,
    pub skills: Json<Vec<String>>,
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn location(&self) -> Option<Point> {
        Some(Point::new(self.longitude?, self.latitude?))
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Disaster {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub disaster_type: DisasterType,
    pub severity: Severity,
    #[sqlx(flatten)]
    pub location: Location,
    pub photos: Json<Vec<String>>,
    pub reported_by: String,
    pub status: DisasterStatus,
    pub verified_by: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub affected_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct HelpRequest {
    pub id: String,
    #[serde(rename = "disaster")]
    pub disaster_id: String,
    pub requested_by: String,
    #[serde(rename = "requestType")]
    pub request_types: Json<Vec<RequestType>>,
    pub description: String,
    pub urgency: Severity,
    #[sqlx(flatten)]
    pub location: Location,
    pub status: HelpRequestStatus,
    pub matched_volunteer: Option<String>,
    pub matched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub verified_by: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub quantity: Json<BTreeMap<String, i64>>,
    pub created_at: DateTime<Utc>,
}

impl HelpRequest {
    /// Comma-joined request types, e.g. `food,water`.
    pub fn request_type_list(&self) -> String {
        self.request_types
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub receiver: String,
    #[serde(rename = "helpRequest")]
    pub help_request_id: Option<String>,
    pub content: String,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DonationEvent {
    pub id: String,
    pub title: String,
    pub description: String,
    pub target_amount: f64,
    pub target_items: Json<BTreeMap<String, i64>>,
    pub collected_amount: f64,
    pub collected_items: Json<BTreeMap<String, i64>>,
    pub created_by: String,
    #[serde(rename = "organization")]
    pub organization_id: Option<String>,
    pub status: EventStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DonationEvent {
    /// Every numeric goal is met at once. A zero money target is no goal at all.
    pub fn goals_met(&self) -> bool {
        if self.target_amount > 0.0 && self.collected_amount < self.target_amount {
            return false;
        }

        self.target_items
            .iter()
            .all(|(item, target)| self.collected_items.get(item).copied().unwrap_or(0) >= *target)
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Donation {
    pub id: String,
    pub donor: String,
    pub donation_type: DonationType,
    pub amount: f64,
    pub item_description: Option<String>,
    pub quantity: i64,
    #[serde(rename = "event")]
    pub event_id: Option<String>,
    pub status: DonationStatus,
    pub transaction_id: Option<String>,
    pub delivery_address: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub email: String,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "camelCase")]
#[sqlx(rename_all = "camelCase")]
pub enum FeedbackTargetType {
    Volunteer,
    DonationEvent,
    Organization,
}

#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    pub id: String,
    #[serde(rename = "from")]
    pub from_user: String,
    pub target_type: FeedbackTargetType,
    pub target_id: String,
    #[serde(rename = "helpRequest")]
    pub help_request_id: Option<String>,
    pub rating: i64,
    pub comment: String,
    pub category: FeedbackCategory,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub id: String,
    pub title: String,
    pub content: String,
    pub category: AnnouncementCategory,
    pub created_by: String,
    pub is_published: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(target_amount: f64, targets: &[(&str, i64)]) -> DonationEvent {
        DonationEvent {
            id: "e".to_owned(),
            title: "t".to_owned(),
            description: "d".to_owned(),
            target_amount,
            target_items: Json(targets.iter().map(|(k, v)| ((*k).to_owned(), *v)).collect()),
            collected_amount: 0.0,
            collected_items: Json(BTreeMap::new()),
            created_by: "u".to_owned(),
            organization_id: None,
            status: EventStatus::Active,
            start_date: Utc::now(),
            end_date: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn goals_require_money_and_every_item() {
        let mut ev = event(100.0, &[("blankets", 10)]);
        ev.collected_amount = 100.0;
        assert!(!ev.goals_met());

        drop(ev.collected_items.insert("blankets".to_owned(), 9));
        assert!(!ev.goals_met());

        drop(ev.collected_items.insert("blankets".to_owned(), 10));
        assert!(ev.goals_met());
    }

    #[test]
    fn zero_money_target_is_ignored() {
        let mut ev = event(0.0, &[("water", 2)]);
        assert!(!ev.goals_met());
        drop(ev.collected_items.insert("water".to_owned(), 5));
        assert!(ev.goals_met());
    }

    #[test]
    fn location_prefers_city() {
        let loc = Location {
            longitude: 0.0,
            latitude: 0.0,
            address: Some("1 Main St".to_owned()),
            city: Some("Dhaka".to_owned()),
            state: None,
            country: None,
        };
        assert_eq!(loc.describe("your area"), "Dhaka");

        let loc = Location { city: None, ..loc };
        assert_eq!(loc.describe("your area"), "1 Main St");

        let loc = Location {
            city: Some(String::new()),
            ..loc
        };
        assert_eq!(loc.describe("your area"), "1 Main St");

        let loc = Location {
            address: Some(String::new()),
            ..loc
        };
        assert_eq!(loc.describe("your area"), "your area");
    }

    #[test]
    fn help_request_status_uses_kebab_case() {
        let json = serde_json::to_string(&HelpRequestStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
    }
}
