use std::{collections::BTreeSet, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    Car,
    Bike,
    Cng,
}

impl VehicleType {
    /// Seats a host can offer, not counting the host.
    pub fn max_seats(self) -> u32 {
        use VehicleType::*;
        match self {
            Car => 3,
            Bike => 1,
            Cng => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        use VehicleType::*;
        match self {
            Car => "car",
            Bike => "bike",
            Cng => "cng",
        }
    }
}

impl FromStr for VehicleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "car" => Ok(VehicleType::Car),
            "bike" => Ok(VehicleType::Bike),
            "cng" => Ok(VehicleType::Cng),
            other => Err(format!("unknown vehicle type {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Female,
    Male,
    Unspecified,
}

impl Gender {
    pub fn as_str(self) -> &'static str {
        match self {
            Gender::Female => "female",
            Gender::Male => "male",
            Gender::Unspecified => "unspecified",
        }
    }
}

impl FromStr for Gender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "female" => Ok(Gender::Female),
            "male" => Ok(Gender::Male),
            "unspecified" => Ok(Gender::Unspecified),
            other => Err(format!("unknown gender {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Open,
    Full,
    Departed,
    Cancelled,
}

impl RideStatus {
    pub fn as_str(self) -> &'static str {
        use RideStatus::*;
        match self {
            Open => "open",
            Full => "full",
            Departed => "departed",
            Cancelled => "cancelled",
        }
    }

    /// Open and full rides still accept membership changes.
    pub fn is_active(self) -> bool {
        matches!(self, RideStatus::Open | RideStatus::Full)
    }

    pub fn can_transition_to(self, next: RideStatus) -> bool {
        use RideStatus::*;
        matches!(
            (self, next),
            (Open, Full) | (Full, Open) | (Open | Full, Departed) | (Open | Full, Cancelled)
        )
    }
}

impl FromStr for RideStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(RideStatus::Open),
            "full" => Ok(RideStatus::Full),
            "departed" => Ok(RideStatus::Departed),
            "cancelled" => Ok(RideStatus::Cancelled),
            other => Err(format!("unknown ride status {other:?}")),
        }
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub gender: Gender,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ride {
    pub id: Uuid,
    pub host_id: Uuid,
    pub vehicle_type: VehicleType,
    pub pickup_name: String,
    pub destination_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub departure_time: OffsetDateTime,
    pub total_fare: f64,
    pub seat_capacity: u32,
    pub members: BTreeSet<Uuid>,
    pub is_female_only: bool,
    pub status: RideStatus,
    pub join_code: String,
    #[serde(skip)]
    pub(crate) version: i64,
}

impl Ride {
    pub fn seats_available(&self) -> u32 {
        self.seat_capacity.saturating_sub(self.members.len() as u32)
    }

    /// Host or current member.
    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.host_id == user_id || self.members.contains(&user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub ride_id: Uuid,
    pub sender_id: Uuid,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
}

impl ChatMessage {
    /// Total order within a ride: `sent_at`, then `id`.
    pub fn order_key(&self) -> (i64, Uuid) {
        (to_millis(self.sent_at), self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOrder {
    #[default]
    Oldest,
    Newest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: Uuid,
    pub ride_id: Uuid,
    pub reviewer_id: Uuid,
    pub reviewee_id: Uuid,
    pub rating: u8,
    pub comment: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

pub(crate) fn to_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_millis(millis: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, sqlx::Error> {
    Uuid::parse_str(s).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

pub(crate) fn parse_column<T: FromStr<Err = String>>(s: &str) -> Result<T, sqlx::Error> {
    s.parse().map_err(|e: String| sqlx::Error::Decode(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions() {
        use RideStatus::*;
        assert!(Open.can_transition_to(Full));
        assert!(Full.can_transition_to(Open));
        assert!(Full.can_transition_to(Departed));
        assert!(Open.can_transition_to(Cancelled));
        assert!(!Departed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Open));
        assert!(!Open.can_transition_to(Open));
    }

    #[test]
    fn millis_keep_ordering() {
        let at = time::macros::datetime!(2025-03-22 15:00:00.123 UTC);
        assert_eq!(from_millis(to_millis(at)), at);
    }

    #[test]
    fn bike_has_one_seat() {
        assert_eq!(VehicleType::Bike.max_seats(), 1);
        assert_eq!("cng".parse::<VehicleType>(), Ok(VehicleType::Cng));
        assert!("truck".parse::<VehicleType>().is_err());
    }
}
