use std::time::Duration;

use rand::seq::IndexedRandom;
use serde::Deserialize;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use time::OffsetDateTime;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    error::{is_unique_violation, RideError, RideResult},
    model::{
        from_millis, parse_column, parse_uuid, to_millis, Gender, Ride, RideStatus, VehicleType,
    },
    users::UserDirectory,
};

const RIDE_COLUMNS: &str = "r.id,r.host_id,r.vehicle_type,r.pickup_name,r.destination_name,\
    r.departure_time,r.total_fare,r.seat_capacity,r.is_female_only,r.status,r.join_code,r.version";

const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const JOIN_CODE_LEN: usize = 6;
const JOIN_CODE_ATTEMPTS: usize = 8;

type RideRow = (String, String, String, String, String, i64, f64, i64, bool, String, String, i64);

#[derive(Debug, Clone, Deserialize)]
pub struct RideSpec {
    pub host_id: Uuid,
    pub vehicle_type: VehicleType,
    pub pickup_name: String,
    pub destination_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub departure_time: OffsetDateTime,
    pub total_fare: f64,
    /// Defaults to everything the vehicle can carry.
    #[serde(default)]
    pub seat_capacity: Option<u32>,
    #[serde(default)]
    pub is_female_only: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RideFilter {
    pub vehicle_type: Option<VehicleType>,
    /// Matched against pickup, destination and host name.
    pub q: Option<String>,
    /// Only honored when the viewer is female. This is a listing policy;
    /// eligibility itself is enforced on join.
    pub female_only: Option<bool>,
    pub viewer_id: Option<Uuid>,
    /// Active rides when absent.
    pub status: Option<RideStatus>,
}

/// Owns ride records and their lifecycle.
#[derive(Clone)]
pub struct Registry {
    db_pool: SqlitePool,
    clock: Clock,
    users: UserDirectory,
}

impl Registry {
    pub fn new(db_pool: SqlitePool, clock: Clock, users: UserDirectory) -> Self {
        Self { db_pool, clock, users }
    }

    pub(crate) fn db_pool(&self) -> &SqlitePool {
        &self.db_pool
    }

    pub(crate) fn users(&self) -> &UserDirectory {
        &self.users
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    pub async fn create(&self, spec: RideSpec) -> RideResult<Ride> {
        let now = self.now();
        let seat_capacity = validate(&spec, now)?;

        let host = self.users.get(spec.host_id).await?;
        if spec.is_female_only && host.gender != Gender::Female {
            return Err(RideError::validation("only female hosts can offer female-only rides"));
        }

        let id = Uuid::now_v7();
        let mut attempts = 0;
        let join_code = loop {
            attempts += 1;
            let join_code = new_join_code();
            let inserted = sqlx::query(
                "INSERT INTO rides (id,host_id,vehicle_type,pickup_name,destination_name,
                    departure_time,total_fare,seat_capacity,is_female_only,status,join_code,
                    version,created_at)
                 VALUES (?,?,?,?,?,?,?,?,?,?,?,0,?)",
            )
            .bind(id.to_string())
            .bind(spec.host_id.to_string())
            .bind(spec.vehicle_type.as_str())
            .bind(spec.pickup_name.trim())
            .bind(spec.destination_name.trim())
            .bind(to_millis(spec.departure_time))
            .bind(spec.total_fare)
            .bind(seat_capacity as i64)
            .bind(spec.is_female_only)
            .bind(RideStatus::Open.as_str())
            .bind(&join_code)
            .bind(to_millis(now))
            .execute(&self.db_pool)
            .await;

            match inserted {
                Ok(_) => break join_code,
                Err(err) if is_unique_violation(&err) && attempts < JOIN_CODE_ATTEMPTS => {
                    debug!(%join_code, "join code taken, drawing another");
                }
                Err(err) => return Err(err.into()),
            }
        };

        info!(ride_id = %id, host_id = %spec.host_id, %join_code, "ride created");
        self.get(id).await
    }

    /// Loads a ride. A ride whose departure time has passed is reported,
    /// and recorded, as departed.
    pub async fn get(&self, id: Uuid) -> RideResult<Ride> {
        loop {
            let mut ride = self.load(id).await?;
            if !ride.status.is_active() || ride.departure_time > self.now() {
                return Ok(ride);
            }

            let done = sqlx::query(
                "UPDATE rides SET status=?, version=version+1 WHERE id=? AND version=?",
            )
            .bind(RideStatus::Departed.as_str())
            .bind(id.to_string())
            .bind(ride.version)
            .execute(&self.db_pool)
            .await?;
            if done.rows_affected() == 1 {
                info!(ride_id = %id, "ride departed");
                ride.status = RideStatus::Departed;
                ride.version += 1;
                return Ok(ride);
            }
        }
    }

    async fn load(&self, id: Uuid) -> RideResult<Ride> {
        let sql = format!("SELECT {RIDE_COLUMNS} FROM rides r WHERE r.id=?");
        let row: Option<RideRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.db_pool)
            .await?;

        match row {
            Some(row) => self.hydrate(row).await,
            None => Err(RideError::NotFound("ride")),
        }
    }

    pub async fn list(&self, filter: &RideFilter) -> RideResult<Vec<Ride>> {
        self.sweep_departed().await?;

        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {RIDE_COLUMNS} FROM rides r JOIN users h ON h.id=r.host_id WHERE 1=1"
        ));

        match filter.status {
            Some(status) => {
                query.push(" AND r.status=").push_bind(status.as_str());
            }
            None => {
                query.push(" AND r.status IN ('open','full')");
            }
        }

        if let Some(vehicle_type) = filter.vehicle_type {
            query.push(" AND r.vehicle_type=").push_bind(vehicle_type.as_str());
        }

        if let Some(q) = filter.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            let pattern = format!("%{}%", escape_like(q));
            query
                .push(" AND (r.pickup_name LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR r.destination_name LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR (h.first_name || ' ' || h.last_name) LIKE ")
                .push_bind(pattern)
                .push(" ESCAPE '\\')");
        }

        if filter.female_only == Some(true) && self.viewer_is_female(filter.viewer_id).await? {
            query.push(" AND r.is_female_only=1");
        }

        query.push(" ORDER BY r.departure_time ASC, r.id ASC");

        let rows: Vec<RideRow> = query.build_query_as().fetch_all(&self.db_pool).await?;
        let mut rides = Vec::with_capacity(rows.len());
        for row in rows {
            rides.push(self.hydrate(row).await?);
        }
        Ok(rides)
    }

    /// Moves a ride along its lifecycle. Cancelling also drops every
    /// membership.
    pub async fn update_status(&self, id: Uuid, next: RideStatus) -> RideResult<Ride> {
        let ride = self.get(id).await?;
        if !ride.status.can_transition_to(next) {
            return Err(RideError::validation(format!(
                "cannot move ride from {} to {next}",
                ride.status
            )));
        }

        let seats_left = ride.seats_available();
        if (next == RideStatus::Full && seats_left > 0)
            || (next == RideStatus::Open && seats_left == 0)
        {
            return Err(RideError::validation(format!(
                "ride has {seats_left} seats left, cannot be {next}"
            )));
        }

        let mut tx = self.db_pool.begin().await?;
        let done = sqlx::query(
            "UPDATE rides SET status=?, version=version+1 WHERE id=? AND version=?",
        )
        .bind(next.as_str())
        .bind(id.to_string())
        .bind(ride.version)
        .execute(&mut *tx)
        .await?;
        if done.rows_affected() == 0 {
            return Err(RideError::Conflict);
        }

        if next == RideStatus::Cancelled {
            sqlx::query("DELETE FROM ride_members WHERE ride_id=?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!(ride_id = %id, from = %ride.status, to = %next, "ride status changed");
        self.get(id).await
    }

    /// Marks every active ride whose departure time has elapsed as departed.
    pub async fn sweep_departed(&self) -> RideResult<u64> {
        let done = sqlx::query(
            "UPDATE rides SET status=?, version=version+1
             WHERE status IN ('open','full') AND departure_time<=?",
        )
        .bind(RideStatus::Departed.as_str())
        .bind(to_millis(self.now()))
        .execute(&self.db_pool)
        .await?;

        let departed = done.rows_affected();
        if departed > 0 {
            info!(departed, "rides departed");
        }
        Ok(departed)
    }

    /// Finds the ride a join code points at, preferring an active ride over
    /// older ones that once used the same code.
    pub async fn resolve_code(&self, code: &str) -> RideResult<Uuid> {
        let code = code.trim().to_ascii_uppercase();
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM rides WHERE join_code=?
             ORDER BY (status IN ('open','full')) DESC, created_at DESC LIMIT 1",
        )
        .bind(&code)
        .fetch_optional(&self.db_pool)
        .await?;

        match row {
            Some((id,)) => Ok(parse_uuid(&id)?),
            None => Err(RideError::NotFound("join code")),
        }
    }

    async fn viewer_is_female(&self, viewer_id: Option<Uuid>) -> RideResult<bool> {
        let Some(viewer_id) = viewer_id else {
            return Ok(false);
        };
        match self.users.find(viewer_id).await? {
            Some(viewer) => Ok(viewer.gender == Gender::Female),
            None => {
                warn!(%viewer_id, "unknown viewer asked for female-only rides");
                Ok(false)
            }
        }
    }

    async fn hydrate(&self, row: RideRow) -> RideResult<Ride> {
        let (
            id,
            host_id,
            vehicle_type,
            pickup_name,
            destination_name,
            departure_time,
            total_fare,
            seat_capacity,
            is_female_only,
            status,
            join_code,
            version,
        ) = row;

        let members: Vec<(String,)> =
            sqlx::query_as("SELECT user_id FROM ride_members WHERE ride_id=?")
                .bind(&id)
                .fetch_all(&self.db_pool)
                .await?;

        Ok(Ride {
            id: parse_uuid(&id)?,
            host_id: parse_uuid(&host_id)?,
            vehicle_type: parse_column(&vehicle_type)?,
            pickup_name,
            destination_name,
            departure_time: from_millis(departure_time),
            total_fare,
            seat_capacity: seat_capacity as u32,
            members: members
                .iter()
                .map(|(user_id,)| parse_uuid(user_id))
                .collect::<Result<_, _>>()?,
            is_female_only,
            status: parse_column(&status)?,
            join_code,
            version,
        })
    }
}

/// Periodically departs rides whose time has come.
pub fn spawn_sweeper(registry: Registry, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = registry.sweep_departed().await {
                warn!(error = %err, "departure sweep failed");
            }
        }
    })
}

fn validate(spec: &RideSpec, now: OffsetDateTime) -> RideResult<u32> {
    if spec.pickup_name.trim().is_empty() || spec.destination_name.trim().is_empty() {
        return Err(RideError::validation("pickup and destination are required"));
    }
    if !spec.total_fare.is_finite() || spec.total_fare < 0.0 {
        return Err(RideError::validation("total_fare must be a non-negative number"));
    }
    // Compared at storage precision, or a ride could be created already gone.
    if to_millis(spec.departure_time) <= to_millis(now) {
        return Err(RideError::validation("departure_time must be in the future"));
    }

    let max_seats = spec.vehicle_type.max_seats();
    let seat_capacity = spec.seat_capacity.unwrap_or(max_seats);
    if seat_capacity == 0 || seat_capacity > max_seats {
        return Err(RideError::validation(format!(
            "a {} offers between 1 and {max_seats} seats",
            spec.vehicle_type.as_str()
        )));
    }
    Ok(seat_capacity)
}

fn new_join_code() -> String {
    let mut rng = rand::rng();
    (0..JOIN_CODE_LEN)
        .filter_map(|_| CODE_ALPHABET.choose(&mut rng))
        .map(|&b| b as char)
        .collect()
}

fn escape_like(q: &str) -> String {
    let mut escaped = String::with_capacity(q.len());
    for c in q.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    #[tokio::test]
    async fn create_defaults_capacity_from_vehicle() {
        let fx = Fixture::new().await;
        let host = fx.user("Ayesha", Gender::Female).await;

        let ride = fx.registry.create(fx.spec(host.id, VehicleType::Car)).await.unwrap();
        assert_eq!(ride.seat_capacity, 3);
        assert_eq!(ride.status, RideStatus::Open);
        assert!(ride.members.is_empty());
        assert_eq!(ride.join_code.len(), JOIN_CODE_LEN);
        assert_eq!(fx.registry.get(ride.id).await.unwrap(), ride);
    }

    #[tokio::test]
    async fn create_rejects_past_departure_and_bad_capacity() {
        let fx = Fixture::new().await;
        let host = fx.user("Ayesha", Gender::Female).await;

        let mut spec = fx.spec(host.id, VehicleType::Car);
        spec.departure_time = fx.registry.now();
        assert!(matches!(fx.registry.create(spec).await, Err(RideError::Validation(_))));

        let mut spec = fx.spec(host.id, VehicleType::Bike);
        spec.seat_capacity = Some(2);
        assert!(matches!(fx.registry.create(spec).await, Err(RideError::Validation(_))));

        let mut spec = fx.spec(host.id, VehicleType::Car);
        spec.seat_capacity = Some(0);
        assert!(matches!(fx.registry.create(spec).await, Err(RideError::Validation(_))));

        let mut spec = fx.spec(host.id, VehicleType::Car);
        spec.total_fare = -1.0;
        assert!(matches!(fx.registry.create(spec).await, Err(RideError::Validation(_))));
    }

    #[tokio::test]
    async fn departure_within_the_current_millisecond_is_not_future() {
        let fx = Fixture::new().await;
        let host = fx.user("Ayesha", Gender::Female).await;

        let mut spec = fx.spec(host.id, VehicleType::Car);
        spec.departure_time = fx.registry.now() + time::Duration::microseconds(500);
        assert!(matches!(fx.registry.create(spec).await, Err(RideError::Validation(_))));

        let mut spec = fx.spec(host.id, VehicleType::Car);
        spec.departure_time = fx.registry.now() + time::Duration::milliseconds(1);
        let ride = fx.registry.create(spec).await.unwrap();
        assert_eq!(ride.status, RideStatus::Open);
    }

    #[tokio::test]
    async fn only_female_hosts_offer_female_only_rides() {
        let fx = Fixture::new().await;
        let host = fx.user("Rafi", Gender::Male).await;

        let mut spec = fx.spec(host.id, VehicleType::Cng);
        spec.is_female_only = true;
        assert!(matches!(fx.registry.create(spec).await, Err(RideError::Validation(_))));
    }

    #[tokio::test]
    async fn unknown_ride_is_not_found() {
        let fx = Fixture::new().await;
        assert!(matches!(fx.registry.get(Uuid::now_v7()).await, Err(RideError::NotFound("ride"))));
    }

    #[tokio::test]
    async fn list_filters_by_vehicle_and_text() {
        let fx = Fixture::new().await;
        let ayesha = fx.user("Ayesha", Gender::Female).await;
        let rafi = fx.user("Rafi", Gender::Male).await;

        let mut spec = fx.spec(ayesha.id, VehicleType::Car);
        spec.destination_name = "Banani".to_owned();
        let car = fx.registry.create(spec).await.unwrap();

        let mut spec = fx.spec(rafi.id, VehicleType::Bike);
        spec.destination_name = "Dhanmondi".to_owned();
        let bike = fx.registry.create(spec).await.unwrap();

        let all = fx.registry.list(&RideFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let bikes = fx
            .registry
            .list(&RideFilter { vehicle_type: Some(VehicleType::Bike), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(bikes.iter().map(|r| r.id).collect::<Vec<_>>(), vec![bike.id]);

        let banani = fx
            .registry
            .list(&RideFilter { q: Some("banani".to_owned()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(banani.iter().map(|r| r.id).collect::<Vec<_>>(), vec![car.id]);

        let by_host = fx
            .registry
            .list(&RideFilter { q: Some("Rafi".to_owned()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(by_host.iter().map(|r| r.id).collect::<Vec<_>>(), vec![bike.id]);

        let literal = fx
            .registry
            .list(&RideFilter { q: Some("%".to_owned()), ..Default::default() })
            .await
            .unwrap();
        assert!(literal.is_empty());
    }

    #[tokio::test]
    async fn female_only_filter_needs_a_female_viewer() {
        let fx = Fixture::new().await;
        let ayesha = fx.user("Ayesha", Gender::Female).await;
        let rafi = fx.user("Rafi", Gender::Male).await;

        let mut spec = fx.spec(ayesha.id, VehicleType::Cng);
        spec.is_female_only = true;
        let restricted = fx.registry.create(spec).await.unwrap();
        fx.registry.create(fx.spec(rafi.id, VehicleType::Car)).await.unwrap();

        let as_ayesha = fx
            .registry
            .list(&RideFilter {
                female_only: Some(true),
                viewer_id: Some(ayesha.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(as_ayesha.iter().map(|r| r.id).collect::<Vec<_>>(), vec![restricted.id]);

        let as_rafi = fx
            .registry
            .list(&RideFilter {
                female_only: Some(true),
                viewer_id: Some(rafi.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(as_rafi.len(), 2);
    }

    #[tokio::test]
    async fn elapsed_rides_depart() {
        let fx = Fixture::new().await;
        let host = fx.user("Ayesha", Gender::Female).await;
        let ride = fx.registry.create(fx.spec(host.id, VehicleType::Car)).await.unwrap();

        fx.advance(time::Duration::hours(4));
        assert_eq!(fx.registry.get(ride.id).await.unwrap().status, RideStatus::Departed);
        assert!(fx.registry.list(&RideFilter::default()).await.unwrap().is_empty());

        let departed = fx
            .registry
            .list(&RideFilter { status: Some(RideStatus::Departed), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(departed.len(), 1);
    }

    #[tokio::test]
    async fn sweep_counts_departures() {
        let fx = Fixture::new().await;
        let host = fx.user("Ayesha", Gender::Female).await;
        fx.registry.create(fx.spec(host.id, VehicleType::Car)).await.unwrap();
        fx.registry.create(fx.spec(host.id, VehicleType::Bike)).await.unwrap();

        assert_eq!(fx.registry.sweep_departed().await.unwrap(), 0);
        fx.advance(time::Duration::hours(4));
        assert_eq!(fx.registry.sweep_departed().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn update_status_follows_lifecycle() {
        let fx = Fixture::new().await;
        let host = fx.user("Ayesha", Gender::Female).await;
        let ride = fx.registry.create(fx.spec(host.id, VehicleType::Car)).await.unwrap();

        assert!(matches!(
            fx.registry.update_status(ride.id, RideStatus::Full).await,
            Err(RideError::Validation(_))
        ));

        let departed = fx.registry.update_status(ride.id, RideStatus::Departed).await.unwrap();
        assert_eq!(departed.status, RideStatus::Departed);

        assert!(matches!(
            fx.registry.update_status(ride.id, RideStatus::Cancelled).await,
            Err(RideError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn join_code_resolves_case_insensitively() {
        let fx = Fixture::new().await;
        let host = fx.user("Ayesha", Gender::Female).await;
        let ride = fx.registry.create(fx.spec(host.id, VehicleType::Car)).await.unwrap();

        let code = ride.join_code.to_ascii_lowercase();
        assert_eq!(fx.registry.resolve_code(&code).await.unwrap(), ride.id);
        assert!(matches!(
            fx.registry.resolve_code("NOPE00").await,
            Err(RideError::NotFound("join code"))
        ));
    }

    #[test]
    fn join_codes_use_unambiguous_alphabet() {
        let code = new_join_code();
        assert_eq!(code.len(), JOIN_CODE_LEN);
        assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
        assert!(!code.contains('0') && !code.contains('O'));
    }
}
