use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{StoreResult, TripStore};
use crate::error::StoreError;
use crate::models::{
    Invitation, InvitationStatus, MemberRole, NewTrip, Trip, TripMember, TripStatus, TripUpdate,
    UserSummary,
};

const MEMBERSHIP_ACTIVE: &str = "ACTIVE";
const MEMBERSHIP_INACTIVE: &str = "INACTIVE";

const TRIP_COLUMNS: &str = "id, name, description, destination, start_date, end_date, status, \
                            created_by, created_at, updated_at";
const INVITATION_COLUMNS: &str = "id, trip_id, inviter_id, invitee_email, invitee_id, role, \
                                  status, expires_at, created_at, updated_at";

/// Postgres-backed `TripStore` over the `trips`, `trip_memberships`,
/// `trip_invitations` and `users` tables.
#[derive(Clone)]
pub struct PgTripStore {
    pool: PgPool,
}

/// Identifiers are opaque to callers; a value that is not a UUID cannot
/// name a row.
fn parse_id(id: &str, entity: &'static str) -> StoreResult<Uuid> {
    Uuid::parse_str(id).map_err(|_| StoreError::NotFound(entity))
}

fn corrupt(column: &str, value: &str) -> StoreError {
    StoreError::Database(format!("unexpected {column} value {value:?}"))
}

fn trip_from_row(row: &PgRow) -> StoreResult<Trip> {
    let status: String = row.try_get("status")?;
    let id: Uuid = row.try_get("id")?;
    let created_by: Uuid = row.try_get("created_by")?;
    Ok(Trip {
        id: id.to_string(),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        destination: row.try_get("destination")?,
        start_date: row.try_get::<Option<NaiveDate>, _>("start_date")?,
        end_date: row.try_get::<Option<NaiveDate>, _>("end_date")?,
        status: TripStatus::from_db(&status).ok_or_else(|| corrupt("status", &status))?,
        created_by: created_by.to_string(),
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn member_from_row(row: &PgRow) -> StoreResult<TripMember> {
    let role: String = row.try_get("role")?;
    let trip_id: Uuid = row.try_get("trip_id")?;
    let user_id: Uuid = row.try_get("user_id")?;
    Ok(TripMember {
        trip_id: trip_id.to_string(),
        user_id: user_id.to_string(),
        role: MemberRole::from_db(&role).ok_or_else(|| corrupt("role", &role))?,
        joined_at: row.try_get("created_at")?,
    })
}

fn invitation_from_row(row: &PgRow) -> StoreResult<Invitation> {
    let role: String = row.try_get("role")?;
    let status: String = row.try_get("status")?;
    let id: Uuid = row.try_get("id")?;
    let trip_id: Uuid = row.try_get("trip_id")?;
    let inviter_id: Uuid = row.try_get("inviter_id")?;
    let invitee_id: Option<Uuid> = row.try_get("invitee_id")?;
    Ok(Invitation {
        id: id.to_string(),
        trip_id: trip_id.to_string(),
        inviter_id: inviter_id.to_string(),
        invitee_email: row.try_get("invitee_email")?,
        invitee_id: invitee_id.map(|id| id.to_string()),
        role: MemberRole::from_db(&role).ok_or_else(|| corrupt("role", &role))?,
        status: InvitationStatus::from_db(&status).ok_or_else(|| corrupt("status", &status))?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl PgTripStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ensure_live_trip(&self, trip_id: Uuid) -> StoreResult<()> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM trips WHERE id = $1 AND deleted_at IS NULL)",
        )
        .bind(trip_id)
        .fetch_one(&self.pool)
        .await?;
        if exists {
            Ok(())
        } else {
            Err(StoreError::NotFound("trip"))
        }
    }
}

#[async_trait]
impl TripStore for PgTripStore {
    async fn get_user_role(&self, trip_id: &str, user_id: &str) -> StoreResult<MemberRole> {
        let trip_id = parse_id(trip_id, "trip")?;
        let user_id = parse_id(user_id, "member")?;

        let role: Option<String> = sqlx::query_scalar(
            r#"
            SELECT m.role
            FROM trip_memberships m
            JOIN trips t ON t.id = m.trip_id AND t.deleted_at IS NULL
            WHERE m.trip_id = $1 AND m.user_id = $2 AND m.status = $3
            "#,
        )
        .bind(trip_id)
        .bind(user_id)
        .bind(MEMBERSHIP_ACTIVE)
        .fetch_optional(&self.pool)
        .await?;

        let role = role.ok_or(StoreError::NotFound("member"))?;
        MemberRole::from_db(&role).ok_or_else(|| corrupt("role", &role))
    }

    async fn get_trip(&self, trip_id: &str) -> StoreResult<Trip> {
        let trip_id = parse_id(trip_id, "trip")?;
        let row = sqlx::query(&format!(
            "SELECT {TRIP_COLUMNS} FROM trips WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(trip_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("trip"))?;
        trip_from_row(&row)
    }

    async fn create_trip(&self, trip: NewTrip, created_by: &str) -> StoreResult<Trip> {
        let creator = parse_id(created_by, "user")?;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO trips (id, name, description, destination, start_date, end_date, status, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {TRIP_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&trip.name)
        .bind(&trip.description)
        .bind(&trip.destination)
        .bind(trip.start_date)
        .bind(trip.end_date)
        .bind(TripStatus::Planning.to_db())
        .bind(creator)
        .fetch_one(&mut *tx)
        .await?;
        let created = trip_from_row(&row)?;

        sqlx::query(
            "INSERT INTO trip_memberships (trip_id, user_id, role, status) VALUES ($1, $2, $3, $4)",
        )
        .bind(parse_id(&created.id, "trip")?)
        .bind(creator)
        .bind(MemberRole::Owner.to_db())
        .bind(MEMBERSHIP_ACTIVE)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(created)
    }

    async fn update_trip(&self, trip_id: &str, update: &TripUpdate) -> StoreResult<Trip> {
        let id = parse_id(trip_id, "trip")?;
        let row = sqlx::query(&format!(
            r#"
            UPDATE trips SET
                name = COALESCE($2, name),
                description = COALESCE($3, description),
                destination = COALESCE($4, destination),
                start_date = COALESCE($5, start_date),
                end_date = COALESCE($6, end_date),
                status = COALESCE($7, status),
                updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING {TRIP_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&update.name)
        .bind(&update.description)
        .bind(&update.destination)
        .bind(update.start_date)
        .bind(update.end_date)
        .bind(update.status.map(|s| s.to_db()))
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("trip"))?;
        trip_from_row(&row)
    }

    async fn soft_delete_trip(&self, trip_id: &str) -> StoreResult<()> {
        let id = parse_id(trip_id, "trip")?;
        let result = sqlx::query(
            "UPDATE trips SET deleted_at = NOW(), updated_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("trip"));
        }
        Ok(())
    }

    async fn get_trip_members(&self, trip_id: &str) -> StoreResult<Vec<TripMember>> {
        let id = parse_id(trip_id, "trip")?;
        self.ensure_live_trip(id).await?;
        let rows = sqlx::query(
            r#"
            SELECT trip_id, user_id, role, created_at
            FROM trip_memberships
            WHERE trip_id = $1 AND status = $2
            ORDER BY created_at
            "#,
        )
        .bind(id)
        .bind(MEMBERSHIP_ACTIVE)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(member_from_row).collect()
    }

    async fn add_member(
        &self,
        trip_id: &str,
        user_id: &str,
        role: MemberRole,
    ) -> StoreResult<TripMember> {
        let trip = parse_id(trip_id, "trip")?;
        let user = parse_id(user_id, "user")?;
        self.ensure_live_trip(trip).await?;

        // Reactivates a previously removed membership; an active one is left as is.
        let row = sqlx::query(
            r#"
            INSERT INTO trip_memberships (trip_id, user_id, role, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (trip_id, user_id)
            DO UPDATE SET role = EXCLUDED.role, status = EXCLUDED.status, updated_at = NOW()
            WHERE trip_memberships.status != $4
            RETURNING trip_id, user_id, role, created_at
            "#,
        )
        .bind(trip)
        .bind(user)
        .bind(role.to_db())
        .bind(MEMBERSHIP_ACTIVE)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            StoreError::Conflict(format!("user {user_id} is already a member of trip {trip_id}"))
        })?;
        member_from_row(&row)
    }

    async fn remove_member(&self, trip_id: &str, user_id: &str) -> StoreResult<()> {
        let trip = parse_id(trip_id, "trip")?;
        let user = parse_id(user_id, "member")?;
        let result = sqlx::query(
            r#"
            UPDATE trip_memberships SET status = $3, updated_at = NOW()
            WHERE trip_id = $1 AND user_id = $2 AND status = $4
            "#,
        )
        .bind(trip)
        .bind(user)
        .bind(MEMBERSHIP_INACTIVE)
        .bind(MEMBERSHIP_ACTIVE)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("member"));
        }
        Ok(())
    }

    async fn update_member_role(
        &self,
        trip_id: &str,
        user_id: &str,
        role: MemberRole,
    ) -> StoreResult<TripMember> {
        let trip = parse_id(trip_id, "trip")?;
        let user = parse_id(user_id, "member")?;
        let row = sqlx::query(
            r#"
            UPDATE trip_memberships SET role = $3, updated_at = NOW()
            WHERE trip_id = $1 AND user_id = $2 AND status = $4
            RETURNING trip_id, user_id, role, created_at
            "#,
        )
        .bind(trip)
        .bind(user)
        .bind(role.to_db())
        .bind(MEMBERSHIP_ACTIVE)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("member"))?;
        member_from_row(&row)
    }

    async fn create_invitation(&self, invitation: Invitation) -> StoreResult<Invitation> {
        let invitee_id = invitation
            .invitee_id
            .as_deref()
            .map(|id| parse_id(id, "user"))
            .transpose()?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO trip_invitations
                (id, trip_id, inviter_id, invitee_email, invitee_id, role, status, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {INVITATION_COLUMNS}
            "#
        ))
        .bind(parse_id(&invitation.id, "invitation")?)
        .bind(parse_id(&invitation.trip_id, "trip")?)
        .bind(parse_id(&invitation.inviter_id, "user")?)
        .bind(&invitation.invitee_email)
        .bind(invitee_id)
        .bind(invitation.role.to_db())
        .bind(invitation.status.to_db())
        .bind(invitation.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(format!(
                "a pending invitation for {} already exists",
                invitation.invitee_email
            )),
            _ => StoreError::from(e),
        })?;
        invitation_from_row(&row)
    }

    async fn get_invitation(&self, invitation_id: &str) -> StoreResult<Invitation> {
        let id = parse_id(invitation_id, "invitation")?;
        let row = sqlx::query(&format!(
            "SELECT {INVITATION_COLUMNS} FROM trip_invitations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("invitation"))?;
        invitation_from_row(&row)
    }

    async fn update_invitation_status(
        &self,
        invitation_id: &str,
        status: InvitationStatus,
    ) -> StoreResult<Invitation> {
        let id = parse_id(invitation_id, "invitation")?;
        let row = sqlx::query(&format!(
            r#"
            UPDATE trip_invitations SET status = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {INVITATION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(status.to_db())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("invitation"))?;
        invitation_from_row(&row)
    }

    async fn get_invitations_by_trip_id(&self, trip_id: &str) -> StoreResult<Vec<Invitation>> {
        let id = parse_id(trip_id, "trip")?;
        let rows = sqlx::query(&format!(
            "SELECT {INVITATION_COLUMNS} FROM trip_invitations WHERE trip_id = $1 ORDER BY created_at DESC"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(invitation_from_row).collect()
    }

    async fn lookup_user_by_email(&self, email: &str) -> StoreResult<UserSummary> {
        let row = sqlx::query("SELECT id, email, username FROM users WHERE lower(email) = lower($1) LIMIT 1")
            .bind(email.trim())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound("user"))?;
        let id: Uuid = row.try_get("id")?;
        Ok(UserSummary {
            id: id.to_string(),
            email: row.try_get("email")?,
            username: row.try_get("username")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_uuid_ids_are_not_found() {
        assert_eq!(parse_id("trip-1", "trip"), Err(StoreError::NotFound("trip")));
        let id = Uuid::new_v4();
        assert_eq!(parse_id(&id.to_string(), "trip"), Ok(id));
    }
}
