use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{StoreResult, TripStore};
use crate::error::StoreError;
use crate::models::{
    Invitation, InvitationStatus, MemberRole, NewTrip, Trip, TripMember, TripStatus, TripUpdate,
    UserSummary,
};

#[derive(Default)]
struct Tables {
    trips: HashMap<String, Trip>,
    deleted: HashMap<String, chrono::DateTime<Utc>>,
    /// trip id -> members in join order
    members: HashMap<String, Vec<TripMember>>,
    invitations: HashMap<String, Invitation>,
    users: HashMap<String, UserSummary>,
}

impl Tables {
    fn live_trip(&self, trip_id: &str) -> StoreResult<&Trip> {
        if self.deleted.contains_key(trip_id) {
            return Err(StoreError::NotFound("trip"));
        }
        self.trips.get(trip_id).ok_or(StoreError::NotFound("trip"))
    }

    fn member_mut(&mut self, trip_id: &str, user_id: &str) -> StoreResult<&mut TripMember> {
        self.members
            .get_mut(trip_id)
            .and_then(|members| members.iter_mut().find(|m| m.user_id == user_id))
            .ok_or(StoreError::NotFound("member"))
    }
}

/// `TripStore` kept in process memory, for development and tests.
#[derive(Default)]
pub struct InMemoryTripStore {
    tables: RwLock<Tables>,
}

impl InMemoryTripStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user resolvable by `lookup_user_by_email`.
    pub async fn insert_user(&self, user: UserSummary) {
        let mut tables = self.tables.write().await;
        tables.users.insert(user.email.to_ascii_lowercase(), user);
    }

    /// Insert a trip with a fixed id and its owner, bypassing id generation.
    pub async fn seed_trip(&self, trip_id: &str, owner_id: &str) -> Trip {
        let now = Utc::now();
        let trip = Trip {
            id: trip_id.to_string(),
            name: format!("Trip {trip_id}"),
            description: None,
            destination: None,
            start_date: None,
            end_date: None,
            status: TripStatus::Planning,
            created_by: owner_id.to_string(),
            created_at: now,
            updated_at: now,
        };
        let mut tables = self.tables.write().await;
        tables.trips.insert(trip.id.clone(), trip.clone());
        tables.members.insert(
            trip.id.clone(),
            vec![TripMember {
                trip_id: trip.id.clone(),
                user_id: owner_id.to_string(),
                role: MemberRole::Owner,
                joined_at: now,
            }],
        );
        trip
    }
}

#[async_trait]
impl TripStore for InMemoryTripStore {
    async fn get_user_role(&self, trip_id: &str, user_id: &str) -> StoreResult<MemberRole> {
        let tables = self.tables.read().await;
        tables.live_trip(trip_id)?;
        tables
            .members
            .get(trip_id)
            .and_then(|members| members.iter().find(|m| m.user_id == user_id))
            .map(|m| m.role)
            .ok_or(StoreError::NotFound("member"))
    }

    async fn get_trip(&self, trip_id: &str) -> StoreResult<Trip> {
        self.tables.read().await.live_trip(trip_id).cloned()
    }

    async fn create_trip(&self, trip: NewTrip, created_by: &str) -> StoreResult<Trip> {
        let now = Utc::now();
        let trip = Trip {
            id: uuid::Uuid::new_v4().to_string(),
            name: trip.name,
            description: trip.description,
            destination: trip.destination,
            start_date: trip.start_date,
            end_date: trip.end_date,
            status: TripStatus::Planning,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
        };
        let owner = TripMember {
            trip_id: trip.id.clone(),
            user_id: created_by.to_string(),
            role: MemberRole::Owner,
            joined_at: now,
        };

        let mut tables = self.tables.write().await;
        tables.trips.insert(trip.id.clone(), trip.clone());
        tables.members.insert(trip.id.clone(), vec![owner]);
        Ok(trip)
    }

    async fn update_trip(&self, trip_id: &str, update: &TripUpdate) -> StoreResult<Trip> {
        let mut tables = self.tables.write().await;
        tables.live_trip(trip_id)?;
        let trip = tables
            .trips
            .get_mut(trip_id)
            .ok_or(StoreError::NotFound("trip"))?;
        update.apply(trip);
        Ok(trip.clone())
    }

    async fn soft_delete_trip(&self, trip_id: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.live_trip(trip_id)?;
        tables.deleted.insert(trip_id.to_string(), Utc::now());
        Ok(())
    }

    async fn get_trip_members(&self, trip_id: &str) -> StoreResult<Vec<TripMember>> {
        let tables = self.tables.read().await;
        tables.live_trip(trip_id)?;
        Ok(tables.members.get(trip_id).cloned().unwrap_or_default())
    }

    async fn add_member(
        &self,
        trip_id: &str,
        user_id: &str,
        role: MemberRole,
    ) -> StoreResult<TripMember> {
        let mut tables = self.tables.write().await;
        tables.live_trip(trip_id)?;
        let members = tables.members.entry(trip_id.to_string()).or_default();
        if members.iter().any(|m| m.user_id == user_id) {
            return Err(StoreError::Conflict(format!(
                "user {user_id} is already a member of trip {trip_id}"
            )));
        }
        let member = TripMember {
            trip_id: trip_id.to_string(),
            user_id: user_id.to_string(),
            role,
            joined_at: Utc::now(),
        };
        members.push(member.clone());
        Ok(member)
    }

    async fn remove_member(&self, trip_id: &str, user_id: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.live_trip(trip_id)?;
        let members = tables
            .members
            .get_mut(trip_id)
            .ok_or(StoreError::NotFound("member"))?;
        let before = members.len();
        members.retain(|m| m.user_id != user_id);
        if members.len() == before {
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
        let mut tables = self.tables.write().await;
        tables.live_trip(trip_id)?;
        let member = tables.member_mut(trip_id, user_id)?;
        member.role = role;
        Ok(member.clone())
    }

    async fn create_invitation(&self, invitation: Invitation) -> StoreResult<Invitation> {
        let mut tables = self.tables.write().await;
        tables.live_trip(&invitation.trip_id)?;
        let duplicate = tables.invitations.values().any(|i| {
            i.trip_id == invitation.trip_id
                && i.invitee_email == invitation.invitee_email
                && i.status == InvitationStatus::Pending
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "a pending invitation for {} already exists",
                invitation.invitee_email
            )));
        }
        tables
            .invitations
            .insert(invitation.id.clone(), invitation.clone());
        Ok(invitation)
    }

    async fn get_invitation(&self, invitation_id: &str) -> StoreResult<Invitation> {
        self.tables
            .read()
            .await
            .invitations
            .get(invitation_id)
            .cloned()
            .ok_or(StoreError::NotFound("invitation"))
    }

    async fn update_invitation_status(
        &self,
        invitation_id: &str,
        status: InvitationStatus,
    ) -> StoreResult<Invitation> {
        let mut tables = self.tables.write().await;
        let invitation = tables
            .invitations
            .get_mut(invitation_id)
            .ok_or(StoreError::NotFound("invitation"))?;
        invitation.status = status;
        invitation.updated_at = Utc::now();
        Ok(invitation.clone())
    }

    async fn get_invitations_by_trip_id(&self, trip_id: &str) -> StoreResult<Vec<Invitation>> {
        let tables = self.tables.read().await;
        let mut invitations: Vec<Invitation> = tables
            .invitations
            .values()
            .filter(|i| i.trip_id == trip_id)
            .cloned()
            .collect();
        invitations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(invitations)
    }

    async fn lookup_user_by_email(&self, email: &str) -> StoreResult<UserSummary> {
        self.tables
            .read()
            .await
            .users
            .get(&email.trim().to_ascii_lowercase())
            .cloned()
            .ok_or(StoreError::NotFound("user"))
    }
}
