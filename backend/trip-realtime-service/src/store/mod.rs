//! `TripStore` port: the persistence operations the edge consumes.
//!
//! Adapters own their transaction handling; callers see single calls.

mod memory;
mod postgres;

pub use memory::InMemoryTripStore;
pub use postgres::PgTripStore;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{
    Invitation, InvitationStatus, MemberRole, NewTrip, Trip, TripMember, TripUpdate, UserSummary,
};

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait TripStore: Send + Sync {
    /// Role of `user_id` in `trip_id`; `NotFound("member")` when the user is
    /// not an active member.
    async fn get_user_role(&self, trip_id: &str, user_id: &str) -> StoreResult<MemberRole>;

    async fn get_trip(&self, trip_id: &str) -> StoreResult<Trip>;

    /// Creates the trip and the creator's `Owner` membership atomically.
    async fn create_trip(&self, trip: NewTrip, created_by: &str) -> StoreResult<Trip>;

    async fn update_trip(&self, trip_id: &str, update: &TripUpdate) -> StoreResult<Trip>;

    async fn soft_delete_trip(&self, trip_id: &str) -> StoreResult<()>;

    async fn get_trip_members(&self, trip_id: &str) -> StoreResult<Vec<TripMember>>;

    /// `Conflict` when the user is already an active member.
    async fn add_member(
        &self,
        trip_id: &str,
        user_id: &str,
        role: MemberRole,
    ) -> StoreResult<TripMember>;

    async fn remove_member(&self, trip_id: &str, user_id: &str) -> StoreResult<()>;

    async fn update_member_role(
        &self,
        trip_id: &str,
        user_id: &str,
        role: MemberRole,
    ) -> StoreResult<TripMember>;

    async fn create_invitation(&self, invitation: Invitation) -> StoreResult<Invitation>;

    async fn get_invitation(&self, invitation_id: &str) -> StoreResult<Invitation>;

    async fn update_invitation_status(
        &self,
        invitation_id: &str,
        status: InvitationStatus,
    ) -> StoreResult<Invitation>;

    async fn get_invitations_by_trip_id(&self, trip_id: &str) -> StoreResult<Vec<Invitation>>;

    async fn lookup_user_by_email(&self, email: &str) -> StoreResult<UserSummary>;
}
