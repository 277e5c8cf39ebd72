use actix_middleware::UserId;
use actix_web::{web, HttpResponse};
use error_types::{error_codes, AppError};
use event_schema::EventType;
use serde::Deserialize;
use serde_json::json;

use super::publish;
use crate::error::{AppResult, StoreError};
use crate::middleware::UserRole;
use crate::models::MemberRole;
use crate::permissions::validate_role_transition;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMemberRequest {
    pub user_id: String,
    #[serde(default = "default_role")]
    pub role: MemberRole,
}

fn default_role() -> MemberRole {
    MemberRole::Member
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoleRequest {
    pub role: MemberRole,
}

fn owner_immutable() -> AppError {
    AppError::forbidden(
        error_codes::OWNER_IMMUTABLE,
        "The trip owner's role cannot be assigned or changed",
    )
}

/// Role of `member_id`, with a missing membership reported as
/// `member_not_found`.
async fn current_role(state: &AppState, trip_id: &str, member_id: &str) -> AppResult<MemberRole> {
    match state.store.get_user_role(trip_id, member_id).await {
        Ok(role) => Ok(role),
        Err(StoreError::NotFound(_)) => Err(AppError::not_found(
            error_codes::MEMBER_NOT_FOUND,
            "Member not found in this trip",
        )),
        Err(e) => Err(e.into()),
    }
}

/// GET /v1/trips/{id}/members
pub async fn list_members(
    state: web::Data<AppState>,
    trip_id: web::Path<String>,
) -> AppResult<HttpResponse> {
    let members = state.store.get_trip_members(&trip_id).await?;
    Ok(HttpResponse::Ok().json(members))
}

/// POST /v1/trips/{id}/members
pub async fn add_member(
    state: web::Data<AppState>,
    user: UserId,
    trip_id: web::Path<String>,
    body: web::Json<AddMemberRequest>,
) -> AppResult<HttpResponse> {
    let body = body.into_inner();
    if body.user_id.trim().is_empty() {
        return Err(AppError::validation("userId is required"));
    }
    if body.role == MemberRole::Owner {
        return Err(owner_immutable());
    }

    let member = state
        .store
        .add_member(&trip_id, body.user_id.trim(), body.role)
        .await?;
    tracing::info!(trip_id = %member.trip_id, member_id = %member.user_id, role = %member.role, "Member added");

    publish(&state, &member.trip_id, EventType::MemberAdded, &member, user.as_str()).await;
    Ok(HttpResponse::Created().json(member))
}

/// PATCH /v1/trips/{id}/members/{memberId}
/// PUT /v1/trips/{id}/members/{memberId}/role
pub async fn update_member_role(
    state: web::Data<AppState>,
    user: UserId,
    caller: UserRole,
    path: web::Path<(String, String)>,
    body: web::Json<UpdateRoleRequest>,
) -> AppResult<HttpResponse> {
    let (trip_id, member_id) = path.into_inner();
    let requested = body.into_inner().role;

    let current = current_role(&state, &trip_id, &member_id).await?;
    validate_role_transition(current, requested)?;

    let member = state
        .store
        .update_member_role(&trip_id, &member_id, requested)
        .await?;
    tracing::info!(
        trip_id = %trip_id,
        member_id = %member_id,
        from = %current,
        to = %requested,
        by_role = %caller.0,
        "Member role updated"
    );

    publish(
        &state,
        &trip_id,
        EventType::MemberRoleUpdated,
        &json!({
            "userId": member.user_id,
            "oldRole": current,
            "newRole": member.role,
        }),
        user.as_str(),
    )
    .await;
    Ok(HttpResponse::Ok().json(member))
}

/// DELETE /v1/trips/{id}/members/{memberId}
pub async fn remove_member(
    state: web::Data<AppState>,
    user: UserId,
    path: web::Path<(String, String)>,
) -> AppResult<HttpResponse> {
    let (trip_id, member_id) = path.into_inner();

    if current_role(&state, &trip_id, &member_id).await? == MemberRole::Owner {
        return Err(owner_immutable());
    }
    state.store.remove_member(&trip_id, &member_id).await?;
    tracing::info!(trip_id = %trip_id, member_id = %member_id, "Member removed");

    publish(
        &state,
        &trip_id,
        EventType::MemberRemoved,
        &json!({ "userId": member_id }),
        user.as_str(),
    )
    .await;
    Ok(HttpResponse::NoContent().finish())
}
