use actix_middleware::UserId;
use actix_web::{web, HttpResponse};
use error_types::{error_codes, AppError};
use event_schema::EventType;
use serde_json::json;

use super::publish;
use crate::error::{AppResult, StoreError};
use crate::models::{Invitation, InvitationRequest, InvitationStatus, MemberRole};
use crate::state::AppState;

/// POST /v1/trips/{id}/invitations
///
/// Invitees without an account are recorded by email only.
pub async fn create_invitation(
    state: web::Data<AppState>,
    user: UserId,
    trip_id: web::Path<String>,
    body: web::Json<InvitationRequest>,
) -> AppResult<HttpResponse> {
    let body = body.into_inner();
    let email = body.email.trim().to_ascii_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::validation("A valid email is required"));
    }
    if body.role == MemberRole::Owner {
        return Err(AppError::forbidden(
            error_codes::OWNER_IMMUTABLE,
            "Invitations cannot grant the owner role",
        ));
    }

    let invitee_id = match state.store.lookup_user_by_email(&email).await {
        Ok(found) => Some(found.id),
        Err(StoreError::NotFound(_)) => None,
        Err(e) => return Err(e.into()),
    };

    let invitation = Invitation::pending(&trip_id, user.as_str(), &email, invitee_id, body.role);
    let invitation = state.store.create_invitation(invitation).await?;
    tracing::info!(
        trip_id = %invitation.trip_id,
        invitation_id = %invitation.id,
        registered = invitation.invitee_id.is_some(),
        "Invitation created"
    );

    publish(
        &state,
        &invitation.trip_id,
        EventType::InvitationCreated,
        &invitation,
        user.as_str(),
    )
    .await;
    Ok(HttpResponse::Created().json(invitation))
}

/// GET /v1/trips/{id}/invitations
pub async fn list_invitations(
    state: web::Data<AppState>,
    trip_id: web::Path<String>,
) -> AppResult<HttpResponse> {
    let invitations = state.store.get_invitations_by_trip_id(&trip_id).await?;
    Ok(HttpResponse::Ok().json(invitations))
}

/// DELETE /v1/trips/{id}/invitations/{invitationId}
pub async fn cancel_invitation(
    state: web::Data<AppState>,
    user: UserId,
    path: web::Path<(String, String)>,
) -> AppResult<HttpResponse> {
    let (trip_id, invitation_id) = path.into_inner();
    let not_found =
        || AppError::not_found(error_codes::INVITATION_NOT_FOUND, "Invitation not found");

    let invitation = match state.store.get_invitation(&invitation_id).await {
        Ok(invitation) if invitation.trip_id == trip_id => invitation,
        Ok(_) | Err(StoreError::NotFound(_)) => return Err(not_found()),
        Err(e) => return Err(e.into()),
    };
    if invitation.status != InvitationStatus::Pending {
        return Err(AppError::conflict(format!(
            "Invitation is already {}",
            invitation.status.to_db().to_ascii_lowercase()
        )));
    }

    let invitation = state
        .store
        .update_invitation_status(&invitation.id, InvitationStatus::Cancelled)
        .await?;

    publish(
        &state,
        &trip_id,
        EventType::InvitationStatusUpdated,
        &json!({ "invitationId": invitation.id, "status": invitation.status }),
        user.as_str(),
    )
    .await;
    Ok(HttpResponse::NoContent().finish())
}
