//! Trip endpoints. `(Trip, *)` permissions are enforced by the route chain.

use actix_middleware::UserId;
use actix_web::{web, HttpResponse};
use event_schema::EventType;
use serde_json::json;

use super::publish;
use crate::error::AppResult;
use crate::models::{NewTrip, TripUpdate};
use crate::state::AppState;
use error_types::AppError;

/// POST /v1/trips
///
/// The creator becomes the trip's owner.
pub async fn create_trip(
    state: web::Data<AppState>,
    user: UserId,
    body: web::Json<NewTrip>,
) -> AppResult<HttpResponse> {
    let body = body.into_inner();
    body.validate().map_err(AppError::validation)?;

    let trip = state.store.create_trip(body, user.as_str()).await?;
    tracing::info!(trip_id = %trip.id, user_id = %user, "Trip created");

    publish(&state, &trip.id, EventType::TripCreated, &trip, user.as_str()).await;
    Ok(HttpResponse::Created().json(trip))
}

/// GET /v1/trips/{id}
pub async fn get_trip(
    state: web::Data<AppState>,
    trip_id: web::Path<String>,
) -> AppResult<HttpResponse> {
    let trip = state.store.get_trip(&trip_id).await?;
    Ok(HttpResponse::Ok().json(trip))
}

/// PUT /v1/trips/{id}
pub async fn update_trip(
    state: web::Data<AppState>,
    user: UserId,
    trip_id: web::Path<String>,
    body: web::Json<TripUpdate>,
) -> AppResult<HttpResponse> {
    let update = body.into_inner();
    if update.is_empty() {
        return Err(AppError::validation("No fields to update"));
    }
    if let Some(name) = &update.name {
        if name.trim().is_empty() {
            return Err(AppError::validation("name must not be empty"));
        }
    }

    let trip = state.store.update_trip(&trip_id, &update).await?;
    publish(&state, &trip.id, EventType::TripUpdated, &trip, user.as_str()).await;
    Ok(HttpResponse::Ok().json(trip))
}

/// DELETE /v1/trips/{id}
pub async fn delete_trip(
    state: web::Data<AppState>,
    user: UserId,
    trip_id: web::Path<String>,
) -> AppResult<HttpResponse> {
    let trip_id = trip_id.into_inner();
    state.store.soft_delete_trip(&trip_id).await?;
    tracing::info!(trip_id = %trip_id, user_id = %user, "Trip deleted");

    publish(
        &state,
        &trip_id,
        EventType::TripDeleted,
        &json!({ "tripId": trip_id }),
        user.as_str(),
    )
    .await;
    Ok(HttpResponse::NoContent().finish())
}
