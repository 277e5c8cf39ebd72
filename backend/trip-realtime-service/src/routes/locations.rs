use actix_web::{web, HttpResponse};
use chrono::Utc;
use error_types::AppError;
use event_schema::EventType;
use serde::{Deserialize, Serialize};

use super::publish;
use crate::error::AppResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LocationUpdate {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
}

impl LocationUpdate {
    fn validate(&self) -> Result<(), String> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err("latitude must be between -90 and 90".into());
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err("longitude must be between -180 and 180".into());
        }
        if matches!(self.accuracy, Some(a) if !a.is_finite() || a < 0.0) {
            return Err("accuracy must be a non-negative number".into());
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LocationPayload<'a> {
    user_id: &'a str,
    latitude: f64,
    longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    accuracy: Option<f64>,
    timestamp: i64,
}

/// PUT /v1/trips/{id}/locations/{userId}
///
/// Only the location's owner reaches this handler. Positions are not
/// persisted; they are fanned out to the trip as `LOCATION_UPDATED`.
pub async fn update_location(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Json<LocationUpdate>,
) -> AppResult<HttpResponse> {
    let (trip_id, user_id) = path.into_inner();
    let body = body.into_inner();
    body.validate().map_err(AppError::validation)?;

    let payload = LocationPayload {
        user_id: &user_id,
        latitude: body.latitude,
        longitude: body.longitude,
        accuracy: body.accuracy,
        timestamp: Utc::now().timestamp_millis(),
    };
    publish(&state, &trip_id, EventType::LocationUpdated, &payload, &user_id).await;

    Ok(HttpResponse::Accepted().json(payload))
}
