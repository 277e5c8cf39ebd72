use actix_middleware::{UserId, WsConnectionPermit};
use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use error_types::{error_codes, AppError};
use tracing::{info, warn};

use crate::error::AppResult;
use crate::state::AppState;
use crate::websocket::{dispatch_inbound, ActixSink, ActixSource, CloseReason, SafeConn, CONNECTED_FRAME};

/// GET /v1/trips/{id}/ws
///
/// Authentication, the per-user connection cap and trip membership are
/// checked by the route chain before the upgrade happens here.
pub async fn connect(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<AppState>,
    user: UserId,
    trip_id: web::Path<String>,
) -> AppResult<HttpResponse> {
    let (response, session, stream) = actix_ws::handle(&req, body).map_err(|e| {
        warn!(trip_id = %trip_id, user_id = %user, error = %e, "WebSocket upgrade failed");
        AppError::bad_request(
            error_codes::WEBSOCKET_UPGRADE_FAILED,
            "Could not upgrade to WebSocket",
        )
    })?;

    let conn = SafeConn::new(
        user.as_str(),
        trip_id.as_str(),
        state.config.websocket.clone(),
        state.session_metrics.clone(),
    );
    if let Some(permit) = req.extensions().get::<WsConnectionPermit>().cloned() {
        conn.attach_permit(permit);
    }

    if let Err(e) = conn.send(CONNECTED_FRAME) {
        warn!(session_id = %conn.id(), error = %e, "Failed to queue connect acknowledgement");
    }
    let inbound = match conn.start(Box::new(ActixSink::new(session)), ActixSource::new(stream)) {
        Ok(inbound) => inbound,
        Err(e) => {
            conn.close(CloseReason::Shutdown).await;
            return Err(AppError::internal(format!("session start failed: {e}")));
        }
    };
    info!(session_id = %conn.id(), trip_id = %trip_id, user_id = %user, "WebSocket session started");
    state
        .registry
        .attach(conn.clone(), dispatch_inbound(conn, inbound))
        .await;

    Ok(response)
}
