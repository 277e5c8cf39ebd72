//! HTTP surface.
//!
//! Every `/v1` route sits behind the auth gate. Per route, the rate limiter
//! runs before the permission gate so rejected callers never reach the store.

pub mod health;
pub mod invitations;
pub mod locations;
pub mod members;
pub mod trips;
pub mod ws;

use actix_middleware::{AuthGate, RateLimitMiddleware, RateLimitPolicy, WsConnectionLimit};
use actix_web::{
    dev::HttpServiceFactory, guard, http::Method, web, FromRequest, Handler, Responder,
};
use event_schema::EventType;
use serde::Serialize;

use crate::middleware::{owner_from_path, RequirePermission};
use crate::permissions::{Action, Resource};
use crate::state::AppState;

/// Emit a domain event after a committed mutation.
///
/// A failed publish is logged; the mutation already happened, so the request
/// still succeeds.
pub(crate) async fn publish<P: Serialize>(
    state: &AppState,
    trip_id: &str,
    event_type: EventType,
    payload: &P,
    user_id: &str,
) {
    if let Err(e) = state.emitter.emit(trip_id, event_type.clone(), payload, user_id).await {
        tracing::error!(
            trip_id = %trip_id,
            event_type = %event_type,
            error = %e,
            "Failed to publish event"
        );
    }
}

struct Gates<'a> {
    state: &'a AppState,
}

impl Gates<'_> {
    fn api_limit(&self) -> RateLimitMiddleware {
        let limits = &self.state.config.rate_limit;
        RateLimitMiddleware::new(
            self.state.rate_limiter.clone(),
            RateLimitPolicy::api(limits.requests_per_minute, limits.requests_per_hour),
            self.state.ip_resolver.clone(),
        )
    }

    fn auth_limit(&self) -> RateLimitMiddleware {
        let limits = &self.state.config.rate_limit;
        RateLimitMiddleware::new(
            self.state.rate_limiter.clone(),
            RateLimitPolicy::auth(limits.auth_requests_per_minute, limits.auth_window),
            self.state.ip_resolver.clone(),
        )
    }

    fn ws_limit(&self) -> WsConnectionLimit {
        let limits = &self.state.config.rate_limit;
        WsConnectionLimit::new(
            self.state.rate_limiter.clone(),
            limits.ws_max_connections_per_user,
            limits.ws_connection_window,
        )
    }

    fn permission(&self, resource: Resource, action: Action) -> RequirePermission {
        RequirePermission::new(resource, action, self.state.store.clone())
    }
}

/// One method on one trip-scoped path: rate limit, then permission check.
fn trip_route<F, Args>(
    path: &str,
    method: Method,
    permission: RequirePermission,
    limit: RateLimitMiddleware,
    handler: F,
) -> impl HttpServiceFactory
where
    F: Handler<Args>,
    Args: FromRequest + 'static,
    F::Output: Responder + 'static,
{
    web::resource(path)
        .guard(guard::Method(method.clone()))
        .wrap(permission)
        .wrap(limit)
        .route(web::route().method(method).to(handler))
}

pub fn configure(cfg: &mut web::ServiceConfig, state: &AppState) {
    let gates = Gates { state };
    let auth = AuthGate::new(state.validator.clone())
        .with_simulator_bypass(state.config.simulator_bypass_enabled());

    cfg.app_data(web::Data::new(state.clone()))
        .route("/health", web::get().to(health::health))
        .route("/health/liveness", web::get().to(health::liveness))
        .route("/health/readiness", web::get().to(health::readiness))
        .route("/metrics", web::get().to(health::metrics))
        .service(
            web::scope("/v1")
                .wrap(auth)
                .service(
                    web::resource("/trips")
                        .wrap(gates.auth_limit())
                        .route(web::post().to(trips::create_trip)),
                )
                .service(
                    web::resource("/trips/{id}/ws")
                        .wrap(gates.permission(Resource::Trip, Action::Read))
                        .wrap(gates.ws_limit())
                        .route(web::get().to(ws::connect)),
                )
                .service(trip_route(
                    "/trips/{id}",
                    Method::GET,
                    gates.permission(Resource::Trip, Action::Read),
                    gates.api_limit(),
                    trips::get_trip,
                ))
                .service(trip_route(
                    "/trips/{id}",
                    Method::PUT,
                    gates.permission(Resource::Trip, Action::Update),
                    gates.api_limit(),
                    trips::update_trip,
                ))
                .service(trip_route(
                    "/trips/{id}",
                    Method::DELETE,
                    gates.permission(Resource::Trip, Action::Delete),
                    gates.api_limit(),
                    trips::delete_trip,
                ))
                .service(trip_route(
                    "/trips/{id}/members",
                    Method::GET,
                    gates.permission(Resource::Member, Action::Read),
                    gates.api_limit(),
                    members::list_members,
                ))
                .service(trip_route(
                    "/trips/{id}/members",
                    Method::POST,
                    gates.permission(Resource::Member, Action::Create),
                    gates.api_limit(),
                    members::add_member,
                ))
                .service(trip_route(
                    "/trips/{id}/members/{memberId}",
                    Method::PATCH,
                    gates.permission(Resource::Member, Action::ChangeRole),
                    gates.api_limit(),
                    members::update_member_role,
                ))
                .service(trip_route(
                    "/trips/{id}/members/{memberId}/role",
                    Method::PUT,
                    gates.permission(Resource::Member, Action::ChangeRole),
                    gates.api_limit(),
                    members::update_member_role,
                ))
                .service(trip_route(
                    "/trips/{id}/members/{memberId}",
                    Method::DELETE,
                    gates.permission(Resource::Member, Action::Remove),
                    gates.api_limit(),
                    members::remove_member,
                ))
                .service(trip_route(
                    "/trips/{id}/invitations",
                    Method::POST,
                    gates.permission(Resource::Invitation, Action::Create),
                    gates.auth_limit(),
                    invitations::create_invitation,
                ))
                .service(trip_route(
                    "/trips/{id}/invitations",
                    Method::GET,
                    gates.permission(Resource::Invitation, Action::Read),
                    gates.api_limit(),
                    invitations::list_invitations,
                ))
                .service(trip_route(
                    "/trips/{id}/invitations/{invitationId}",
                    Method::DELETE,
                    gates.permission(Resource::Invitation, Action::Delete),
                    gates.api_limit(),
                    invitations::cancel_invitation,
                ))
                .service(trip_route(
                    "/trips/{id}/locations/{userId}",
                    Method::PUT,
                    gates
                        .permission(Resource::Location, Action::Update)
                        .with_owner(owner_from_path("userId")),
                    gates.api_limit(),
                    locations::update_location,
                )),
        );
}
