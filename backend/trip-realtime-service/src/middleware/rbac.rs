//! Trip-scoped permission gate.
//!
//! Runs inside the auth gate on routes carrying `{id}`. The caller's role is
//! resolved through the `TripStore`, checked against the permission matrix,
//! and stored in the request extensions for the handler.

use actix_middleware::{request_id_of, RequestContext};
use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform},
    Error, FromRequest, HttpMessage, HttpRequest,
};
use error_types::{error_codes, AppError};
use futures::future::{ready, LocalBoxFuture, Ready};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::models::MemberRole;
use crate::permissions::{rule_for, Action, Resource};
use crate::store::TripStore;

/// Resolves the owner of the resource a request targets.
pub type OwnerIdExtractor = Arc<dyn Fn(&ServiceRequest) -> Option<String> + Send + Sync>;

/// Caller's role in the trip, set after a successful check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRole(pub MemberRole);

/// Owner of the targeted resource, when the route has an owner extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceOwnerId(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsResourceOwner(pub bool);

/// Owner extractor reading a path segment, e.g. `userId` on location routes.
pub fn owner_from_path(segment: &'static str) -> OwnerIdExtractor {
    Arc::new(move |req: &ServiceRequest| req.match_info().get(segment).map(str::to_string))
}

#[derive(Clone)]
pub struct RequirePermission {
    resource: Resource,
    action: Action,
    store: Arc<dyn TripStore>,
    owner_id: Option<OwnerIdExtractor>,
}

impl RequirePermission {
    pub fn new(resource: Resource, action: Action, store: Arc<dyn TripStore>) -> Self {
        Self {
            resource,
            action,
            store,
            owner_id: None,
        }
    }

    pub fn with_owner(mut self, extractor: OwnerIdExtractor) -> Self {
        self.owner_id = Some(extractor);
        self
    }
}

impl<S, B> Transform<S, ServiceRequest> for RequirePermission
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = RequirePermissionService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequirePermissionService {
            service: Rc::new(service),
            gate: self.clone(),
        }))
    }
}

pub struct RequirePermissionService<S> {
    service: Rc<S>,
    gate: RequirePermission,
}

struct Granted {
    role: MemberRole,
    owner_id: Option<String>,
    is_owner: bool,
}

impl RequirePermission {
    async fn check(&self, req: &ServiceRequest) -> Result<Granted, AppError> {
        let trip_id = req
            .match_info()
            .get("id")
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| AppError::bad_request(error_codes::MISSING_TRIP_ID, "Trip ID is required"))?;

        let user_id = RequestContext::of(req)
            .and_then(|ctx| ctx.user_id().map(str::to_string))
            .ok_or_else(|| {
                AppError::unauthorized(error_codes::UNAUTHORIZED, "User not authenticated")
            })?;

        let role = match self.store.get_user_role(&trip_id, &user_id).await {
            Ok(role) => role,
            Err(StoreError::NotFound(_)) => {
                warn!(trip_id = %trip_id, user_id = %user_id, "Access attempt by non-member");
                return Err(AppError::forbidden(
                    error_codes::NOT_TRIP_MEMBER,
                    "You are not a member of this trip",
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let Some(rule) = rule_for(self.resource, self.action) else {
            warn!(resource = %self.resource, action = %self.action, "No permission rule defined");
            return Err(insufficient(self.resource, self.action));
        };

        let owner_id = match (&self.owner_id, rule.requires_ownership()) {
            (Some(extract), true) => extract(req),
            _ => None,
        };
        let is_owner = owner_id.as_deref() == Some(user_id.as_str());

        if !rule.admits(role, is_owner) {
            warn!(
                trip_id = %trip_id,
                user_id = %user_id,
                role = %role,
                resource = %self.resource,
                action = %self.action,
                "Permission denied"
            );
            return Err(insufficient(self.resource, self.action));
        }

        debug!(trip_id = %trip_id, user_id = %user_id, role = %role, "Permission granted");
        Ok(Granted {
            role,
            owner_id,
            is_owner,
        })
    }
}

fn insufficient(resource: Resource, action: Action) -> AppError {
    AppError::forbidden(
        error_codes::INSUFFICIENT_PERMISSIONS,
        format!("Insufficient permissions to {action} {resource}"),
    )
}

impl<S, B> Service<ServiceRequest> for RequirePermissionService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let gate = self.gate.clone();

        Box::pin(async move {
            let checked = gate.check(&req).await;
            match checked {
                Ok(granted) => {
                    {
                        let mut extensions = req.extensions_mut();
                        extensions.insert(UserRole(granted.role));
                        extensions.insert(IsResourceOwner(granted.is_owner));
                        if let Some(owner_id) = granted.owner_id {
                            extensions.insert(ResourceOwnerId(owner_id));
                        }
                    }
                    service.call(req).await.map(ServiceResponse::map_into_left_body)
                }
                Err(err) => {
                    let response = err.render(&request_id_of(&req), false);
                    Ok(req.into_response(response).map_into_right_body())
                }
            }
        })
    }
}

impl FromRequest for UserRole {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let role = req.extensions().get::<UserRole>().copied();
        ready(role.ok_or_else(|| {
            AppError::internal("route is missing its permission gate").into()
        }))
    }
}

impl FromRequest for IsResourceOwner {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let is_owner = req
            .extensions()
            .get::<IsResourceOwner>()
            .copied()
            .unwrap_or(IsResourceOwner(false));
        ready(Ok(is_owner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTripStore;
    use actix_middleware::AuthenticatedUser;
    use actix_web::{test, web, App, HttpResponse};
    use serde_json::{Map, Value};

    fn as_user(req: &ServiceRequest, user_id: &str) {
        req.extensions_mut().insert(RequestContext::new("req-1"));
        RequestContext::attach_user(
            req,
            AuthenticatedUser {
                user_id: user_id.to_string(),
                email: None,
                username: None,
                role: None,
                is_admin: false,
                claims: Map::new(),
            },
        );
    }

    async fn handler(role: UserRole, owner: IsResourceOwner) -> HttpResponse {
        HttpResponse::Ok().json(serde_json::json!({
            "role": role.0,
            "isOwner": owner.0,
        }))
    }

    async fn store() -> Arc<InMemoryTripStore> {
        let store = Arc::new(InMemoryTripStore::new());
        store.seed_trip("T1", "owner").await;
        store.add_member("T1", "member", MemberRole::Member).await.unwrap();
        store
    }

    // `x-test-user` stands in for the auth gate.
    macro_rules! app_with {
        ($gate:expr, $path:expr) => {
            test::init_service(
                App::new()
                    .wrap_fn(|req, srv| {
                        let user = req
                            .headers()
                            .get("x-test-user")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        if let Some(user) = user {
                            as_user(&req, &user);
                        }
                        actix_web::dev::Service::call(srv, req)
                    })
                    .service(web::resource($path).wrap($gate).to(handler)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_member_can_read_trip() {
        let store = store().await;
        let gate = RequirePermission::new(Resource::Trip, Action::Read, store);
        let app = app_with!(gate, "/v1/trips/{id}");

        let req = test::TestRequest::get()
            .uri("/v1/trips/T1")
            .insert_header(("x-test-user", "member"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["role"], "MEMBER");
    }

    #[actix_web::test]
    async fn test_non_member_is_forbidden() {
        let store = store().await;
        let gate = RequirePermission::new(Resource::Trip, Action::Delete, store);
        let app = app_with!(gate, "/v1/trips/{id}");

        let req = test::TestRequest::delete()
            .uri("/v1/trips/T1")
            .insert_header(("x-test-user", "stranger"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 403);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["code"], error_codes::NOT_TRIP_MEMBER);
    }

    #[actix_web::test]
    async fn test_role_below_minimum_is_forbidden() {
        let store = store().await;
        let gate = RequirePermission::new(Resource::Trip, Action::Delete, store);
        let app = app_with!(gate, "/v1/trips/{id}");

        let req = test::TestRequest::delete()
            .uri("/v1/trips/T1")
            .insert_header(("x-test-user", "member"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 403);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["code"], error_codes::INSUFFICIENT_PERMISSIONS);
    }

    #[actix_web::test]
    async fn test_anonymous_is_unauthorized() {
        let store = store().await;
        let gate = RequirePermission::new(Resource::Trip, Action::Read, store);
        let app = app_with!(gate, "/v1/trips/{id}");

        let req = test::TestRequest::get().uri("/v1/trips/T1").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 401);
    }

    #[actix_web::test]
    async fn test_missing_trip_id_is_bad_request() {
        let store = store().await;
        let gate = RequirePermission::new(Resource::Trip, Action::Read, store);
        let app = app_with!(gate, "/v1/trips");

        let req = test::TestRequest::get()
            .uri("/v1/trips")
            .insert_header(("x-test-user", "member"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["code"], error_codes::MISSING_TRIP_ID);
    }

    #[actix_web::test]
    async fn test_owner_only_rule_uses_extractor() {
        let store = store().await;
        let gate = RequirePermission::new(Resource::Location, Action::Update, store)
            .with_owner(owner_from_path("userId"));
        let app = app_with!(gate, "/v1/trips/{id}/locations/{userId}");

        let own = test::TestRequest::put()
            .uri("/v1/trips/T1/locations/member")
            .insert_header(("x-test-user", "member"))
            .to_request();
        let resp = test::call_service(&app, own).await;
        assert_eq!(resp.status(), 200);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["isOwner"], true);

        let other = test::TestRequest::put()
            .uri("/v1/trips/T1/locations/member")
            .insert_header(("x-test-user", "owner"))
            .to_request();
        let resp = test::call_service(&app, other).await;
        assert_eq!(resp.status(), 403);
    }
}
