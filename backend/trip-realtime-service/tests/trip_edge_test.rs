//! End-to-end checks of the HTTP edge: auth gate, permission gate, owner
//! immutability and the WebSocket handshake, against the in-memory store.

use actix_middleware::{ErrorEnvelope, RequestId, REQUEST_ID_HEADER};
use actix_web::{http::header, http::StatusCode, test, App};
use jwt_security::test_utils::{expired_token, valid_token, TEST_HS_SECRET};
use jwt_security::{JwtValidator, TokenValidator};
use serde_json::{json, Value};
use std::sync::Arc;
use trip_realtime_service::config::Config;
use trip_realtime_service::models::{MemberRole, UserSummary};
use trip_realtime_service::routes;
use trip_realtime_service::state::AppState;
use trip_realtime_service::store::{InMemoryTripStore, TripStore};

async fn seeded() -> (AppState, Arc<InMemoryTripStore>) {
    let store = Arc::new(InMemoryTripStore::new());
    store.seed_trip("T1", "U1").await;
    store.add_member("T1", "U2", MemberRole::Member).await.unwrap();

    let validator: Arc<dyn TokenValidator> =
        Arc::new(JwtValidator::new(Some(TEST_HS_SECRET), None));
    let state = AppState::local(Config::default(), validator)
        .unwrap()
        .with_store(store.clone());
    (state, store)
}

macro_rules! app {
    ($state:expr) => {{
        let state = $state.clone();
        test::init_service(
            App::new()
                .wrap(ErrorEnvelope::new(false))
                .wrap(RequestId::new())
                .configure(move |cfg| routes::configure(cfg, &state)),
        )
        .await
    }};
}

fn bearer(sub: &str) -> (header::HeaderName, String) {
    (header::AUTHORIZATION, format!("Bearer {}", valid_token(sub)))
}

#[actix_web::test]
async fn test_health_is_public() {
    let (state, _) = seeded().await;
    let app = app!(state);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/health/readiness").to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["checks"]["redis"], "disabled");
}

#[actix_web::test]
async fn test_expired_token_is_rejected_before_the_store() {
    let (state, _) = seeded().await;
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri("/v1/trips/T1")
        .insert_header((header::AUTHORIZATION, format!("Bearer {}", expired_token("U1"))))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(resp.headers().contains_key(REQUEST_ID_HEADER));
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "token_expired");
}

#[actix_web::test]
async fn test_missing_token_is_unauthorized() {
    let (state, _) = seeded().await;
    let app = app!(state);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/v1/trips/T1").to_request()).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn test_member_reads_trip() {
    let (state, _) = seeded().await;
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri("/v1/trips/T1")
        .insert_header(bearer("U2"))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-ratelimit-limit"));
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["id"], "T1");
}

#[actix_web::test]
async fn test_non_member_cannot_delete_trip() {
    let (state, store) = seeded().await;
    let app = app!(state);

    let req = test::TestRequest::delete()
        .uri("/v1/trips/T1")
        .insert_header(bearer("U3"))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "not_trip_member");
    assert!(store.get_trip("T1").await.is_ok());
}

#[actix_web::test]
async fn test_member_cannot_delete_trip() {
    let (state, store) = seeded().await;
    let app = app!(state);

    let req = test::TestRequest::delete()
        .uri("/v1/trips/T1")
        .insert_header(bearer("U2"))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "insufficient_permissions");
    assert!(store.get_trip("T1").await.is_ok());
}

#[actix_web::test]
async fn test_owner_deletes_trip() {
    let (state, store) = seeded().await;
    let app = app!(state);

    let req = test::TestRequest::delete()
        .uri("/v1/trips/T1")
        .insert_header(bearer("U1"))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert!(store.get_trip("T1").await.is_err());
}

#[actix_web::test]
async fn test_role_cannot_be_raised_to_owner() {
    let (state, store) = seeded().await;
    let app = app!(state);

    let req = test::TestRequest::patch()
        .uri("/v1/trips/T1/members/U2")
        .insert_header(bearer("U1"))
        .set_json(json!({ "role": "owner" }))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "owner_immutable");
    assert_eq!(
        store.get_user_role("T1", "U2").await.unwrap(),
        MemberRole::Member
    );
}

#[actix_web::test]
async fn test_owner_promotes_member_to_admin() {
    let (state, store) = seeded().await;
    let app = app!(state);

    let req = test::TestRequest::put()
        .uri("/v1/trips/T1/members/U2/role")
        .insert_header(bearer("U1"))
        .set_json(json!({ "role": "ADMIN" }))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(store.get_user_role("T1", "U2").await.unwrap(), MemberRole::Admin);
}

#[actix_web::test]
async fn test_owner_cannot_be_removed() {
    let (state, store) = seeded().await;
    let app = app!(state);

    let req = test::TestRequest::delete()
        .uri("/v1/trips/T1/members/U1")
        .insert_header(bearer("U1"))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "owner_immutable");
    assert_eq!(store.get_user_role("T1", "U1").await.unwrap(), MemberRole::Owner);
}

#[actix_web::test]
async fn test_create_trip_makes_caller_owner() {
    let (state, store) = seeded().await;
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/v1/trips")
        .insert_header(bearer("U9"))
        .set_json(json!({ "name": "Lofoten", "destination": "Norway" }))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::CREATED);
    let body: Value = test::read_body_json(resp).await;
    let trip_id = body["id"].as_str().unwrap();
    assert_eq!(store.get_user_role(trip_id, "U9").await.unwrap(), MemberRole::Owner);
}

#[actix_web::test]
async fn test_invitation_lifecycle() {
    let (state, store) = seeded().await;
    store
        .insert_user(UserSummary {
            id: "U5".into(),
            email: "friend@example.com".into(),
            username: None,
        })
        .await;
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/v1/trips/T1/invitations")
        .insert_header(bearer("U1"))
        .set_json(json!({ "email": " Friend@Example.com " }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let invitation: Value = test::read_body_json(resp).await;
    assert_eq!(invitation["inviteeEmail"], "friend@example.com");
    assert_eq!(invitation["inviteeId"], "U5");
    let invitation_id = invitation["id"].as_str().unwrap().to_string();

    let req = test::TestRequest::delete()
        .uri(&format!("/v1/trips/T1/invitations/{invitation_id}"))
        .insert_header(bearer("U1"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let req = test::TestRequest::get()
        .uri("/v1/trips/T1/invitations")
        .insert_header(bearer("U1"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let listed: Value = test::read_body_json(resp).await;
    assert_eq!(listed[0]["status"], "CANCELLED");
}

#[actix_web::test]
async fn test_location_updates_are_owner_only() {
    let (state, _) = seeded().await;
    let app = app!(state);
    let position = json!({ "latitude": 68.2, "longitude": 13.6 });

    let req = test::TestRequest::put()
        .uri("/v1/trips/T1/locations/U1")
        .insert_header(bearer("U2"))
        .set_json(&position)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let req = test::TestRequest::put()
        .uri("/v1/trips/T1/locations/U2")
        .insert_header(bearer("U2"))
        .set_json(&position)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
}

fn ws_request(uri: &str) -> test::TestRequest {
    test::TestRequest::get()
        .uri(uri)
        .insert_header((header::UPGRADE, "websocket"))
        .insert_header((header::CONNECTION, "upgrade"))
        .insert_header((header::SEC_WEBSOCKET_VERSION, "13"))
        .insert_header((header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ=="))
}

#[actix_web::test]
async fn test_websocket_handshake_with_query_token() {
    let (state, _) = seeded().await;
    let app = app!(state);

    let uri = format!("/v1/trips/T1/ws?token={}", valid_token("U1"));
    let resp = test::call_service(&app, ws_request(&uri).to_request()).await;

    assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
}

#[actix_web::test]
async fn test_websocket_requires_token_and_membership() {
    let (state, _) = seeded().await;
    let app = app!(state);

    let resp = test::call_service(&app, ws_request("/v1/trips/T1/ws").to_request()).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "websocket_token_missing");

    let uri = format!("/v1/trips/T1/ws?token={}", valid_token("U3"));
    let resp = test::call_service(&app, ws_request(&uri).to_request()).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}
