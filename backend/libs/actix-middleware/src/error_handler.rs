//! Central error envelope middleware.
//!
//! Every error leaving the inner service is rendered as the standard JSON
//! envelope with the request's ID. `AppError`s keep their kind; other actix
//! errors are classified by status code. Internal causes reach the body only
//! in debug mode.

use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    error::InternalError,
    http::StatusCode,
    Error, HttpResponse,
};
use error_types::{error_codes, AppError};
use futures::future::LocalBoxFuture;
use std::future::{ready, Ready};
use std::rc::Rc;

use crate::context::request_id_of;

#[derive(Clone, Default)]
pub struct ErrorEnvelope {
    debug: bool,
}

impl ErrorEnvelope {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }
}

impl<S, B> Transform<S, ServiceRequest> for ErrorEnvelope
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = ErrorEnvelopeService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ErrorEnvelopeService {
            service: Rc::new(service),
            debug: self.debug,
        }))
    }
}

pub struct ErrorEnvelopeService<S> {
    service: Rc<S>,
    debug: bool,
}

impl<S, B> Service<ServiceRequest> for ErrorEnvelopeService<S>
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
        let debug = self.debug;
        // The router needs sole ownership of the request, so only plain
        // strings are kept across the inner call.
        let request_id = request_id_of(req.request());
        let path = req.path().to_string();

        Box::pin(async move {
            match service.call(req).await {
                Ok(res) => {
                    let rendered = res
                        .response()
                        .error()
                        .map(|err| render_error(&request_id, &path, err, debug));
                    match rendered {
                        Some(response) => {
                            let (req, _) = res.into_parts();
                            Ok(ServiceResponse::new(req, response).map_into_right_body())
                        }
                        None => Ok(res.map_into_left_body()),
                    }
                }
                Err(err) => {
                    let response = render_error(&request_id, &path, &err, debug);
                    Err(InternalError::from_response(err, response).into())
                }
            }
        })
    }
}

fn render_error(request_id: &str, path: &str, err: &Error, debug: bool) -> HttpResponse {
    let app_error = match err.as_error::<AppError>() {
        Some(app_error) => app_error.clone(),
        None => classify(err),
    };

    if app_error.is_server_error() {
        tracing::error!(
            request_id = %request_id,
            path = %path,
            error_type = app_error.error_type(),
            error = %err,
            "Request failed"
        );
    } else {
        tracing::debug!(
            request_id = %request_id,
            path = %path,
            code = app_error.error_code(),
            "Request rejected"
        );
    }

    let mut response = app_error.render(request_id, debug);
    // Preserve headers such as Retry-After or rate-limit headers set by the origin.
    let origin = err.error_response();
    for (name, value) in origin.headers() {
        if !response.headers().contains_key(name) {
            response.headers_mut().insert(name.clone(), value.clone());
        }
    }
    response
}

/// Map a framework error to the taxonomy by its status code.
fn classify(err: &Error) -> AppError {
    let status = err.as_response_error().status_code();
    let message = err.to_string();
    match status {
        StatusCode::BAD_REQUEST
        | StatusCode::PAYLOAD_TOO_LARGE
        | StatusCode::UNSUPPORTED_MEDIA_TYPE
        | StatusCode::UNPROCESSABLE_ENTITY => AppError::bad_request(error_codes::INVALID_PAYLOAD, message),
        StatusCode::UNAUTHORIZED => AppError::unauthorized(error_codes::UNAUTHORIZED, message),
        StatusCode::FORBIDDEN => AppError::forbidden(error_codes::INSUFFICIENT_PERMISSIONS, message),
        StatusCode::NOT_FOUND => AppError::not_found(error_codes::NOT_FOUND, message),
        StatusCode::CONFLICT => AppError::conflict(message),
        StatusCode::TOO_MANY_REQUESTS => AppError::rate_limited(0),
        _ => AppError::internal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request_id::{RequestId, REQUEST_ID_HEADER};
    use actix_web::{body::to_bytes, dev::ServiceRequest, test, web, App};
    use serde_json::Value;

    async fn expired() -> Result<HttpResponse, AppError> {
        Err(AppError::token_expired())
    }

    async fn db_failure() -> Result<HttpResponse, AppError> {
        Err(AppError::database("connection reset by peer"))
    }

    async fn echo_id(id: web::Path<String>) -> HttpResponse {
        HttpResponse::Ok().body(id.into_inner())
    }

    async fn bad_json(_body: web::Json<Value>) -> HttpResponse {
        HttpResponse::Ok().finish()
    }

    macro_rules! app {
        ($debug:expr) => {
            test::init_service(
                App::new()
                    .wrap(ErrorEnvelope::new($debug))
                    .wrap(RequestId::new())
                    .route("/expired", web::get().to(expired))
                    .route("/db", web::get().to(db_failure))
                    .route("/trips/{id}", web::get().to(echo_id))
                    .route("/json", web::post().to(bad_json)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_envelope_carries_request_id() {
        let app = app!(false);
        let resp =
            test::call_service(&app, test::TestRequest::get().uri("/expired").to_request()).await;
        assert_eq!(resp.status(), 401);

        let request_id = resp
            .headers()
            .get(REQUEST_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "token_expired");
        assert_eq!(body["error"]["refresh_required"], true);
        assert_eq!(body["meta"]["requestID"], request_id.as_str());
        assert_eq!(body["error"]["traceID"], request_id.as_str());
    }

    #[actix_web::test]
    async fn test_server_error_hides_cause() {
        let app = app!(false);
        let resp = test::call_service(&app, test::TestRequest::get().uri("/db").to_request()).await;
        assert_eq!(resp.status(), 500);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["code"], "database_error");
        assert!(body["error"].get("details").is_none());
    }

    #[actix_web::test]
    async fn test_debug_mode_exposes_cause() {
        let app = app!(true);
        let resp = test::call_service(&app, test::TestRequest::get().uri("/db").to_request()).await;
        let body: Value = test::read_body_json(resp).await;
        assert!(body["error"]["details"]
            .as_str()
            .unwrap()
            .contains("connection reset"));
    }

    #[actix_web::test]
    async fn test_framework_errors_are_enveloped() {
        let app = app!(false);
        let req = test::TestRequest::post()
            .uri("/json")
            .insert_header(("content-type", "application/json"))
            .set_payload("{not json")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["code"], "invalid_payload");
    }

    #[actix_web::test]
    async fn test_routed_request_passes_through() {
        let app = app!(false);
        let resp =
            test::call_service(&app, test::TestRequest::get().uri("/trips/T1").to_request()).await;
        assert_eq!(resp.status(), 200);
        assert_eq!(test::read_body(resp).await, "T1");
    }

    #[actix_web::test]
    async fn test_middleware_error_is_rendered() {
        let app = test::init_service(
            App::new()
                .wrap(ErrorEnvelope::new(false))
                .wrap(RequestId::new())
                .service(
                    web::scope("/guarded")
                        .wrap_fn(|_req: ServiceRequest, _srv| async {
                            Err::<ServiceResponse, Error>(
                                AppError::forbidden(error_codes::NOT_TRIP_MEMBER, "nope").into(),
                            )
                        })
                        .route("", web::get().to(HttpResponse::Ok)),
                ),
        )
        .await;

        let err = test::try_call_service(&app, test::TestRequest::get().uri("/guarded").to_request())
            .await
            .unwrap_err();
        let resp = err.error_response();
        assert_eq!(resp.status(), 403);
        let body: Value = serde_json::from_slice(&to_bytes(resp.into_body()).await.unwrap()).unwrap();
        assert_eq!(body["error"]["code"], "not_trip_member");
        assert!(!body["meta"]["requestID"].as_str().unwrap().is_empty());
    }
}
