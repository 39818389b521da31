//! Request telemetry: one structured log line per request plus endpoint metrics
//! recorded into `AppState`.

use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{debug, error, info};

pub struct RequestTelemetry;

impl<S, B> Transform<S, ServiceRequest> for RequestTelemetry
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestTelemetryMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestTelemetryMiddleware { service }))
    }
}

pub struct RequestTelemetryMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestTelemetryMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let method = req.method().to_string();
        // Metrics are keyed by route pattern so `/api/v1/sessions/{id}` is one endpoint.
        let endpoint = format!(
            "{} {}",
            method,
            req.match_pattern().unwrap_or_else(|| req.path().to_string())
        );
        let uri = req.uri().to_string();
        let remote_addr = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("unknown")
            .to_string();
        let app_state = req.app_data::<web::Data<AppState>>().cloned();

        debug!(method = %method, uri = %uri, remote_addr = %remote_addr, "Request started");

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            let is_error = match &result {
                Ok(response) => {
                    let status = response.status();
                    info!(
                        method = %method,
                        uri = %uri,
                        remote_addr = %remote_addr,
                        status = %status.as_u16(),
                        duration_ms = %duration_ms,
                        "Request completed"
                    );
                    status.is_client_error() || status.is_server_error()
                }
                Err(err) => {
                    error!(
                        method = %method,
                        uri = %uri,
                        remote_addr = %remote_addr,
                        duration_ms = %duration_ms,
                        error = %err,
                        "Request failed"
                    );
                    true
                }
            };

            if let Some(app_state) = app_state {
                app_state.record_endpoint_request(&endpoint, duration_ms, is_error);
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::tests::test_state;
    use actix_web::{App, HttpResponse};

    #[actix_web::test]
    async fn test_records_by_route_pattern() {
        let state = web::Data::new(test_state(AppConfig::default()));

        let app = actix_web::test::init_service(
            App::new()
                .app_data(state.clone())
                .wrap(RequestTelemetry)
                .route("/items/{id}", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .route("/missing/{id}", web::get().to(|| async { HttpResponse::NotFound().finish() })),
        )
        .await;

        for uri in ["/items/1", "/items/2", "/missing/3"] {
            let req = actix_web::test::TestRequest::get().uri(uri).to_request();
            actix_web::test::call_service(&app, req).await;
        }

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.request_count, 3);
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.endpoint_metrics["GET /items/{id}"].request_count, 2);
        assert_eq!(metrics.endpoint_metrics["GET /missing/{id}"].error_count, 1);
    }
}
