//! Session inspection and administrative teardown.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// GET /api/v1/sessions
pub async fn list_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let sessions = state.sessions.list_sessions();
    let summary = state.sessions.summary();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "summary": summary,
        "sessions": sessions
    })))
}

/// GET /api/v1/sessions/{id}
pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let session = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| AppError::NotFound(format!("Session not found: {}", session_id)))?;

    Ok(HttpResponse::Ok().json(session.info()))
}

/// DELETE /api/v1/sessions/{id}
///
/// Tears the session down and closes its transport.
pub async fn close_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    if !state.sessions.on_close(&session_id) {
        return Err(AppError::NotFound(format!("Session not found: {}", session_id)));
    }

    info!(session_id = %session_id, "session closed by administrator");
    Ok(HttpResponse::Ok().json(json!({
        "status": "closed",
        "session_id": session_id,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::session::voice::tests::FakePeer;
    use crate::session::{ConnectionState, PeerConnection, SessionOffer};
    use crate::state::tests::test_state;
    use actix_web::{http::StatusCode, App};
    use std::sync::atomic::Ordering;

    #[actix_web::test]
    async fn test_list_and_close_session() {
        let state = web::Data::new(test_state(AppConfig::default()));
        let peer = FakePeer::new();
        let answer = state
            .sessions
            .on_offer(SessionOffer::default(), peer.clone())
            .unwrap();

        let app = actix_web::test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/api/v1/sessions", web::get().to(list_sessions))
                .route("/api/v1/sessions/{id}", web::get().to(get_session))
                .route("/api/v1/sessions/{id}", web::delete().to(close_session)),
        )
        .await;

        let req = actix_web::test::TestRequest::get().uri("/api/v1/sessions").to_request();
        let body: serde_json::Value = actix_web::test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["sessions"][0]["session_id"], answer.session_id.as_str());
        assert_eq!(body["summary"]["sessions_created"], 1);

        let uri = format!("/api/v1/sessions/{}", answer.session_id);
        let req = actix_web::test::TestRequest::get().uri(&uri).to_request();
        let resp = actix_web::test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let req = actix_web::test::TestRequest::delete().uri(&uri).to_request();
        let resp = actix_web::test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.sessions.active_count(), 0);
        assert_eq!(peer.closes.load(Ordering::SeqCst), 1);
        assert_eq!(peer.connection_state(), ConnectionState::Closed);

        let req = actix_web::test::TestRequest::delete().uri(&uri).to_request();
        let resp = actix_web::test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
