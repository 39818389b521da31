use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

fn config_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "audio": {
            "analysis_sample_rate": config.audio.analysis_sample_rate,
            "chunk_samples": config.audio.chunk_samples,
            "inbound_sample_rate": config.audio.inbound_sample_rate,
            "inbound_channels": config.audio.inbound_channels,
            "poll_interval_ms": config.audio.poll_interval_ms
        },
        "segmenter": {
            "energy_threshold": config.segmenter.energy_threshold,
            "record_timeout_secs": config.segmenter.record_timeout_secs,
            "silence_flush_secs": config.segmenter.silence_flush_secs,
            "max_recording_secs": config.segmenter.max_recording_secs
        },
        "playback": {
            "sample_rate": config.playback.sample_rate,
            "channels": config.playback.channels,
            "frame_duration_ms": config.playback.frame_duration_ms
        },
        "sessions": {
            "max_concurrent_sessions": config.sessions.max_concurrent_sessions,
            "reaper_interval_secs": config.sessions.reaper_interval_secs,
            "heartbeat_timeout_secs": config.sessions.heartbeat_timeout_secs,
            "fanout": config.sessions.fanout
        },
        "enhancement": {
            "enabled": config.enhancement.enabled,
            "noise_gate_ratio": config.enhancement.noise_gate_ratio,
            "peak_ceiling": config.enhancement.peak_ceiling,
            "smoothing": config.enhancement.smoothing
        },
        // Credentials are never echoed back.
        "transcription": {
            "endpoint": config.transcription.endpoint,
            "model": config.transcription.model,
            "language": config.transcription.language,
            "timeout_secs": config.transcription.timeout_secs
        },
        "backend": {
            "endpoint": config.backend.endpoint,
            "timeout_secs": config.backend.timeout_secs
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

/// Apply a partial update. Only segmenter tuning and the fan-out policy are
/// runtime-updatable; they take effect for sessions created afterwards.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FanoutPolicy;
    use crate::state::tests::test_state;
    use actix_web::{http::StatusCode, App};

    #[actix_web::test]
    async fn test_update_segmenter_and_fanout() {
        let state = web::Data::new(test_state(AppConfig::default()));
        let app = actix_web::test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/api/v1/config", web::get().to(get_config))
                .route("/api/v1/config", web::put().to(update_config)),
        )
        .await;

        let req = actix_web::test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"segmenter": {"silence_flush_secs": 2.5}, "sessions": {"fanout": "broadcast"}}))
            .to_request();
        let body: serde_json::Value = actix_web::test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["updated_config"]["segmenter"]["silence_flush_secs"], 2.5);

        let settings = state.sessions.settings();
        assert_eq!(settings.segmenter.silence_flush_secs, 2.5);
        assert_eq!(settings.sessions.fanout, FanoutPolicy::Broadcast);

        let req = actix_web::test::TestRequest::get().uri("/api/v1/config").to_request();
        let body: serde_json::Value = actix_web::test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["sessions"]["fanout"], "broadcast");
        assert!(body["config"]["transcription"].get("api_key").is_none());
    }

    #[actix_web::test]
    async fn test_invalid_update_is_rejected() {
        let state = web::Data::new(test_state(AppConfig::default()));
        let app = actix_web::test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/api/v1/config", web::put().to(update_config)),
        )
        .await;

        let req = actix_web::test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"segmenter": {"silence_flush_secs": -1.0}}))
            .to_request();
        let resp = actix_web::test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().segmenter.silence_flush_secs, 4.0);
    }
}
