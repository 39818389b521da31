use crate::session::manager::SessionManagerSummary;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
#[cfg(target_os = "linux")]
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let sessions = state.sessions.summary();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "voice-session-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "active_sessions": sessions.active_sessions
        },
        "collaborators": {
            "enhancement_enabled": config.enhancement.enabled,
            "transcription_endpoint": config.transcription.endpoint,
            "transcription_model": config.transcription.model,
            "backend_endpoint": config.backend.endpoint
        },
        "memory": get_memory_info(),
        "system": get_system_status(&sessions)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let sessions = state.sessions.summary();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "http": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            },
            "endpoints": endpoint_stats
        },
        "sessions": sessions,
        "memory": get_memory_info()
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let kb_field = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": kb_field("VmRSS:"),
                "virtual_memory_bytes": kb_field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

fn get_system_status(sessions: &SessionManagerSummary) -> serde_json::Value {
    let session_usage = if sessions.max_sessions > 0 {
        sessions.active_sessions as f64 / sessions.max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage >= 1.0 {
        "at_capacity"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    let mut warnings = Vec::new();
    if session_usage > 0.8 {
        warnings.push("High session usage - consider increasing max_concurrent_sessions");
    }
    if sessions.backend_failures > 0 {
        warnings.push("Response backend has failed at least once");
    }

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": sessions.max_sessions,
        "current_sessions": sessions.active_sessions,
        "load_warnings": warnings
    })
}
