//! Liveness endpoint backed by the scheduler heartbeat file.
//!
//! Returns 200 while the heartbeat is younger than the staleness window
//! (three orchestration intervals), 503 otherwise.

use std::path::PathBuf;

use actix_web::{get, web, App, HttpResponse, HttpServer};
use serde::Serialize;

use crate::scheduler::heartbeat_age;

/// Staleness factor applied to the orchestration interval.
const STALENESS_FACTOR: u64 = 3;

#[derive(Clone)]
pub struct LivenessState {
    pub heartbeat_file: PathBuf,
    pub max_age_secs: u64,
}

impl LivenessState {
    pub fn new(heartbeat_file: PathBuf, tick_interval_minutes: u64) -> Self {
        Self {
            heartbeat_file,
            max_age_secs: tick_interval_minutes * 60 * STALENESS_FACTOR,
        }
    }
}

#[derive(Serialize)]
struct LivenessResponse {
    status: &'static str,
    heartbeat_age_secs: Option<i64>,
}

/// Liveness check endpoint.
#[get("/")]
pub async fn liveness(state: web::Data<LivenessState>) -> HttpResponse {
    match heartbeat_age(&state.heartbeat_file) {
        Some(age) if age.num_seconds() >= 0 && (age.num_seconds() as u64) <= state.max_age_secs => {
            HttpResponse::Ok().json(LivenessResponse {
                status: "alive",
                heartbeat_age_secs: Some(age.num_seconds()),
            })
        }
        Some(age) => HttpResponse::ServiceUnavailable().json(LivenessResponse {
            status: "stale",
            heartbeat_age_secs: Some(age.num_seconds()),
        }),
        None => HttpResponse::ServiceUnavailable().json(LivenessResponse {
            status: "no-heartbeat",
            heartbeat_age_secs: None,
        }),
    }
}

/// Start the liveness HTTP server on the given port.
pub fn start_liveness_server(
    state: LivenessState,
    port: u16,
) -> std::io::Result<actix_web::dev::Server> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(liveness)
    })
    .workers(1)
    .bind(("0.0.0.0", port))?
    .run();
    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};

    async fn call(state: LivenessState) -> actix_web::http::StatusCode {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .service(liveness),
        )
        .await;
        let request = test::TestRequest::get().uri("/").to_request();
        test::call_service(&app, request).await.status()
    }

    #[actix_rt::test]
    async fn test_fresh_heartbeat_is_alive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartbeat.txt");
        crate::scheduler::write_heartbeat(&path).unwrap();
        let status = call(LivenessState::new(path, 3)).await;
        assert_eq!(status, actix_web::http::StatusCode::OK);
    }

    #[actix_rt::test]
    async fn test_stale_heartbeat_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartbeat.txt");
        let old = chrono::Utc::now() - chrono::Duration::hours(2);
        std::fs::write(&path, old.to_rfc3339()).unwrap();
        let status = call(LivenessState::new(path, 3)).await;
        assert_eq!(status, actix_web::http::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[actix_rt::test]
    async fn test_missing_heartbeat_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let status = call(LivenessState::new(dir.path().join("absent"), 3)).await;
        assert_eq!(status, actix_web::http::StatusCode::SERVICE_UNAVAILABLE);
    }
}
