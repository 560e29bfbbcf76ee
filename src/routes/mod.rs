use actix_web::web;

pub mod agent;

/// The one HTTP surface the core owns: the agent ingest API (§4.10/§6).
/// Graph, spider, and watcher control are consumed in-process, not over HTTP.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/agent")
            .route("/heartbeat", web::post().to(agent::heartbeat))
            .route("/events", web::post().to(agent::events))
            .route("/sudo-events", web::post().to(agent::sudo_events))
            .route("/keys", web::post().to(agent::keys)),
    );
}
