use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

use crate::api_types::{ApiError, ApiResponse};
use crate::fingerprint;
use crate::logging::AgentLogger;
use crate::models::{AccessEvent, FileType, KeyLocation, NewAccessEvent, SSHKey, Server};
use crate::ConnectionPool;

#[derive(Deserialize, ToSchema)]
pub struct HeartbeatRequest {
    pub server_id: i32,
    pub agent_version: String,
    pub now: i64,
}

#[derive(Deserialize, ToSchema)]
pub struct AgentAccessEvent {
    pub source_ip: String,
    pub fingerprint: Option<String>,
    pub username: String,
    pub auth_method: String,
    pub event_type: String,
    pub event_time: i64,
    pub raw_log_line: String,
}

#[derive(Deserialize, ToSchema)]
pub struct EventsRequest {
    pub server_id: i32,
    pub events: Vec<AgentAccessEvent>,
}

#[derive(Serialize, ToSchema)]
pub struct EventsResponse {
    pub accepted: usize,
}

#[derive(Deserialize, ToSchema)]
pub struct AgentSudoEvent {
    pub username: String,
    pub tty: String,
    pub pwd: String,
    pub target_user: String,
    pub command: String,
    pub event_time: i64,
}

#[derive(Deserialize, ToSchema)]
pub struct SudoEventsRequest {
    pub server_id: i32,
    pub events: Vec<AgentSudoEvent>,
}

#[derive(Deserialize, ToSchema)]
pub struct AgentKeyLocation {
    pub file_path: String,
    pub file_type: String,
    pub unix_owner: Option<String>,
    pub unix_perms: Option<i32>,
    pub file_mtime: Option<i64>,
    pub file_size: Option<i64>,
    pub public_key_line: String,
}

#[derive(Deserialize, ToSchema)]
pub struct KeysRequest {
    pub server_id: i32,
    pub locations: Vec<AgentKeyLocation>,
}

#[derive(Serialize, ToSchema)]
pub struct KeysResponse {
    pub accepted: usize,
}

/// Extracts the bearer token and checks it against `server.agent_token_hash`
/// with a constant-time comparison over the SHA256 digests. Any failure —
/// missing header, unknown server, no token provisioned, mismatch — is
/// reported identically as `AuthFailed` so no timing or message difference
/// distinguishes them.
fn authenticate(req: &HttpRequest, server: &Server) -> Result<(), ApiError> {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::unauthorized())?;

    let Some(expected_hex) = server.agent_token_hash.as_deref() else {
        AgentLogger::log_auth_failure(&server.hostname, "no token provisioned");
        return Err(ApiError::unauthorized());
    };

    let digest = Sha256::digest(token.as_bytes());
    let actual_hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();

    if constant_time_eq(expected_hex.as_bytes(), actual_hex.as_bytes()) {
        Ok(())
    } else {
        AgentLogger::log_auth_failure(&server.hostname, "token mismatch");
        Err(ApiError::unauthorized())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn load_server(db: &ConnectionPool, server_id: i32) -> Result<Server, ApiError> {
    let mut conn = db.get().map_err(|e| ApiError::internal_error(e.to_string()))?;
    Server::get_by_id(&mut conn, server_id)
        .map_err(|e| ApiError::internal_error(e.to_string()))?
        .ok_or_else(|| ApiError::not_found("server not found".to_owned()))
}

#[utoipa::path(
    post,
    path = "/api/agent/heartbeat",
    request_body = HeartbeatRequest,
    responses((status = 204, description = "heartbeat recorded"), (status = 401, description = "bad token"))
)]
pub async fn heartbeat(
    req: HttpRequest,
    db: web::Data<ConnectionPool>,
    body: web::Json<HeartbeatRequest>,
) -> Result<HttpResponse, ApiError> {
    let server = load_server(&db, body.server_id)?;
    authenticate(&req, &server)?;

    let mut conn = db.get().map_err(|e| ApiError::internal_error(e.to_string()))?;
    server
        .record_heartbeat(&mut conn, &body.agent_version)
        .map_err(|e| ApiError::internal_error(e.to_string()))?;

    AgentLogger::log_heartbeat(&server.hostname, &body.agent_version);
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    post,
    path = "/api/agent/events",
    request_body = EventsRequest,
    responses((status = 200, body = EventsResponse), (status = 401, description = "bad token"))
)]
pub async fn events(
    req: HttpRequest,
    db: web::Data<ConnectionPool>,
    body: web::Json<EventsRequest>,
) -> Result<HttpResponse, ApiError> {
    let server = load_server(&db, body.server_id)?;
    authenticate(&req, &server)?;

    let mut conn = db.get().map_err(|e| ApiError::internal_error(e.to_string()))?;

    let new_events: Vec<NewAccessEvent> = body
        .events
        .iter()
        .map(|e| NewAccessEvent {
            target_server_id: server.id,
            source_ip: e.source_ip.clone(),
            source_server_id: None,
            ssh_key_id: None,
            fingerprint: e.fingerprint.clone(),
            username: e.username.clone(),
            auth_method: e.auth_method.clone(),
            event_type: e.event_type.clone(),
            event_time: e.event_time,
            raw_log_line: e.raw_log_line.clone(),
            log_source: "agent".to_owned(),
        })
        .collect();

    let inserted = AccessEvent::insert_batch(&mut conn, &new_events).map_err(|e| ApiError::internal_error(e.to_string()))?;

    if let Some(watermark) = body.events.iter().map(|e| e.event_time).max() {
        server
            .advance_watermark(&mut conn, watermark)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
    }

    AgentLogger::log_events_ingested(&server.hostname, body.events.len(), inserted);
    Ok(HttpResponse::Ok().json(ApiResponse::success(EventsResponse { accepted: inserted })))
}

/// Sudo events are accepted and counted but not persisted: no table in
/// the core models this side stream yet.
#[utoipa::path(
    post,
    path = "/api/agent/sudo-events",
    request_body = SudoEventsRequest,
    responses((status = 200, description = "accepted"), (status = 401, description = "bad token"))
)]
pub async fn sudo_events(
    req: HttpRequest,
    db: web::Data<ConnectionPool>,
    body: web::Json<SudoEventsRequest>,
) -> Result<HttpResponse, ApiError> {
    let server = load_server(&db, body.server_id)?;
    authenticate(&req, &server)?;

    Ok(HttpResponse::Ok().json(ApiResponse::success(EventsResponse {
        accepted: body.events.len(),
    })))
}

#[utoipa::path(
    post,
    path = "/api/agent/keys",
    request_body = KeysRequest,
    responses((status = 200, body = KeysResponse), (status = 401, description = "bad token"))
)]
pub async fn keys(
    req: HttpRequest,
    db: web::Data<ConnectionPool>,
    body: web::Json<KeysRequest>,
) -> Result<HttpResponse, ApiError> {
    let server = load_server(&db, body.server_id)?;
    authenticate(&req, &server)?;

    let mut conn = db.get().map_err(|e| ApiError::internal_error(e.to_string()))?;
    let mut accepted = 0;

    for location in &body.locations {
        let parsed = match fingerprint::parse_public_key_file(&location.public_key_line)
            .or_else(|_| fingerprint::parse_authorized_keys_line(&location.public_key_line))
        {
            Ok(parsed) => parsed,
            Err(_) => continue,
        };

        let file_type = match location.file_type.as_str() {
            "authorized_keys" => FileType::AuthorizedKeys,
            "host_key" => FileType::HostKey,
            _ => FileType::Identity,
        };

        let key = SSHKey::get_or_create(
            &mut conn,
            &parsed.fingerprint_sha256,
            &parsed.fingerprint_md5,
            parsed.key_type,
            parsed.key_bits,
            parsed.comment.as_deref(),
            file_type == FileType::HostKey,
            location.file_mtime,
        )
        .map_err(|e| ApiError::internal_error(e.to_string()))?;

        KeyLocation::upsert(
            &mut conn,
            server.id,
            key.id,
            &location.file_path,
            file_type,
            location.unix_owner.as_deref(),
            location.unix_perms,
            location.file_mtime,
            location.file_size,
        )
        .map_err(|e| ApiError::internal_error(e.to_string()))?;

        accepted += 1;
    }

    AgentLogger::log_keys_ingested(&server.hostname, accepted);
    Ok(HttpResponse::Ok().json(ApiResponse::success(KeysResponse { accepted })))
}

#[cfg(test)]
mod tests {
    use actix_web::{http::StatusCode, test, App};
    use diesel::r2d2::{ConnectionManager, Pool};
    use diesel_migrations::MigrationHarness;
    use serde_json::json;
    use tempfile::TempDir;

    use crate::models::Server;
    use crate::ConnectionPool;

    fn test_pool() -> (ConnectionPool, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let db_path = dir.path().join("test.db");
        let manager = ConnectionManager::<crate::DbConnection>::new(format!("sqlite://{}", db_path.display()));
        let pool: ConnectionPool = Pool::builder().build(manager).expect("pool");
        {
            let mut conn = pool.get().expect("conn");
            conn.run_pending_migrations(crate::MIGRATIONS).expect("migrate");
        }
        (pool, dir)
    }

    #[actix_web::test]
    async fn heartbeat_rejects_missing_bearer_token() {
        let (pool, _dir) = test_pool();
        let server = Server::get_or_create(&mut pool.get().unwrap(), "host-a", "10.0.0.1", 22).unwrap();
        server.set_agent_token_hash(&mut pool.get().unwrap(), &"a".repeat(64)).unwrap();

        let app = test::init_service(
            App::new()
                .app_data(actix_web::web::Data::new(pool.clone()))
                .configure(crate::routes::configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/agent/heartbeat")
            .set_json(json!({"server_id": server.id, "agent_version": "1.0", "now": 0}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn heartbeat_rejects_wrong_token_in_constant_time_path() {
        use sha2::{Digest, Sha256};

        let (pool, _dir) = test_pool();
        let server = Server::get_or_create(&mut pool.get().unwrap(), "host-b", "10.0.0.2", 22).unwrap();
        let correct_hash = Sha256::digest(b"the-real-token").iter().map(|b| format!("{b:02x}")).collect::<String>();
        server.set_agent_token_hash(&mut pool.get().unwrap(), &correct_hash).unwrap();

        let app = test::init_service(
            App::new()
                .app_data(actix_web::web::Data::new(pool.clone()))
                .configure(crate::routes::configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/agent/heartbeat")
            .insert_header(("Authorization", "Bearer wrong-token"))
            .set_json(json!({"server_id": server.id, "agent_version": "1.0", "now": 0}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn heartbeat_accepts_correct_bearer_token() {
        use sha2::{Digest, Sha256};

        let (pool, _dir) = test_pool();
        let server = Server::get_or_create(&mut pool.get().unwrap(), "host-c", "10.0.0.3", 22).unwrap();
        let token = "the-real-token";
        let hash = Sha256::digest(token.as_bytes()).iter().map(|b| format!("{b:02x}")).collect::<String>();
        server.set_agent_token_hash(&mut pool.get().unwrap(), &hash).unwrap();

        let app = test::init_service(
            App::new()
                .app_data(actix_web::web::Data::new(pool.clone()))
                .configure(crate::routes::configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/agent/heartbeat")
            .insert_header(("Authorization", format!("Bearer {token}")))
            .set_json(json!({"server_id": server.id, "agent_version": "1.2.3", "now": 0}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let refreshed = Server::get_by_id(&mut pool.get().unwrap(), server.id).unwrap().unwrap();
        assert_eq!(refreshed.agent_version.as_deref(), Some("1.2.3"));
    }

    #[actix_web::test]
    async fn heartbeat_rejects_unprovisioned_server() {
        let (pool, _dir) = test_pool();
        let server = Server::get_or_create(&mut pool.get().unwrap(), "host-d", "10.0.0.4", 22).unwrap();

        let app = test::init_service(
            App::new()
                .app_data(actix_web::web::Data::new(pool.clone()))
                .configure(crate::routes::configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/agent/heartbeat")
            .insert_header(("Authorization", "Bearer anything"))
            .set_json(json!({"server_id": server.id, "agent_version": "1.0", "now": 0}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
