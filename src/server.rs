use actix_web::{middleware::Logger, web, App, HttpServer};

use crate::config::Configuration;
use crate::openapi;
use crate::ConnectionPool;

/// Serves the one HTTP surface the core owns: the agent ingest API. No
/// session, identity, or CSRF middleware — callers authenticate with a
/// per-server bearer token (`routes::agent::authenticate`).
pub async fn start_server(configuration: &Configuration, pool: ConnectionPool) -> std::io::Result<()> {
    let listen = configuration.listen;
    let port = configuration.port;

    let server = HttpServer::new(move || {
        App::new()
            .wrap(Logger::new("%a \"%r\" %s %b \"%{Referer}i\" \"%{User-Agent}i\" %T"))
            .app_data(web::Data::new(pool.clone()))
            .service(openapi::swagger_ui())
            .configure(crate::routes::configure)
    })
    .bind((listen, port))?
    .run();

    log::info!("Server started successfully on {}:{}", configuration.listen, configuration.port);

    let result = server.await;

    match &result {
        Ok(()) => {
            crate::logging::AppLogger::log_shutdown("keyspider", "server completed normally");
        }
        Err(e) => {
            crate::logging::AppLogger::log_shutdown("keyspider", &format!("server error: {}", e));
        }
    }

    result
}

