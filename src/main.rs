use std::sync::Arc;

use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
use log::{error, info, warn};
use russh::keys::load_secret_key;

mod api_types;
mod config;
mod database;
mod fingerprint;
mod graph;
mod logging;
mod logparse;
mod models;
mod openapi;
mod routes;
mod scanner;
mod scheduler;
mod schema;
mod server;
mod sftp;
mod spider;
mod ssh;
mod unreachable;
mod watcher;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

#[derive(diesel::MultiConnection)]
pub enum DbConnection {
    Sqlite(diesel::SqliteConnection),
}

pub type ConnectionPool = Pool<ConnectionManager<DbConnection>>;

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    color_eyre::install().map_err(|e| {
        eprintln!("Failed to install color_eyre: {e}");
        std::io::Error::new(std::io::ErrorKind::Other, format!("Failed to install color_eyre: {e}"))
    })?;

    if std::env::var("RUST_SPANTRACE").is_err() {
        std::env::set_var("RUST_SPANTRACE", "0");
    }

    let (configuration, config_source) = config::get_configuration().map_err(|e| {
        eprintln!("Configuration error: {e}");
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
    })?;

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", configuration.loglevel.clone());
    }
    pretty_env_logger::init();
    logging::AppLogger::log_config_loaded(&config_source, 0);

    info!("Using database: {}", configuration.database_url);
    info!("Using SSH key file: {}", configuration.ssh.private_key_file.display());
    info!("Using log level: {}", configuration.loglevel);

    let pool = database::create_connection_pool(configuration.database_url.clone())?;

    let key_path = &configuration.ssh.private_key_file;
    if !key_path.exists() {
        eprintln!("SSH private key file not found: {}", key_path.display());
        eprintln!("Generate one with:");
        if let Some(parent) = key_path.parent() {
            eprintln!("  mkdir -p {}", parent.display());
        }
        eprintln!("  ssh-keygen -t ed25519 -f {} -C 'keyspider'", key_path.display());
        std::process::exit(1);
    }

    let key = load_secret_key(key_path, configuration.ssh.private_key_passphrase.as_deref()).map_err(|e| {
        error!("Failed to load private key: {e}");
        std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("Failed to load private key: {e}"))
    })?;

    let ssh_pool = Arc::new(ssh::SshPool::new(key, configuration.ssh.clone()));

    let spider_engine = Arc::new(spider::SpiderEngine::new(
        ssh_pool.clone(),
        pool.clone(),
        configuration.spider.clone(),
        configuration.log.clone(),
        configuration.unreachable.clone(),
    ));

    logging::AppLogger::log_startup("keyspider", env!("CARGO_PKG_VERSION"));

    for seed in &configuration.seeds {
        let engine = spider_engine.clone();
        let mut conn = pool.get().map_err(|e| {
            error!("Couldn't connect to database: {e}");
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, format!("Couldn't connect to database: {e}"))
        })?;

        let job = models::ScanJob::create(&mut conn, models::ScanJobType::Spider, None, configuration.spider.default_depth as i32)
            .map_err(|e| {
                error!("Couldn't create seed scan job: {e}");
                std::io::Error::new(std::io::ErrorKind::Other, format!("Couldn't create seed scan job: {e}"))
            })?;
        drop(conn);

        let seed_hostname = seed.hostname.clone();
        let seed_ip = seed.ip.clone();
        let ssh_port = seed.ssh_port;
        let login = configuration.ssh.login.clone();

        tokio::spawn(async move {
            let result = engine
                .run(&job, &seed_hostname, &seed_ip, ssh_port, &login, None, |progress| {
                    info!(
                        "{seed_hostname}: crawl progress servers_done={} queue={} events={} keys={}",
                        progress.servers_done, progress.queue_size, progress.events_parsed, progress.keys_found
                    );
                })
                .await;
            if let Err(e) = result {
                warn!("seed crawl from {seed_hostname} ended with error: {e}");
            }
        });
    }

    {
        let mut conn = pool.get().map_err(|e| {
            error!("Couldn't connect to database: {e}");
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, format!("Couldn't connect to database: {e}"))
        })?;
        let known_servers = models::Server::list_all(&mut conn).map_err(|e| {
            error!("Couldn't list servers: {e}");
            std::io::Error::new(std::io::ErrorKind::Other, format!("Couldn't list servers: {e}"))
        })?;
        drop(conn);

        for server in known_servers {
            let (watcher, _rx) = watcher::TailWatcher::new(
                server.id,
                server.hostname.clone(),
                server.ip.clone(),
                configuration.ssh.login.clone(),
                ssh_pool.clone(),
                pool.clone(),
                configuration.watcher.clone(),
                configuration.log.clone(),
                0,
                spider_engine.clone(),
            );
            tokio::spawn(Arc::new(watcher).run());
        }
    }

    if let Some(scheduler_task) = scheduler::init_scheduler(
        configuration.spider.full_rescan_schedule.as_deref(),
        spider_engine.clone(),
        pool.clone(),
        configuration.ssh.login.clone(),
        configuration.spider.default_depth as i32,
    )
    .await
    {
        tokio::spawn(scheduler_task);
    }

    let result = server::start_server(&configuration, pool).await;

    match &result {
        Ok(()) => logging::AppLogger::log_shutdown("keyspider", "server completed normally"),
        Err(e) => logging::AppLogger::log_shutdown("keyspider", &format!("server error: {e}")),
    }

    result
}
