use std::sync::Arc;

use croner::Cron;
use futures::{future::BoxFuture, FutureExt};
use log::{error, info};
use tokio_cron_scheduler::{JobBuilder, JobScheduler, JobSchedulerError};

use crate::models::{ScanJob, ScanJobType};
use crate::spider::SpiderEngine;
use crate::ConnectionPool;

fn init_job(schedule: Cron) -> JobBuilder<chrono::Utc> {
    let mut job_builder = JobBuilder::new().with_cron_job_type();
    job_builder.schedule = Some(schedule);
    job_builder
}

fn parse_cron(pattern: &str) -> Option<Cron> {
    let mut pat = pattern.to_owned();
    if pat.split_whitespace().count() == 5 {
        pat = format!("0 {pat}");
    }
    match Cron::new(&pat).with_seconds_required().parse() {
        Ok(cron) => Some(cron),
        Err(e) => {
            error!("Failed to parse full-fleet rescan schedule '{pattern}': {e}");
            None
        }
    }
}

/// Wires the periodic `ScanJobType::Full` rescan named in `spider.full_rescan_schedule`.
/// Returns `None` when no schedule is configured, so `main` can skip spawning it.
pub async fn init_scheduler(
    full_rescan_schedule: Option<&str>,
    engine: Arc<SpiderEngine>,
    db: ConnectionPool,
    login: String,
    max_depth: i32,
) -> Option<BoxFuture<'static, Result<(), JobSchedulerError>>> {
    let Some(schedule) = full_rescan_schedule.and_then(parse_cron) else {
        info!("Skipping scheduler initialization, no full-fleet rescan schedule configured");
        return None;
    };

    let mut sched = JobScheduler::new().await.expect("Failed to create job scheduler");

    info!("Initializing scheduler");
    if let Err(e) = sched.init().await {
        panic!("Couldn't initialize job scheduler: {e}")
    };

    let mut job = init_job(schedule.clone());
    job = job.with_run_async(Box::new(move |uuid, mut sched| {
        let engine = engine.clone();
        let db = db.clone();
        let login = login.clone();
        Box::pin(async move {
            info!("Running full-fleet rescan job");
            match run_full_rescan(&engine, &db, &login, max_depth).await {
                Ok(()) => info!("Full-fleet rescan finished"),
                Err(e) => error!("Full-fleet rescan failed: {e}"),
            }

            match sched.next_tick_for_job(uuid).await {
                Ok(Some(next_tick)) => info!("Next full-fleet rescan: {next_tick}"),
                Ok(None) => info!("Full-fleet rescan won't run again"),
                Err(e) => info!("Error finding next full-fleet rescan time: {e}"),
            }
        })
    }));

    sched
        .add(job.build().expect("Failed to build full-fleet rescan job"))
        .await
        .expect("Failed to create full-fleet rescan job");
    info!("Scheduled full-fleet rescan: '{}'", schedule.pattern);

    Some(
        async move {
            info!("Starting scheduler");
            sched.start().await
        }
        .boxed(),
    )
}

async fn run_full_rescan(engine: &SpiderEngine, db: &ConnectionPool, login: &str, max_depth: i32) -> Result<(), String> {
    let mut conn = db.get().map_err(|e| e.to_string())?;
    let job = ScanJob::create(&mut conn, ScanJobType::Full, None, max_depth).map_err(|e| e.to_string())?;
    drop(conn);

    engine.rescan_known_fleet(&job, login, |_| {}).await
}
