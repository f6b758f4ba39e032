//! mastery CLI: operator interface to the mastery engine.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use mastery_engine::analytics::{BatchScheduler, MasteryEvaluator};
use mastery_engine::bus::{DeadLetterSink, EventSink, EventSource};
use mastery_engine::config::{Config, EngineConfig};
use mastery_engine::db::{Db, PgmqBus};
use mastery_engine::engine::{Consumer, ConsumerConfig};
use mastery_engine::ingest::Ingestor;
use mastery_engine::model::{LearningEvent, SubScores};
use mastery_engine::predict::Predictor;
use mastery_engine::resilience::Dependencies;
use mastery_engine::service::{CohortGroup, MasteryService};
use mastery_engine::store::{MasteryStore, StateStore};
use mastery_engine::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "mastery", about = "Mastery & analytics engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the event consumer and batch workers
    Serve {
        /// Deliveries per poll
        #[arg(long, default_value_t = 32)]
        batch_size: usize,
        /// Poll interval when the queue is empty (ms)
        #[arg(long, default_value_t = 1000)]
        poll_ms: u64,
        /// Seconds a read message stays invisible before redelivery
        #[arg(long, default_value_t = 60)]
        visibility_timeout: i32,
    },
    /// Learning event operations
    Event {
        #[command(subcommand)]
        action: EventAction,
    },
    /// Mastery record operations
    Mastery {
        #[command(subcommand)]
        action: MasteryAction,
    },
    /// Project a student's mastery of a component forward
    Predict {
        student_id: String,
        component: String,
        #[arg(long, default_value_t = 14)]
        horizon: u32,
    },
    /// Ranked recommendations for a student
    Recommend { student_id: String },
    /// Batch re-evaluation
    Batch {
        #[command(subcommand)]
        action: BatchAction,
    },
    /// Cohort analytics
    Cohort {
        #[command(subcommand)]
        action: CohortAction,
    },
    /// Dead-letter operations
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },
    /// Schedule erasure of every record of a student
    Erase {
        student_id: String,
        /// Seconds until the records disappear
        #[arg(long, default_value_t = 0)]
        ttl_secs: u64,
        /// Physically remove expired records afterwards
        #[arg(long)]
        purge: bool,
    },
}

#[derive(Subcommand)]
enum EventAction {
    /// Enqueue a learning event (or apply it directly with --ingest)
    Send {
        #[arg(long)]
        student: String,
        #[arg(long)]
        component: String,
        #[arg(long)]
        completion: f64,
        #[arg(long)]
        quiz: f64,
        #[arg(long)]
        quality: f64,
        #[arg(long)]
        consistency: f64,
        /// RFC 3339 timestamp; defaults to now
        #[arg(long)]
        occurred_at: Option<DateTime<Utc>>,
        /// Idempotency key; defaults to the event id
        #[arg(long)]
        key: Option<String>,
        /// Apply even if older than the current record
        #[arg(long)]
        correction: bool,
        /// Ingest synchronously instead of enqueueing
        #[arg(long)]
        ingest: bool,
    },
}

#[derive(Subcommand)]
enum MasteryAction {
    /// Show every component record of a student
    Show { student_id: String },
}

#[derive(Subcommand)]
enum BatchAction {
    /// Evaluate students now and print the job
    Run {
        /// HIGH, NORMAL or LOW
        #[arg(long, default_value = "normal")]
        priority: String,
        #[arg(required = true)]
        students: Vec<String>,
    },
}

#[derive(Subcommand)]
enum CohortAction {
    /// Compare groups given as name=student1,student2,...
    Compare {
        #[arg(long = "group", required = true)]
        groups: Vec<String>,
        /// Compare one component instead of the per-student mean
        #[arg(long)]
        component: Option<String>,
    },
}

#[derive(Subcommand)]
enum DlqAction {
    /// Re-attempt parked dead letters
    Redrive {
        #[arg(long, default_value_t = 100)]
        max: usize,
    },
}

/// Everything wired against Postgres.
struct Runtime {
    config: Arc<EngineConfig>,
    db: Arc<Db>,
    bus: Arc<PgmqBus>,
    deps: Dependencies,
    store: MasteryStore,
    ingestor: Arc<Ingestor>,
    predictor: Arc<Predictor>,
    service: MasteryService,
}

impl Runtime {
    async fn connect(config: &Config, visibility_timeout: i32) -> anyhow::Result<Self> {
        let engine = Arc::new(config.engine()?);
        let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
        db.migrate().await?;
        db.ensure_queues().await?;

        let deps = Dependencies::from_config(&engine);
        let bus = Arc::new(PgmqBus::new(Arc::clone(&db), visibility_timeout));
        let store = MasteryStore::new(
            Arc::clone(&db) as Arc<dyn StateStore>,
            deps.store.clone(),
        );
        let ingestor = Arc::new(Ingestor::new(
            store.clone(),
            Arc::clone(&bus) as Arc<dyn EventSink>,
            Arc::clone(&bus) as Arc<dyn DeadLetterSink>,
            deps.bus.clone(),
            engine.ingest.clone(),
        ));
        let predictor = Arc::new(Predictor::new(engine.predictor.clone()));
        let scheduler = BatchScheduler::new(
            Arc::new(MasteryEvaluator::new(
                store.clone(),
                Arc::clone(&predictor),
                engine.recommend.clone(),
            )),
            engine.batch.clone(),
        );
        let service = MasteryService::new(
            store.clone(),
            Arc::clone(&predictor),
            scheduler,
            Arc::clone(&engine),
        );

        Ok(Self {
            config: engine,
            db,
            bus,
            deps,
            store,
            ingestor,
            predictor,
            service,
        })
    }

    fn consumer(&self, config: ConsumerConfig) -> Consumer {
        Consumer::new(
            Arc::clone(&self.bus) as Arc<dyn EventSource>,
            Arc::clone(&self.bus) as Arc<dyn DeadLetterSink>,
            Arc::clone(&self.ingestor),
            self.deps.bus.clone(),
            config,
        )
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    if let Command::Serve {
        batch_size,
        poll_ms,
        visibility_timeout,
    } = cli.command
    {
        return cmd_serve(&config, batch_size, poll_ms, visibility_timeout).await;
    }

    let rt = Runtime::connect(&config, 60).await?;
    match cli.command {
        Command::Serve { .. } => Ok(()),
        Command::Event {
            action:
                EventAction::Send {
                    student,
                    component,
                    completion,
                    quiz,
                    quality,
                    consistency,
                    occurred_at,
                    key,
                    correction,
                    ingest,
                },
        } => {
            let event_id = Uuid::new_v4().to_string();
            let event = LearningEvent {
                idempotency_key: key.unwrap_or_else(|| event_id.clone()),
                event_id,
                student_id: student,
                component,
                scores: SubScores::new(completion, quiz, quality, consistency),
                occurred_at: occurred_at.unwrap_or_else(Utc::now),
                correction,
            };
            if ingest {
                let ingested = rt.ingestor.ingest(&event).await?;
                println!("{}", ingested.disposition.as_str());
                print_json(&ingested.record)
            } else {
                event.validate()?;
                let msg_id = rt.bus.send_event(&event).await?;
                println!("Enqueued: {} (msg {msg_id})", event.event_id);
                Ok(())
            }
        }
        Command::Mastery {
            action: MasteryAction::Show { student_id },
        } => print_json(&rt.service.get_mastery(&student_id).await?),
        Command::Predict {
            student_id,
            component,
            horizon,
        } => print_json(
            &rt.service
                .get_prediction(&student_id, &component, horizon)
                .await?,
        ),
        Command::Recommend { student_id } => {
            print_json(&rt.service.get_recommendations(&student_id).await?)
        }
        Command::Batch {
            action: BatchAction::Run { priority, students },
        } => {
            let batch_id = rt.service.submit_batch(students, &priority)?;
            rt.service.scheduler().run_until_idle().await?;
            print_json(&rt.service.get_batch_status(&batch_id.to_string())?)
        }
        Command::Cohort {
            action: CohortAction::Compare { groups, component },
        } => {
            let groups = groups
                .iter()
                .map(|raw| parse_group(raw))
                .collect::<anyhow::Result<Vec<_>>>()?;
            print_json(
                &rt.service
                    .compare_cohorts(&groups, component.as_deref())
                    .await?,
            )
        }
        Command::Dlq {
            action: DlqAction::Redrive { max },
        } => {
            let summary = rt.consumer(ConsumerConfig::default()).redrive(max).await?;
            println!(
                "taken {}, recovered {}, backfilled {}, parked again {}, quarantined {}",
                summary.taken,
                summary.recovered,
                summary.backfilled,
                summary.parked_again,
                summary.quarantined
            );
            Ok(())
        }
        Command::Erase {
            student_id,
            ttl_secs,
            purge,
        } => {
            let scheduled = rt
                .service
                .erase_student(&student_id, Duration::from_secs(ttl_secs))
                .await?;
            println!("Scheduled {scheduled} record(s) for erasure");
            if purge {
                let purged = rt.store.purge_expired().await?;
                println!("Purged {purged} expired record(s)");
            }
            Ok(())
        }
    }
}

/// `name=s1,s2,s3`
fn parse_group(raw: &str) -> anyhow::Result<CohortGroup> {
    let (name, students) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("group must look like name=student1,student2: {raw}"))?;
    Ok(CohortGroup {
        name: name.trim().to_string(),
        student_ids: students
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
    })
}

async fn cmd_serve(
    config: &Config,
    batch_size: usize,
    poll_ms: u64,
    visibility_timeout: i32,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::from_config(config, "mastery-engine"))?;

    let rt = Runtime::connect(config, visibility_timeout).await?;
    rt.db.health_check().await?;
    let poll_interval = Duration::from_millis(poll_ms);

    let consumer = rt.consumer(ConsumerConfig {
        batch_size,
        poll_interval,
        ..ConsumerConfig::default()
    });
    let scheduler = rt.service.scheduler().clone();

    let (c, s) = (consumer.clone(), scheduler.clone());
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("interrupt received");
        c.shutdown();
        s.shutdown();
    });

    // Housekeeping: expired erasures, stale predictions, finished batches.
    let (store, predictor, jobs) = (
        rt.store.clone(),
        Arc::clone(&rt.predictor),
        scheduler.clone(),
    );
    let sweep_every = rt.config.predictor.cache_ttl().max(Duration::from_secs(60));
    let housekeeping = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(n) => info!(purged = n, "expired records purged"),
                Err(e) => warn!("purge failed: {e}"),
            }
            predictor.evict_expired();
            let evicted = jobs.evict_finished();
            if evicted > 0 {
                info!(evicted, "finished batches evicted");
            }
        }
    });

    let workers = tokio::spawn(async move { scheduler.run(poll_interval).await });
    consumer.run().await?;
    housekeeping.abort();
    workers.await??;
    Ok(())
}
