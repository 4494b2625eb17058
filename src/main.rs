//! Admin CLI for the sync service.
//!
//! Stands in for the HTTP admin surface the core library leaves out of
//! scope: `start`/`stop`/`status`/`logs`/`reset`/`delete` subcommands, all
//! backed by the same `TaskManager` operations an HTTP handler would call.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread;

use log::{error, info};

use binlog_doc_sync::checkpoint::CheckpointStore;
use binlog_doc_sync::config::TaskConfig;
use binlog_doc_sync::config_store::ConfigStore;
use binlog_doc_sync::introspector::{MySqlFullSyncSource, MySqlIntrospector};
use binlog_doc_sync::sink::MongoSink;
use binlog_doc_sync::source::{MySqlBinlogSource, SourceOptions};
use binlog_doc_sync::supervisor::{SourceOpener, Supervisor};
use binlog_doc_sync::task_manager::TaskRunner;
use binlog_doc_sync::tasklog::TaskLog;
use binlog_doc_sync::worker::{SyncWorker, WorkerStatus};
use binlog_doc_sync::TaskManager;

struct MySqlSourceOpener {
    host: String,
    port: u16,
    user: String,
    password: String,
    server_id: u32,
}

impl SourceOpener for MySqlSourceOpener {
    fn open(
        &self,
        position: Option<(String, u64)>,
    ) -> binlog_doc_sync::Result<Box<dyn binlog_doc_sync::source::BinlogSource>> {
        let (start_log_file, start_log_pos) = position.unwrap_or_default();
        let source = MySqlBinlogSource::connect(SourceOptions {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            server_id: self.server_id,
            start_log_file,
            start_log_pos: start_log_pos as u32,
        })?;
        Ok(Box::new(source))
    }
}

fn mysql_opts(conf: &TaskConfig, database: &str) -> mysql::OptsBuilder {
    mysql::OptsBuilder::new()
        .ip_or_hostname(conf.mysql_conf.host.clone())
        .tcp_port(conf.mysql_conf.port.unwrap_or(3306))
        .user(Some(conf.mysql_conf.user.clone()))
        .pass(Some(conf.mysql_conf.password.clone()))
        .db_name(Some(database.to_string()))
}

fn mongo_database(conf: &TaskConfig) -> binlog_doc_sync::Result<mongodb::sync::Database> {
    use binlog_doc_sync::error::SyncError;

    let hosts = conf
        .mongo_conf
        .hosts
        .clone()
        .unwrap_or_else(|| vec![conf.mongo_conf.host.clone().unwrap_or_else(|| "127.0.0.1".into())]);
    let port = conf.mongo_conf.port.unwrap_or(27017);
    let host_list = hosts
        .iter()
        .map(|h| if h.contains(':') { h.clone() } else { format!("{h}:{port}") })
        .collect::<Vec<_>>()
        .join(",");

    let mut uri = format!(
        "mongodb://{}:{}@{}/{}?authSource={}&maxPoolSize={}&connectTimeoutMS={}&socketTimeoutMS={}",
        conf.mongo_conf.user,
        conf.mongo_conf.password,
        host_list,
        conf.mongo_conf.database.as_deref().unwrap_or("sync_db"),
        conf.mongo_conf.auth_source,
        conf.mongo_max_pool_size,
        conf.mongo_connect_timeout_ms,
        conf.mongo_socket_timeout_ms,
    );
    if let Some(rs) = &conf.mongo_conf.replica_set {
        uri.push_str(&format!("&replicaSet={rs}"));
    }

    let client = mongodb::sync::Client::with_uri_str(&uri)
        .map_err(|e| SyncError::source_transient(format!("mongo connect failed: {e}")))?;
    Ok(client.database(conf.mongo_conf.database.as_deref().unwrap_or("sync_db")))
}

/// Drives one task end to end: full sync when no checkpoint exists, then the
/// supervised incremental loop. Mirrors `SyncWorker.run` in the source.
struct MySqlTaskRunner;

impl TaskRunner for MySqlTaskRunner {
    fn run(
        &self,
        config: TaskConfig,
        checkpoints: Arc<CheckpointStore>,
        task_log: Arc<TaskLog>,
        stop: Arc<AtomicBool>,
        status: Arc<Mutex<WorkerStatus>>,
    ) {
        let task_id = config.task_id.clone();
        if let Err(e) = run_task(config, checkpoints, task_log, stop, status) {
            error!("task={task_id} exited with error: {e}");
        }
    }
}

fn run_task(
    config: TaskConfig,
    checkpoints: Arc<CheckpointStore>,
    task_log: Arc<TaskLog>,
    stop: Arc<AtomicBool>,
    status: Arc<Mutex<WorkerStatus>>,
) -> binlog_doc_sync::Result<()> {
    let task_id = config.task_id.clone();
    let mysql_database = config
        .mysql_conf
        .database
        .clone()
        .ok_or_else(|| binlog_doc_sync::SyncError::config_invalid("mysql_conf.database required"))?;

    let introspector: Arc<dyn binlog_doc_sync::introspector::Introspector> = Arc::new(MySqlIntrospector::new(
        mysql_opts(&config, &mysql_database),
        config.pk_field.clone(),
        config.unknown_col_fix_enabled,
        config.unknown_col_schema_cache_sec,
        config.auto_discover_only_base_table,
    ));
    let full_sync_source = MySqlFullSyncSource::new(mysql_opts(&config, &mysql_database), config.pk_field.clone());
    let sink: Arc<dyn binlog_doc_sync::sink::Sink> = Arc::new(MongoSink::new(
        mongo_database(&config)?,
        config.mongo_write_w,
        config.mongo_write_j,
    ));

    let mut worker = SyncWorker::new(config.clone(), Arc::clone(&checkpoints), Arc::clone(&task_log));
    worker.set_stop_flag(Arc::clone(&stop));
    worker.auto_build_table_map_if_needed(introspector.as_ref())?;

    let existing = checkpoints.load(&task_id)?;
    let start = match existing {
        Some(cp) => Some((cp.log_file, cp.log_pos)),
        None => {
            info!("task={task_id} no checkpoint, starting full sync");
            *status.lock().unwrap() = worker.status(binlog_doc_sync::worker::Phase::FullSync);
            worker.run_full_sync(&full_sync_source, sink.as_ref())?;
            None
        }
    };

    *status.lock().unwrap() = worker.status(binlog_doc_sync::worker::Phase::IncSync);
    let opener = MySqlSourceOpener {
        host: config.mysql_conf.host.clone().unwrap_or_else(|| "127.0.0.1".into()),
        port: config.mysql_conf.port.unwrap_or(3306),
        user: config.mysql_conf.user.clone(),
        password: config.mysql_conf.password.clone(),
        server_id: 100 + (std::process::id() % 10_000),
    };
    let supervisor = Supervisor::new(
        task_id.clone(),
        Arc::clone(&checkpoints),
        config.inc_reconnect_backoff_base_sec,
        config.inc_reconnect_backoff_max_sec,
        config.inc_reconnect_max_retry,
    );
    let result = supervisor.run_inc_sync_with_reconnect(&mut worker, &opener, sink, introspector, start);
    *status.lock().unwrap() = worker.status(binlog_doc_sync::worker::Phase::Stopped);
    result
}

fn usage() {
    println!("binlog-doc-sync - continuous MySQL-binlog to MongoDB replication");
    println!();
    println!("Usage: binlog-doc-sync [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("Commands:");
    println!("  start <config.json>   Start a task from a config file, then block");
    println!("  stop <task_id>        Stop a running task");
    println!("  status [task_id]      Print status for one or all tasks");
    println!("  logs <task_id>        Print a task's log file");
    println!("  reset <task_id>       Clear a task's checkpoint");
    println!("  delete <task_id>      Stop and remove a task entirely");
    println!();
    println!("Options:");
    println!("  -d, --data-dir DIR    Data directory (default: ./data)");
    println!("  -h, --help            Show this help");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let mut data_dir = PathBuf::from("./data");
    let mut positional = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--data-dir" | "-d" => {
                if i + 1 < args.len() {
                    data_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--help" | "-h" => {
                usage();
                return Ok(());
            }
            other => positional.push(other.to_string()),
        }
        i += 1;
    }

    let Some(command) = positional.first().cloned() else {
        usage();
        return Ok(());
    };

    let configs = Arc::new(ConfigStore::new(data_dir.join("configs")));
    let checkpoints = Arc::new(CheckpointStore::new(data_dir.join("state")));
    let task_log = Arc::new(TaskLog::new(data_dir.join("logs")));
    let manager = Arc::new(TaskManager::new(
        Arc::new(MySqlTaskRunner),
        Arc::clone(&configs),
        Arc::clone(&checkpoints),
        Arc::clone(&task_log),
    ));

    match command.as_str() {
        "start" => {
            let path = positional.get(1).ok_or("start requires a config file path")?;
            let bytes = std::fs::read(path)?;
            let config: TaskConfig = serde_json::from_slice(&bytes)?;
            manager.start(config)?;
            info!("task started, blocking (ctrl-c to stop)");
            loop {
                thread::sleep(std::time::Duration::from_secs(3600));
            }
        }
        "stop" => {
            let task_id = positional.get(1).ok_or("stop requires a task id")?;
            manager.stop(task_id);
        }
        "status" => {
            if let Some(task_id) = positional.get(1) {
                match manager.status(task_id)? {
                    Some(status) => println!("{status:?}"),
                    None => println!("no such task: {task_id}"),
                }
            } else {
                for status in manager.status_all()? {
                    println!("{status:?}");
                }
            }
        }
        "logs" => {
            let task_id = positional.get(1).ok_or("logs requires a task id")?;
            for line in task_log.read(task_id, 0, 1000)? {
                println!("{line}");
            }
        }
        "reset" => {
            let task_id = positional.get(1).ok_or("reset requires a task id")?;
            manager.reset(task_id)?;
        }
        "delete" => {
            let task_id = positional.get(1).ok_or("delete requires a task id")?;
            manager.delete(task_id)?;
        }
        other => {
            eprintln!("unknown command: {other}");
            usage();
        }
    }

    Ok(())
}
