use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use appvault_core::config::{load_settings, parse_settings, save_settings, validate_settings};
use appvault_core::run_log::start_run_log;
use appvault_core::{
    APP_NAME, CloudClient, DirectoryCloudClient, Engine, EngineContext, MediumItem,
    PackageItem, ProgressSink, RunKind, RunOptions, RunReport, SecurityContext, Settings,
    ShellPackageManager, SqliteRecordStore, TransferGateway, WebDavClient,
};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "appvault")]
#[command(about = "AppVault CLI (app and media archive backend)", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    events: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
    Backup {
        #[command(subcommand)]
        cmd: TargetCmd,
    },
    Restore {
        #[command(subcommand)]
        cmd: TargetCmd,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
    Set,
}

#[derive(Subcommand)]
enum TargetCmd {
    Packages(RunArgs),
    Media(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// JSON array of items; backups write the recorded sizes back into it.
    #[arg(long)]
    manifest: PathBuf,

    #[arg(long)]
    run_id: Option<String>,

    /// Mirror archives to a locally mounted remote directory.
    #[arg(long, conflicts_with = "webdav")]
    remote_dir: Option<PathBuf>,

    /// Mirror archives to the WebDAV remote from the settings.
    #[arg(long)]
    webdav: bool,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

struct NdjsonProgressSink {
    task_id: String,
}

impl ProgressSink for NdjsonProgressSink {
    fn on_progress(&self, p: appvault_core::TaskProgress) {
        let line = serde_json::json!({
            "type": "task.progress",
            "taskId": self.task_id,
            "itemId": p.item_id,
            "dataType": p.data_type,
            "phase": p.phase,
            "bytesDone": p.bytes_done,
            "bytesTotal": p.bytes_total,
            "throughputBps": p.throughput_bps,
        });
        println!("{line}");
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| std::env::var("APPVAULT_CONFIG_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_config_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var("APPVAULT_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_data_dir);
    let out = Output {
        json: cli.json,
        events: cli.events,
    };

    match cli.cmd {
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&config_dir, out.json),
            SettingsCmd::Set => settings_set(&config_dir, out.json),
        },
        Command::Backup { cmd } => run_target(RunKind::Backup, cmd, &config_dir, &data_dir, out).await,
        Command::Restore { cmd } => {
            run_target(RunKind::Restore, cmd, &config_dir, &data_dir, out).await
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Output {
    json: bool,
    events: bool,
}

fn settings_get(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = load_settings(config_dir).map_err(map_core_err)?;
    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    } else {
        let text = toml::to_string(&settings)
            .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn settings_set(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let settings =
        parse_settings(&input).map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    validate_settings(&settings).map_err(map_core_err)?;
    save_settings(config_dir, &settings).map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    }
    Ok(())
}

async fn run_target(
    kind: RunKind,
    cmd: TargetCmd,
    config_dir: &Path,
    data_dir: &Path,
    out: Output,
) -> Result<(), CliError> {
    let settings = load_settings(config_dir).map_err(map_core_err)?;
    match cmd {
        TargetCmd::Packages(args) => {
            let mut items: Vec<PackageItem> = read_manifest(&args.manifest)?;
            let report = execute(kind, &settings, data_dir, &args, out, |engine, run_id, opts| {
                let items = items.clone();
                async move {
                    match kind {
                        RunKind::Backup => engine.backup_packages(&run_id, items, opts).await,
                        RunKind::Restore => engine.restore_packages(&run_id, items, opts).await,
                    }
                }
            })
            .await?;
            if kind == RunKind::Backup {
                for (item, result) in items.iter_mut().zip(&report.items) {
                    result.apply_recorded(&mut item.recorded);
                }
                write_manifest(&args.manifest, &items)?;
            }
            finish(&report, out)
        }
        TargetCmd::Media(args) => {
            let mut items: Vec<MediumItem> = read_manifest(&args.manifest)?;
            let report = execute(kind, &settings, data_dir, &args, out, |engine, run_id, opts| {
                let items = items.clone();
                async move {
                    match kind {
                        RunKind::Backup => engine.backup_media(&run_id, items, opts).await,
                        RunKind::Restore => engine.restore_media(&run_id, items, opts).await,
                    }
                }
            })
            .await?;
            if kind == RunKind::Backup {
                for (item, result) in items.iter_mut().zip(&report.items) {
                    if let Some(bytes) = result.slices.iter().find_map(|s| s.record_bytes) {
                        item.recorded_bytes = bytes;
                    }
                }
                write_manifest(&args.manifest, &items)?;
            }
            finish(&report, out)
        }
    }
}

/// Wires the engine for one run: record db, run log, optional remote and Ctrl-C.
async fn execute<F, Fut>(
    kind: RunKind,
    settings: &Settings,
    data_dir: &Path,
    args: &RunArgs,
    out: Output,
    start: F,
) -> Result<RunReport, CliError>
where
    F: FnOnce(Engine, String, RunOptions) -> Fut,
    Fut: std::future::Future<Output = appvault_core::Result<RunReport>>,
{
    let run_id = args
        .run_id
        .clone()
        .unwrap_or_else(|| format!("run_{}", uuid::Uuid::new_v4()));
    let _log = start_run_log(kind, &run_id, data_dir)
        .map_err(|e| CliError::new("log.open_failed", e.to_string()))?;

    let store = SqliteRecordStore::open(&data_dir.join("records.sqlite"))
        .await
        .map_err(map_core_err)?;
    let mut ctx = EngineContext::new(
        settings.clone(),
        Arc::new(store),
        Arc::new(ShellPackageManager::new()),
        security_context()?,
    );
    if out.events {
        ctx = ctx.with_progress(Arc::new(NdjsonProgressSink {
            task_id: run_id.clone(),
        }));
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!(event = "run.interrupted", "run.interrupted");
            on_signal.cancel();
        }
    });
    let opts = RunOptions {
        cancel: Some(cancel),
        gateway: gateway(settings, args)?,
    };

    if out.events {
        emit_state(&run_id, kind, "running");
    }
    let report = start(Engine::new(ctx), run_id.clone(), opts)
        .await
        .map_err(|e| {
            if out.events {
                emit_state(&run_id, kind, "failed");
            }
            map_core_err(e)
        })?;
    if out.events {
        let state = if report.summary.cancelled > 0 {
            "cancelled"
        } else if report.summary.failed > 0 {
            "failed"
        } else {
            "succeeded"
        };
        emit_state(&run_id, kind, state);
    }
    Ok(report)
}

fn emit_state(run_id: &str, kind: RunKind, state: &str) {
    println!(
        "{}",
        serde_json::json!({
            "type": "task.state",
            "taskId": run_id,
            "kind": kind,
            "state": state,
        })
    );
}

fn finish(report: &RunReport, out: Output) -> Result<(), CliError> {
    if out.json {
        println!(
            "{}",
            serde_json::to_string(report)
                .map_err(|e| CliError::new("report.encode_failed", e.to_string()))?
        );
    } else if !out.events {
        for item in &report.items {
            let slices = item
                .slices
                .iter()
                .map(|s| format!("{}={}", s.data_type, s.state))
                .collect::<Vec<_>>()
                .join(" ");
            println!("{} {slices}", item.item_id);
            for slice in item.slices.iter().filter(|s| s.is_error()) {
                for line in &slice.log {
                    println!("  {}: {line}", slice.data_type);
                }
            }
            for line in &item.log {
                println!("  {line}");
            }
        }
        println!(
            "succeeded={} failed={} cancelled={}",
            report.summary.succeeded, report.summary.failed, report.summary.cancelled
        );
    }

    if report.summary.cancelled > 0 {
        return Err(map_core_err(appvault_core::Error::Cancelled));
    }
    if report.summary.failed > 0 {
        return Err(CliError::new(
            "run.items_failed",
            format!("{} item(s) failed", report.summary.failed),
        )
        .with_details(serde_json::json!({ "runId": report.run_id })));
    }
    Ok(())
}

fn gateway(settings: &Settings, args: &RunArgs) -> Result<Option<TransferGateway>, CliError> {
    let client: Arc<dyn CloudClient> = if let Some(dir) = &args.remote_dir {
        Arc::new(DirectoryCloudClient::new(dir))
    } else if args.webdav {
        let remote = settings
            .webdav
            .as_ref()
            .ok_or_else(|| CliError::new("config.invalid", "webdav remote is not configured"))?;
        Arc::new(WebDavClient::new(remote))
    } else {
        return Ok(None);
    };
    Ok(Some(TransferGateway::new(client)))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn security_context() -> Result<Arc<dyn SecurityContext>, CliError> {
    Ok(Arc::new(appvault_core::LinuxSecurityContext::new()))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn security_context() -> Result<Arc<dyn SecurityContext>, CliError> {
    Err(CliError::new(
        "security.unavailable",
        "ownership and label restore only supported on Linux and Android",
    ))
}

fn read_manifest<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, CliError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| CliError::new("manifest.read_failed", e.to_string()))?;
    serde_json::from_str(&text).map_err(|e| CliError::new("manifest.invalid", e.to_string()))
}

fn write_manifest<T: Serialize>(path: &Path, items: &[T]) -> Result<(), CliError> {
    let text = serde_json::to_string_pretty(items)
        .map_err(|e| CliError::new("manifest.invalid", e.to_string()))?;
    atomic_write(path, text.as_bytes())
        .map_err(|e| CliError::new("manifest.write_failed", e.to_string()))
}

fn default_config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join(APP_NAME)
}

fn default_data_dir() -> PathBuf {
    default_config_dir()
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

fn map_core_err(e: appvault_core::Error) -> CliError {
    match e {
        appvault_core::Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        appvault_core::Error::Cloud { message } => CliError::retryable("cloud.unavailable", message),
        appvault_core::Error::PackageManager { message } => CliError::new("pm.failed", message),
        appvault_core::Error::Sqlite(e) => CliError::new("db.failed", e.to_string()),
        appvault_core::Error::Cancelled => CliError::new("task.cancelled", "cancelled"),
        other => CliError::new("unknown", other.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}
