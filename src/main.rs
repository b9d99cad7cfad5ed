use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upload_orchestrator::config::{Config, config_path};
use upload_orchestrator::upload::{
    CredentialProvider, HttpStatusOracle, HttpTransferChannel, StaticToken, UploadEvent,
    UploadManager, UploadState, Payload,
};

// 原始模式下需要手动回车
macro_rules! say {
    ($($arg:tt)*) => {
        print!("{}\r\n", format!($($arg)*))
    };
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(err) = run().await {
        error!("Fatal error: {:#}", err);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let path = config_path();
    info!("Loading configuration from {:?}", path);
    let config = Config::load_config(&path)?;

    let credentials: Arc<dyn CredentialProvider> = Arc::new(StaticToken::new(config.token.clone()));
    let channel = HttpTransferChannel::new(&config.endpoint, credentials.clone())
        .context("Failed to create transfer channel")?;
    let oracle = HttpStatusOracle::new(&config.endpoint, credentials)
        .context("Failed to create status oracle")?;

    let handle = UploadManager::builder(Arc::new(channel), Arc::new(oracle))
        .timings(config.timings.clone())?
        .spawn();
    let manager = handle.manager.clone();

    let mut files = Vec::new();
    for file in &config.files {
        match Payload::from_path(file).await {
            Ok(payload) => files.push(payload),
            Err(err) => warn!("Skipping {:?}: {}", file, err),
        }
    }

    if !files.is_empty() {
        match manager.enqueue(files, config.policy.clone()).await {
            Ok(outcome) => {
                info!("{} file(s) queued", outcome.accepted.len());
                for rejected in outcome.rejected {
                    warn!("Rejected {}", rejected);
                }
            }
            Err(err) => warn!("{}", err),
        }
    }

    let printer = tokio::spawn(print_events(manager.subscribe_events()));
    let result = handle_keyboard(&manager).await;

    printer.abort();
    drop(manager);
    handle.shutdown().await?;

    result
}

/// Read keys on a blocking thread and forward presses.
fn spawn_key_reader() -> mpsc::Receiver<KeyCode> {
    let (key_tx, key_rx) = mpsc::channel(16);

    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        loop {
            if event::poll(Duration::from_millis(100))? {
                if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                    if kind != KeyEventKind::Press {
                        continue;
                    }
                    if key_tx.blocking_send(code).is_err() || code == KeyCode::Char('q') {
                        return Ok(());
                    }
                }
            }
        }
    });

    key_rx
}

async fn handle_keyboard(manager: &UploadManager) -> anyhow::Result<()> {
    enable_raw_mode()?;
    print_help();

    let result = keyboard_loop(manager, spawn_key_reader()).await;

    disable_raw_mode()?;
    result
}

async fn keyboard_loop(manager: &UploadManager, mut keys: mpsc::Receiver<KeyCode>) -> anyhow::Result<()> {
    while let Some(code) = keys.recv().await {
        match code {
            KeyCode::Char('q') => {
                say!("Quitting...");
                break;
            }
            KeyCode::Char('s') => {
                let started = manager.start_all().await?;
                say!("Started {} upload(s)", started.len());
            }
            KeyCode::Char('a') => {
                for task in manager.get_all_tasks().await? {
                    if task.state.is_in_flight() {
                        manager.abort(task.id).await?;
                    }
                }
            }
            KeyCode::Char('r') => {
                for task in manager.get_all_tasks().await? {
                    if task.state == UploadState::Error {
                        if let Err(err) = manager.retry(task.id).await {
                            say!("Cannot retry {}: {}", task.payload.file_name, err);
                        }
                    }
                }
            }
            KeyCode::Char('c') => {
                let removed = manager.clear_all().await?;
                say!("Removed {} task(s)", removed);
            }
            KeyCode::Char('l') => {
                say!("============== All Task ==============");
                for task in manager.get_all_tasks().await? {
                    say!(
                        "{} {:?} {}% {}",
                        task.payload.file_name,
                        task.state,
                        task.progress.unwrap_or(0),
                        task.error_detail().unwrap_or_default()
                    );
                }
                let summary = manager.summary().await?;
                say!(
                    "total {} / completed {} / errored {} ({:.0}%)",
                    summary.total,
                    summary.completed,
                    summary.errored,
                    summary.overall_progress_percent
                );
            }
            KeyCode::Char('h') => print_help(),
            _ => {}
        }
    }

    Ok(())
}

fn print_help() {
    say!("[s] start all  [l] list  [a] abort in-flight  [r] retry failed  [c] clear  [q] quit");
}

async fn print_events(mut events: broadcast::Receiver<UploadEvent>) {
    loop {
        match events.recv().await {
            Ok(UploadEvent::Progress { task_id, percent }) => say!("{} {}%", task_id, percent),
            Ok(UploadEvent::StateChanged { task_id, old_state, new_state }) => {
                say!("{} {:?} -> {:?}", task_id, old_state, new_state)
            }
            Ok(UploadEvent::Completed { task_id, remote_id }) => say!("{} ready as {}", task_id, remote_id),
            Ok(UploadEvent::Failed { task_id, failure }) => say!("{} failed: {}", task_id, failure),
            Ok(UploadEvent::AllSettled { total, completed, errored }) => {
                say!("All settled: {} completed, {} failed, {} total", completed, errored, total)
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => warn!("Skipped {} events", skipped),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
