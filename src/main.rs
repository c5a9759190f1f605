use anyhow::Context;
use log::{error, info, LevelFilter};
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify, RwLock};

mod error;
mod events;
mod models;
mod services;
mod utils;

use error::Error;
use events::EventBus;
use models::settings::Settings;
use services::auth_service::AuthState;
use services::channel_service::ChannelService;
use services::cookie_jar_service::CookieJarService;
use services::gql_service::GqlClient;
use services::http_service::HttpClient;
use services::mining_service::MiningService;
use services::watch_service::WatchService;
use services::websocket_service::WsPool;

/// Writes log lines to stderr and the per-run log file.
struct TeeWriter {
    file: std::fs::File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stderr().write_all(buf)?;
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()?;
        self.file.flush()
    }
}

fn init_logging(logs_dir: &std::path::Path) -> anyhow::Result<()> {
    let timestamp = chrono::Local::now().format("%Y-%m-%dT%H-%M-%S");
    let log_path = logs_dir.join(format!("drops-miner.{timestamp}.log"));
    let file = std::fs::File::create(&log_path)
        .with_context(|| format!("creating log file {}", log_path.display()))?;
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_millis()
        .target(env_logger::Target::Pipe(Box::new(TeeWriter { file })))
        .init();
    info!("Logging to {}", log_path.display());
    Ok(())
}

fn main() -> ExitCode {
    let data_dir = utils::paths::data_dir();
    if let Err(e) = utils::paths::ensure_layout(&data_dir) {
        eprintln!("Failed to create data directory {}: {e}", data_dir.display());
        return ExitCode::from(3);
    }
    if let Err(e) = init_logging(&utils::paths::logs_dir(&data_dir)) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::from(3);
    }

    let settings_path = utils::paths::settings_path(&data_dir);
    let settings = match Settings::load(&settings_path) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Settings error: {e:#}");
            return ExitCode::from(3);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };
    match runtime.block_on(run(data_dir, settings_path, settings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Login(_)) | Err(Error::CaptchaRequired) => ExitCode::from(2),
        Err(Error::ExitRequest) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(
    data_dir: std::path::PathBuf,
    settings_path: std::path::PathBuf,
    settings: Settings,
) -> Result<(), Error> {
    info!("=== drops-miner v{} starting ===", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {}", data_dir.display());
    info!("Control surface port: {}", utils::paths::control_port());

    let bus = EventBus::new();
    let jar = Arc::new(CookieJarService::new(utils::paths::cookies_path(&data_dir)));
    let proxy = (!settings.proxy.is_empty()).then(|| settings.proxy.clone());
    let http = Arc::new(HttpClient::new(jar, proxy, bus.shutdown_rx()).await?);
    let auth = Arc::new(AuthState::new(http.clone(), bus.clone()));
    let gql = Arc::new(GqlClient::new(http.clone(), auth.clone()));
    let channel_service = Arc::new(ChannelService::new(gql.clone()));
    let settings = Arc::new(RwLock::new(settings));

    let (ws_tx, ws_rx) = mpsc::unbounded_channel();
    let (watch_signal_tx, watch_signal_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (target_tx, target_rx) = watch::channel(None);
    let restart_watching = Arc::new(Notify::new());

    let ws_pool = Arc::new(WsPool::new(auth.clone(), ws_tx, bus.shutdown_rx()));

    // the web control surface plugs in here: it subscribes to `bus` for
    // push events and feeds ControlRequests through this sender
    let _control_tx = control_tx;

    // ctrl-c / SIGTERM flip the shutdown flag every task observes
    let signal_bus = bus.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_bus.shutdown();
        }
    });

    // login happens inside the mining loop; the watch loop needs the user
    // id for its payloads, so it starts once auth has settled
    let miner = MiningService::new(
        bus.clone(),
        http.clone(),
        auth.clone(),
        gql,
        channel_service.clone(),
        ws_pool,
        settings.clone(),
        settings_path,
        ws_rx,
        control_rx,
        watch_signal_rx,
        target_tx,
        restart_watching.clone(),
    );

    let watch_http = http.clone();
    let watch_auth = auth.clone();
    let watch_bus = bus.clone();
    let watch_task = tokio::spawn(async move {
        watch_auth.wait_until_logged_in().await;
        let Some(user_id) = watch_auth.user_id().await else {
            return;
        };
        let service = WatchService::new(
            watch_http,
            channel_service,
            settings,
            target_rx,
            watch_signal_tx,
            restart_watching,
            watch_bus.shutdown_rx(),
            user_id,
        );
        service.run().await;
    });

    let result = miner.run().await;

    bus.shutdown();
    watch_task.abort();
    http.jar().save().await.ok();
    info!("=== drops-miner stopped ===");
    result
}
