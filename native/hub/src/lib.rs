//! This `hub` crate is the
//! entry point of the Rust logic.

use std::path::{Path, PathBuf};

use adb::host::AdbHostTransport;
use anyhow::{Context, Result};
use const_format::concatcp;
use logging::SignalLayer;
use mimalloc::MiMalloc;
use models::signals::system::RustPanic;
use provision::{
    Provisioner,
    dart::{DartObserver, receive_commands},
};
use rinf::RustSignal;
use settings::SettingsHandler;
use time::macros::format_description;
use tokio_stream::wrappers::WatchStream;
use tracing::{Instrument, error, info, info_span};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter, fmt, fmt::time::LocalTime, layer::SubscriberExt, util::SubscriberInitExt,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

rinf::write_interface!();

pub mod adb;
pub mod downloader;
pub mod error;
pub mod logging;
pub mod models;
pub mod provision;
pub mod settings;
pub mod utils;

#[cfg(test)]
mod testing;

pub const USER_AGENT: &str = concatcp!("Provisioner/", env!("CARGO_PKG_VERSION"));

const DEFAULT_LOG_FILTER: &str = "debug,hyper_util=info,reqwest=info,rustls=info";

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        let message = format!("{panic_info}\n{backtrace}");
        error!(message, "Rust panic");
        RustPanic { message }.send_signal_to_dart();
        original_hook(panic_info);
    }));

    let app_dir = match prepare_app_dir() {
        Ok(dir) => dir,
        Err(e) => panic!("Failed to prepare app directory: {e:#}"),
    };

    let _guard = match setup_logging(&app_dir.join("logs")) {
        Ok(guard) => Some(guard),
        Err(e) => {
            rinf::debug_print!("Failed to setup logging: {:#}", e);
            None
        }
    };

    info!(version = env!("CARGO_PKG_VERSION"), "Starting provisioner backend");

    let settings_handler = SettingsHandler::new(app_dir);
    let transport = AdbHostTransport::new(WatchStream::new(settings_handler.subscribe())).await;
    let provisioner = Provisioner::new(transport, DartObserver::new(), settings_handler.subscribe());
    provisioner.publish_state().await;
    tokio::spawn(
        receive_commands(provisioner.clone()).instrument(info_span!("task_receive_commands")),
    );

    // Keep the main function running until Dart shutdown.
    rinf::dart_shutdown().await;
    info!("Dart shutdown, releasing device session");
    provisioner.disconnect().await;
}

fn prepare_app_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().context("Failed to get data directory")?;
    let app_dir = data_dir.join("Provisioner");
    std::fs::create_dir_all(&app_dir)
        .with_context(|| format!("Failed to create {}", app_dir.display()))?;
    Ok(app_dir)
}

fn setup_logging(logs_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir).context("Failed to create logs directory")?;
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(10)
        .filename_prefix("provisioner_native")
        .filename_suffix("log")
        .build(logs_dir)
        .context("Failed to initialize file appender")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let timer = LocalTime::new(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
    ));
    let file_layer = fmt::layer().with_ansi(false).with_timer(timer).with_writer(non_blocking);

    let (signal_layer, receiver) = SignalLayer::new();
    SignalLayer::start_forwarder(receiver);
    SignalLayer::start_request_handler(logs_dir.to_path_buf());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(signal_layer)
        .try_init()
        .context("Failed to set global subscriber")?;
    Ok(guard)
}
