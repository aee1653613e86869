use chrono::Local;
use color_eyre::{eyre::eyre, Result};
use hass_device::config::Settings;
use hass_device::device::{Device, Handler};
use hass_device::scheduler::Interval;
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(Settings::default_path);
    let settings = Settings::load_or_create(&path).await?;
    info!("Using settings from {}", path.display());

    let device = Device::with_options(settings.device.clone(), settings.device_options())
        .map_err(|e| eyre!("Failed to create device: {}", e))?;

    if settings.runtime.status_interval_secs > 0 {
        let started = Local::now();
        device
            .on_interval(
                Interval::seconds(settings.runtime.status_interval_secs),
                Handler::cooperative(move |device, _| async move {
                    let uptime = Local::now().signed_duration_since(started);
                    let status = format!("up {}s", uptime.num_seconds());
                    if let Err(e) = device.set_status(status, true).await {
                        error!("Failed to publish status: {}", e);
                    }
                }),
            )
            .map_err(|e| eyre!("Failed to schedule status updates: {}", e))?;
    }

    let options = settings.connect_options()?;
    let runner = device.handle();
    let mut run = tokio::spawn(async move { runner.run(options).await });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
        }
        finished = &mut run => {
            finished
                .map_err(|e| eyre!("Device task failed: {}", e))?
                .map_err(|e| eyre!("Device run failed: {}", e))?;
            return Ok(());
        }
    }
    info!("Shutting down");

    if let Err(e) = device.destroy_discovery().await {
        error!("Failed to remove discovery: {}", e);
    }
    device
        .stop()
        .await
        .map_err(|e| eyre!("Failed to stop device: {}", e))?;
    run.await
        .map_err(|e| eyre!("Device task failed: {}", e))?
        .map_err(|e| eyre!("Device run failed: {}", e))?;

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
