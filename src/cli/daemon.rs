use anyhow::Result;
use console::style;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::context::{AppContext, telegram_token};
use crate::core::lifecycle::{LifecycleManager, RuntimeComponent};
use crate::core::terminal::{GuideSection, print_goodbye, print_info};
use crate::interfaces::telegram::TelegramInterface;
use crate::logging;
use crate::platform::{NativePlatform, Platform};

pub const LOG_FILE: &str = "switchyard.log";

/// Run the runtime loops in the foreground until Ctrl+C.
pub async fn run_daemon() -> Result<()> {
    let config = AppContext::load_config()?;
    let run_dir = AppContext::run_dir();
    std::fs::create_dir_all(&run_dir)?;
    NativePlatform::restrict_dir_permissions(&run_dir);
    let log_path = run_dir.join(LOG_FILE);
    logging::init(&config.log_level, Some(&log_path), false)?;

    let ctx = AppContext::open(config).await?;
    let runtime = ctx.runtime.clone();

    let mut lifecycle = LifecycleManager::new().await?;
    lifecycle.attach(Arc::new(Mutex::new(RuntimeComponent::new(runtime.clone()))));
    let telegram = telegram_token(&ctx.config);
    if let Some(token) = &telegram {
        lifecycle.attach(Arc::new(Mutex::new(TelegramInterface::new(
            token.clone(),
            ctx.config.notify.chat_id,
            runtime.bus().clone(),
        ))));
    }
    lifecycle
        .schedule_maintenance(&ctx.config.runtime.maintenance_cron, runtime.bus().clone())
        .await?;
    lifecycle.start().await?;

    GuideSection::new("switchyard daemon")
        .status("Status", &format!("{}", style("RUNNING").green().bold()))
        .status("Data", &ctx.data_dir.display().to_string())
        .status("Log", &log_path.display().to_string())
        .status(
            "Executors",
            &runtime.router().executors().names().join(", "),
        )
        .status(
            "Telegram",
            if telegram.is_some() { "connected" } else { "off" },
        )
        .blank()
        .text(&format!("Press {} to stop.", style("Ctrl+C").bold().yellow()))
        .print();
    println!();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    lifecycle.shutdown().await?;
    print_goodbye();
    Ok(())
}

pub async fn follow_logs(run_dir: &Path) -> Result<()> {
    let log_path = run_dir.join(LOG_FILE);
    if !log_path.exists() {
        print_info("No log file yet. Start the daemon with 'switchyard daemon'.");
        return Ok(());
    }
    let mut child = NativePlatform::tail_file(&log_path)?;
    tokio::signal::ctrl_c().await?;
    let _ = child.kill();
    let _ = child.wait();
    Ok(())
}
