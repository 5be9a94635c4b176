use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;
use tracing::{error, info, warn};

use conveyor::app::Application;
use conveyor::commands::register_builtin_commands;
use conveyor::shutdown::ShutdownManager;
use conveyor_core::{command::CommandRegistry, config::AppConfig, logging::init_logging};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("conveyor")
        .version("1.0.0")
        .about("异步作业编排引擎")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["standalone", "embedded"])
                .default_value("standalone"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mode = matches.get_one::<String>("mode").expect("有默认值");

    let config = match mode.as_str() {
        "embedded" => AppConfig::embedded_default(),
        _ => AppConfig::load(config_path.map(std::path::Path::new))
            .context("加载配置失败")?,
    };

    init_logging(&config.logging)?;

    info!("启动作业编排引擎，运行模式: {}", mode);
    if let Some(path) = config_path {
        info!("配置文件: {}", path);
    }

    let mut registry = CommandRegistry::new();
    register_builtin_commands(&mut registry)?;

    let shutdown_timeout = config.dispatcher.shutdown_timeout_seconds;
    let app = Application::new(config, registry).await?;

    let shutdown_manager = ShutdownManager::new();
    let app_handle = {
        let shutdown_tx = shutdown_manager.sender();
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_tx).await {
                error!("应用运行失败: {e}");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(Duration::from_secs(shutdown_timeout + 5), app_handle).await {
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("作业编排引擎已退出");
    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("安装Ctrl+C信号处理器失败");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("安装SIGTERM信号处理器失败")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
