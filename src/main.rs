use std::path::PathBuf;

use anyhow::Context;
use ecoflow_bridge::{
    BluestTransport, Config, ConnectionSupervisor, LogSink, MqttSink, Sink, SupervisorError,
    SupervisorSettings,
};
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ecoflow_bridge=info")),
        )
        .init();

    info!("Starting ecoflow-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(std::env::args_os().nth(1).map(PathBuf::from))
        .context("Failed to load configuration")?;
    let settings = SupervisorSettings::from_config(&config)?;

    let sink: Box<dyn Sink> = if config.mqtt.enabled {
        Box::new(MqttSink::connect(&config.mqtt))
    } else {
        info!("MQTT disabled, readings are only logged");
        Box::new(LogSink)
    };

    let transport = BluestTransport::new().await?;

    let (stop, shutdown) = watch::channel(false);
    let supervisor = ConnectionSupervisor::new(
        transport,
        sink,
        settings,
        config.publish.min_interval(),
        &config.publish.topic_prefix,
        shutdown,
    );
    let mut supervisor = tokio::spawn(supervisor.run());

    tokio::select! {
        result = shutdown_signal() => {
            result.context("Failed to listen for shutdown signals")?;
            info!("Shutdown requested");
        }
        // The supervisor only stops on its own when the device is unusable
        result = &mut supervisor => return finish(result),
    }

    stop.send_replace(true);
    finish(supervisor.await)
}

fn finish(result: Result<Result<(), SupervisorError>, JoinError>) -> anyhow::Result<()> {
    result.context("Supervisor task failed")??;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    // systemd stops the service with SIGTERM
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
