use anyhow::Context;
use ridesession::{app, clock::Clock, config::Config, db, log, registry, AppState};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    log::init();

    let config = Config::from_env()?;
    let db_pool = db::connect(&config.database_url, config.max_connections).await?;

    let app_state = AppState::new(db_pool, Clock::system(), config.chat_buffer);
    let sweeper = registry::spawn_sweeper(app_state.registry.clone(), config.sweep_interval);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "ride session service listening");

    axum::serve(listener, app(app_state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    sweeper.abort();
    info!("bye");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
