use std::sync::Arc;

use retain::{
    api_router, build_calendar, init_logging, log_app_bind, log_app_start,
    logging_config_from_env, pipeline_config_from_env, server_config_from_env, AppState,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("api_server", &logging_cfg);

    let server_cfg = server_config_from_env()?;
    let pipeline_cfg = pipeline_config_from_env()?;
    let calendar = Arc::new(build_calendar(&pipeline_cfg)?);
    let state = AppState::with_manifest_path(
        server_cfg.manifest_path.clone(),
        calendar,
        pipeline_cfg.timezone,
    );

    let app = api_router(state);
    let listener = tokio::net::TcpListener::bind(server_cfg.bind_addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind("api_server", bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
