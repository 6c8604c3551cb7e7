use portfolio_chat::{app, config::Settings, telemetry};

#[tokio::main]
async fn main() {
    let settings = Settings::from_env();
    telemetry::init(&settings.log_level);

    if let Err(err) = app::run(settings).await {
        tracing::error!(error = %err, "server stopped");
        std::process::exit(1);
    }
}
