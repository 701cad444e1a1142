use arango_deployment::controllers::deployment_controller;
use arango_deployment::util::telemetry;

mod handlers;
mod server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init().await?;

    // Initiatilize Kubernetes controller state
    let state = deployment_controller::State::default();
    let controller = deployment_controller::run(state.clone());

    // Both runtimes implements graceful shutdown, so poll until both are done
    let (controller, server) = tokio::join!(controller, server::start_server(state));
    controller?;
    server
}
