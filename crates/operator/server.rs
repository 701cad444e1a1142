use actix_web::{middleware, web::Data, App, HttpServer};
use anyhow::Result;
use arango_deployment::controllers::deployment_controller::State;

use crate::handlers::{health, metrics};

pub const BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Configure and start the HTTP server
pub async fn start_server(state: State) -> Result<()> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health::index)
            .service(health::health)
            .service(metrics::metrics)
    })
    .bind(BIND_ADDRESS)?
    .shutdown_timeout(5);

    server.run().await?;
    Ok(())
}
