// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::net::TcpListener;

use emberserver::{
    configurations::get_configuration,
    run,
    services::AppServices,
    telemetry::{get_subscriber, init_subscriber},
};
use tracing::info;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Configure logging/trace subscription
    let subscriber = get_subscriber("emberserver".into(), "info".into(), std::io::stdout);
    init_subscriber(subscriber);

    // Load configuration
    let configuration = get_configuration("server/").expect("Could not load configuration.");

    // Port binding
    let address = format!(
        "{}:{}",
        configuration.application.host, configuration.application.port
    );
    let listener = TcpListener::bind(&address)?;
    info!(%address, "Starting server");

    let services =
        AppServices::build(configuration).map_err(|e| std::io::Error::other(e.to_string()))?;

    run(listener, services)?.await
}
