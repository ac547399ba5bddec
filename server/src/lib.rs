// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Ember server: REST and websocket surface over the delivery backend.

pub mod auth;
pub mod configurations;
pub mod endpoints;
pub mod metrics_marker;
pub mod services;
pub mod telemetry;
pub mod ws;

use std::net::TcpListener;

use actix_web::{
    App, HttpResponse, HttpServer,
    dev::Server,
    web::{self, Data},
};
use tracing_actix_web::TracingLogger;

use crate::{endpoints::{ENDPOINT_HEALTH_CHECK, ENDPOINT_WS}, services::AppServices};

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().finish()
}

/// Start the HTTP server on the given listener.
pub fn run(listener: TcpListener, services: AppServices) -> Result<Server, std::io::Error> {
    let services = Data::new(services);
    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(services.clone())
            .route(ENDPOINT_HEALTH_CHECK, web::get().to(health_check))
            .service(
                web::scope("/v1/accounts")
                    .route("/challenge/{uid}", web::get().to(endpoints::accounts::challenge))
                    .route("/signup", web::put().to(endpoints::accounts::signup))
                    .route("/signin", web::put().to(endpoints::accounts::signin))
                    .route(
                        "/attributes",
                        web::put().to(endpoints::accounts::update_attributes),
                    )
                    .route("/apn", web::put().to(endpoints::accounts::register_apn))
                    .route("/apn", web::delete().to(endpoints::accounts::unregister_apn))
                    .route("/gcm", web::put().to(endpoints::accounts::register_gcm))
                    .route("/gcm", web::delete().to(endpoints::accounts::unregister_gcm))
                    .route(
                        "/{uid}/{signature}",
                        web::delete().to(endpoints::accounts::destroy),
                    ),
            )
            .service(
                web::scope("/v1/group/deliver")
                    .route("/send_msg", web::put().to(endpoints::group_msg::send_msg))
                    .route("/recall_msg", web::put().to(endpoints::group_msg::recall_msg))
                    .route("/get_msg", web::put().to(endpoints::group_msg::get_msg))
                    .route("/ack_msg", web::put().to(endpoints::group_msg::ack_msg)),
            )
            .service(
                web::scope("/v1/offline")
                    .route("/pushmsg", web::post().to(endpoints::offline::push_msg))
                    .route(
                        "/notifications",
                        web::post().to(endpoints::offline::notifications),
                    ),
            )
            .route(ENDPOINT_WS, web::get().to(ws::upgrade))
    })
    .listen(listener)?
    .run();
    Ok(server)
}
