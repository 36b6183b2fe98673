// Copyright 2024 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use buildgrid_common::config::DbConfig;
use buildgrid_common::tracing::init_tracing_with_default_env_filter;
use buildgrid_controller_service::api;
use buildgrid_controller_service::api::middleware::{
    CorrelationIdMiddleware, RequestLimitsMiddleware,
};
use buildgrid_controller_service::config::{make_config_loader, ControllerServiceConfig};
use buildgrid_controller_service::db;
use buildgrid_controller_service::metrics;
use buildgrid_controller_service::service::Services;
use poem::endpoint::PrometheusExporter;
use poem::listener::TcpListener;
use poem::middleware::{CatchPanic, Cors};
use poem::EndpointExt;
use prometheus::Registry;
use tokio::task::JoinSet;
use tracing::{error, info};

fn main() -> Result<(), std::io::Error> {
    if std::env::args().any(|arg| arg == "--dump-openapi-yaml") {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(dump_openapi_yaml())
    } else if let Some(config) = make_config_loader().load_or_dump_config() {
        init_tracing_with_default_env_filter(&config.tracing);
        let prometheus = metrics::register_all();

        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(async_main(&config, prometheus))
    } else {
        Ok(())
    }
}

async fn dump_openapi_yaml() -> Result<(), std::io::Error> {
    let config = ControllerServiceConfig::default();
    let services = Services::new(&config).await.map_err(|e| {
        error!("Services - init error: {}", e);
        std::io::Error::other(e)
    })?;
    let open_api_service = api::make_open_api_service(&services);
    println!("{}", open_api_service.spec_yaml());
    Ok(())
}

async fn async_main(
    config: &ControllerServiceConfig,
    prometheus_registry: Registry,
) -> Result<(), std::io::Error> {
    let http_port = config.http_port;

    info!("Starting buildgrid controller on port {}", http_port);

    match config.db.clone() {
        DbConfig::Postgres(c) => {
            db::postgres_migrate(&c).await.map_err(|e| {
                error!("DB - init error: {}", e);
                std::io::Error::other(format!("Init error: {e:?}"))
            })?;
        }
        DbConfig::Sqlite(c) => {
            db::sqlite_migrate(&c).await.map_err(|e| {
                error!("DB - init error: {}", e);
                std::io::Error::other(format!("Init error: {e:?}"))
            })?;
        }
    };

    let services = Services::new(config).await.map_err(|e| {
        error!("Services - init error: {}", e);
        std::io::Error::other(e)
    })?;

    services
        .queue_service
        .rebuild_from_store()
        .await
        .map_err(|e| {
            error!("Queue - init error: {}", e);
            std::io::Error::other(format!("Init error: {e}"))
        })?;

    let mut join_set: JoinSet<Result<(), anyhow::Error>> = JoinSet::new();
    services.sweeps.spawn(&mut join_set);

    let cors = Cors::new()
        .allow_origin_regex(&config.cors_origin_regex)
        .allow_credentials(true);

    let app = api::combined_routes(&services)
        .nest("/metrics", PrometheusExporter::new(prometheus_registry))
        .with(CatchPanic::new())
        .with(RequestLimitsMiddleware::new(
            config.limits.max_concurrent_requests,
            config.limits.request_timeout,
        ))
        .with(CorrelationIdMiddleware)
        .with(cors);

    let http_server = tokio::spawn(async move {
        poem::Server::new(TcpListener::bind(format!("0.0.0.0:{http_port}")))
            .run(app)
            .await
            .expect("HTTP server failed");
    });

    tokio::select! {
        _ = http_server => {},
        Some(result) = join_set.join_next() => {
            if let Err(err) = result {
                error!("Background task failed: {}", err);
            }
        },
    }

    Ok(())
}
