use std::{future::IntoFuture, process, sync::Arc};

use parcelmap::{
    application::{
        error::AppError,
        serving::{LayerData, LayerRequest, LayerService, PipelineConfig},
    },
    cache::{CacheConfig, CacheManager},
    config,
    domain::{layer::LayerId, policy::ZoomPolicy},
    infra::{
        catalog::LayerCatalog,
        error::InfraError,
        fetch::HttpFetcher,
        http::{self, ServingState},
        telemetry,
    },
};
use tokio::sync::Notify;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Warm(args) => run_warm(settings, args).await,
        config::Command::ClearCache(args) => run_clear_cache(settings, args).await,
    }
}

fn build_layer_service(settings: &config::Settings) -> Result<LayerService, AppError> {
    let catalog = LayerCatalog::load(&settings.catalog.path)?;
    let fetcher = HttpFetcher::new(&settings.remote, &settings.pipeline.staging_directory)?;
    let cache = Arc::new(CacheManager::new(&CacheConfig::from(&settings.cache)));

    Ok(LayerService::new(
        Arc::new(catalog),
        Arc::new(fetcher),
        cache,
        settings.policy.clone(),
        PipelineConfig::from(&settings.pipeline),
    ))
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let layers = build_layer_service(&settings)?;
    let router = http::build_router(ServingState::new(layers));

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "parcelmap::serve",
        addr = %settings.server.addr,
        "Listening"
    );

    let shutdown = Arc::new(Notify::new());
    let signalled = shutdown.clone();
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signalled.notify_one();
        })
        .into_future();

    // Open event streams would hold a graceful shutdown forever.
    let grace = settings.server.graceful_shutdown;
    let deadline = async move {
        shutdown.notified().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        _ = deadline => {
            warn!(
                target = "parcelmap::serve",
                grace_ms = grace.as_millis() as u64,
                "Connections still open after shutdown grace period; exiting"
            );
        }
    }

    info!(target = "parcelmap::serve", "Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!(target = "parcelmap::serve", "Shutdown signal received");
}

async fn run_warm(settings: config::Settings, args: config::WarmArgs) -> Result<(), AppError> {
    let layers = build_layer_service(&settings)?;
    let layer_id = LayerId(args.layer);

    let mut zooms = args.zoom;
    zooms.sort_unstable();
    zooms.dedup();

    info!(
        target = "parcelmap::warm",
        layer_id = %layer_id,
        zooms = ?zooms,
        "Starting cache warm"
    );

    for zoom in zooms {
        let started = std::time::Instant::now();
        match layers.generate(LayerRequest::new(layer_id, zoom)).await? {
            LayerData::Vector(data) => {
                let info = data.info();
                info!(
                    target = "parcelmap::warm",
                    layer_id = %layer_id,
                    zoom = ZoomPolicy::clamp_zoom(zoom),
                    cache = data.status.header_value(),
                    returned = info.returned_features,
                    total = info.total_features,
                    bytes = data.payload.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Warmed layer"
                );
            }
            LayerData::PassThrough(_) => {
                info!(
                    target = "parcelmap::warm",
                    layer_id = %layer_id,
                    "Layer is served by its remote service; nothing to warm"
                );
                return Ok(());
            }
        }
    }

    Ok(())
}

async fn run_clear_cache(
    settings: config::Settings,
    args: config::ClearCacheArgs,
) -> Result<(), AppError> {
    let layers = build_layer_service(&settings)?;

    match args.layer.map(LayerId) {
        Some(layer_id) => {
            layers.invalidate_layer(layer_id).await?;
            info!(
                target = "parcelmap::clear_cache",
                layer_id = %layer_id,
                directory = %settings.cache.disk_directory.display(),
                "Dropped cached payloads and staged source for layer"
            );
        }
        None => {
            layers.clear_cache().await?;
            info!(
                target = "parcelmap::clear_cache",
                directory = %settings.cache.disk_directory.display(),
                staging = %settings.pipeline.staging_directory.display(),
                "Dropped all cached payloads and staged sources"
            );
        }
    }

    Ok(())
}
