use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use clap::Parser;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::task;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::annotations::{self, NpzStore, QueryMode, QueryResult};
use crate::core::jpeg::{create_encoder, DEFAULT_TILE_QUALITY};
use crate::core::pyramid::{PyramidDescriptor, TileRequest, DEFAULT_TILE_SIZE};
use crate::core::viewport::{resolve_viewport, DEFAULT_MAGNIFICATION_DIVISOR};
use crate::core::ResampleFilter;
use crate::error::{self, ServiceError};
use crate::session::{LoadSummary, SessionState};
use crate::tile::TileFetcher;

#[derive(Parser, Debug, Clone)]
#[command(name = "wsi-overlay-server", about = "Whole-slide tile server with segmentation overlays")]
pub struct ServeArgs {
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long, default_value_t = 8000)]
    pub port: u16,
    #[arg(long, default_value_t = DEFAULT_TILE_QUALITY)]
    pub tile_quality: u8,
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE)]
    pub default_tile_size: u32,
    #[arg(long, default_value_t = 4096)]
    pub max_tile_size: u32,
    #[arg(long, default_value_t = 1024)]
    pub cache_entries: u64,
    /// Level-0 pixels per annotation unit
    #[arg(long, default_value_t = DEFAULT_MAGNIFICATION_DIVISOR)]
    pub magnification_divisor: u32,
    /// Seed for placeholder annotations; random when unset
    #[arg(long)]
    pub synthetic_seed: Option<u64>,
    /// JPEG encoder: image or turbojpeg
    #[arg(long, default_value = "image")]
    pub encoder: String,
    /// Filter for synthesized levels of plain raster images
    #[arg(long, default_value_t = ResampleFilter::Bilinear)]
    pub raster_filter: ResampleFilter,
    #[arg(long, default_value_t = 30)]
    pub metrics_interval_secs: u64,
    /// 0 disables the per-request timeout
    #[arg(long, default_value_t = 0)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 8)]
    pub tokio_workers: usize,
    #[arg(long, default_value_t = 32)]
    pub tokio_blocking_threads: usize,
    /// Default tracing filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Clone)]
pub struct AppState {
    session: Arc<SessionState>,
    tiles: Arc<TileFetcher>,
    rng: Arc<Mutex<StdRng>>,
    metrics: Arc<Mutex<Metrics>>,
    raster_filter: ResampleFilter,
    divisor: u32,
    default_tile_size: u32,
    max_tile_size: u32,
}

impl AppState {
    pub fn from_args(args: &ServeArgs) -> Result<Self> {
        if args.magnification_divisor == 0 {
            anyhow::bail!("--magnification-divisor must be positive");
        }
        if args.default_tile_size == 0 || args.default_tile_size > args.max_tile_size {
            anyhow::bail!(
                "--default-tile-size must be in 1..={} (got {})",
                args.max_tile_size,
                args.default_tile_size
            );
        }
        let encoder = create_encoder(&args.encoder)?;
        let rng = match args.synthetic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            session: Arc::new(SessionState::new()),
            tiles: Arc::new(TileFetcher::new(encoder, args.tile_quality, args.cache_entries)),
            rng: Arc::new(Mutex::new(rng)),
            metrics: Arc::new(Mutex::new(Metrics::default())),
            raster_filter: args.raster_filter,
            divisor: args.magnification_divisor,
            default_tile_size: args.default_tile_size,
            max_tile_size: args.max_tile_size,
        })
    }

    fn tile_size(&self, requested: Option<u32>) -> error::Result<u32> {
        let tile_size = requested.unwrap_or(self.default_tile_size);
        if tile_size == 0 || tile_size > self.max_tile_size {
            return Err(ServiceError::InvalidRequest(format!(
                "tile_size must be in 1..={} (got {})",
                self.max_tile_size, tile_size
            )));
        }
        Ok(tile_size)
    }

    /// Independent generator for one request, drawn from the shared one.
    fn request_rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.rng.lock().gen())
    }
}

#[derive(Default, Clone)]
struct Metrics {
    tile_total: u64,
    tile_cache_hit: u64,
    tile_generated: u64,
    tile_ms_sum: u128,
    tile_ms_max: u128,
    overlay_total: u64,
    overlay_fallback: u64,
    overlay_ms_sum: u128,
    errors: u64,
}

impl Metrics {
    fn record_tile(&mut self, cache_hit: bool, ms: u128) {
        self.tile_total += 1;
        self.tile_ms_sum += ms;
        if ms > self.tile_ms_max {
            self.tile_ms_max = ms;
        }
        if cache_hit {
            self.tile_cache_hit += 1;
        } else {
            self.tile_generated += 1;
        }
    }

    fn record_overlay(&mut self, fallback: bool, ms: u128) {
        self.overlay_total += 1;
        self.overlay_ms_sum += ms;
        if fallback {
            self.overlay_fallback += 1;
        }
    }

    fn take(&mut self) -> Metrics {
        std::mem::take(self)
    }
}

#[derive(Deserialize)]
struct LoadRequest {
    file_path: PathBuf,
}

#[derive(Serialize)]
struct LoadImageResponse {
    status: &'static str,
    #[serde(flatten)]
    descriptor: PyramidDescriptor,
}

#[derive(Deserialize)]
struct TileQuery {
    tile_size: Option<u32>,
}

#[derive(Deserialize)]
struct SegmentationQuery {
    tile_size: Option<u32>,
    mode: Option<String>,
}

pub fn run(args: ServeArgs) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.tokio_workers)
        .max_blocking_threads(args.tokio_blocking_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args))
}

async fn async_main(args: ServeArgs) -> Result<()> {
    let state = AppState::from_args(&args)?;
    info!(
        "encoder={} tile_quality={} cache_entries={} magnification_divisor={} synthetic_seed={:?}",
        state.tiles.encoder_name(),
        args.tile_quality,
        args.cache_entries,
        args.magnification_divisor,
        args.synthetic_seed
    );

    if args.metrics_interval_secs > 0 {
        spawn_metrics_loop(
            state.metrics.clone(),
            Duration::from_secs(args.metrics_interval_secs),
        );
    }

    let app = build_router(state, &args);
    let addr = format!("{}:{}", args.host, args.port);
    info!(
        "listening on http://{} (tokio_workers={}, tokio_blocking_threads={}, hw_threads={})",
        addr,
        args.tokio_workers,
        args.tokio_blocking_threads,
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(0)
    );
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn build_router(state: AppState, args: &ServeArgs) -> Router {
    let mut app = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/load-wsi", post(load_wsi))
        .route("/api/tile/:level/:x/:y", get(get_tile))
        .route("/api/load-segmentation", post(load_segmentation))
        .route("/api/segmentation/:level/:x/:y", get(get_segmentation))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());
    if args.request_timeout_secs > 0 {
        app = app.layer(TimeoutLayer::new(Duration::from_secs(
            args.request_timeout_secs,
        )));
    }
    app
}

fn spawn_metrics_loop(metrics: Arc<Mutex<Metrics>>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let snapshot = metrics.lock().take();
            if snapshot.tile_total == 0 && snapshot.overlay_total == 0 && snapshot.errors == 0 {
                continue;
            }
            let tile_avg = if snapshot.tile_total > 0 {
                snapshot.tile_ms_sum / snapshot.tile_total as u128
            } else {
                0
            };
            let overlay_avg = if snapshot.overlay_total > 0 {
                snapshot.overlay_ms_sum / snapshot.overlay_total as u128
            } else {
                0
            };
            let mut sys = System::new();
            let (rss_kb, cpu_pct) = if let Ok(pid) = sysinfo::get_current_pid() {
                sys.refresh_process(pid);
                sys.process(pid)
                    .map(|p| (p.memory() / 1024, p.cpu_usage()))
                    .unwrap_or((0, 0.0))
            } else {
                (0, 0.0)
            };
            info!(
                "metrics tiles_total={} cache_hit={} generated={} tile_avg_ms={} tile_max_ms={} overlays={} overlay_fallback={} overlay_avg_ms={} errors={} rss_mb={} cpu_pct={:.1}",
                snapshot.tile_total,
                snapshot.tile_cache_hit,
                snapshot.tile_generated,
                tile_avg,
                snapshot.tile_ms_max,
                snapshot.overlay_total,
                snapshot.overlay_fallback,
                overlay_avg,
                snapshot.errors,
                rss_kb / 1024,
                cpu_pct
            );
        }
    });
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn load_wsi(
    State(state): State<AppState>,
    body: Result<Json<LoadRequest>, JsonRejection>,
) -> Result<Json<LoadImageResponse>, ServiceError> {
    let Json(body) = body?;
    let session = state.session.clone();
    let filter = state.raster_filter;
    let descriptor = task::spawn_blocking(move || session.load_image(&body.file_path, filter))
        .await?
        .inspect_err(|_| state.metrics.lock().errors += 1)?;
    state.tiles.invalidate();
    Ok(Json(LoadImageResponse {
        status: "success",
        descriptor,
    }))
}

async fn get_tile(
    State(state): State<AppState>,
    path: Result<AxumPath<(u32, u32, u32)>, PathRejection>,
    query: Result<Query<TileQuery>, QueryRejection>,
) -> Result<Response, ServiceError> {
    let start = Instant::now();
    let AxumPath((level, x, y)) = path?;
    let Query(query) = query?;
    let tile_size = state.tile_size(query.tile_size)?;
    let image = state
        .session
        .active_image()
        .ok_or(ServiceError::NoImageLoaded)?;
    let request = TileRequest {
        level,
        grid_x: x,
        grid_y: y,
        tile_size,
    };
    let tiles = state.tiles.clone();
    let fetched = task::spawn_blocking(move || tiles.fetch(&image, &request))
        .await?
        .inspect_err(|err| {
            if err.status().is_server_error() {
                state.metrics.lock().errors += 1;
            }
        })?;
    let ms = start.elapsed().as_millis();
    state.metrics.lock().record_tile(fetched.cache_hit, ms);
    info!(
        "tile level={} x={} y={} tile_size={} cache_hit={} ms={}",
        level, x, y, tile_size, fetched.cache_hit, ms
    );
    Ok(jpeg_response(fetched.bytes))
}

async fn load_segmentation(
    State(state): State<AppState>,
    body: Result<Json<LoadRequest>, JsonRejection>,
) -> Result<Json<LoadSummary>, ServiceError> {
    let Json(body) = body?;
    let session = state.session.clone();
    let summary = task::spawn_blocking(move || session.load_annotations(&body.file_path))
        .await?
        .inspect_err(|_| state.metrics.lock().errors += 1)?;
    Ok(Json(summary))
}

async fn get_segmentation(
    State(state): State<AppState>,
    path: Result<AxumPath<(u32, u32, u32)>, PathRejection>,
    query: Result<Query<SegmentationQuery>, QueryRejection>,
) -> Result<Json<QueryResult>, ServiceError> {
    let start = Instant::now();
    let AxumPath((level, x, y)) = path?;
    let Query(query) = query?;
    let path = state
        .session
        .active_annotations()
        .ok_or(ServiceError::NoAnnotationsLoaded)?;
    let mode = match query.mode.as_deref() {
        None => QueryMode::Centroids,
        Some(raw) => raw.parse().map_err(ServiceError::InvalidRequest)?,
    };
    let tile_size = state.tile_size(query.tile_size)?;
    let viewport = resolve_viewport(level, x, y, tile_size, state.divisor)?;
    let mut rng = state.request_rng();

    let outcome = task::spawn_blocking(move || {
        let mut store = NpzStore::open(&path).map_err(ServiceError::AnnotationOpen)?;
        Ok::<_, ServiceError>(annotations::query(&mut store, &viewport, mode, &mut rng))
    })
    .await?
    .inspect_err(|err| {
        warn!("segmentation read failed level={} x={} y={}: {}", level, x, y, err);
        state.metrics.lock().errors += 1;
    })?;

    let ms = start.elapsed().as_millis();
    state
        .metrics
        .lock()
        .record_overlay(outcome.fallback.is_some(), ms);
    info!(
        "segmentation level={} x={} y={} tile_size={} mode={} items={} fallback={:?} ms={}",
        level,
        x,
        y,
        tile_size,
        mode,
        outcome.result.len(),
        outcome.fallback,
        ms
    );
    Ok(Json(outcome.result))
}

fn jpeg_response(bytes: Bytes) -> Response {
    let mut resp = Response::new(bytes.into());
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
    resp
}
