use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use image::{Rgba, RgbaImage};
use ndarray::{array, Array2};
use ndarray_npy::NpzWriter;
use serde_json::{json, Value};
use tempfile::TempDir;

use wsi_overlay::{build_router, AppState, ServeArgs};

struct TestServer {
    base_url: String,
    client: reqwest::Client,
}

impl TestServer {
    async fn start() -> Result<Self> {
        let args = ServeArgs::parse_from([
            "wsi-overlay-server",
            "--synthetic-seed",
            "1234",
            "--metrics-interval-secs",
            "0",
        ]);
        let app = build_router(AppState::from_args(&args)?, &args);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Ok(Self {
            base_url: format!("http://{}", addr),
            client: reqwest::Client::new(),
        })
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        Ok(self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?)
    }

    async fn load(&self, endpoint: &str, file: &Path) -> Result<reqwest::Response> {
        Ok(self
            .client
            .post(format!("{}{}", self.base_url, endpoint))
            .json(&json!({ "file_path": file }))
            .send()
            .await?)
    }
}

fn write_slide(dir: &Path) -> PathBuf {
    let path = dir.join("slide.png");
    let image = RgbaImage::from_fn(1000, 600, |x, _| {
        if x < 500 {
            Rgba([220, 40, 40, 255])
        } else {
            Rgba([40, 40, 220, 255])
        }
    });
    image.save(&path).unwrap();
    path
}

fn write_annotations(dir: &Path, name: &str, build: impl FnOnce(&mut NpzWriter<File>)) -> PathBuf {
    let path = dir.join(name);
    let mut npz = NpzWriter::new(File::create(&path).unwrap());
    build(&mut npz);
    npz.finish().unwrap();
    path
}

async fn error_message(resp: reqwest::Response) -> Result<String> {
    let body: Value = resp.json().await?;
    Ok(body["error"].as_str().unwrap_or_default().to_string())
}

#[tokio::test]
async fn test_healthz() -> Result<()> {
    let server = TestServer::start().await?;
    let resp = server.get("/healthz").await?;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await?, "ok");
    Ok(())
}

#[tokio::test]
async fn test_requests_before_any_load_are_rejected() -> Result<()> {
    let server = TestServer::start().await?;

    let resp = server.get("/api/tile/0/0/0").await?;
    assert_eq!(resp.status(), 400);
    assert_eq!(error_message(resp).await?, "No WSI file loaded");

    let resp = server.get("/api/segmentation/0/0/0?mode=centroids").await?;
    assert_eq!(resp.status(), 400);
    assert_eq!(error_message(resp).await?, "No segmentation file loaded");
    Ok(())
}

#[tokio::test]
async fn test_load_wsi_and_fetch_tiles() -> Result<()> {
    let dir = TempDir::new()?;
    let slide = write_slide(dir.path());
    let server = TestServer::start().await?;

    let resp = server.load("/api/load-wsi", &slide).await?;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await?;
    assert_eq!(
        body,
        json!({
            "status": "success",
            "dimensions": [1000, 600],
            "level_count": 3,
            "level_dimensions": [[1000, 600], [500, 300], [250, 150]],
            "level_downsamples": [1.0, 2.0, 4.0]
        })
    );

    // Loading the same file again reports the same pyramid.
    let again: Value = server.load("/api/load-wsi", &slide).await?.json().await?;
    assert_eq!(again, body);

    let resp = server.get("/api/tile/0/0/0").await?;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "image/jpeg");
    let bytes = resp.bytes().await?;
    let tile = image::load_from_memory(&bytes)?.to_rgb8();
    assert_eq!(tile.dimensions(), (256, 256));
    let px = tile.get_pixel(128, 128);
    assert!(px[0] > 180 && px[2] < 90, "expected red, got {:?}", px);

    // Level 1 tile (1, 0) starts at level-0 x=512: the blue half.
    let bytes = server.get("/api/tile/1/1/0").await?.bytes().await?;
    let tile = image::load_from_memory(&bytes)?.to_rgb8();
    let px = tile.get_pixel(64, 64);
    assert!(px[2] > 180 && px[0] < 90, "expected blue, got {:?}", px);

    // Past the right edge: padded with white.
    let bytes = server.get("/api/tile/0/3/0?tile_size=512").await?.bytes().await?;
    let tile = image::load_from_memory(&bytes)?.to_rgb8();
    assert_eq!(tile.dimensions(), (512, 512));
    let px = tile.get_pixel(500, 500);
    assert!(px.0.iter().all(|&c| c > 240), "expected white, got {:?}", px);

    let resp = server.get("/api/tile/3/0/0").await?;
    assert_eq!(resp.status(), 400);
    assert!(error_message(resp).await?.contains("level_count=3"));

    let resp = server.get("/api/tile/0/0/0?tile_size=0").await?;
    assert_eq!(resp.status(), 400);
    Ok(())
}

#[tokio::test]
async fn test_load_errors() -> Result<()> {
    let dir = TempDir::new()?;
    let server = TestServer::start().await?;

    let missing = dir.path().join("missing.svs");
    let resp = server.load("/api/load-wsi", &missing).await?;
    assert_eq!(resp.status(), 404);
    assert!(error_message(resp).await?.starts_with("File not found"));

    let resp = server.load("/api/load-segmentation", &missing).await?;
    assert_eq!(resp.status(), 404);

    let garbage = dir.path().join("garbage.tiff");
    std::fs::write(&garbage, b"definitely not a slide")?;
    let resp = server.load("/api/load-wsi", &garbage).await?;
    assert_eq!(resp.status(), 500);
    let resp = server.load("/api/load-segmentation", &garbage).await?;
    assert_eq!(resp.status(), 500);

    // Still nothing loaded after failed loads.
    assert_eq!(server.get("/api/tile/0/0/0").await?.status(), 400);
    Ok(())
}

#[tokio::test]
async fn test_malformed_requests_answer_json_400() -> Result<()> {
    let server = TestServer::start().await?;

    for path in [
        "/api/tile/-1/0/0",
        "/api/tile/0/x/0",
        "/api/tile/0/0/0?tile_size=big",
        "/api/segmentation/0/0/1.5?mode=centroids",
    ] {
        let resp = server.get(path).await?;
        assert_eq!(resp.status(), 400, "{path}");
        assert!(error_message(resp).await?.starts_with("Invalid request: "), "{path}");
    }

    for body in [json!({}), json!({ "file_path": 7 })] {
        let resp = server
            .client
            .post(format!("{}/api/load-wsi", server.base_url))
            .json(&body)
            .send()
            .await?;
        assert_eq!(resp.status(), 400, "{body}");
        assert!(error_message(resp).await?.starts_with("Invalid request: "));
    }

    let resp = server
        .client
        .post(format!("{}/api/load-segmentation", server.base_url))
        .header("content-type", "application/json")
        .body("{\"file_path\": ")
        .send()
        .await?;
    assert_eq!(resp.status(), 400);
    assert!(error_message(resp).await?.starts_with("Invalid request: "));
    Ok(())
}

#[tokio::test]
async fn test_segmentation_filters_stored_data() -> Result<()> {
    let dir = TempDir::new()?;
    let seg = write_annotations(dir.path(), "seg.npz", |npz| {
        let centroids: Array2<f64> = array![[5.0, 5.0], [15.9, 3.0], [16.0, 2.0], [40.0, 40.0], [0.0, 0.0]];
        npz.add_array("SegmentationNode/centroids.npy", &centroids).unwrap();
        let inside: Array2<f64> = array![[2.0, 2.0], [6.0, 2.0], [6.0, 6.0]];
        let outside: Array2<f64> = array![[100.0, 100.0], [120.0, 100.0], [120.0, 120.0]];
        npz.add_array("SegmentationNode/contours/0.npy", &outside).unwrap();
        npz.add_array("SegmentationNode/contours/1.npy", &inside).unwrap();
    });
    let server = TestServer::start().await?;

    let resp = server.load("/api/load-segmentation", &seg).await?;
    assert_eq!(resp.status(), 200);
    let summary: Value = resp.json().await?;
    assert_eq!(
        summary,
        json!({
            "status": "success",
            "centroids_count": 100,
            "has_contours": true,
            "segmentation_found": true
        })
    );

    // Level 0, tile (0, 0), 256 px: annotation box [0, 16) x [0, 16).
    let body: Value = server
        .get("/api/segmentation/0/0/0?mode=centroids")
        .await?
        .json()
        .await?;
    assert_eq!(body, json!({ "centroids": [[5.0, 5.0], [15.9, 3.0], [0.0, 0.0]] }));

    // Mode defaults to centroids.
    let default_mode: Value = server.get("/api/segmentation/0/0/0").await?.json().await?;
    assert_eq!(default_mode, body);

    let body: Value = server
        .get("/api/segmentation/0/0/0?mode=contours")
        .await?
        .json()
        .await?;
    assert_eq!(
        body,
        json!({ "contours": [{ "id": 1, "points": [[2.0, 2.0], [6.0, 2.0], [6.0, 6.0]] }] })
    );

    // Level 2, tile (1, 1): box [64, 128) x [64, 128) holds only the far contour.
    let body: Value = server
        .get("/api/segmentation/2/1/1?mode=contours")
        .await?
        .json()
        .await?;
    assert_eq!(body["contours"].as_array().unwrap().len(), 1);
    assert_eq!(body["contours"][0]["id"], 0);

    let resp = server.get("/api/segmentation/0/0/0?mode=polygons").await?;
    assert_eq!(resp.status(), 400);
    Ok(())
}

#[tokio::test]
async fn test_segmentation_absent_and_fallback() -> Result<()> {
    let dir = TempDir::new()?;
    let sparse = write_annotations(dir.path(), "sparse.npz", |npz| {
        let centroids: Array2<f64> = array![[1.0, 1.0]];
        npz.add_array("SegmentationNode/centroids.npy", &centroids).unwrap();
    });
    let broken = write_annotations(dir.path(), "broken.npz", |npz| {
        let one_column: Array2<f64> = array![[1.0], [2.0], [3.0]];
        npz.add_array("SegmentationNode/centroids.npy", &one_column).unwrap();
        let flat: Array2<f64> = array![[1.0, 2.0], [3.0, 4.0]];
        npz.add_array("SegmentationNode/contours.npy", &flat).unwrap();
    });
    let server = TestServer::start().await?;

    server.load("/api/load-segmentation", &sparse).await?;
    let body: Value = server
        .get("/api/segmentation/0/0/0?mode=contours")
        .await?
        .json()
        .await?;
    assert_eq!(body, json!({ "contours": [] }));

    server.load("/api/load-segmentation", &broken).await?;
    // Level 1, tile (2, 3): pixel box [1024, 1536) x [1536, 2048) → [64, 96) x [96, 128).
    let body: Value = server
        .get("/api/segmentation/1/2/3?mode=centroids")
        .await?
        .json()
        .await?;
    let points = body["centroids"].as_array().unwrap();
    assert_eq!(points.len(), 20);
    for point in points {
        assert!(point[0].is_i64() && point[1].is_i64(), "{point}");
        let x = point[0].as_f64().unwrap();
        let y = point[1].as_f64().unwrap();
        assert!((64.0..96.0).contains(&x), "x={x}");
        assert!((96.0..128.0).contains(&y), "y={y}");
    }

    let body: Value = server
        .get("/api/segmentation/1/2/3?mode=contours")
        .await?
        .json()
        .await?;
    let contours = body["contours"].as_array().unwrap();
    assert_eq!(contours.len(), 2);
    assert_eq!(contours[0]["id"], 0);
    assert_eq!(contours[1]["id"], 1);
    assert!(contours
        .iter()
        .all(|c| c["points"].as_array().unwrap().len() == 8));
    Ok(())
}
