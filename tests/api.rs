use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use image::{Rgb, RgbImage};
use tower::ServiceExt;

use torchio::config::{RasterSettings, ToolSettings};
use torchio::http::{AppState, build_router};

const BOUNDARY: &str = "torchio-test-boundary";
const BODY_LIMIT: u64 = 50 * 1024 * 1024;

struct Part<'a> {
    name: &'a str,
    filename: Option<&'a str>,
    content_type: Option<&'a str>,
    data: &'a [u8],
}

fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part.filename {
            Some(filename) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                    part.name, filename
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n", part.name).as_bytes(),
            ),
        }
        if let Some(content_type) = part.content_type {
            body.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(part.data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn post_multipart(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn router_with_tools(uploads: &Path, ghostscript: &str, pdftoppm: &str) -> Router {
    let state = AppState {
        uploads_dir: uploads.to_path_buf(),
        tools: ToolSettings {
            ghostscript_path: PathBuf::from(ghostscript),
            pdftoppm_path: PathBuf::from(pdftoppm),
        },
        raster: RasterSettings {
            dpi: 72,
            jpeg_quality: 90,
        },
    };
    build_router(state, BODY_LIMIT)
}

fn test_router(uploads: &Path) -> Router {
    router_with_tools(uploads, "gs", "pdftoppm")
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([40, 90, 200]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    buf.into_inner()
}

fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([200, 90, 40]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Jpeg).unwrap();
    buf.into_inner()
}

/// Produce a valid PDF on disk for endpoints that take one as input.
fn sample_pdf(dir: &Path) -> PathBuf {
    let image_path = dir.join("source.jpg");
    std::fs::write(&image_path, jpeg_bytes(60, 40)).unwrap();
    let pdf_path = dir.join("sample.pdf");
    torchio::convert::images::images_to_pdf(&[image_path], &pdf_path, 90).unwrap();
    pdf_path
}

fn tool_available(name: &str) -> bool {
    std::process::Command::new(name)
        .arg("-v")
        .output()
        .is_ok()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

/// Cleanup runs after the body stream is dropped, so poll briefly.
async fn assert_uploads_empty(dir: &Path) {
    for _ in 0..150 {
        let count = std::fs::read_dir(dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        if count == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let leftovers: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name())
        .collect();
    panic!("upload directory not cleaned: {leftovers:?}");
}

#[tokio::test]
async fn root_reports_running() {
    let uploads = tempfile::tempdir().unwrap();
    let router = test_router(uploads.path());

    let response = router
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_bytes(response).await;
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(json["message"].as_str().unwrap().contains("running"));
}

#[tokio::test]
async fn image_convert_produces_the_requested_format() {
    let uploads = tempfile::tempdir().unwrap();
    let router = test_router(uploads.path());

    let body = multipart_body(&[
        Part {
            name: "file",
            filename: Some("photo.png"),
            content_type: Some("image/png"),
            data: &png_bytes(24, 16),
        },
        Part {
            name: "format",
            filename: None,
            content_type: None,
            data: b"jpeg",
        },
    ]);
    let response = router
        .oneshot(post_multipart("/api/image-convert", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("image/jpeg")
    );
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok()),
        Some("attachment; filename=\"converted.jpeg\"")
    );

    let bytes = body_bytes(response).await;
    let decoded = image::load_from_memory(&bytes).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (24, 16));

    assert_uploads_empty(uploads.path()).await;
}

#[tokio::test]
async fn image_convert_rejects_unknown_formats_and_leaves_no_files() {
    let uploads = tempfile::tempdir().unwrap();
    let router = test_router(uploads.path());

    let body = multipart_body(&[
        Part {
            name: "file",
            filename: Some("photo.png"),
            content_type: Some("image/png"),
            data: &png_bytes(8, 8),
        },
        Part {
            name: "format",
            filename: None,
            content_type: None,
            data: b"exr",
        },
    ]);
    let response = router
        .oneshot(post_multipart("/api/image-convert", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["error"], "Conversion failed");
    assert!(json["details"].as_str().unwrap().contains("exr"));

    assert_uploads_empty(uploads.path()).await;
}

#[tokio::test]
async fn missing_file_field_is_a_client_error() {
    let uploads = tempfile::tempdir().unwrap();
    let router = test_router(uploads.path());

    let body = multipart_body(&[Part {
        name: "unrelated",
        filename: None,
        content_type: None,
        data: b"nothing",
    }]);
    let response = router
        .oneshot(post_multipart("/api/compress", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["error"], "Compression failed");

    assert_uploads_empty(uploads.path()).await;
}

#[tokio::test]
async fn jpg_to_pdf_emits_one_page_per_upload_in_order() {
    let uploads = tempfile::tempdir().unwrap();
    let router = test_router(uploads.path());

    let first = jpeg_bytes(30, 20);
    let second = jpeg_bytes(20, 30);
    let third = jpeg_bytes(10, 10);
    let body = multipart_body(&[
        Part {
            name: "files",
            filename: Some("a.jpg"),
            content_type: Some("image/jpeg"),
            data: &first,
        },
        Part {
            name: "files",
            filename: Some("b.jpg"),
            content_type: Some("image/jpeg"),
            data: &second,
        },
        Part {
            name: "files",
            filename: Some("c.jpg"),
            content_type: Some("image/jpeg"),
            data: &third,
        },
    ]);
    let response = router
        .oneshot(post_multipart("/api/jpg-to-pdf", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok()),
        Some("attachment; filename=\"jpg-to-pdf.pdf\"")
    );

    let bytes = body_bytes(response).await;
    let doc = lopdf::Document::load_mem(&bytes).unwrap();
    assert_eq!(doc.get_pages().len(), 3);

    assert_uploads_empty(uploads.path()).await;
}

#[tokio::test]
async fn pdf_to_word_extracts_into_a_docx() {
    let uploads = tempfile::tempdir().unwrap();
    let inputs = tempfile::tempdir().unwrap();
    let router = test_router(uploads.path());

    let pdf = std::fs::read(sample_pdf(inputs.path())).unwrap();
    let body = multipart_body(&[Part {
        name: "file",
        filename: Some("sample.pdf"),
        content_type: Some("application/pdf"),
        data: &pdf,
    }]);
    let response = router
        .oneshot(post_multipart("/api/pdf-to-word", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = body_bytes(response).await;
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    assert!(archive.by_name("word/document.xml").is_ok());

    assert_uploads_empty(uploads.path()).await;
}

#[tokio::test]
async fn pdf_to_excel_extracts_into_an_xlsx() {
    let uploads = tempfile::tempdir().unwrap();
    let inputs = tempfile::tempdir().unwrap();
    let router = test_router(uploads.path());

    let pdf = std::fs::read(sample_pdf(inputs.path())).unwrap();
    let body = multipart_body(&[Part {
        name: "file",
        filename: Some("sample.pdf"),
        content_type: Some("application/pdf"),
        data: &pdf,
    }]);
    let response = router
        .oneshot(post_multipart("/api/pdf-to-excel", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet")
    );
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok()),
        Some("attachment; filename=\"converted.xlsx\"")
    );

    let bytes = body_bytes(response).await;
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    assert!(archive.by_name("xl/worksheets/sheet1.xml").is_ok());

    assert_uploads_empty(uploads.path()).await;
}

#[tokio::test]
async fn png_to_pdf_emits_one_page_per_upload_in_order() {
    let uploads = tempfile::tempdir().unwrap();
    let router = test_router(uploads.path());

    let first = png_bytes(30, 20);
    let second = png_bytes(20, 30);
    let body = multipart_body(&[
        Part {
            name: "files",
            filename: Some("a.png"),
            content_type: Some("image/png"),
            data: &first,
        },
        Part {
            name: "files",
            filename: Some("b.png"),
            content_type: Some("image/png"),
            data: &second,
        },
    ]);
    let response = router
        .oneshot(post_multipart("/api/png-to-pdf", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok()),
        Some("attachment; filename=\"png-to-pdf.pdf\"")
    );

    let bytes = body_bytes(response).await;
    let doc = lopdf::Document::load_mem(&bytes).unwrap();
    assert_eq!(doc.get_pages().len(), 2);

    assert_uploads_empty(uploads.path()).await;
}

#[tokio::test]
async fn collaborator_failure_returns_the_envelope_and_cleans_up() {
    let uploads = tempfile::tempdir().unwrap();
    let router = router_with_tools(uploads.path(), "/nonexistent/gs", "/nonexistent/pdftoppm");

    let body = multipart_body(&[Part {
        name: "file",
        filename: Some("broken.pdf"),
        content_type: Some("application/pdf"),
        data: b"%PDF-1.4 not really",
    }]);
    let response = router
        .oneshot(post_multipart("/api/compress", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["error"], "Compression failed");
    assert!(!json["details"].as_str().unwrap().is_empty());

    assert_uploads_empty(uploads.path()).await;
}

#[tokio::test]
async fn compress_round_trips_through_ghostscript() {
    if !tool_available("gs") {
        eprintln!("ghostscript not installed, skipping");
        return;
    }

    let uploads = tempfile::tempdir().unwrap();
    let inputs = tempfile::tempdir().unwrap();
    let router = test_router(uploads.path());

    let pdf = std::fs::read(sample_pdf(inputs.path())).unwrap();
    let body = multipart_body(&[Part {
        name: "file",
        filename: Some("sample.pdf"),
        content_type: Some("application/pdf"),
        data: &pdf,
    }]);
    let response = router
        .oneshot(post_multipart("/api/compress", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok()),
        Some("attachment; filename=\"compressed.pdf\"")
    );

    let bytes = body_bytes(response).await;
    assert!(bytes.starts_with(b"%PDF"));

    assert_uploads_empty(uploads.path()).await;
}

#[tokio::test]
async fn pdf_to_jpg_zips_every_page_with_stable_names() {
    if !tool_available("pdftoppm") {
        eprintln!("pdftoppm not installed, skipping");
        return;
    }

    let uploads = tempfile::tempdir().unwrap();
    let inputs = tempfile::tempdir().unwrap();
    let router = test_router(uploads.path());

    let pdf = std::fs::read(sample_pdf(inputs.path())).unwrap();
    let body = multipart_body(&[Part {
        name: "file",
        filename: Some("sample.pdf"),
        content_type: Some("application/pdf"),
        data: &pdf,
    }]);
    let response = router
        .oneshot(post_multipart("/api/pdf-to-jpg", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/zip")
    );

    let bytes = body_bytes(response).await;
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    assert_eq!(archive.len(), 1);
    assert!(archive.by_name("page_1.jpg").is_ok());

    assert_uploads_empty(uploads.path()).await;
}
