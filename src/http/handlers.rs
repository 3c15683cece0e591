//! One handler per conversion route. Handlers only orchestrate: stage the
//! uploads into a session, run the collaborator, hand the artifact back
//! through [`ConversionSession::finalize`]. Every error path runs cleanup
//! before the envelope is returned.

use std::path::PathBuf;

use axum::{Json, extract::State, response::Response};
use axum_extra::extract::Multipart;
use metrics::counter;
use serde_json::{Value, json};

use super::{AppState, error::ApiError, multipart};
use crate::{
    convert::{
        ghostscript, images, office,
        raster::{self, RasterFormat},
    },
    session::{ConversionError, ConversionSession, Staged},
};

const DOCX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

const COMPRESSION_FAILED: &str = "Compression failed";
const CONVERSION_FAILED: &str = "Conversion failed";

pub async fn root() -> Json<Value> {
    Json(json!({ "message": "torchio server is running and CORS is enabled." }))
}

pub async fn compress_pdf(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut session = open_session(&state, COMPRESSION_FAILED)?;
    let staged = stage_compress(&state, &mut session, &mut multipart).await;
    respond(session, staged, COMPRESSION_FAILED).await
}

async fn stage_compress(
    state: &AppState,
    session: &mut ConversionSession,
    multipart: &mut Multipart,
) -> Result<Staged, ConversionError> {
    let upload = multipart::stage_file(session, multipart).await?;
    let output = session.allocate("compressed.pdf");
    ghostscript::compress(&state.tools.ghostscript_path, &upload.path, &output).await?;
    Ok(Staged {
        path: output,
        download_name: "compressed.pdf".to_string(),
        content_type: "application/pdf".to_string(),
    })
}

pub async fn pdf_to_word(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut session = open_session(&state, CONVERSION_FAILED)?;
    let staged = stage_pdf_to_word(&mut session, &mut multipart).await;
    respond(session, staged, CONVERSION_FAILED).await
}

async fn stage_pdf_to_word(
    session: &mut ConversionSession,
    multipart: &mut Multipart,
) -> Result<Staged, ConversionError> {
    let upload = multipart::stage_file(session, multipart).await?;
    let input = upload.path.clone();
    let text = run_blocking(move || office::pdf_text(&input)).await?;

    let output = session.allocate("converted.docx");
    let out = output.clone();
    run_blocking(move || office::text_to_docx(&text, &out)).await?;
    Ok(Staged {
        path: output,
        download_name: "converted.docx".to_string(),
        content_type: DOCX_CONTENT_TYPE.to_string(),
    })
}

pub async fn pdf_to_excel(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut session = open_session(&state, CONVERSION_FAILED)?;
    let staged = stage_pdf_to_excel(&mut session, &mut multipart).await;
    respond(session, staged, CONVERSION_FAILED).await
}

async fn stage_pdf_to_excel(
    session: &mut ConversionSession,
    multipart: &mut Multipart,
) -> Result<Staged, ConversionError> {
    let upload = multipart::stage_file(session, multipart).await?;
    let input = upload.path.clone();
    let text = run_blocking(move || office::pdf_text(&input)).await?;

    let output = session.allocate("converted.xlsx");
    let out = output.clone();
    run_blocking(move || office::text_to_xlsx(&text, &out)).await?;
    Ok(Staged {
        path: output,
        download_name: "converted.xlsx".to_string(),
        content_type: XLSX_CONTENT_TYPE.to_string(),
    })
}

pub async fn pdf_to_jpg(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut session = open_session(&state, CONVERSION_FAILED)?;
    let staged = stage_pdf_to_pages(&state, &mut session, &mut multipart, RasterFormat::Jpeg).await;
    respond(session, staged, CONVERSION_FAILED).await
}

pub async fn pdf_to_png(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut session = open_session(&state, CONVERSION_FAILED)?;
    let staged = stage_pdf_to_pages(&state, &mut session, &mut multipart, RasterFormat::Png).await;
    respond(session, staged, CONVERSION_FAILED).await
}

async fn stage_pdf_to_pages(
    state: &AppState,
    session: &mut ConversionSession,
    multipart: &mut Multipart,
    format: RasterFormat,
) -> Result<Staged, ConversionError> {
    let upload = multipart::stage_file(session, multipart).await?;
    let pages_dir = session.allocate_dir("pages")?;
    let pages = raster::pdf_to_images(
        &state.tools.pdftoppm_path,
        &upload.path,
        &pages_dir,
        format,
        state.raster.dpi,
        state.raster.jpeg_quality,
    )
    .await?;

    let zip_name = match format {
        RasterFormat::Jpeg => "pdf-to-jpg.zip",
        RasterFormat::Png => "pdf-to-png.zip",
    };
    let output = session.allocate(zip_name);
    let out = output.clone();
    run_blocking(move || raster::zip_files(&pages, &out)).await?;
    Ok(Staged {
        path: output,
        download_name: zip_name.to_string(),
        content_type: "application/zip".to_string(),
    })
}

pub async fn jpg_to_pdf(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut session = open_session(&state, CONVERSION_FAILED)?;
    let staged = stage_images_to_pdf(&state, &mut session, &mut multipart, "jpg-to-pdf.pdf").await;
    respond(session, staged, CONVERSION_FAILED).await
}

pub async fn png_to_pdf(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut session = open_session(&state, CONVERSION_FAILED)?;
    let staged = stage_images_to_pdf(&state, &mut session, &mut multipart, "png-to-pdf.pdf").await;
    respond(session, staged, CONVERSION_FAILED).await
}

async fn stage_images_to_pdf(
    state: &AppState,
    session: &mut ConversionSession,
    multipart: &mut Multipart,
    download_name: &str,
) -> Result<Staged, ConversionError> {
    let uploads = multipart::stage_files(session, multipart).await?;
    let inputs: Vec<PathBuf> = uploads.into_iter().map(|upload| upload.path).collect();

    let output = session.allocate(download_name);
    let out = output.clone();
    let quality = state.raster.jpeg_quality;
    run_blocking(move || images::images_to_pdf(&inputs, &out, quality)).await?;
    Ok(Staged {
        path: output,
        download_name: download_name.to_string(),
        content_type: "application/pdf".to_string(),
    })
}

pub async fn image_convert(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut session = open_session(&state, CONVERSION_FAILED)?;
    let staged = stage_image_convert(&state, &mut session, &mut multipart).await;
    respond(session, staged, CONVERSION_FAILED).await
}

async fn stage_image_convert(
    state: &AppState,
    session: &mut ConversionSession,
    multipart: &mut Multipart,
) -> Result<Staged, ConversionError> {
    let (upload, format) = multipart::stage_file_with_format(session, multipart).await?;
    let format = format.to_ascii_lowercase();
    let download_name = format!("converted.{format}");

    let output = session.allocate(&download_name);
    let input = upload.path.clone();
    let out = output.clone();
    let target = format.clone();
    let quality = state.raster.jpeg_quality;
    run_blocking(move || images::reencode(&input, &target, &out, quality)).await?;

    let content_type = mime_guess::from_path(&output)
        .first_or_octet_stream()
        .to_string();
    Ok(Staged {
        path: output,
        download_name,
        content_type,
    })
}

fn open_session(state: &AppState, short: &'static str) -> Result<ConversionSession, ApiError> {
    ConversionSession::new(&state.uploads_dir)
        .map_err(|err| ApiError::from_conversion(short, &err))
}

async fn run_blocking<T>(
    task: impl FnOnce() -> Result<T, ConversionError> + Send + 'static,
) -> Result<T, ConversionError>
where
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| ConversionError::collaborator("worker pool", err.to_string()))?
}

async fn respond(
    mut session: ConversionSession,
    staged: Result<Staged, ConversionError>,
    short: &'static str,
) -> Result<Response, ApiError> {
    match staged {
        Ok(staged) => match session.finalize(staged).await {
            Ok(response) => {
                counter!("torchio_conversions_total").increment(1);
                Ok(response)
            }
            Err(err) => {
                counter!("torchio_conversion_failures_total").increment(1);
                Err(ApiError::from_conversion(short, &err))
            }
        },
        Err(err) => {
            session.cleanup().await;
            counter!("torchio_conversion_failures_total").increment(1);
            Err(ApiError::from_conversion(short, &err))
        }
    }
}
