//! PDF compression via Ghostscript's `pdfwrite` device.

use std::path::Path;

use tokio::process::Command;

use super::run_tool;
use crate::session::ConversionError;

const STAGE: &str = "pdf compression";

/// Rewrite `input` into `output` with Ghostscript's `/ebook` preset, which
/// downsamples embedded images to roughly 150 dpi.
pub async fn compress(
    ghostscript_path: &Path,
    input: &Path,
    output: &Path,
) -> Result<(), ConversionError> {
    let mut command = Command::new(ghostscript_path);
    command
        .arg("-sDEVICE=pdfwrite")
        .arg("-dCompatibilityLevel=1.4")
        .arg("-dPDFSETTINGS=/ebook")
        .arg("-dNOPAUSE")
        .arg("-dQUIET")
        .arg("-dBATCH")
        .arg(format!("-sOutputFile={}", output.display()))
        .arg(input);
    run_tool(STAGE, &mut command).await?;

    // Ghostscript can exit zero without writing anything for some corrupt
    // inputs; treat a missing or empty output as a failure.
    match tokio::fs::metadata(output).await {
        Ok(meta) if meta.len() > 0 => Ok(()),
        _ => Err(ConversionError::collaborator(
            STAGE,
            "ghostscript produced no output",
        )),
    }
}
