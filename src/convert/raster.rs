//! PDF page rasterization via Poppler's `pdftoppm`, plus zip packaging of
//! the resulting page images.

use std::{
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use tokio::process::Command;
use zip::{CompressionMethod, ZipWriter, write::FileOptions};

use super::run_tool;
use crate::session::ConversionError;

const STAGE: &str = "pdf rasterization";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterFormat {
    Jpeg,
    Png,
}

impl RasterFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }
}

/// Render every page of `input` into `out_dir`, one image per page, named
/// `page_1.<ext>` through `page_P.<ext>` in page order. Returns the page
/// files in order.
pub async fn pdf_to_images(
    pdftoppm_path: &Path,
    input: &Path,
    out_dir: &Path,
    format: RasterFormat,
    dpi: u32,
    jpeg_quality: u8,
) -> Result<Vec<PathBuf>, ConversionError> {
    let prefix = out_dir.join("page");
    let mut command = Command::new(pdftoppm_path);
    match format {
        RasterFormat::Jpeg => {
            command
                .arg("-jpeg")
                .arg("-jpegopt")
                .arg(format!("quality={jpeg_quality}"));
        }
        RasterFormat::Png => {
            command.arg("-png");
        }
    }
    command
        .arg("-r")
        .arg(dpi.to_string())
        .arg(input)
        .arg(&prefix);
    run_tool(STAGE, &mut command).await?;

    let pages = collect_pages(out_dir, format).await?;
    if pages.is_empty() {
        return Err(ConversionError::collaborator(
            STAGE,
            "no pages were rendered",
        ));
    }
    Ok(pages)
}

/// `pdftoppm` zero-pads page numbers based on the page count (`page-01.jpg`),
/// so gather its output, order by page number, and rename to the stable
/// `page_N.<ext>` scheme.
async fn collect_pages(
    out_dir: &Path,
    format: RasterFormat,
) -> Result<Vec<PathBuf>, ConversionError> {
    let extension = format.extension();
    let mut rendered: Vec<(u32, PathBuf)> = Vec::new();

    let mut entries = tokio::fs::read_dir(out_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(number) = name
            .strip_prefix("page-")
            .and_then(|rest| rest.strip_suffix(&format!(".{extension}")))
            .and_then(|digits| digits.parse::<u32>().ok())
        else {
            continue;
        };
        rendered.push((number, path));
    }
    rendered.sort_by_key(|(number, _)| *number);

    let mut pages = Vec::with_capacity(rendered.len());
    for (index, (_, path)) in rendered.into_iter().enumerate() {
        let renamed = out_dir.join(format!("page_{}.{extension}", index + 1));
        tokio::fs::rename(&path, &renamed).await?;
        pages.push(renamed);
    }
    Ok(pages)
}

/// Pack `files` into a zip archive at `zip_path`, storing each entry under
/// its basename. Blocking; run on a blocking thread.
pub fn zip_files(files: &[PathBuf], zip_path: &Path) -> Result<(), ConversionError> {
    let stage: &'static str = "zip packaging";
    let archive = File::create(zip_path)?;
    let mut writer = ZipWriter::new(archive);
    let options = FileOptions::<'_, ()>::default().compression_method(CompressionMethod::Deflated);

    let mut buffer = Vec::new();
    for file in files {
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ConversionError::collaborator(stage, "page file has no name"))?;
        writer
            .start_file(name, options)
            .map_err(|err| ConversionError::collaborator(stage, err.to_string()))?;
        buffer.clear();
        File::open(file)?.read_to_end(&mut buffer)?;
        writer.write_all(&buffer)?;
    }
    writer
        .finish()
        .map_err(|err| ConversionError::collaborator(stage, err.to_string()))?;
    Ok(())
}
