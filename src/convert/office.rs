//! PDF text extraction and Office document writing. All functions here are
//! CPU-bound library calls; callers run them on a blocking thread.

use std::{fs::File, path::Path};

use docx_rs::{Docx, Paragraph, Run};
use rust_xlsxwriter::Workbook;

use crate::session::ConversionError;

// Hard limits of the xlsx format.
const XLSX_MAX_ROWS: usize = 1_048_576;
const XLSX_MAX_CELL_CHARS: usize = 32_767;

/// Extract the text content of a PDF. Scanned PDFs without a text layer
/// yield an empty string rather than an error.
pub fn pdf_text(input: &Path) -> Result<String, ConversionError> {
    pdf_extract::extract_text(input)
        .map_err(|err| ConversionError::collaborator("text extraction", err.to_string()))
}

/// Write `text` into a docx file, one paragraph per line.
pub fn text_to_docx(text: &str, output: &Path) -> Result<(), ConversionError> {
    let stage: &'static str = "docx writing";
    let mut docx = Docx::new();
    let mut wrote_any = false;
    for line in text.lines() {
        docx = docx.add_paragraph(Paragraph::new().add_run(Run::new().add_text(line)));
        wrote_any = true;
    }
    if !wrote_any {
        docx = docx.add_paragraph(Paragraph::new().add_run(Run::new().add_text("")));
    }

    let file = File::create(output)?;
    docx.build()
        .pack(file)
        .map_err(|err| ConversionError::collaborator(stage, err.to_string()))?;
    Ok(())
}

/// Write `text` into an xlsx file, one line per row in the first column.
/// Lines beyond the sheet's row capacity are dropped and over-long lines
/// truncated; the format allows nothing else.
pub fn text_to_xlsx(text: &str, output: &Path) -> Result<(), ConversionError> {
    let stage: &'static str = "xlsx writing";
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet
        .set_name("PDF Data")
        .map_err(|err| ConversionError::collaborator(stage, err.to_string()))?;

    for (row, line) in text.lines().take(XLSX_MAX_ROWS).enumerate() {
        let cell: String = line.chars().take(XLSX_MAX_CELL_CHARS).collect();
        worksheet
            .write_string(row as u32, 0, &cell)
            .map_err(|err| ConversionError::collaborator(stage, err.to_string()))?;
    }

    workbook
        .save(output)
        .map_err(|err| ConversionError::collaborator(stage, err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn docx_output_is_a_valid_zip_with_document_xml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("converted.docx");
        text_to_docx("first line\nsecond line", &out).expect("docx");

        let mut archive =
            zip::ZipArchive::new(File::open(&out).expect("open")).expect("archive");
        let mut xml = String::new();
        archive
            .by_name("word/document.xml")
            .expect("document part")
            .read_to_string(&mut xml)
            .expect("read");
        assert!(xml.contains("first line"));
        assert!(xml.contains("second line"));
    }

    #[test]
    fn empty_text_still_produces_a_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("converted.docx");
        text_to_docx("", &out).expect("docx");
        assert!(out.metadata().expect("metadata").len() > 0);
    }

    #[test]
    fn xlsx_output_contains_the_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("converted.xlsx");
        text_to_xlsx("alpha\nbeta", &out).expect("xlsx");

        let mut archive =
            zip::ZipArchive::new(File::open(&out).expect("open")).expect("archive");
        assert!(archive.by_name("xl/worksheets/sheet1.xml").is_ok());
    }
}
