//! Multipart payload staging: pull uploaded files out of the form and into
//! session-owned paths.

use axum_extra::extract::Multipart;

use crate::session::{ConversionError, ConversionSession};

pub struct StagedUpload {
    pub path: std::path::PathBuf,
    pub original_name: String,
}

/// Save the single `file` field into the session. Other fields are ignored.
pub async fn stage_file(
    session: &mut ConversionSession,
    multipart: &mut Multipart,
) -> Result<StagedUpload, ConversionError> {
    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|err| ConversionError::upload(err.to_string()))?;
        let Some(field) = field else {
            return Err(ConversionError::upload("missing `file` field"));
        };
        if field.name() != Some("file") {
            continue;
        }

        let original_name = field_file_name(&field);
        let path = session.allocate(&original_name);
        session.save_upload(field, &path).await?;
        return Ok(StagedUpload {
            path,
            original_name,
        });
    }
}

/// Save every `files` field into the session, preserving upload order.
pub async fn stage_files(
    session: &mut ConversionSession,
    multipart: &mut Multipart,
) -> Result<Vec<StagedUpload>, ConversionError> {
    let mut staged = Vec::new();
    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|err| ConversionError::upload(err.to_string()))?;
        let Some(field) = field else { break };
        if field.name() != Some("files") {
            continue;
        }

        let original_name = field_file_name(&field);
        let path = session.allocate(&original_name);
        session.save_upload(field, &path).await?;
        staged.push(StagedUpload {
            path,
            original_name,
        });
    }

    if staged.is_empty() {
        return Err(ConversionError::upload("missing `files` fields"));
    }
    Ok(staged)
}

/// Save the `file` field and read the textual `format` field, in whichever
/// order the client sent them.
pub async fn stage_file_with_format(
    session: &mut ConversionSession,
    multipart: &mut Multipart,
) -> Result<(StagedUpload, String), ConversionError> {
    let mut upload: Option<StagedUpload> = None;
    let mut format: Option<String> = None;

    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|err| ConversionError::upload(err.to_string()))?;
        let Some(field) = field else { break };

        match field.name() {
            Some("format") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| ConversionError::upload(err.to_string()))?
                    .trim()
                    .to_string();
                if !value.is_empty() {
                    format = Some(value);
                }
            }
            Some("file") if upload.is_none() => {
                let original_name = field_file_name(&field);
                let path = session.allocate(&original_name);
                session.save_upload(field, &path).await?;
                upload = Some(StagedUpload {
                    path,
                    original_name,
                });
            }
            _ => {}
        }
    }

    let upload = upload.ok_or_else(|| ConversionError::upload("missing `file` field"))?;
    let format = format.ok_or_else(|| ConversionError::upload("missing `format` field"))?;
    Ok((upload, format))
}

fn field_file_name(field: &axum_extra::extract::multipart::Field) -> String {
    field
        .file_name()
        .map(|value| value.to_string())
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "upload.bin".to_string())
}
