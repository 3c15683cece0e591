//! Conversion collaborators: each submodule wraps one external tool or
//! library and reports failures as [`ConversionError::Collaborator`] with a
//! stage name suitable for logging.

pub mod ghostscript;
pub mod images;
pub mod office;
pub mod raster;

use tokio::process::Command;

use crate::session::ConversionError;

/// Run an external tool to completion, capturing output. A missing binary and
/// a non-zero exit both surface as collaborator failures carrying the stage
/// name and a stderr excerpt.
pub(crate) async fn run_tool(
    stage: &'static str,
    command: &mut Command,
) -> Result<(), ConversionError> {
    let program = command.as_std().get_program().to_string_lossy().to_string();
    let output = command.output().await.map_err(|err| {
        ConversionError::collaborator(stage, format!("could not launch `{program}`: {err}"))
    })?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let excerpt = stderr_excerpt(&stderr);
    Err(ConversionError::collaborator(
        stage,
        format!("`{program}` exited with {}: {excerpt}", output.status),
    ))
}

fn stderr_excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return "no diagnostic output".to_string();
    }
    // Keep the tail; tools print the actionable line last.
    let mut lines: Vec<&str> = trimmed.lines().collect();
    if lines.len() > 4 {
        lines = lines.split_off(lines.len() - 4);
    }
    lines.join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_excerpt_keeps_the_tail() {
        let noisy = "line1\nline2\nline3\nline4\nline5\nline6";
        assert_eq!(stderr_excerpt(noisy), "line3 | line4 | line5 | line6");
        assert_eq!(stderr_excerpt("  \n "), "no diagnostic output");
    }

    #[tokio::test]
    async fn missing_binary_is_a_collaborator_failure() {
        let mut command = Command::new("/nonexistent/definitely-not-a-tool");
        let err = run_tool("pdf compression", &mut command)
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains("pdf compression failed"));
    }
}
