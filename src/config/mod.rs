//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, num::NonZeroU64, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "torchio";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_UPLOAD_REQUEST_LIMIT_BYTES: u64 = 50 * 1024 * 1024;
const DEFAULT_GHOSTSCRIPT_PATH: &str = "gs";
const DEFAULT_PDFTOPPM_PATH: &str = "pdftoppm";
const DEFAULT_RASTER_DPI: u32 = 200;
const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Command-line arguments for the torchio binary.
#[derive(Debug, Parser)]
#[command(name = "torchio", version, about = "torchio conversion server")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TORCHIO_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the torchio HTTP service.
    Serve(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the uploads directory.
    #[arg(long = "uploads-directory", value_name = "PATH")]
    pub uploads_directory: Option<PathBuf>,

    /// Override the maximum request size for uploads in bytes.
    #[arg(long = "uploads-max-request-bytes", value_name = "BYTES")]
    pub uploads_max_request_bytes: Option<u64>,

    /// Override the Ghostscript executable used for PDF compression.
    #[arg(long = "tools-ghostscript-path", value_name = "PATH")]
    pub tools_ghostscript_path: Option<PathBuf>,

    /// Override the pdftoppm executable used for PDF rasterization.
    #[arg(long = "tools-pdftoppm-path", value_name = "PATH")]
    pub tools_pdftoppm_path: Option<PathBuf>,

    /// Override the rasterization resolution in DPI.
    #[arg(long = "raster-dpi", value_name = "DPI")]
    pub raster_dpi: Option<u32>,

    /// Override the JPEG encoding quality (1-100).
    #[arg(long = "raster-jpeg-quality", value_name = "QUALITY")]
    pub raster_jpeg_quality: Option<u8>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub uploads: UploadSettings,
    pub tools: ToolSettings,
    pub raster: RasterSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub directory: PathBuf,
    pub max_request_bytes: NonZeroU64,
}

/// Paths to the external conversion binaries.
#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub ghostscript_path: PathBuf,
    pub pdftoppm_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RasterSettings {
    pub dpi: u32,
    pub jpeg_quality: u8,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Parse CLI arguments and load settings in one step.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let cli = CliArgs::parse();
    let settings = load(&cli)?;
    Ok((cli, settings))
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("TORCHIO").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    uploads: RawUploadSettings,
    tools: RawToolSettings,
    raster: RawRasterSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUploadSettings {
    directory: Option<PathBuf>,
    max_request_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawToolSettings {
    ghostscript_path: Option<PathBuf>,
    pdftoppm_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRasterSettings {
    dpi: Option<u32>,
    jpeg_quality: Option<u8>,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(directory) = overrides.uploads_directory.as_ref() {
            self.uploads.directory = Some(directory.clone());
        }
        if let Some(limit) = overrides.uploads_max_request_bytes {
            self.uploads.max_request_bytes = Some(limit);
        }
        if let Some(path) = overrides.tools_ghostscript_path.as_ref() {
            self.tools.ghostscript_path = Some(path.clone());
        }
        if let Some(path) = overrides.tools_pdftoppm_path.as_ref() {
            self.tools.pdftoppm_path = Some(path.clone());
        }
        if let Some(dpi) = overrides.raster_dpi {
            self.raster.dpi = Some(dpi);
        }
        if let Some(quality) = overrides.raster_jpeg_quality {
            self.raster.jpeg_quality = Some(quality);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            uploads,
            tools,
            raster,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            uploads: build_upload_settings(uploads)?,
            tools: build_tool_settings(tools)?,
            raster: build_raster_settings(raster)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_upload_settings(uploads: RawUploadSettings) -> Result<UploadSettings, LoadError> {
    let directory = uploads
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR));

    let max_request_bytes_value = uploads
        .max_request_bytes
        .unwrap_or(DEFAULT_UPLOAD_REQUEST_LIMIT_BYTES);
    let max_request_bytes = NonZeroU64::new(max_request_bytes_value).ok_or_else(|| {
        LoadError::invalid("uploads.max_request_bytes", "must be greater than zero")
    })?;
    usize::try_from(max_request_bytes_value).map_err(|_| {
        LoadError::invalid(
            "uploads.max_request_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    Ok(UploadSettings {
        directory,
        max_request_bytes,
    })
}

fn build_tool_settings(tools: RawToolSettings) -> Result<ToolSettings, LoadError> {
    let ghostscript_path = tools
        .ghostscript_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_GHOSTSCRIPT_PATH));
    if ghostscript_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "tools.ghostscript_path",
            "path must not be empty",
        ));
    }

    let pdftoppm_path = tools
        .pdftoppm_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PDFTOPPM_PATH));
    if pdftoppm_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "tools.pdftoppm_path",
            "path must not be empty",
        ));
    }

    Ok(ToolSettings {
        ghostscript_path,
        pdftoppm_path,
    })
}

fn build_raster_settings(raster: RawRasterSettings) -> Result<RasterSettings, LoadError> {
    let dpi = raster.dpi.unwrap_or(DEFAULT_RASTER_DPI);
    if dpi == 0 {
        return Err(LoadError::invalid("raster.dpi", "must be greater than zero"));
    }

    let jpeg_quality = raster.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY);
    if !(1..=100).contains(&jpeg_quality) {
        return Err(LoadError::invalid(
            "raster.jpeg_quality",
            "must be between 1 and 100",
        ));
    }

    Ok(RasterSettings { dpi, jpeg_quality })
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    format!("{host}:{port}")
        .parse()
        .map_err(|err| format!("failed to parse `{host}:{port}`: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serve_cli(overrides: ServeOverrides) -> CliArgs {
        CliArgs {
            config_file: None,
            command: Some(Command::Serve(Box::new(ServeArgs { overrides }))),
        }
    }

    #[test]
    fn defaults_resolve() {
        let cli = CliArgs {
            config_file: None,
            command: None,
        };
        let settings = load(&cli).expect("defaults should load");
        assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
        assert_eq!(settings.uploads.directory, PathBuf::from(DEFAULT_UPLOAD_DIR));
        assert_eq!(settings.raster.dpi, DEFAULT_RASTER_DPI);
        assert_eq!(settings.raster.jpeg_quality, DEFAULT_JPEG_QUALITY);
        assert_eq!(
            settings.tools.ghostscript_path,
            PathBuf::from(DEFAULT_GHOSTSCRIPT_PATH)
        );
    }

    #[test]
    fn serve_overrides_take_precedence() {
        let settings = load(&serve_cli(ServeOverrides {
            server_port: Some(9100),
            uploads_directory: Some(PathBuf::from("/tmp/torchio-test-uploads")),
            raster_dpi: Some(144),
            ..ServeOverrides::default()
        }))
        .expect("overrides should load");
        assert_eq!(settings.server.addr.port(), 9100);
        assert_eq!(
            settings.uploads.directory,
            PathBuf::from("/tmp/torchio-test-uploads")
        );
        assert_eq!(settings.raster.dpi, 144);
    }

    #[test]
    fn zero_port_is_rejected() {
        let result = load(&serve_cli(ServeOverrides {
            server_port: Some(0),
            ..ServeOverrides::default()
        }));
        assert!(matches!(
            result,
            Err(LoadError::Invalid {
                key: "server.port",
                ..
            })
        ));
    }

    #[test]
    fn jpeg_quality_bounds_are_enforced() {
        let result = load(&serve_cli(ServeOverrides {
            raster_jpeg_quality: Some(0),
            ..ServeOverrides::default()
        }));
        assert!(result.is_err());
    }
}
