//! CLI command definitions and dispatch.

mod inspect;
mod squash;
mod version;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use squash_core::SquashConfig;
use tokio_util::sync::CancellationToken;

/// Flatten container image layers into a single archive.
#[derive(Parser)]
#[command(name = "image-squash", version, about)]
pub struct Cli {
    /// Configuration file (YAML, or JSON when the extension is .json)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Load `--config` if given, defaults otherwise.
    pub fn load_config(&self) -> squash_core::Result<SquashConfig> {
        match &self.config {
            Some(path) => SquashConfig::from_file(path),
            None => Ok(SquashConfig::default()),
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Squash an image into a single layer archive
    Squash(squash::SquashArgs),
    /// List an image's layers without fetching them
    Inspect(inspect::InspectArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(
    cli: Cli,
    config: SquashConfig,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Squash(args) => squash::execute(args, config, cancel).await,
        Command::Inspect(args) => inspect::execute(args, config).await,
        Command::Version(args) => version::execute(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use squash_runtime::SourceKind;

    #[test]
    fn test_parse_squash_flags() {
        let cli = Cli::try_parse_from([
            "image-squash",
            "squash",
            "alpine:3.20",
            "out.tar.gz",
            "--source",
            "registry",
            "--gzip",
            "--prefetch",
            "5",
            "--strip-prefix",
            "rootfs",
            "--insecure",
        ])
        .unwrap();

        let Command::Squash(args) = cli.command else {
            panic!("expected squash command");
        };
        assert_eq!(args.image, "alpine:3.20");
        assert_eq!(args.output, PathBuf::from("out.tar.gz"));
        assert_eq!(args.source, SourceKind::Registry);
        assert!(args.gzip);
        assert!(args.insecure);
        assert_eq!(args.prefetch, Some(5));
        assert_eq!(args.strip_prefix.as_deref(), Some("rootfs"));
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from([
            "image-squash",
            "inspect",
            "./layout",
            "--config",
            "squash.yaml",
            "--json",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("squash.yaml")));
        let Command::Inspect(args) = cli.command else {
            panic!("expected inspect command");
        };
        assert!(args.json);
        assert_eq!(args.source, SourceKind::Auto);
    }

    #[test]
    fn test_unknown_source_is_rejected() {
        let result = Cli::try_parse_from(["image-squash", "inspect", "x", "--source", "ftp"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let cli = Cli::try_parse_from([
            "image-squash",
            "version",
            "--config",
            "/nonexistent/squash.yaml",
        ])
        .unwrap();
        assert!(cli.load_config().is_err());
    }
}
