//! `image-squash squash` command.

use std::path::PathBuf;

use clap::Args;
use squash_core::{OutputCompression, SquashConfig};
use squash_runtime::{SourceKind, SquashReport, Squasher};
use tokio_util::sync::CancellationToken;

use crate::output;

#[derive(Args)]
pub struct SquashArgs {
    /// Image to squash: registry reference, OCI layout directory
    /// (optionally `DIR:REF`) or `docker save` archive
    pub image: String,

    /// Destination archive path
    pub output: PathBuf,

    /// Where to read the image from
    #[arg(long, default_value = "auto")]
    pub source: SourceKind,

    /// Parent directory for the working area
    #[arg(long, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// gzip-compress the output archive
    #[arg(long)]
    pub gzip: bool,

    /// Prefix stripped from every layer member path
    #[arg(long, value_name = "PREFIX")]
    pub strip_prefix: Option<String>,

    /// Layers fetched ahead of the one being folded
    #[arg(long, value_name = "N")]
    pub prefetch: Option<usize>,

    /// Use plain HTTP for the registry
    #[arg(long)]
    pub insecure: bool,

    /// Also write the squashed filesystem to this directory
    #[arg(long, value_name = "DIR")]
    pub extract: Option<PathBuf>,

    /// Only print the output digest
    #[arg(short, long)]
    pub quiet: bool,

    /// Print the report as JSON
    #[arg(long, conflicts_with = "quiet")]
    pub json: bool,
}

impl SquashArgs {
    /// Layer command-line flags over the file configuration.
    fn apply(&self, mut config: SquashConfig) -> SquashConfig {
        if let Some(dir) = &self.work_dir {
            config.work_dir = Some(dir.clone());
        }
        if self.gzip {
            config.output_compression = OutputCompression::Gzip;
        }
        if let Some(prefix) = &self.strip_prefix {
            config.strip_prefix = Some(prefix.clone());
        }
        if let Some(prefetch) = self.prefetch {
            config.prefetch_layers = prefetch;
        }
        if self.insecure {
            config.registry.insecure = true;
        }
        config
    }
}

pub async fn execute(
    args: SquashArgs,
    config: SquashConfig,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.apply(config);
    config.validate()?;

    let source = args.source.build(&config.registry);
    let mut squasher = Squasher::new(config, source).with_cancellation(cancel);
    if let Some(dir) = &args.extract {
        squasher = squasher.with_extract_dir(dir);
    }

    let report = squasher.squash(&args.image, &args.output).await?;

    if args.quiet {
        println!("{}", report.digest);
    } else if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SquashReport) {
    let mut table = output::new_table(&["FIELD", "VALUE"]);
    table.add_row(vec!["Image".to_string(), report.reference.clone()]);
    table.add_row(vec!["Output".to_string(), report.output.display().to_string()]);
    table.add_row(vec!["Layers".to_string(), report.layers.to_string()]);
    table.add_row(vec!["Entries".to_string(), report.entries.to_string()]);
    table.add_row(vec!["Size".to_string(), output::format_bytes(report.size)]);
    table.add_row(vec!["Digest".to_string(), report.digest.clone()]);
    println!("{table}");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> SquashArgs {
        SquashArgs {
            image: "alpine".to_string(),
            output: PathBuf::from("out.tar"),
            source: SourceKind::Auto,
            work_dir: None,
            gzip: false,
            strip_prefix: None,
            prefetch: None,
            insecure: false,
            extract: None,
            quiet: false,
            json: false,
        }
    }

    #[test]
    fn test_flags_override_file_config() {
        let file = SquashConfig {
            prefetch_layers: 8,
            strip_prefix: Some("rootfs".to_string()),
            ..Default::default()
        };
        let args = SquashArgs {
            gzip: true,
            prefetch: Some(1),
            insecure: true,
            work_dir: Some(PathBuf::from("/scratch")),
            ..args()
        };

        let config = args.apply(file);
        assert_eq!(config.output_compression, OutputCompression::Gzip);
        assert_eq!(config.prefetch_layers, 1);
        assert!(config.registry.insecure);
        assert_eq!(config.work_dir, Some(PathBuf::from("/scratch")));
        assert_eq!(config.strip_prefix.as_deref(), Some("rootfs"));
    }

    #[test]
    fn test_absent_flags_keep_file_config() {
        let file = SquashConfig {
            output_compression: OutputCompression::Gzip,
            prefetch_layers: 6,
            ..Default::default()
        };
        let config = args().apply(file);
        assert_eq!(config.output_compression, OutputCompression::Gzip);
        assert_eq!(config.prefetch_layers, 6);
    }
}
