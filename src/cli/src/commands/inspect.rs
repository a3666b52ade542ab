//! `image-squash inspect` command.

use clap::Args;
use squash_core::SquashConfig;
use squash_runtime::oci::ImageManifest;
use squash_runtime::{SourceKind, Squasher};

use crate::output;

#[derive(Args)]
pub struct InspectArgs {
    /// Image to inspect
    pub image: String,

    /// Where to read the image from
    #[arg(long, default_value = "auto")]
    pub source: SourceKind,

    /// Use plain HTTP for the registry
    #[arg(long)]
    pub insecure: bool,

    /// Print the manifest as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(
    args: InspectArgs,
    mut config: SquashConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if args.insecure {
        config.registry.insecure = true;
    }
    let source = args.source.build(&config.registry);
    let manifest = Squasher::new(config, source).inspect(&args.image).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(());
    }

    println!("{}", manifest.reference);
    if let Some(digest) = &manifest.digest {
        println!("Digest: {digest}");
    }
    println!("{}", layer_table(&manifest));
    Ok(())
}

fn layer_table(manifest: &ImageManifest) -> comfy_table::Table {
    let mut table = output::new_table(&["#", "DIGEST", "MEDIA TYPE", "SIZE"]);
    for (index, layer) in manifest.layers.iter().enumerate() {
        let media_type = if layer.media_type.is_empty() {
            "-"
        } else {
            layer.media_type.as_str()
        };
        table.add_row(vec![
            index.to_string(),
            output::short_digest(&layer.digest),
            media_type.to_string(),
            output::format_bytes(layer.size),
        ]);
    }
    table
}
