//! Command line access to a registry blob store.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use eyre::WrapErr;
use registry::notifications::{ActorRecord, RequestRecord};
use registry::{Digest, Registry, RegistryConfig};
use storage::StorageConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Push, fetch and digest registry layers.
#[derive(Debug, Parser)]
#[command(name = "registry-blobs", version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "REGISTRY_CONFIG")]
    config: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the canonical tarsum digest of a tar archive
    Digest {
        /// The archive
        file: Utf8PathBuf,
    },

    /// Upload a tar archive as a layer of a repository
    Push {
        /// Repository name
        repository: String,

        /// The archive
        file: Utf8PathBuf,

        /// Digest the archive is expected to have
        #[arg(long)]
        digest: Option<Digest>,
    },

    /// Write the content of a layer to stdout, or to a file
    Fetch {
        /// Repository name
        repository: String,

        /// Digest of the layer
        digest: Digest,

        /// Where to write the content
        #[arg(short, long)]
        output: Option<Utf8PathBuf>,
    },
}

fn load_config(path: Option<&Utf8PathBuf>) -> eyre::Result<RegistryConfig> {
    let Some(path) = path else {
        tracing::debug!("No configuration file, storing under ./registry-data");
        return Ok(RegistryConfig {
            storage: StorageConfig::Local {
                path: "registry-data".into(),
            },
            ..Default::default()
        });
    };

    let contents = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read configuration from {path}"))?;
    toml_edit::de::from_str(&contents)
        .wrap_err_with(|| format!("failed to parse configuration from {path}"))
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,registry=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match args.command {
        Command::Digest { file } => {
            let reader = tokio::fs::File::open(&file)
                .await
                .wrap_err_with(|| format!("failed to open {file}"))?;
            let digest = registry::digest_tar(reader).await?;
            println!("{digest}");
        }
        Command::Push {
            repository,
            file,
            digest,
        } => {
            let config = load_config(args.config.as_ref())?;
            let bridge = config.events.as_ref().map(|events| events.bridge());
            let registry = Registry::from_config(config)?;
            let store = registry.repository(&repository)?;

            let digest = match digest {
                Some(digest) => digest,
                None => {
                    let reader = tokio::fs::File::open(&file)
                        .await
                        .wrap_err_with(|| format!("failed to open {file}"))?;
                    registry::digest_tar(reader).await?
                }
            };

            let reader = tokio::fs::File::open(&file)
                .await
                .wrap_err_with(|| format!("failed to open {file}"))?;
            let upload = store.upload().await?;
            upload.copy_from(reader).await?;

            let layer = match upload.finish(&digest).await {
                Ok(layer) => layer,
                Err(err) => {
                    if !upload.state().await.is_closed() {
                        upload.cancel().await?;
                    }
                    return Err(err).wrap_err("upload failed");
                }
            };

            tracing::info!(digest = %layer.digest, size = layer.size, "Pushed layer");
            match bridge {
                Some(bridge) => {
                    let event = bridge.layer_pushed(
                        &layer,
                        RequestRecord::default(),
                        ActorRecord::default(),
                    );
                    println!("{}", serde_json::to_string_pretty(&event)?);
                }
                None => println!("{}", layer.digest),
            }
        }
        Command::Fetch {
            repository,
            digest,
            output,
        } => {
            let config = load_config(args.config.as_ref())?;
            let registry = Registry::from_config(config)?;
            let store = registry.repository(&repository)?;

            let layer = store.fetch(&digest).await?;
            let mut reader = store.open(&layer).await?;
            match output {
                Some(path) => {
                    let mut file = tokio::fs::File::create(&path)
                        .await
                        .wrap_err_with(|| format!("failed to create {path}"))?;
                    tokio::io::copy(&mut reader, &mut file).await?;
                }
                None => {
                    tokio::io::copy(&mut reader, &mut tokio::io::stdout()).await?;
                }
            }
        }
    }

    Ok(())
}
