//! Harbor CLI
//!
//! Serve libraries over mutually-authenticated TLS, or act as the
//! transfer client against a running server.

mod progress;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use harbor_auth::vault;
use harbor_client::Client;
use harbor_core::config::{ClientConfig, ServerConfig};
use harbor_server::Server;
use progress::{TransferProgress, format_bytes};

/// Harbor - secure library-scoped file transfer
#[derive(Parser)]
#[command(name = "harbor")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (server config for `serve`, client config
    /// otherwise)
    #[arg(short, long)]
    config: PathBuf,

    /// Passphrase for encrypted configuration files
    #[arg(long, env = "HARBOR_CONFIG_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Serve,

    /// Upload a file
    Put {
        /// Local file to send
        local: PathBuf,
        /// Destination path inside the library
        remote: String,
        /// Start over instead of resuming a partial upload
        #[arg(long)]
        no_resume: bool,
    },

    /// Download a file
    Get {
        /// Source path inside the library
        remote: String,
        /// Local destination file
        local: PathBuf,
        /// Start over instead of resuming a partial download
        #[arg(long)]
        no_resume: bool,
    },

    /// List a directory
    Ls {
        /// Directory inside the library
        #[arg(default_value = "/")]
        path: String,
        /// Descend into subdirectories
        #[arg(short, long)]
        recursive: bool,
    },

    /// Recursive listing with checksums
    Manifest {
        /// Subtree inside the library
        #[arg(default_value = "/")]
        path: String,
    },

    /// Delete a file
    Rm {
        /// Path inside the library
        remote: String,
    },

    /// Rename or move a file
    Mv {
        /// Current path
        old: String,
        /// New path
        new: String,
    },

    /// Create a directory
    Mkdir {
        /// Directory to create
        path: String,
    },

    /// Remove a directory
    Rmdir {
        /// Directory to remove
        path: String,
        /// Remove non-empty directories
        #[arg(short, long)]
        recursive: bool,
    },

    /// Show file metadata
    Stat {
        /// Path inside the library
        path: String,
    },

    /// Print a file's SHA-256 digest
    Checksum {
        /// Path inside the library
        path: String,
    },

    /// Check whether a path exists
    Exists {
        /// Path inside the library
        path: String,
    },

    /// Probe the server
    Ping,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "debug" } else { "info" })
        .init();

    match cli.command {
        Commands::Serve => serve(&cli).await,
        _ => run_client_command(cli).await,
    }
}

async fn serve(cli: &Cli) -> anyhow::Result<()> {
    let config = load_server_config(cli)?;
    let server = Server::bind(config)
        .await
        .context("failed to start server")?;
    server.run().await.context("server failed")?;
    Ok(())
}

async fn run_client_command(cli: Cli) -> anyhow::Result<()> {
    let config = load_client_config(&cli)?;
    let mut client = Client::connect(config)
        .await
        .context("failed to connect")?;

    let result = execute(&mut client, &cli.command).await;
    client.disconnect().await;
    result
}

async fn execute(client: &mut Client, command: &Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve => unreachable!("handled in main"),

        Commands::Put {
            local,
            remote,
            no_resume,
        } => {
            let size = std::fs::metadata(local)
                .with_context(|| format!("cannot read {}", local.display()))?
                .len();
            let name = local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| remote.clone());

            // The digest pass and the send each cover the file once.
            let bar = TransferProgress::new(size * 2, &name);
            let mut on_progress = |done: u64, total: u64| bar.update(done, total);

            let outcome = if *no_resume {
                client.upload(local, remote, false, Some(&mut on_progress)).await
            } else {
                client
                    .upload_with_retry(local, remote, Some(&mut on_progress))
                    .await
            };

            match outcome {
                Ok(()) => {
                    bar.finish_with_message(format!("Uploaded {} ({})", remote, format_bytes(size)));
                    Ok(())
                }
                Err(err) => {
                    bar.abandon();
                    Err(err.into())
                }
            }
        }

        Commands::Get {
            remote,
            local,
            no_resume,
        } => {
            let bar = TransferProgress::new(0, remote);
            let mut on_progress = |done: u64, total: u64| bar.update(done, total);

            let outcome = if *no_resume {
                client.download(remote, local, false, Some(&mut on_progress)).await
            } else {
                client
                    .download_with_retry(remote, local, Some(&mut on_progress))
                    .await
            };

            match outcome {
                Ok(()) => {
                    bar.finish_with_message(format!("Downloaded {} -> {}", remote, local.display()));
                    Ok(())
                }
                Err(err) => {
                    bar.abandon();
                    Err(err.into())
                }
            }
        }

        Commands::Ls { path, recursive } => {
            let files = client.list(path, *recursive).await?;
            for entry in &files {
                if entry.is_directory {
                    println!("{:>10}  {}/", "-", entry.path);
                } else {
                    println!("{:>10}  {}", format_bytes(entry.size), entry.path);
                }
            }
            println!("{} entries", files.len());
            Ok(())
        }

        Commands::Manifest { path } => {
            let files = client.manifest(path).await?;
            for entry in files.iter().filter(|e| !e.is_directory) {
                println!("{}  {:>10}  {}", entry.checksum, format_bytes(entry.size), entry.path);
            }
            println!("{} entries", files.len());
            Ok(())
        }

        Commands::Rm { remote } => {
            client.delete(remote).await?;
            println!("Deleted {remote}");
            Ok(())
        }

        Commands::Mv { old, new } => {
            client.rename(old, new).await?;
            println!("Renamed {old} -> {new}");
            Ok(())
        }

        Commands::Mkdir { path } => {
            client.mkdir(path).await?;
            println!("Created {path}");
            Ok(())
        }

        Commands::Rmdir { path, recursive } => {
            client.rmdir(path, *recursive).await?;
            println!("Removed {path}");
            Ok(())
        }

        Commands::Stat { path } => {
            let info = client.stat(path).await?;
            println!("Path:     {}", info.path);
            println!(
                "Type:     {}",
                if info.is_directory { "directory" } else { "file" }
            );
            println!("Size:     {}", format_bytes(info.size));
            if !info.checksum.is_empty() {
                println!("SHA-256:  {}", info.checksum);
            }
            println!("Modified: {}", info.modified_time);
            Ok(())
        }

        Commands::Checksum { path } => {
            let digest = client.checksum(path).await?;
            println!("{digest}  {path}");
            Ok(())
        }

        Commands::Exists { path } => {
            let exists = client.exists(path).await?;
            println!("{exists}");
            if !exists {
                std::process::exit(1);
            }
            Ok(())
        }

        Commands::Ping => {
            if client.ping().await {
                println!("Server is reachable (session {})", client.session_id());
                Ok(())
            } else {
                anyhow::bail!("server did not answer the ping")
            }
        }
    }
}

fn load_server_config(cli: &Cli) -> anyhow::Result<ServerConfig> {
    let json = read_config_text(cli)?;
    Ok(ServerConfig::from_json(&json)?)
}

fn load_client_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let json = read_config_text(cli)?;
    let config = ClientConfig::from_json(&json)?;
    config.validate()?;
    Ok(config)
}

fn read_config_text(cli: &Cli) -> anyhow::Result<String> {
    let raw = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("cannot read config {}", cli.config.display()))?;

    if vault::is_envelope(&raw) {
        let passphrase = cli
            .passphrase
            .as_deref()
            .context("config is encrypted; supply --passphrase or HARBOR_CONFIG_PASSPHRASE")?;
        let plaintext = vault::open(&raw, passphrase)?;
        return String::from_utf8(plaintext).context("decrypted config is not UTF-8");
    }

    Ok(raw)
}
