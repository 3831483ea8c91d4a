use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;

use rosfs::cas::{CasTreeFetcher, LocalDiskBlobStore};
use rosfs::outputs::OutputServiceNode;
use rosfs::vfs::{InMemoryOutputPathFactory, InodeGenerator, NoopEntryNotifier};

#[derive(Parser)]
#[command(name = "rosfs", version, about = "Remote output service directory")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the remote output service gRPC API.
    Serve(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Address to bind the gRPC listener on.
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:8980")]
    listen: SocketAddr,

    /// Directory backing the content-addressable store.
    #[arg(long, value_name = "DIR", default_value = "./cas")]
    cas_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "rosfs=info".to_string()))
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Serve(args) => serve_cmd(args).await?,
    }

    Ok(())
}

async fn serve_cmd(args: ServeArgs) -> anyhow::Result<()> {
    if !args.cas_dir.exists() {
        std::fs::create_dir_all(&args.cas_dir)?;
    }
    if !args.cas_dir.is_dir() {
        anyhow::bail!("cas dir must be a directory");
    }

    let blobs = Arc::new(LocalDiskBlobStore::new(&args.cas_dir));
    let trees = Arc::new(CasTreeFetcher::new(blobs.clone()));
    let inodes = Arc::new(InodeGenerator::new());
    let notifier = Arc::new(NoopEntryNotifier);
    let output_paths = Arc::new(InMemoryOutputPathFactory::new(
        inodes.clone(),
        notifier.clone(),
    ));
    let node = Arc::new(OutputServiceNode::new(
        inodes,
        notifier,
        output_paths,
        blobs,
        trees,
    ));

    let listener = TcpListener::bind(args.listen).await?;
    rosfs::rpc::serve(node, listener, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(())
}
