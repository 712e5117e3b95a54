use anyhow::Context;
use clap::Parser;
use ebb::download::{self, DownloadError};
use ebb::identity::ClientIdentity;
use ebb::metainfo::Metainfo;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ebb", about = "A single-file BitTorrent leecher")]
pub struct Args {
    /// Path to the .torrent file
    #[arg(short = 'T', long = "torrent")]
    torrent: PathBuf,

    /// Directory the downloaded file is written into
    #[arg(short = 'o', long = "output-dir", default_value = ".")]
    output_dir: PathBuf,

    /// Listening port reported to the tracker
    #[arg(short = 'p', long = "port", default_value_t = 6881)]
    port: u16,

    /// Write logs to this file instead of stderr
    #[arg(short = 'l', long = "logfile")]
    logfile: Option<PathBuf>,
}

const EXIT_BAD_ARGS: u8 = 1;
const EXIT_TORRENT_PARSE: u8 = 2;
const EXIT_TRACKER: u8 = 3;
const EXIT_ABORTED: u8 = 4;

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // clap renders its own usage text; --help and --version land here too
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(EXIT_BAD_ARGS)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    if let Err(err) = init_logging(args.logfile.as_deref()) {
        eprintln!("ebb: {err:#}");
        return ExitCode::from(EXIT_BAD_ARGS);
    }

    let meta = match Metainfo::read(&args.torrent).await {
        Ok(meta) => meta,
        Err(err) => {
            tracing::error!(torrent = %args.torrent.display(), error = %err, "torrent parse failed");
            return ExitCode::from(EXIT_TORRENT_PARSE);
        }
    };

    let identity = ClientIdentity::new(args.port, meta.total_length as u64);
    match download::run(meta, identity, &args.output_dir).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(DownloadError::Tracker(err)) => {
            tracing::error!(error = %err, "tracker unreachable");
            ExitCode::from(EXIT_TRACKER)
        }
        Err(err) => {
            tracing::error!(error = %err, "download aborted");
            ExitCode::from(EXIT_ABORTED)
        }
    }
}

fn init_logging(logfile: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open logfile `{}`", path.display()))?;
            builder.with_writer(Arc::new(file)).with_ansi(false).init();
        }
        None => builder.init(),
    }
    Ok(())
}
