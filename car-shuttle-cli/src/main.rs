use anyhow::{Context, Result};
use car_shuttle::{pack_tree, Config};
use clap::Parser;
use std::{env, io, path::PathBuf};
use tracing_subscriber::EnvFilter;

mod estuary;

use estuary::EstuaryClient;

/// Pack a path into UnixFS CAR chunks and pin them on an Estuary shuttle.
///
/// Reads the bearer token from `ESTUARY_KEY` and the shuttle hostname from
/// `ESTUARY_SHUTTLE`. On success the root CID is printed on stdout.
#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    /// File, directory or symlink to pack and upload.
    path: PathBuf,
}

fn main() -> Result<()> {
    // Diagnostics go to stderr; stdout carries only the root CID.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let key = env::var("ESTUARY_KEY").context("ESTUARY_KEY must be set")?;
    let shuttle = env::var("ESTUARY_SHUTTLE").context("ESTUARY_SHUTTLE must be set")?;
    let sink = EstuaryClient::new(&shuttle, key);

    let root = pack_tree(&args.path, &sink, &Config::default())?;
    tracing::info!(
        file_size = root.file_size,
        dag_size = root.dag_size,
        "upload complete"
    );
    println!("{}", root.cid);
    Ok(())
}
