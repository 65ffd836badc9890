//! fsrv - command line client for fsrvd

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::path::{Path, PathBuf};

use fsrv::cli::{ClientCommand, ClientOpts};
use fsrv::client::Client;

fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    let mut client = Client::connect((opts.host.as_str(), opts.port))
        .with_context(|| format!("connect to {}:{}", opts.host, opts.port))?;

    match opts.command {
        ClientCommand::Ls => {
            let names = client.list()?;
            println!("{} file(s)", names.len());
            for name in names {
                println!("  {}", name);
            }
        }
        ClientCommand::Get { remote, local } => {
            let local = local.unwrap_or_else(|| PathBuf::from(&remote));
            if !get(&mut client, &remote, &local)? {
                client.exit()?;
                anyhow::bail!("{}: not found on server", remote);
            }
        }
        ClientCommand::Put { local, remote } => {
            let remote = match remote {
                Some(r) => r,
                None => local
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_owned)
                    .with_context(|| format!("cannot derive a remote name from {}", local.display()))?,
            };
            let file = match File::open(&local) {
                Ok(f) => f,
                Err(e) => {
                    // Let the server know the announced upload is off
                    let _ = client.abort_upload();
                    return Err(e).with_context(|| format!("open {}", local.display()));
                }
            };
            let size = file.metadata()?.len();
            client.upload_from(&remote, file, size)?;
            println!("uploaded {} ({} bytes)", remote, size);
        }
    }

    client.exit()
}

fn get(client: &mut Client, remote: &str, local: &Path) -> Result<bool> {
    match client.download_file(remote, local)? {
        Some(bytes) => {
            println!("downloaded {} ({} bytes) -> {}", remote, bytes, local.display());
            Ok(true)
        }
        None => Ok(false),
    }
}
