// Copyright 2026 The Simlin Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use simlin_worker::{WorkerHandle, init_logging};

#[derive(Parser, Debug)]
#[command(name = "simlin-worker")]
#[command(version, about = "Run a simulation, answering JSON commands line by line")]
struct Args {
    /// Path to the project JSON, or `-` to read it from stdin
    project: PathBuf,

    /// Read commands from this file instead of stdin
    #[arg(long)]
    commands: Option<PathBuf>,
}

async fn read_project(args: &Args) -> Result<String> {
    if args.project.as_os_str() == "-" {
        if args.commands.is_none() {
            bail!("reading the project from stdin requires --commands");
        }
        let mut contents = String::new();
        tokio::io::stdin()
            .read_to_string(&mut contents)
            .await
            .context("reading project from stdin")?;
        return Ok(contents);
    }

    tokio::fs::read_to_string(&args.project)
        .await
        .with_context(|| format!("reading {}", args.project.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let project_json = read_project(&args).await?;
    let worker = WorkerHandle::start(project_json).await?;

    let input: Box<dyn AsyncBufRead + Unpin + Send> = match &args.commands {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let mut stdout = tokio::io::stdout();
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(response) = worker.handle_line(&line).await? {
            stdout.write_all(response.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }

    Ok(())
}
