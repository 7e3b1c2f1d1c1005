use std::{fs, path::PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "scan-client", about = "Command-line client for the piiscan server")]
struct Cli {
    /// Base URL of the running server.
    #[arg(long, default_value = "http://127.0.0.1:50051")]
    server: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a unary scan and print the detected spans.
    Detect {
        /// Text to scan; mutually exclusive with --file.
        #[arg(long)]
        text: Option<String>,
        /// File whose contents should be scanned.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Confidence floor for the scan.
        #[arg(long)]
        threshold: Option<f32>,
        /// Skip the policy store and use the server's on-disk defaults.
        #[arg(long)]
        no_store: bool,
        /// Print the masked rendering instead of the span list.
        #[arg(long)]
        masked: bool,
    },
    /// Run a streaming scan and print each frame as it arrives.
    Stream {
        /// Text to scan; mutually exclusive with --file.
        #[arg(long)]
        text: Option<String>,
        /// File whose contents should be scanned.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Confidence floor for the scan.
        #[arg(long)]
        threshold: Option<f32>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Command::Detect {
            text,
            file,
            threshold,
            no_store,
            masked,
        } => {
            let content = load_content(text, file)?;
            let payload = serde_json::json!({
                "content": content,
                "threshold": threshold,
                "options": { "fetch_policy_from_store": !no_store }
            });
            let response = client
                .post(format!("{}/detect", cli.server.trim_end_matches('/')))
                .json(&payload)
                .send()
                .await
                .context("request failed")?;
            if !response.status().is_success() {
                bail!("server returned {}: {}", response.status(), response.text().await.unwrap_or_default());
            }
            let body: Value = response.json().await.context("invalid response body")?;
            if masked {
                println!("{}", body["masked_content"].as_str().unwrap_or_default());
            } else {
                print_entities(&body["entities"]);
                if let Some(summary) = body["summary"].as_object() {
                    for (name, count) in summary {
                        println!("{name}: {count}");
                    }
                }
            }
        }
        Command::Stream {
            text,
            file,
            threshold,
        } => {
            let content = load_content(text, file)?;
            let payload = serde_json::json!({
                "content": content,
                "threshold": threshold,
            });
            let response = client
                .post(format!("{}/detect/stream", cli.server.trim_end_matches('/')))
                .json(&payload)
                .send()
                .await
                .context("request failed")?;
            if !response.status().is_success() {
                bail!("server returned {}: {}", response.status(), response.text().await.unwrap_or_default());
            }

            let mut buffer = String::new();
            let mut response = response;
            while let Some(chunk) = response.chunk().await.context("stream interrupted")? {
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let frame: Value = serde_json::from_str(line).context("invalid frame")?;
                    println!(
                        "chunk {}/{} — {} entities",
                        frame["chunk_index"],
                        frame["total_chunks"],
                        frame["entities"].as_array().map(Vec::len).unwrap_or(0)
                    );
                    print_entities(&frame["entities"]);
                }
            }
        }
    }
    Ok(())
}

fn load_content(text: Option<String>, file: Option<PathBuf>) -> Result<String> {
    match (text, file) {
        (Some(text), None) => Ok(text),
        (None, Some(path)) => {
            fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))
        }
        (Some(_), Some(_)) => bail!("--text and --file are mutually exclusive"),
        (None, None) => bail!("one of --text or --file is required"),
    }
}

fn print_entities(entities: &Value) {
    let Some(entities) = entities.as_array() else {
        return;
    };
    for entity in entities {
        println!(
            "  [{:>5}..{:<5}] {:<14} {:.2}  {}",
            entity["start"],
            entity["end"],
            entity["type"].as_str().unwrap_or("?"),
            entity["score"].as_f64().unwrap_or(0.0),
            entity["text"].as_str().unwrap_or("")
        );
    }
}
