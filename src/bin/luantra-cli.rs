use anyhow::{bail, Context};
use serde_json::{json, Value};
use std::env;
use std::time::Duration;
use tracing::error;

const DEFAULT_SERVER: &str = "http://localhost:3001";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    let server = env::var("LUANTRA_SERVER").unwrap_or_else(|_| DEFAULT_SERVER.to_string());
    let client = Client::new(&server)?;

    match args[1].as_str() {
        "health" => client.health().await?,
        "status" => {
            let Some(session) = args.get(2) else {
                error!("Usage: luantra-cli status <session-id>");
                return Ok(());
            };
            client.status(session).await?;
        }
        "history" => {
            let Some(session) = args.get(2) else {
                error!("Usage: luantra-cli history <session-id>");
                return Ok(());
            };
            client.history(session).await?;
        }
        "chat" => {
            if args.len() < 4 {
                error!("Usage: luantra-cli chat <session-id> <message>");
                return Ok(());
            }
            client.chat(&args[2], &args[3..].join(" ")).await?;
        }
        "help" | "--help" | "-h" => print_help(),
        other => {
            error!("Unknown command: {}", other);
            print_help();
        }
    }

    Ok(())
}

fn print_help() {
    println!("Luantra CLI - talk to a running Luantra server");
    println!();
    println!("USAGE:");
    println!("    luantra-cli <COMMAND> [ARGS]");
    println!();
    println!("COMMANDS:");
    println!("    health                       Show server health");
    println!("    status <session-id>          Show training progress for a session");
    println!("    history <session-id>         Print a session's conversation");
    println!("    chat <session-id> <message>  Send a chat message");
    println!("    help                         Show this help message");
    println!();
    println!("The server address is read from LUANTRA_SERVER (default {}).", DEFAULT_SERVER);
}

struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    fn new(base: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> anyhow::Result<Value> {
        let response = request.send().await.context("contacting server")?;
        let status = response.status();
        let body: Value = response.json().await.context("reading response")?;
        if !status.is_success() {
            let message = body["error"].as_str().unwrap_or("unknown error");
            bail!("server returned {}: {}", status, message);
        }
        Ok(body)
    }

    async fn health(&self) -> anyhow::Result<()> {
        let body = self.send(self.http.get(format!("{}/health", self.base))).await?;
        println!("Status: {}", body["status"].as_str().unwrap_or("unknown"));
        println!("Version: {}", body["version"].as_str().unwrap_or("?"));
        println!("Sessions: {}", body["sessions"]);
        println!("Active jobs: {}", body["activeJobs"]);
        Ok(())
    }

    async fn status(&self, session: &str) -> anyhow::Result<()> {
        let url = format!("{}/training-progress/{}", self.base, session);
        let body = self.send(self.http.get(url)).await?;

        if !body["hasActiveJob"].as_bool().unwrap_or(false) {
            println!("No active training job (stage: {})", body["stage"].as_str().unwrap_or("?"));
            return Ok(());
        }
        let progress = &body["progress"];
        println!(
            "[{:>3}%] {} ({})",
            progress["percentage"],
            progress["stage"].as_str().unwrap_or(""),
            progress["eta"].as_str().unwrap_or("")
        );
        if body["isComplete"].as_bool().unwrap_or(false) {
            println!("Training complete.");
        } else if body["hasFailed"].as_bool().unwrap_or(false) {
            println!("Training failed.");
        }
        Ok(())
    }

    async fn history(&self, session: &str) -> anyhow::Result<()> {
        let url = format!("{}/chat-history/{}", self.base, session);
        let body = self.send(self.http.get(url)).await?;

        println!("Session {} (stage: {})", session, body["stage"].as_str().unwrap_or("?"));
        for message in body["messages"].as_array().into_iter().flatten() {
            println!();
            println!(
                "{}: {}",
                message["role"].as_str().unwrap_or("?"),
                message["text"].as_str().unwrap_or("")
            );
        }
        Ok(())
    }

    async fn chat(&self, session: &str, message: &str) -> anyhow::Result<()> {
        let request = self
            .http
            .post(format!("{}/chat", self.base))
            .json(&json!({ "sessionId": session, "message": message }));
        let body = self.send(request).await?;
        println!("{}", body["message"].as_str().unwrap_or(""));
        Ok(())
    }
}
