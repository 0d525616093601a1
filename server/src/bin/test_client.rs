use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use shared::{codes, Envelope};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Connects to a session server, optionally logs in, and prints what comes back
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Server WebSocket URL
    #[arg(short, long, default_value = "ws://127.0.0.1:8080")]
    url: String,
    /// Log in with this uid
    #[arg(long, requires = "secret")]
    uid: Option<i64>,
    /// Login secret printed by the server at startup
    #[arg(long)]
    secret: Option<String>,
    /// Raw frame to send after login; may be repeated
    #[arg(long = "send")]
    frames: Vec<String>,
    /// How long to keep listening, in seconds
    #[arg(long, default_value_t = 5)]
    listen_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    println!("Connecting to {}", args.url);
    let (mut ws, _) = connect_async(args.url.as_str()).await?;

    if let (Some(uid), Some(secret)) = (args.uid, &args.secret) {
        let login = json!({ "value": codes::LOGIN, "args": { "uid": uid, "secret": secret } });
        println!("Sending login for uid {}", uid);
        ws.send(Message::text(login.to_string())).await?;
    }

    for frame in &args.frames {
        println!("Sending: {}", frame);
        ws.send(Message::text(frame.clone())).await?;
    }

    let deadline = Instant::now() + Duration::from_secs(args.listen_secs);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let next = match timeout(remaining, ws.next()).await {
            Ok(next) => next,
            Err(_) => break,
        };

        match next {
            Some(Ok(Message::Text(text))) => match Envelope::parse(&text) {
                Ok(envelope) => println!("Received {}: {:?}", envelope.value, envelope.args),
                Err(_) => println!("Received raw: {}", text),
            },
            Some(Ok(Message::Close(frame))) => {
                println!("Server closed the connection: {:?}", frame);
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                println!("Connection error: {}", e);
                break;
            }
            None => break,
        }
    }

    if let Err(e) = ws.close(None).await {
        println!("Close failed: {}", e);
    }
    println!("Test client finished");
    Ok(())
}
