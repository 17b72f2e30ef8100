use std::{env, time::Duration};

use tokio::time::timeout;
use tracing::info;

use chatsync_core::{SyncCommand, SyncEvent};
use chatsync_gateway::{GatewayConfig, spawn_runtime};

mod logging;

#[tokio::main]
async fn main() {
    logging::init();

    let config = GatewayConfig::from_env();
    let handle = match spawn_runtime(config) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("Failed to start gateway: {err}");
            eprintln!("Set CHATSYNC_API_URL, CHATSYNC_WS_URL and CHATSYNC_USER_ID to run.");
            std::process::exit(1);
        }
    };
    let mut events = handle.subscribe();

    if let Ok(token) = env::var("CHATSYNC_TOKEN") {
        let _ = handle.send(SyncCommand::Connect { token }).await;
    }
    if handle
        .send(SyncCommand::RefreshConversations)
        .await
        .is_err()
    {
        eprintln!("Gateway runtime is not accepting commands");
        std::process::exit(1);
    }

    loop {
        let event = match timeout(Duration::from_secs(10), events.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(_)) | Err(_) => {
                eprintln!("No response from the API within 10s");
                std::process::exit(1);
            }
        };

        match event {
            SyncEvent::CacheUpdated { .. } => {
                let conversations = handle.cache().conversations();
                println!("Fetched {} conversations.", conversations.len());
                for conversation in conversations {
                    println!(
                        "  #{} peers={:?} unread={}",
                        conversation.id, conversation.participants, conversation.unread_count
                    );
                }
                break;
            }
            SyncEvent::FatalError { code, message, .. } => {
                eprintln!("Conversation fetch failed ({code}): {message}");
                std::process::exit(1);
            }
            other => info!(?other, "event"),
        }
    }
}
