//! chatzap - local-first chat from the command line
//!
//! ```bash
//! # List conversations (the first run seeds a demo chat)
//! chatzap conversations
//!
//! # Show and send messages
//! chatzap messages <conversation-id>
//! chatzap send <conversation-id> "hello" --sender me
//!
//! # Expose this store to other replicas, or replicate with one
//! chatzap serve --listen 127.0.0.1:5984
//! chatzap sync --remote http://127.0.0.1:5984
//! ```
//!
//! The data directory and remote default to `CHATZAP_DATA_DIR` and
//! `CHATZAP_REMOTE_URL`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chatzap::network::server;
use chatzap::types::{Conversation, Message, MessageStatus};
use chatzap::{ChatConfig, ChatDb, SyncState, DEFAULT_LIMIT};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "chatzap")]
#[command(about = "Local-first chat store with live replication")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory (overrides CHATZAP_DATA_DIR)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List conversations, most recent first
    Conversations {
        #[arg(short, long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,
    },
    /// Show the messages of a conversation
    Messages {
        conversation_id: String,
        #[arg(short, long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,
    },
    /// Start a new conversation
    New {
        title: String,
    },
    /// Send a message
    Send {
        conversation_id: String,
        body: String,
        #[arg(short, long, default_value = "me")]
        sender: String,
    },
    /// Mark a message as read
    Read {
        message_id: String,
    },
    /// Serve this store to other replicas until Ctrl-C
    Serve {
        #[arg(short, long, default_value = "127.0.0.1:5984")]
        listen: SocketAddr,
    },
    /// Replicate with a remote store until Ctrl-C
    Sync {
        /// Remote URL (overrides CHATZAP_REMOTE_URL)
        #[arg(short, long)]
        remote: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = ChatConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config.storage.base_dir = dir;
    }

    let db = ChatDb::open(config.storage.clone())
        .await
        .with_context(|| format!("Failed to open store at {}", config.storage.base_dir.display()))?;
    let conversations = db.bootstrap().await.context("Failed to initialize store")?;

    match cli.command {
        Commands::Conversations { limit } => {
            let conversations = if limit == DEFAULT_LIMIT {
                conversations
            } else {
                db.list_conversations(limit).await
            };
            print_conversations(&conversations);
            Ok(())
        }
        Commands::Messages {
            conversation_id,
            limit,
        } => cmd_messages(&db, &conversation_id, limit).await,
        Commands::New { title } => {
            let conversation = db.create_conversation(&title, None).await?;
            println!("{}", conversation.id);
            Ok(())
        }
        Commands::Send {
            conversation_id,
            body,
            sender,
        } => {
            let message = db.send_message(&conversation_id, &sender, &body).await?;
            println!("{}", message.id);
            Ok(())
        }
        Commands::Read { message_id } => {
            let message = db.advance_status(&message_id, MessageStatus::Read).await?;
            print_message(&message);
            Ok(())
        }
        Commands::Serve { listen } => cmd_serve(&db, listen).await,
        Commands::Sync { remote } => {
            let remote = remote.or(config.remote_url.clone());
            cmd_sync(&db, remote.as_deref(), &config).await
        }
    }
}

async fn cmd_messages(db: &ChatDb, conversation_id: &str, limit: usize) -> Result<()> {
    let conversation = db
        .get_conversation(conversation_id)
        .await
        .with_context(|| format!("No conversation {}", conversation_id))?;

    println!("# {}", conversation.title);
    for message in db.list_messages(conversation_id, limit).await {
        print_message(&message);
    }
    Ok(())
}

async fn cmd_serve(db: &ChatDb, listen: SocketAddr) -> Result<()> {
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
        }
    };
    let (addr, server) = server::bind_with_shutdown(Arc::clone(db.store()), listen, shutdown)?;
    println!("Serving on http://{} (Ctrl-C to stop)", addr);
    server.await;
    Ok(())
}

async fn cmd_sync(db: &ChatDb, remote: Option<&str>, config: &ChatConfig) -> Result<()> {
    if remote.map_or(true, |url| url.trim().is_empty()) {
        bail!("No remote given; pass --remote or set CHATZAP_REMOTE_URL");
    }

    let handle = db.configure_sync(remote, &config.sync)?;
    let mut status = handle.watch();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow().clone();
                if current.state != SyncState::Syncing {
                    println!(
                        "{:?}: pushed {}, pulled {}, conflicts {}",
                        current.state, current.pushed, current.pulled, current.conflicts
                    );
                }
            }
        }
    }

    handle.cancel().await;
    Ok(())
}

fn format_time(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn print_conversations(conversations: &[Conversation]) {
    if conversations.is_empty() {
        println!("No conversations");
        return;
    }
    for c in conversations {
        println!("{}  {}  {}", format_time(c.updated_at), c.id, c.title);
    }
}

fn print_message(message: &Message) {
    println!(
        "[{}] {}: {} ({:?})",
        format_time(message.created_at),
        message.sender_id,
        message.body,
        message.status
    );
}
