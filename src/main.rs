use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{debug, info};

use torgon::settings::{
    ClientSettings, ClientSettingsJsonRepository, ClientSettingsRepository, StorageSettings,
};
use torgon::torgon::models::{Attachment, Message, MessageRole};
use torgon::torgon::repositories::{
    InMemoryThreadRepository, ThreadRepository, ThreadSqliteRepository,
};
use torgon::torgon::services::{ChatService, HttpChatBackend, UserSend};

#[derive(Parser, Debug)]
#[command(name = "torgon", version, about = "Streaming chat client", long_about = None)]
struct Args {
    /// Override the server base URL
    #[arg(long, value_name = "URL")]
    base_url: Option<String>,

    /// Keep threads in memory for this run only
    #[arg(long)]
    memory: bool,

    /// Override path to the SQLite thread store
    #[arg(long, value_name = "PATH", conflicts_with = "memory")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a message and print the streamed reply
    Send {
        /// Continue an existing thread instead of starting a new one
        #[arg(long)]
        thread: Option<String>,

        /// Attach a file (repeatable)
        #[arg(long = "attach", value_name = "FILE")]
        attachments: Vec<PathBuf>,

        /// Give up waiting for the reply after this many seconds
        #[arg(long, default_value_t = 120)]
        timeout: u64,

        text: String,
    },
    /// List threads, most recently active first
    Threads,
    /// Print every message of a thread
    Show { thread: String },
    /// Rename a thread
    Rename { thread: String, title: String },
    /// Delete a thread here and on the server
    Delete { thread: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let settings = load_settings(&args).await?;
    let repository = open_repository(&settings).await?;
    let backend = Arc::new(HttpChatBackend::new(settings.clone()));
    let service = ChatService::new(repository, backend, settings);

    match args.command {
        Command::Send {
            thread,
            attachments,
            timeout,
            text,
        } => send(&service, thread, attachments, Duration::from_secs(timeout), text).await?,
        Command::Threads => {
            for thread in service.list_threads().await? {
                let activity = thread.activity_at().format("%Y-%m-%d %H:%M");
                println!("{}  {}  {}", thread.id, activity, thread.title);
            }
        }
        Command::Show { thread } => {
            let title = service
                .get_thread(&thread)
                .await?
                .map(|t| t.title)
                .with_context(|| format!("No thread with id {}", thread))?;
            println!("# {}", title);
            for message in service.get_messages(&thread).await? {
                print_message(&message);
            }
        }
        Command::Rename { thread, title } => service.rename_thread(&thread, &title).await?,
        Command::Delete { thread } => service.delete_thread(&thread).await?,
    }

    Ok(())
}

async fn load_settings(args: &Args) -> Result<ClientSettings> {
    let repository = ClientSettingsJsonRepository::new()?;
    let mut settings = repository
        .load()
        .await
        .with_context(|| format!("Failed to read {}", repository.path().display()))?;

    if let Some(base_url) = &args.base_url {
        settings.base_url = base_url.clone();
    }
    if args.memory {
        settings.storage = StorageSettings::Memory;
    } else if let Some(path) = &args.db {
        settings.storage = StorageSettings::Sqlite {
            path: Some(path.clone()),
        };
    }
    debug!(?settings, "Settings loaded");
    Ok(settings)
}

async fn open_repository(settings: &ClientSettings) -> Result<Arc<dyn ThreadRepository>> {
    let repository: Arc<dyn ThreadRepository> = match &settings.storage {
        StorageSettings::Memory => Arc::new(InMemoryThreadRepository::new()),
        StorageSettings::Sqlite { path: Some(path) } => {
            Arc::new(ThreadSqliteRepository::open(path).await?)
        }
        StorageSettings::Sqlite { path: None } => Arc::new(ThreadSqliteRepository::new().await?),
    };
    Ok(repository)
}

async fn send(
    service: &Arc<ChatService>,
    thread: Option<String>,
    paths: Vec<PathBuf>,
    timeout: Duration,
    text: String,
) -> Result<()> {
    let mut attachments = Vec::with_capacity(paths.len());
    for path in &paths {
        attachments.push(read_attachment(path).await?);
    }

    // Bind the printing callback before anything is posted so no chunk is missed.
    let thread_id = match thread {
        Some(thread_id) => thread_id,
        None => service.create_thread(None).await?,
    };
    let printed = Arc::new(AtomicBool::new(false));
    let live = printed.clone();
    let stream = service.stream_sessions().get_instance(
        &thread_id,
        Arc::new(move |content: &str, _: bool| {
            live.store(true, Ordering::Relaxed);
            print!("{}", content);
            let _ = std::io::stdout().flush();
        }),
    );

    let request = UserSend::new(text)
        .with_attachments(attachments)
        .in_thread(thread_id);
    let outcome = service.handle_user_send(request).await?;
    info!(thread_id = %outcome.thread_id, "Message sent");

    let (finished_tx, mut finished_rx) = watch::channel(None::<Message>);
    let assistant_id = outcome.assistant_message_id.clone();
    let subscription = service.subscribe_to_messages(
        &outcome.thread_id,
        Box::new(move |messages| {
            if let Some(message) = messages
                .into_iter()
                .find(|m| m.id == assistant_id && m.status.is_terminal())
            {
                finished_tx.send_replace(Some(message));
            }
        }),
    );

    let finished = tokio::time::timeout(timeout, async {
        finished_rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|message| message.clone())
    })
    .await;
    subscription.unsubscribe();
    stream.close_stream();

    let Ok(Some(reply)) = finished else {
        bail!("No reply within {} seconds", timeout.as_secs());
    };
    if !outcome.delivered || !printed.load(Ordering::Relaxed) {
        print!("{}", reply.content);
    }
    println!();
    println!("(thread {})", outcome.thread_id);

    if !outcome.delivered {
        bail!("The server did not accept the message");
    }
    Ok(())
}

async fn read_attachment(path: &Path) -> Result<Attachment> {
    let binary = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Attachment::new(name, mime_type_for(path), binary))
}

fn mime_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("txt" | "md") => "text/plain",
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        _ => "application/octet-stream",
    }
}

fn print_message(message: &Message) {
    let who = match message.role {
        MessageRole::User => "you",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
    };
    println!("[{}] ({})", who, message.status);
    println!("{}", message.content);
    for attachment in &message.attachments {
        println!("  attachment: {}", attachment.file_name());
    }
    println!();
}
