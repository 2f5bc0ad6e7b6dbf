//! mqview CLI: operator interface to the mail queue view.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures_util::TryStreamExt;
use mailqueue_view::config::Config;
use mailqueue_view::db::{Db, PgmqTransport};
use mailqueue_view::model::{ContentRef, ItemFilter, ItemKey, NewItem, QueueName, Slice};
use mailqueue_view::store::RetryingStore;
use mailqueue_view::telemetry::{TelemetryConfig, init_telemetry};
use mailqueue_view::view::{Advance, Enqueued, QueueView};
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(name = "mqview", about = "Browse and manage queued mail")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List live items of a queue, oldest first
    Browse {
        queue: String,
        /// Maximum items to show
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Count live items of a queue
    Size { queue: String },
    /// Delete one item
    Delete {
        queue: String,
        /// Item key (UUID)
        key: String,
        /// Slice of the item; derived from the key when omitted
        #[arg(long)]
        slice: Option<i64>,
    },
    /// Delete every item matching a filter
    DeleteMatching {
        queue: String,
        #[arg(long, conflicts_with_all = ["sender", "recipient"])]
        name: Option<String>,
        #[arg(long, conflicts_with = "recipient")]
        sender: Option<String>,
        #[arg(long)]
        recipient: Option<String>,
    },
    /// Run browse-start maintenance now
    Advance { queue: String },
    /// Send an item through pgmq and index it
    Enqueue {
        queue: String,
        /// Mail name (e.g. the SMTP transaction id)
        name: String,
        #[arg(long)]
        header_ref: String,
        #[arg(long)]
        body_ref: String,
        #[arg(long)]
        sender: Option<String>,
        #[arg(long = "recipient")]
        recipients: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "mqview".to_string(),
        default_level: config.log_level.clone(),
    })?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    let store = RetryingStore::new(db.clone(), config.view.retry.clone());
    let view = QueueView::new(Arc::new(store), config.view)?;

    match cli.command {
        Command::Browse { queue, limit } => cmd_browse(&view, &queue.into(), limit).await,
        Command::Size { queue } => {
            println!("{}", view.size(&queue.into()).await?);
            Ok(())
        }
        Command::Delete { queue, key, slice } => cmd_delete(&view, &queue.into(), &key, slice).await,
        Command::DeleteMatching {
            queue,
            name,
            sender,
            recipient,
        } => {
            let filter = match (name, sender, recipient) {
                (Some(name), _, _) => ItemFilter::Name(name),
                (_, Some(sender), _) => ItemFilter::Sender(sender),
                (_, _, Some(recipient)) => ItemFilter::Recipient(recipient),
                _ => anyhow::bail!("one of --name, --sender or --recipient is required"),
            };
            let deleted = view.delete_matching(&queue.into(), &filter).await?;
            println!("Deleted {deleted} item(s)");
            Ok(())
        }
        Command::Advance { queue } => {
            let queue = QueueName::from(queue);
            match view.advance_browse_start(&queue).await? {
                Advance::Advanced => println!("Advanced"),
                Advance::Unchanged => println!("Unchanged"),
            }
            if let Some(start) = view.browse_start(&queue).await? {
                println!("Browse start: {start}");
            }
            Ok(())
        }
        Command::Enqueue {
            queue,
            name,
            header_ref,
            body_ref,
            sender,
            recipients,
        } => {
            db.create_queue(&queue).await?;
            let mut item = NewItem::new(
                name,
                ContentRef(header_ref),
                ContentRef(body_ref),
            );
            if let Some(sender) = sender {
                item = item.sender(sender);
            }
            for recipient in recipients {
                item = item.recipient(recipient);
            }

            let transport = PgmqTransport::new(db.clone());
            match view.enqueue(&transport, &queue.into(), item).await? {
                Enqueued::Indexed { key, receipt } => {
                    println!("Enqueued: {key} (msg {receipt})");
                }
                Enqueued::Unindexed {
                    key,
                    receipt,
                    error,
                } => {
                    println!("Enqueued: {key} (msg {receipt}), not browsable: {error}");
                }
            }
            Ok(())
        }
    }
}

async fn cmd_browse(view: &QueueView, queue: &QueueName, limit: usize) -> anyhow::Result<()> {
    let mut browse = view.browse(queue).await?;

    // Header
    println!(
        "{:<36}  {:<8}  {:<4}  {:<30}  {:<30}  ENQUEUED",
        "KEY", "SLICE", "BKT", "NAME", "SENDER"
    );
    println!("{}", "-".repeat(130));

    let mut shown = 0;
    while shown < limit {
        let Some(item) = browse.try_next().await? else {
            break;
        };
        println!(
            "{:<36}  {:<8}  {:<4}  {:<30}  {:<30}  {}",
            item.key,
            item.slice,
            item.bucket,
            truncate(&item.name, 30),
            truncate(item.sender.as_deref().unwrap_or("-"), 30),
            item.enqueued_at.format("%Y-%m-%d %H:%M:%S")
        );
        shown += 1;
    }
    drop(browse);

    println!("\n{shown} item(s) shown");
    Ok(())
}

async fn cmd_delete(
    view: &QueueView,
    queue: &QueueName,
    key: &str,
    slice: Option<i64>,
) -> anyhow::Result<()> {
    let key: ItemKey = key.parse()?;
    let slice = match slice {
        Some(slice) => Slice(slice),
        None => {
            let at = key
                .timestamp()
                .context("key carries no timestamp, pass --slice")?;
            view.allocator().slice_of(at)
        }
    };
    view.delete(queue, key, slice).await?;
    println!("Deleted: {key}");
    Ok(())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
