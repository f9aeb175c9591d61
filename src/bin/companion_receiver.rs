//! Wearable-side bridge stand-in: accepts tracker connections, prints each
//! feedback message once and acknowledges reliable sends.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use tennis_tracker::companion::message::message_id;
use tennis_tracker::companion::tcp::{
    self, LinkMessage, MessageStream, ReceiverMessage,
};
use tennis_tracker::companion::MessageFields;
use tennis_tracker::config::Config;
use tennis_tracker::error::LinkError;
use tennis_tracker::logging;

#[derive(Debug, Parser)]
#[command(version = env!("GIT_VERSION"), about = "Companion feedback receiver")]
struct Args {
    /// Listen address (defaults to companion.addr from the config)
    #[arg(long = "listen", value_name = "ADDR")]
    listen: Option<String>,
    #[arg(long = "config", value_name = "PATH", default_value = "config.toml")]
    config: PathBuf,
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    verbose: bool,
}

/// Number of recent ids remembered for deduplication
const SEEN_CAPACITY: usize = 1024;

/// Bounded FIFO of recently shown message ids.
#[derive(Default)]
struct RecentIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl RecentIds {
    /// Returns false if `id` was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == SEEN_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}

type SeenIds = Arc<Mutex<RecentIds>>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let config = Config::load_or_default(&args.config);
    let listen = args.listen.unwrap_or(config.companion.addr);
    let bind_addr: std::net::SocketAddr = listen.parse().context("invalid listen address")?;
    let listener = TcpListener::bind(bind_addr).await?;
    info!("Companion Receiver ({})", env!("GIT_VERSION"));
    info!("Listening on {}", bind_addr);

    let seen: SeenIds = Arc::default();
    loop {
        let (stream, addr) = listener.accept().await?;
        stream.set_nodelay(true)?;
        info!("Tracker connected: {}", addr);
        let seen = Arc::clone(&seen);
        tokio::spawn(async move {
            match serve(stream, seen).await {
                Ok(()) | Err(LinkError::Closed) => info!("Tracker disconnected: {}", addr),
                Err(e) => warn!("connection {} failed: {}", addr, e),
            }
        });
    }
}

async fn serve(stream: TcpStream, seen: SeenIds) -> Result<(), LinkError> {
    let mut stream: MessageStream = tcp::message_stream(stream);
    loop {
        match tcp::recv_message::<LinkMessage>(&mut stream).await? {
            LinkMessage::Deliver { fields } => {
                let id = message_id(&fields).map(str::to_string);
                show(&fields, &seen);
                match id {
                    Some(id) => tcp::send_message(&mut stream, &ReceiverMessage::Ack { id }).await?,
                    None => warn!("reliable message without id, not acknowledged"),
                }
            }
            LinkMessage::Queued { fields } => show(&fields, &seen),
            LinkMessage::Snapshot { fields } => {
                debug!("context: {}", format_fields(&fields));
            }
        }
    }
}

/// Print a message unless its id was already shown. Retries of an
/// unacknowledged send and the fallback path may both deliver it.
fn show(fields: &MessageFields, seen: &SeenIds) {
    if let Some(id) = message_id(fields) {
        let fresh = match seen.lock() {
            Ok(mut seen) => seen.insert(id),
            Err(_) => true,
        };
        if !fresh {
            debug!(%id, "duplicate message ignored");
            return;
        }
    }
    info!("{}", format_fields(fields));
}

fn format_fields(fields: &MessageFields) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_ids_dedup_and_evict_oldest() {
        let mut seen = RecentIds::default();
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        for i in 0..SEEN_CAPACITY {
            assert!(seen.insert(&format!("id-{i}")));
        }
        assert_eq!(seen.order.len(), SEEN_CAPACITY);
        assert_eq!(seen.ids.len(), SEEN_CAPACITY);
        // "a" was evicted first
        assert!(seen.insert("a"));
        assert!(!seen.insert(&format!("id-{}", SEEN_CAPACITY - 1)));
    }
}
