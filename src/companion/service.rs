use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::CompanionConfig;

use super::message::{FeedbackMessage, MessageKind};
use super::{CompanionLink, ConnectionStatus, Notifier};

enum Command {
    Send(FeedbackMessage, Instant),
    Reconnect,
    Shutdown,
}

/// Cheap, cloneable front end of the delivery worker. Never blocks.
#[derive(Clone)]
pub struct CompanionHandle {
    tx: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl CompanionHandle {
    pub fn send(&self, message: FeedbackMessage) {
        if self.tx.send(Command::Send(message, Instant::now())).is_err() {
            debug!("companion worker stopped, message dropped");
        }
    }

    /// Drop pending messages and activate the link again.
    pub fn reconnect(&self) {
        let _ = self.tx.send(Command::Reconnect);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }
}

/// Owns the delivery worker task.
pub struct CompanionService {
    handle: CompanionHandle,
    task: JoinHandle<()>,
}

impl CompanionService {
    pub fn spawn(
        link: Arc<dyn CompanionLink>,
        notifier: Arc<dyn Notifier>,
        config: CompanionConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let worker = Worker {
            link,
            notifier,
            config,
            status: status_tx,
            activated: false,
            was_reachable: false,
            pending: VecDeque::new(),
            last_accepted: HashMap::new(),
        };
        let task = tokio::spawn(worker.run(rx));
        Self {
            handle: CompanionHandle {
                tx,
                status: status_rx,
            },
            task,
        }
    }

    pub fn handle(&self) -> CompanionHandle {
        self.handle.clone()
    }

    /// Finish delivering everything already submitted, then stop.
    pub async fn shutdown(self) {
        let _ = self.handle.tx.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            error!("companion worker panicked: {}", e);
        }
    }
}

struct Worker {
    link: Arc<dyn CompanionLink>,
    notifier: Arc<dyn Notifier>,
    config: CompanionConfig,
    status: watch::Sender<ConnectionStatus>,
    activated: bool,
    was_reachable: bool,
    /// Messages submitted before activation, FIFO
    pending: VecDeque<FeedbackMessage>,
    last_accepted: HashMap<MessageKind, Instant>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        self.activate().await;

        let mut poll = time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await;

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Send(message, at)) => self.submit(message, at).await,
                    Some(Command::Reconnect) => {
                        info!(dropped = self.pending.len(), "companion reconnect");
                        self.pending.clear();
                        self.activated = false;
                        self.activate().await;
                    }
                    Some(Command::Shutdown) | None => break,
                },
                _ = poll.tick() => self.poll().await,
            }
        }
        if !self.pending.is_empty() {
            warn!(count = self.pending.len(), "companion stopped with undelivered messages");
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            debug!(from = current.as_str(), to = status.as_str(), "companion status");
            *current = status;
            true
        });
    }

    async fn activate(&mut self) {
        self.set_status(ConnectionStatus::Connecting);
        match self.link.activate().await {
            Ok(()) => {
                self.activated = true;
                self.was_reachable = self.link.is_reachable();
                self.set_status(if self.was_reachable {
                    ConnectionStatus::Connected
                } else {
                    ConnectionStatus::Disconnected
                });
                info!(reachable = self.was_reachable, "companion link activated");
                self.flush().await;
            }
            Err(e) => {
                warn!("companion activation failed: {}", e);
                self.set_status(ConnectionStatus::Failed);
            }
        }
    }

    async fn poll(&mut self) {
        if !self.activated {
            self.activate().await;
            return;
        }
        let reachable = self.link.is_reachable();
        if reachable == self.was_reachable {
            return;
        }
        self.was_reachable = reachable;
        // pending only fills before activation, so there is nothing to flush here
        if reachable {
            info!("companion reachable again");
            self.set_status(ConnectionStatus::Connected);
        } else {
            info!("companion no longer reachable");
            self.set_status(ConnectionStatus::Disconnected);
        }
    }

    async fn flush(&mut self) {
        if !self.pending.is_empty() {
            debug!(count = self.pending.len(), "flushing pending messages");
        }
        while let Some(message) = self.pending.pop_front() {
            self.deliver(&message).await;
        }
    }

    async fn submit(&mut self, message: FeedbackMessage, at: Instant) {
        let kind = message.kind();
        if let Some(last) = self.last_accepted.get(&kind) {
            if at.saturating_duration_since(*last) < self.config.throttle() {
                debug!(kind = kind.as_str(), id = %message.id(), "message throttled");
                return;
            }
        }
        self.last_accepted.insert(kind, at);

        if !self.activated {
            debug!(kind = kind.as_str(), queued = self.pending.len() + 1, "link not activated, queued");
            self.pending.push_back(message);
            return;
        }
        self.deliver(&message).await;
    }

    /// Reliable send with retries, then queued + snapshot fallback, then local
    /// notification.
    async fn deliver(&mut self, message: &FeedbackMessage) {
        let fields = message.to_fields();
        let kind = message.kind();

        if self.link.is_reachable() {
            let attempts = self.config.max_attempts.max(1);
            for attempt in 1..=attempts {
                match self.link.send_message(&fields).await {
                    Ok(()) => {
                        debug!(kind = kind.as_str(), id = %message.id(), attempt, "delivered");
                        self.set_status(ConnectionStatus::Connected);
                        return;
                    }
                    Err(e) => {
                        warn!(kind = kind.as_str(), attempt, attempts, "send failed: {}", e);
                        if attempt < attempts {
                            time::sleep(self.config.retry_delay()).await;
                        }
                    }
                }
            }
        }

        let (queued, snapshot) = if kind == MessageKind::ShotFeedback {
            futures::join!(
                self.link.transfer_user_info(&fields),
                self.link.update_context(&fields)
            )
        } else {
            let queued = self.link.transfer_user_info(&fields).await;
            let snapshot = self.link.update_context(&fields).await;
            (queued, snapshot)
        };

        match (queued, snapshot) {
            (Err(q), Err(s)) => {
                error!(
                    kind = kind.as_str(),
                    id = %message.id(),
                    queued_error = %q,
                    snapshot_error = %s,
                    "all delivery paths failed"
                );
                if let Err(e) = self.notifier.notify(message) {
                    error!("local notification failed: {:#}", e);
                }
            }
            (queued, snapshot) => {
                debug!(
                    kind = kind.as_str(),
                    queued = queued.is_ok(),
                    snapshot = snapshot.is_ok(),
                    "delivered via fallback"
                );
            }
        }
    }
}
