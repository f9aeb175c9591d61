//! TCP transport between the tracker and the wearable-side receiver.
//!
//! Frames are length-delimited bincode messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use futures::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info};

use crate::config::CompanionConfig;
use crate::error::LinkError;

use super::message::{message_id, MessageFields};
use super::CompanionLink;

/// Tracker → receiver
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum LinkMessage {
    /// Reliable send, answered with `Ack`
    Deliver { fields: MessageFields },
    /// Best-effort delivery, no reply
    Queued { fields: MessageFields },
    /// Latest state snapshot, no reply
    Snapshot { fields: MessageFields },
}

/// Receiver → tracker
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ReceiverMessage {
    Ack { id: String },
}

pub type MessageStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Create a framed message stream with length-delimited framing.
pub fn message_stream(stream: TcpStream) -> MessageStream {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(1024 * 1024) // 1MB
        .new_codec();
    Framed::new(stream, codec)
}

/// Send a serializable message (bincode + length prefix).
pub async fn send_message<T: Serialize>(stream: &mut MessageStream, msg: &T) -> Result<(), LinkError> {
    let data = bincode::serialize(msg)?;
    stream.send(Bytes::from(data)).await?;
    Ok(())
}

/// Receive and deserialize a message.
pub async fn recv_message<T: DeserializeOwned>(stream: &mut MessageStream) -> Result<T, LinkError> {
    match stream.next().await {
        Some(Ok(bytes)) => Ok(bincode::deserialize(&bytes)?),
        Some(Err(e)) => Err(e.into()),
        None => Err(LinkError::Closed),
    }
}

async fn wait_for_ack(stream: &mut MessageStream, id: &str) -> Result<(), LinkError> {
    loop {
        match recv_message::<ReceiverMessage>(stream).await? {
            ReceiverMessage::Ack { id: acked } if acked == id => return Ok(()),
            // late ack of an earlier timed-out send
            ReceiverMessage::Ack { id: stale } => debug!(%stale, "ignoring stale ack"),
        }
    }
}

pub struct TcpLink {
    addr: String,
    ack_timeout: Duration,
    stream: Mutex<Option<MessageStream>>,
    reachable: AtomicBool,
}

impl TcpLink {
    pub fn new(addr: impl Into<String>, ack_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            ack_timeout,
            stream: Mutex::new(None),
            reachable: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &CompanionConfig) -> Self {
        Self::new(config.addr.clone(), config.ack_timeout())
    }

    async fn connect(&self, slot: &mut Option<MessageStream>) -> Result<(), LinkError> {
        let stream = match tokio::time::timeout(self.ack_timeout, TcpStream::connect(self.addr.as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.reachable.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
            Err(_) => {
                self.reachable.store(false, Ordering::SeqCst);
                return Err(LinkError::Unreachable);
            }
        };
        stream.set_nodelay(true)?;
        *slot = Some(message_stream(stream));
        self.reachable.store(true, Ordering::SeqCst);
        info!(addr = %self.addr, "companion connected");
        Ok(())
    }

    fn mark_broken(&self, slot: &mut Option<MessageStream>, error: &LinkError) {
        debug!(addr = %self.addr, "companion link broken: {}", error);
        *slot = None;
        self.reachable.store(false, Ordering::SeqCst);
    }

    /// One-way send, reconnecting first when the link dropped.
    async fn send_oneway(&self, msg: LinkMessage) -> Result<(), LinkError> {
        let mut slot = self.stream.lock().await;
        if slot.is_none() {
            self.connect(&mut slot).await?;
        }
        let Some(stream) = slot.as_mut() else {
            return Err(LinkError::Unreachable);
        };
        if let Err(e) = send_message(stream, &msg).await {
            self.mark_broken(&mut slot, &e);
            return Err(e);
        }
        Ok(())
    }

    async fn deliver(&self, fields: &MessageFields) -> Result<(), LinkError> {
        let id = message_id(fields)
            .ok_or_else(|| LinkError::Protocol("message without id".into()))?
            .to_string();
        let mut slot = self.stream.lock().await;
        let Some(stream) = slot.as_mut() else {
            return Err(LinkError::Unreachable);
        };

        let msg = LinkMessage::Deliver {
            fields: fields.clone(),
        };
        if let Err(e) = send_message(stream, &msg).await {
            self.mark_broken(&mut slot, &e);
            return Err(e);
        }

        let result = match tokio::time::timeout(self.ack_timeout, wait_for_ack(stream, &id)).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::AckTimeout(self.ack_timeout)),
        };
        if let Err(e) = &result {
            if !matches!(e, LinkError::AckTimeout(_)) {
                self.mark_broken(&mut slot, e);
            }
        }
        result
    }
}

impl CompanionLink for TcpLink {
    fn activate(&self) -> BoxFuture<'_, Result<(), LinkError>> {
        async move {
            let mut slot = self.stream.lock().await;
            self.connect(&mut slot).await
        }
        .boxed()
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn send_message<'a>(&'a self, fields: &'a MessageFields) -> BoxFuture<'a, Result<(), LinkError>> {
        self.deliver(fields).boxed()
    }

    fn transfer_user_info<'a>(
        &'a self,
        fields: &'a MessageFields,
    ) -> BoxFuture<'a, Result<(), LinkError>> {
        self.send_oneway(LinkMessage::Queued {
            fields: fields.clone(),
        })
        .boxed()
    }

    fn update_context<'a>(&'a self, fields: &'a MessageFields) -> BoxFuture<'a, Result<(), LinkError>> {
        self.send_oneway(LinkMessage::Snapshot {
            fields: fields.clone(),
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::companion::FeedbackMessage;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_deliver_acked_over_loopback() {
        let (listener, addr) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = message_stream(socket);
            let msg: LinkMessage = recv_message(&mut stream).await.unwrap();
            let LinkMessage::Deliver { fields } = msg.clone() else {
                panic!("expected Deliver, got {:?}", msg);
            };
            let id = message_id(&fields).unwrap().to_string();
            send_message(&mut stream, &ReceiverMessage::Ack { id }).await.unwrap();
            fields
        });

        let link = TcpLink::new(addr, Duration::from_secs(2));
        link.activate().await.unwrap();
        assert!(link.is_reachable());

        let fields = FeedbackMessage::shot_feedback("flat", true).to_fields();
        link.send_message(&fields).await.unwrap();
        assert_eq!(server.await.unwrap(), fields);
    }

    #[tokio::test]
    async fn test_missing_ack_times_out() {
        let (listener, addr) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = message_stream(socket);
            let _: LinkMessage = recv_message(&mut stream).await.unwrap();
            // hold the connection open without acknowledging
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let link = TcpLink::new(addr, Duration::from_millis(100));
        link.activate().await.unwrap();
        let fields = FeedbackMessage::session_ended().to_fields();
        let err = link.send_message(&fields).await.unwrap_err();
        assert!(matches!(err, LinkError::AckTimeout(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_activate_fails_without_receiver() {
        let (listener, addr) = listener().await;
        drop(listener);
        let link = TcpLink::new(addr, Duration::from_millis(200));
        assert!(link.activate().await.is_err());
        assert!(!link.is_reachable());
    }

    #[tokio::test]
    async fn test_snapshot_is_oneway() {
        let (listener, addr) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = message_stream(socket);
            recv_message::<LinkMessage>(&mut stream).await.unwrap()
        });

        let link = TcpLink::new(addr, Duration::from_secs(1));
        let fields = FeedbackMessage::not_in_frame().to_fields();
        // connects lazily
        link.update_context(&fields).await.unwrap();
        assert_eq!(server.await.unwrap(), LinkMessage::Snapshot { fields });
    }
}
