//! Append-only message log.
//!
//! The queue task appends every relayed message before dispatch; a
//! background flusher batches the same buffers and hands the chat
//! traffic to the durable store. The file is the crash audit trail,
//! the channel is the store feed. Appends run on the blocking pool,
//! so no routing task ever holds a worker thread on disk I/O.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use skein_wire::{AddrKind, Body, Command, Message};

use crate::store::{ChatRecord, GroupRecord, MessageStore};

/// Flush cadence for the store feed.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Append-only log with a channel feeding the batch flusher.
pub struct FileLog {
    file: Arc<File>,
    feed: mpsc::UnboundedSender<Bytes>,
}

impl FileLog {
    /// Open (or create) the log file. The returned receiver is the
    /// flusher's intake; pass it to [`spawn_flusher`].
    pub fn open(path: &Path) -> io::Result<(Self, mpsc::UnboundedReceiver<Bytes>)> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (feed, intake) = mpsc::unbounded_channel();
        Ok((
            Self {
                file: Arc::new(file),
                feed,
            },
            intake,
        ))
    }

    /// Append one encoded message. The write lands on the blocking
    /// pool; the caller only learns the result, it never blocks a
    /// runtime worker on the disk.
    pub async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let buf = Bytes::copy_from_slice(bytes);
        let file = self.file.clone();
        let appended = buf.clone();
        tokio::task::spawn_blocking(move || (&*file).write_all(&appended))
            .await
            .map_err(io::Error::other)??;
        let _ = self.feed.send(buf);
        Ok(())
    }
}

/// Drain the log feed on a fixed tick and persist chat traffic.
pub fn spawn_flusher(
    mut intake: mpsc::UnboundedReceiver<Bytes>,
    store: Arc<dyn MessageStore>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut batch: Vec<Bytes> = Vec::new();

        loop {
            tokio::select! {
                buf = intake.recv() => {
                    match buf {
                        Some(buf) => batch.push(buf),
                        None => {
                            flush(&store, std::mem::take(&mut batch)).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        flush(&store, std::mem::take(&mut batch)).await;
                    }
                }
            }
        }
        debug!("filelog: flusher exited");
    })
}

/// Decode a batch and hand chat frames to the store. Anything that is
/// not chat addressed to a client or group is skipped.
async fn flush(store: &Arc<dyn MessageStore>, batch: Vec<Bytes>) {
    let mut chats: Vec<ChatRecord> = Vec::new();
    let mut groups: Vec<GroupRecord> = Vec::new();

    for buf in batch {
        let msg = match Message::decode(&mut buf.clone()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "filelog: skipping undecodable entry");
                continue;
            }
        };
        if msg.header.command != Command::Chat {
            continue;
        }
        let Body::Chat(chat) = msg.body else { continue };
        let header = msg.header;
        let record = ChatRecord {
            from_domain: header.source.domain(),
            to_domain: header.dest.domain(),
            from: header.source.to_string(),
            to: header.dest.to_string(),
            kind: chat.kind,
            text: chat.text,
            extra: chat.extra,
            create_at: chrono::Utc::now(),
        };
        match header.dest.kind() {
            AddrKind::Client => chats.push(record),
            AddrKind::Group => groups.push(GroupRecord(record)),
            _ => {}
        }
    }

    if !chats.is_empty() {
        if let Err(e) = store.save_chat_msgs(chats).await {
            warn!(error = %e, "filelog: chat batch save failed");
        }
    }
    if !groups.is_empty() {
        if let Err(e) = store.save_group_msgs(groups).await {
            warn!(error = %e, "filelog: group batch save failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use skein_wire::{Addr, MsgChat};

    use crate::error::HubError;

    #[derive(Default)]
    struct RecordingStore {
        chats: Mutex<Vec<ChatRecord>>,
        groups: Mutex<Vec<GroupRecord>>,
    }

    #[async_trait::async_trait]
    impl MessageStore for RecordingStore {
        async fn save_chat_msgs(&self, msgs: Vec<ChatRecord>) -> Result<(), HubError> {
            self.chats.lock().unwrap().extend(msgs);
            Ok(())
        }
        async fn save_group_msgs(&self, msgs: Vec<GroupRecord>) -> Result<(), HubError> {
            self.groups.lock().unwrap().extend(msgs);
            Ok(())
        }
    }

    fn tmp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("skein-filelog-{tag}-{}", rand::random::<u64>()))
    }

    fn chat(dest: Addr, text: &str) -> Message {
        Message::new(
            Addr::client(1, 0, "a").unwrap(),
            dest,
            Body::Chat(MsgChat {
                kind: 1,
                text: text.into(),
                extra: String::new(),
            }),
        )
    }

    #[tokio::test]
    async fn appends_and_flushes_chat_traffic() {
        let path = tmp_path("flush");
        let (log, intake) = FileLog::open(&path).unwrap();
        let store = Arc::new(RecordingStore::default());
        spawn_flusher(intake, store.clone());

        let to_client = chat(Addr::client(1, 0, "b").unwrap(), "direct");
        let to_group = chat(Addr::group(1, "g").unwrap(), "fanout");
        let control = Message::new(
            Addr::server("s").unwrap(),
            Addr::server("s").unwrap(),
            Body::QueryServers,
        );

        log.write(&to_client.encode_to_vec()).await.unwrap();
        log.write(&to_group.encode_to_vec()).await.unwrap();
        log.write(&control.encode_to_vec()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert_eq!(store.chats.lock().unwrap().len(), 1);
        assert_eq!(store.groups.lock().unwrap().len(), 1);
        assert_eq!(store.chats.lock().unwrap()[0].text, "direct");

        assert!(std::fs::metadata(&path).unwrap().len() > 0);
        let _ = std::fs::remove_file(&path);
    }
}
