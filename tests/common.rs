#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use roostdb::actor::ChangesListener;
use roostdb::transport::{MessageBuilder, MessageSink, ProgressCallback};
use roostdb::{Database, DatabaseConfig, Error, Rev};

pub fn create_temp_db(name: &str) -> (tempfile::TempDir, PathBuf, Database) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let db = Database::open(&path, DatabaseConfig::default()).expect("open database");
    (dir, path, db)
}

pub fn open_second_handle(path: &PathBuf) -> Database {
    Database::open(path, DatabaseConfig::default()).expect("open second handle")
}

/// A transport sink that collects outgoing requests for inspection.
pub struct CollectingSink {
    pub messages: Mutex<Vec<MessageBuilder>>,
}

impl CollectingSink {
    pub fn new() -> std::sync::Arc<CollectingSink> {
        std::sync::Arc::new(CollectingSink {
            messages: Mutex::new(Vec::new()),
        })
    }

    /// Waits until at least `count` requests were sent, then returns them.
    pub fn wait_for_messages(&self, count: usize, timeout: Duration) -> Vec<MessageBuilder> {
        let start = Instant::now();
        loop {
            {
                let messages = self.messages.lock().unwrap();
                if messages.len() >= count {
                    return messages.clone();
                }
            }
            assert!(
                start.elapsed() < timeout,
                "timed out waiting for {count} outgoing messages"
            );
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

impl MessageSink for CollectingSink {
    fn send_request(&self, message: MessageBuilder, _on_progress: Option<ProgressCallback>) {
        self.messages.lock().unwrap().push(message);
    }
}

/// A changes listener that forwards batches over a channel.
pub struct ChannelPusher {
    tx: Mutex<Sender<(Vec<Rev>, bool)>>,
}

impl ChannelPusher {
    pub fn new() -> (std::sync::Arc<ChannelPusher>, Receiver<(Vec<Rev>, bool)>) {
        let (tx, rx) = channel();
        (
            std::sync::Arc::new(ChannelPusher { tx: Mutex::new(tx) }),
            rx,
        )
    }
}

impl ChangesListener for ChannelPusher {
    fn got_changes(&self, changes: Vec<Rev>, error: Option<Error>) {
        let _ = self
            .tx
            .lock()
            .unwrap()
            .send((changes, error.is_some()));
    }
}
