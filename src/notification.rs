//! A minimal notification sink: Operation failures surface a user
//! notification naming the file and project, but the desktop GUI that
//! would render it is out of scope here. An explicit owned handle rather
//! than hidden global state, so a GUI layer can swap in its own sink.

use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Normal,
    Sync,
    Error,
}

pub trait NotificationSink: Send + Sync {
    fn error(&self, message: String);
    fn sync_status(&self, status: SyncStatus);
}

/// Default sink: logs queue/operation failures at `log::error!`. A GUI
/// layer can supply its own `NotificationSink` instead.
pub struct LoggingSink;

impl NotificationSink for LoggingSink {
    fn error(&self, message: String) {
        log::error!("{}", message);
    }

    fn sync_status(&self, status: SyncStatus) {
        log::info!("Sync status: {:?}", status);
    }
}

#[derive(Clone)]
pub struct Notification {
    sink: Arc<Mutex<Box<dyn NotificationSink>>>,
}

impl Notification {
    pub fn new(sink: Box<dyn NotificationSink>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    pub fn logging() -> Self {
        Self::new(Box::new(LoggingSink))
    }

    pub fn error(&self, message: String) {
        self.sink.lock().expect("notification sink poisoned").error(message);
    }

    pub fn sync_status(&self, status: SyncStatus) {
        self.sink
            .lock()
            .expect("notification sink poisoned")
            .sync_status(status);
    }
}
