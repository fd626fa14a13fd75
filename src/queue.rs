//! The Operation Queue: a single-consumer FIFO drained by one worker
//! thread, using a channel-based worker idiom.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::{self, JoinHandle};

use rusqlite::Connection;

use crate::client::Client;
use crate::config::Settings;
use crate::error::Error;
use crate::notification::Notification;
use crate::operation::{Operation, OperationDeps};

/// `None` is the stop sentinel: the worker exits cleanly once it receives
/// one.
type Job = Option<Operation>;

pub struct OperationQueue {
    sender: Sender<Job>,
    handle: Option<JoinHandle<()>>,
}

impl OperationQueue {
    /// Spawns the single worker thread. `conn`/`client`/`settings` are
    /// moved in so the worker owns everything it needs without further
    /// synchronization; remote calls execute serially on this thread.
    pub fn start(
        conn: Connection,
        client: Client,
        settings: Settings,
        notification: Notification,
    ) -> Self {
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = channel();
        let handle = thread::spawn(move || run(receiver, conn, client, settings, notification));
        Self {
            sender,
            handle: Some(handle),
        }
    }

    pub fn put(&self, operation: Operation) {
        if self.sender.send(Some(operation)).is_err() {
            log::error!("Operation queue worker is gone, dropping job");
        }
    }

    /// Sends the stop sentinel and blocks until the worker thread exits.
    pub fn stop(mut self) {
        let _ = self.sender.send(None);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    receiver: Receiver<Job>,
    conn: Connection,
    client: Client,
    settings: Settings,
    notification: Notification,
) {
    log::info!("Start processing queue");
    let deps = OperationDeps {
        conn: &conn,
        client: &client,
        settings: &settings,
    };

    for job in receiver.iter() {
        let operation = match job {
            Some(op) => op,
            None => break,
        };

        match operation.run(&deps, settings.dry) {
            Ok(()) => {}
            Err(Error::NodeNotFound(path)) => {
                log::warn!("Operation skipped, path resolves under no synced node: {}", path);
            }
            Err(err) => {
                log::error!("Error running operation {:?} : {:?}", operation, err);
                let (file_name, project_name) = operation.describe();
                notification.error(format!(
                    "Error while updating the file {} in project {}.",
                    file_name, project_name
                ));
            }
        }
    }
    log::debug!("OperationWorker stopped");
}
