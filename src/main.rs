//! Process entry point: wires the Watcher, Auditor-driven Sync
//! Coordinator, Intervention broker and Operation Queue together and runs
//! them for the lifetime of the process.

use std::sync::atomic::AtomicBool;
use std::sync::mpsc::channel;
use std::sync::Arc;

use structopt::StructOpt;

use osfsync_core::client::Client;
use osfsync_core::config::{Opt, Settings};
use osfsync_core::coordinator::SyncCoordinator;
use osfsync_core::database;
use osfsync_core::intervention::InterventionBroker;
use osfsync_core::notification::Notification;
use osfsync_core::queue::OperationQueue;
use osfsync_core::watcher;

fn main() {
    env_logger::init();

    let opt = Opt::from_args();
    let settings = match Settings::load(opt) {
        Ok(settings) => settings,
        Err(error) => {
            log::error!("Failed to load settings: {:?}", error);
            std::process::exit(1);
        }
    };

    if let Err(error) = run(settings) {
        log::error!("Fatal error: {:?}", error);
        std::process::exit(1);
    }
}

fn run(settings: Settings) -> Result<(), osfsync_core::error::Error> {
    let db_path = settings.user_folder.join(".osfsync.db");
    let watcher_conn = Arc::new(std::sync::Mutex::new(database::open(&db_path)?));
    let coordinator_conn = database::open(&db_path)?;
    let queue_conn = database::open(&db_path)?;

    let client = Client::new(settings.remote_base_url.clone(), settings.remote_token.clone())
        .map_err(osfsync_core::error::Error::Client)?;
    let notification = Notification::logging();
    let broker = InterventionBroker::headless();
    let queue = OperationQueue::start(queue_conn, client_for_queue(&settings)?, settings.clone(), notification.clone());

    let (watcher_sender, watcher_receiver) = channel();
    let _watcher_handle = watcher::spawn(
        settings.user_folder.clone(),
        watcher_conn,
        settings.ignored_names.clone(),
        settings.ignore_glob_set(),
        settings.event_debounce,
        watcher_sender,
    )?;

    log::info!("Starting sync for {:?}", settings.user_folder);
    let coordinator = SyncCoordinator::new(coordinator_conn, client, settings, broker, queue, notification);
    let stop = Arc::new(AtomicBool::new(false));
    coordinator.run(&watcher_receiver, &stop);

    Ok(())
}

/// The Operation Queue owns its own `Client` so its worker thread can run
/// independently of the Coordinator's, executing remote calls serially on
/// its own thread.
fn client_for_queue(settings: &Settings) -> Result<Client, osfsync_core::error::Error> {
    Client::new(settings.remote_base_url.clone(), settings.remote_token.clone())
        .map_err(osfsync_core::error::Error::Client)
}
