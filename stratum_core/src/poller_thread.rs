//! A background poller thread that tails the change log and drives the state manager.
use std::{
    sync::{mpsc::RecvTimeoutError, Arc, Condvar, Mutex},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::change_log::ChangeLogSource;
use crate::config::SyncConfig;
use crate::state_manager::StateManager;
use crate::{Error, Result};

/// A change-log poller thread.
///
/// The thread first records the log cursor and has the [`StateManager`] load the full
/// configuration, then polls the log every `poll_interval`, delivering new entries to the
/// manager in id order. `last_id` only advances past entries that were successfully handled and
/// never regresses.
pub struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,

    /// Holds `None` until the initial snapshot has been built. Holds `Some(Ok(()))` once the
    /// initial load succeeded. Holds `Some(Err(...))` if the thread failed fatally before that.
    result: Arc<(Mutex<Option<Result<()>>>, Condvar)>,
}

impl PollerThread {
    /// Starts the poller thread with default [`SyncConfig`].
    ///
    /// # Errors
    ///
    /// This method can return the following errors:
    /// - IO Error if poller thread failed to start.
    pub fn start(
        source: Arc<dyn ChangeLogSource>,
        manager: Arc<StateManager>,
    ) -> std::io::Result<PollerThread> {
        PollerThread::start_with_config(source, manager, SyncConfig::default())
    }

    /// Starts the poller thread with the provided configuration.
    ///
    /// # Errors
    ///
    /// This method can return the following errors:
    /// - IO Error if poller thread failed to start.
    pub fn start_with_config(
        source: Arc<dyn ChangeLogSource>,
        manager: Arc<StateManager>,
        config: SyncConfig,
    ) -> std::io::Result<PollerThread> {
        // Using `sync_channel` here as it makes `stop_sender` `Sync` (shareable between
        // threads). Buffer size of 1 is enough: we only ever send one stop command and
        // `try_send()` ignores the case where another thread has already sent it.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let result = Arc::new((Mutex::new(None), Condvar::new()));

        let join_handle = {
            // Cloning Arc for move into thread
            let result = Arc::clone(&result);
            let update_result = move |value| {
                *result.0.lock().unwrap() = Some(value);
                result.1.notify_all();
            };

            std::thread::Builder::new()
                .name("stratum-poller".to_owned())
                .spawn(move || {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let runtime = match tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        {
                            Ok(runtime) => runtime,
                            Err(err) => {
                                update_result(Err(Error::from(err)));
                                return;
                            }
                        };

                        // Record the cursor before the full load so no entry written during the
                        // load is missed; re-applying an entry the load already covered just
                        // rebuilds the same snapshot.
                        let mut last_id = loop {
                            let init = runtime.block_on(async {
                                let last_id = source.latest_id().await?;
                                manager.initialize().await?;
                                Ok::<i64, Error>(last_id)
                            });
                            match init {
                                Ok(last_id) => {
                                    update_result(Ok(()));
                                    break last_id;
                                }
                                Err(err) => {
                                    log::warn!(target: "stratum",
                                        "initial configuration load failed, retrying: {err}");
                                    match stop_receiver.recv_timeout(config.poll_interval) {
                                        Err(RecvTimeoutError::Timeout) => continue,
                                        _ => return,
                                    }
                                }
                            }
                        };

                        loop {
                            let timeout = jitter(config.poll_interval, config.poll_jitter);
                            match stop_receiver.recv_timeout(timeout) {
                                Err(RecvTimeoutError::Timeout) => {
                                    // Timed out. Fall through to poll the log.
                                }
                                Ok(()) => {
                                    log::debug!(target: "stratum", "poller thread received stop command");
                                    return;
                                }
                                Err(RecvTimeoutError::Disconnected) => {
                                    // When the other end of channel disconnects, calls to
                                    // .recv_timeout() return immediately. Stop the thread.
                                    log::debug!(target: "stratum", "poller thread received disconnected");
                                    return;
                                }
                            }

                            match runtime.block_on(poll_once(
                                &*source,
                                &manager,
                                last_id,
                                config.poll_batch,
                            )) {
                                Ok(advanced_to) => last_id = advanced_to,
                                Err(err) => {
                                    // Transient fetch error; last_id stays put and the next tick
                                    // retries the same window.
                                    log::warn!(target: "stratum",
                                        last_id;
                                        "change-log fetch failed: {err}");
                                }
                            }
                        }
                    }));

                    // If catch_unwind returns Err, it means a panic occurred.
                    if outcome.is_err() {
                        update_result(Err(Error::PollerThreadPanicked));
                    }
                })?
        };

        Ok(PollerThread {
            join_handle,
            stop_sender,
            result,
        })
    }

    /// Waits for the initial snapshot to be built.
    ///
    /// This method blocks until the poller thread has recorded the log cursor and the state
    /// manager has published the first snapshot.
    ///
    /// # Errors
    ///
    /// This method can fail with the following errors:
    ///
    /// - [`Error::PollerThreadPanicked`]
    pub fn wait_for_initialization(&self) -> Result<()> {
        let mut lock = self
            .result
            .0
            .lock()
            .map_err(|_| Error::PollerThreadPanicked)?;
        loop {
            match &*lock {
                Some(result) => {
                    // The initial load already finished. Return Ok(()) or a possible error.
                    return result.clone();
                }
                None => {
                    // Block waiting for the initial load.
                    lock = self
                        .result
                        .1
                        .wait(lock)
                        .map_err(|_| Error::PollerThreadPanicked)?;
                }
            }
        }
    }

    /// Stop the poller thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means that the receiver was dropped (thread exited) or the channel buffer is
        // full. First case can be ignored as there's nothing useful we can do—thread is already
        // stopped. Second case can be ignored as it indicates that another thread already sent a
        // stop command and the thread will stop anyway.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    ///
    /// If you don't need to wait for the thread to exit, use [`PollerThread::stop`] instead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PollerThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        // Send stop signal in case it wasn't sent before.
        self.stop();

        // Error means that the thread has panicked and there's nothing useful we can do in that
        // case.
        self.join_handle
            .join()
            .map_err(|_| Error::PollerThreadPanicked)?;

        Ok(())
    }
}

/// Fetch one batch of change-log entries and apply them in order.
///
/// Returns the id to advance the cursor to: past every applied entry, stopping short of the
/// first entry whose entity reload kept failing so the next tick retries it.
async fn poll_once(
    source: &dyn ChangeLogSource,
    manager: &StateManager,
    mut last_id: i64,
    batch: usize,
) -> Result<i64> {
    let entries = source.entries_after(last_id, batch).await?;
    for entry in entries {
        match manager.apply(&entry).await {
            Ok(()) => last_id = entry.id,
            Err(err) if err.is_deferrable() => {
                log::warn!(target: "stratum",
                    id = entry.id;
                    "deferring change-log entry: {err}");
                break;
            }
            Err(err) => {
                // Unexpected non-storage failure; consuming the entry keeps the log moving.
                log::warn!(target: "stratum",
                    id = entry.id;
                    "failed to apply change-log entry, consuming: {err}");
                last_id = entry.id;
            }
        }
    }
    Ok(last_id)
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
