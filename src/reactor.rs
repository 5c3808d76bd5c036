use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, error};

/// A dedicated OS thread driving a single-threaded cooperative event loop. All socket I/O
///  of one server or client runs as tasks on this loop, so no two completions of the same
///  reactor ever run concurrently with each other - only with the application thread.
///
/// Shutting down drops the runtime, which cancels every remaining task at its next
///  suspension point, then joins the thread.
pub(crate) struct Reactor {
    handle: Handle,
    shutdown: Arc<Notify>,
    thread: Option<JoinHandle<()>>,
}

impl Reactor {
    pub fn spawn(name: &str) -> anyhow::Result<Reactor> {
        let shutdown = Arc::new(Notify::new());
        let shutdown_signal = shutdown.clone();
        let (handle_tx, handle_rx) = mpsc::channel();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("could not build the reactor runtime: {}", e);
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                if handle_tx.send(Ok(runtime.handle().clone())).is_err() {
                    return;
                }

                runtime.block_on(async move { shutdown_signal.notified().await });
                debug!("reactor loop ended, cancelling outstanding operations");
            })?;

        let handle = handle_rx.recv()??;
        Ok(Reactor {
            handle,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Stops the event loop and joins the reactor thread. Outstanding operations are
    ///  cancelled, their callbacks never run again.
    pub fn shutdown(self) {
        // all the work happens in Drop, so shutdown-on-drop and explicit shutdown behave
        // identically
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown.notify_one();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("reactor thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_spawn_runs_tasks_and_shutdown_joins() {
        let reactor = Reactor::spawn("test-reactor").unwrap();

        let (tx, rx) = mpsc::channel();
        reactor.handle().spawn(async move {
            tx.send(42u32).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);

        reactor.shutdown();
    }

    #[test]
    fn test_shutdown_cancels_pending_tasks() {
        let reactor = Reactor::spawn("test-reactor").unwrap();

        let (tx, rx) = mpsc::channel::<u32>();
        reactor.handle().spawn(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            let _ = tx.send(1);
        });

        reactor.shutdown();
        // the task was cancelled at its sleep, so the sender is dropped without sending
        assert!(rx.recv().is_err());
    }
}
