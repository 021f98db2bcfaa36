//! Runs the long-lived processes of a service under one cancellation token.
//!
//! Processes run concurrently until one fails, all finish, or SIGINT/SIGTERM
//! arrives. The token is then cancelled, the remaining processes get a grace
//! period to drain, and the closers run with their own timeout.
//!
//! ```no_run
//! use carechain_runner::Runner;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Runner::new()
//!         .with_app_process("heartbeat", |ctx| async move {
//!             while !ctx.is_cancelled() {
//!                 tokio::select! {
//!                     _ = ctx.cancelled() => {}
//!                     _ = tokio::time::sleep(Duration::from_secs(1)) => {
//!                         tracing::info!("still alive");
//!                     }
//!                 }
//!             }
//!             Ok(())
//!         })
//!         .with_closer("flush", || async move { Ok(()) })
//!         .run()
//!         .await;
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type AppProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send,
>;

pub type Closer =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send>;

struct Named<T> {
    name: String,
    inner: T,
}

pub struct Runner {
    app_processes: Vec<Named<AppProcess>>,
    closers: Vec<Named<Closer>>,
    shutdown_timeout: Duration,
    closer_timeout: Duration,
    cancellation_token: CancellationToken,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    /// Defaults: 30s for processes to drain after cancellation, 10s for closers.
    pub fn new() -> Self {
        Self {
            app_processes: Vec::new(),
            closers: Vec::new(),
            shutdown_timeout: Duration::from_secs(30),
            closer_timeout: Duration::from_secs(10),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Register a process. An error from any process cancels all of them and
    /// makes the runner exit non-zero.
    pub fn with_app_process<F, Fut>(mut self, name: impl Into<String>, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.app_processes.push(Named {
            name: name.into(),
            inner: Box::new(|token| Box::pin(process(token))),
        });
        self
    }

    /// Register a process that is already boxed, e.g. one built by a service
    /// module.
    pub fn with_boxed_process(mut self, name: impl Into<String>, process: AppProcess) -> Self {
        self.app_processes.push(Named {
            name: name.into(),
            inner: process,
        });
        self
    }

    /// Closers run after every process has stopped, whatever the outcome.
    pub fn with_closer<F, Fut>(mut self, name: impl Into<String>, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closers.push(Named {
            name: name.into(),
            inner: Box::new(|| Box::pin(closer())),
        });
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// Share cancellation with code outside the runner.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Run to completion and exit the process with the resulting code.
    pub async fn run(self) -> ! {
        let token = self.cancellation_token.clone();
        spawn_signal_handlers(token);

        let code = self.execute().await;
        if code == 0 {
            info!("application exiting normally");
        } else {
            error!(exit_code = code, "application exiting with error");
        }
        std::process::exit(code)
    }

    /// Run processes and closers; returns the exit code instead of exiting.
    pub async fn execute(self) -> i32 {
        let token = self.cancellation_token;
        let mut join_set = JoinSet::new();

        for process in self.app_processes {
            let process_token = token.clone();
            let name = process.name;
            info!(process = %name, "starting process");
            join_set.spawn(async move {
                let result = (process.inner)(process_token).await;
                (name, result)
            });
        }

        let mut failed = false;
        loop {
            let joined = tokio::select! {
                _ = token.cancelled() => break,
                joined = join_set.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };

            match joined {
                Ok((name, Ok(()))) => {
                    debug!(process = %name, "process finished");
                }
                Ok((name, Err(err))) => {
                    error!(process = %name, error = %format!("{:#}", err), "process failed");
                    failed = true;
                }
                Err(err) => {
                    error!(error = %err, "process panicked");
                    failed = true;
                }
            }

            if failed {
                token.cancel();
                break;
            }
        }

        if !join_set.is_empty() {
            info!(
                remaining = join_set.len(),
                timeout_secs = self.shutdown_timeout.as_secs(),
                "waiting for processes to drain"
            );
            let drained = tokio::time::timeout(self.shutdown_timeout, async {
                while let Some(joined) = join_set.join_next().await {
                    match joined {
                        Ok((name, Ok(()))) => debug!(process = %name, "process stopped"),
                        Ok((name, Err(err))) => {
                            error!(process = %name, error = %format!("{:#}", err), "process failed during shutdown");
                            failed = true;
                        }
                        Err(err) => error!(error = %err, "process panicked during shutdown"),
                    }
                }
            })
            .await;

            if drained.is_err() {
                warn!("processes did not stop in time, aborting them");
                join_set.shutdown().await;
            }
        }

        if !self.closers.is_empty() {
            info!(timeout_secs = self.closer_timeout.as_secs(), "running closers");
            if tokio::time::timeout(self.closer_timeout, run_closers(self.closers))
                .await
                .is_err()
            {
                error!("closers timed out");
            }
        }

        if failed {
            1
        } else {
            0
        }
    }
}

async fn run_closers(closers: Vec<Named<Closer>>) {
    let mut closer_set = JoinSet::new();

    for closer in closers {
        closer_set.spawn(async move { (closer.name, (closer.inner)().await) });
    }

    while let Some(joined) = closer_set.join_next().await {
        match joined {
            Ok((name, Ok(()))) => debug!(closer = %name, "closer completed"),
            Ok((name, Err(err))) => error!(closer = %name, error = %format!("{:#}", err), "closer failed"),
            Err(err) => error!(error = %err, "closer panicked"),
        }
    }
}

fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received SIGINT");
                ctrl_c_token.cancel();
            }
            Err(err) => error!(error = %err, "failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received SIGTERM");
                token.cancel();
            }
            Err(err) => error!(error = %err, "failed to listen for SIGTERM"),
        }
    });
}
