//! Strategy Runner
//!
//! Runs a user strategy on its own thread next to the broker read thread and
//! owns the shutdown sequence. Cancellation is cooperative: the strategy is
//! handed a [`CancellationToken`] and is expected to return once it fires.
//! Nothing is killed; a strategy that ignores the token is reported after a
//! bounded wait and left detached.

use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::client::BrokerClient;
use super::worker::{WorkerOutcome, WorkerThread, panic_message};
use crate::domain::connection::{ConnectionConfig, ConnectionError};
use crate::infrastructure::metrics;

const STRATEGY_THREAD_NAME: &str = "strategy";

// =============================================================================
// Strategy Contract
// =============================================================================

/// A user trading loop.
///
/// `run` reads state and places orders through `client` and returns when
/// `cancel` fires or when it is done. Returning `Err` or panicking ends the
/// session.
///
/// Closures with the same shape implement this trait.
pub trait Strategy: Send + 'static {
    /// Name used in logs.
    fn name(&self) -> &str {
        "strategy"
    }

    /// The loop.
    ///
    /// # Errors
    ///
    /// Any error is treated as a fatal strategy fault.
    fn run(&mut self, client: &BrokerClient, cancel: &CancellationToken) -> anyhow::Result<()>;
}

impl<F> Strategy for F
where
    F: FnMut(&BrokerClient, &CancellationToken) -> anyhow::Result<()> + Send + 'static,
{
    fn run(&mut self, client: &BrokerClient, cancel: &CancellationToken) -> anyhow::Result<()> {
        self(client, cancel)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Unhandled failure inside a strategy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StrategyFault {
    /// The strategy returned an error.
    #[error("strategy failed: {0}")]
    Failed(String),

    /// The strategy panicked.
    #[error("strategy panicked: {0}")]
    Panicked(String),
}

impl StrategyFault {
    /// Metric label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "error",
            Self::Panicked(_) => "panic",
        }
    }
}

/// Runner errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunnerError {
    /// A strategy is already running on this runner.
    #[error("a strategy is already running")]
    AlreadyRunning,

    /// The session could not be established.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The strategy ended with a fault; the session has been disconnected.
    #[error(transparent)]
    Strategy(#[from] StrategyFault),

    /// A thread did not exit within the shutdown timeout.
    #[error("shutdown did not complete within {0:?}")]
    ShutdownTimedOut(Duration),

    /// The strategy thread could not be started.
    #[error("failed to start strategy thread: {0}")]
    Spawn(String),
}

// =============================================================================
// Runner
// =============================================================================

/// Runner settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSettings {
    /// Bound on how long `stop` waits for each thread.
    pub shutdown_timeout: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

struct ActiveRun {
    worker: WorkerThread<Result<(), StrategyFault>>,
    cancel: CancellationToken,
    name: String,
}

/// Connects, runs one strategy at a time, and shuts both threads down.
pub struct StrategyRunner {
    client: BrokerClient,
    config: ConnectionConfig,
    settings: RunnerSettings,
    active: Mutex<Option<ActiveRun>>,
}

impl std::fmt::Debug for StrategyRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRunner")
            .field("config", &self.config)
            .field("settings", &self.settings)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl StrategyRunner {
    /// Create a runner that connects `client` with `config`.
    #[must_use]
    pub fn new(client: BrokerClient, config: ConnectionConfig, settings: RunnerSettings) -> Self {
        Self {
            client,
            config,
            settings,
            active: Mutex::new(None),
        }
    }

    /// The client handed to strategies.
    #[must_use]
    pub const fn client(&self) -> &BrokerClient {
        &self.client
    }

    /// Returns true while a strategy has been launched and not yet stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Connect, run `strategy` and block until it returns, then disconnect.
    ///
    /// # Errors
    ///
    /// Returns the connection error if the session cannot be established,
    /// or the strategy's fault after the session has been torn down.
    pub fn start(&self, strategy: impl Strategy) -> Result<(), RunnerError> {
        self.launch(strategy)?;
        self.wait()
    }

    /// Connect if needed and start `strategy` on its own thread without
    /// blocking.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning`, a connection error, or `Spawn`.
    pub fn launch<S: Strategy>(&self, strategy: S) -> Result<(), RunnerError> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(RunnerError::AlreadyRunning);
        }

        let connection = self.client.connection();
        if !connection.is_connected() {
            connection.connect(self.config.clone())?;
        }

        let name = strategy.name().to_string();
        let cancel = CancellationToken::new();
        let client = self.client.clone();
        let token = cancel.clone();
        let worker = WorkerThread::spawn(STRATEGY_THREAD_NAME, move || {
            run_strategy(strategy, &client, &token)
        })
        .map_err(|err| {
            connection.disconnect();
            RunnerError::Spawn(err.to_string())
        })?;

        tracing::info!(strategy = %name, endpoint = %self.config.endpoint(), "Strategy started");
        *active = Some(ActiveRun {
            worker,
            cancel,
            name,
        });
        Ok(())
    }

    /// Block until the launched strategy returns, then shut down.
    ///
    /// # Errors
    ///
    /// Returns the strategy's fault or `ShutdownTimedOut` if the read
    /// thread did not exit.
    pub fn wait(&self) -> Result<(), RunnerError> {
        let completion = self.active.lock().as_ref().map(|run| run.worker.completion());
        let Some(completion) = completion else {
            return Ok(());
        };
        // Not holding the run lock, so `stop` can be called meanwhile.
        let outcome = into_result(completion.wait());
        let stopped = self.stop();
        outcome.and(stopped)
    }

    /// Signal cancellation, wait for the strategy and read threads with the
    /// configured timeout, and disconnect.
    ///
    /// # Errors
    ///
    /// See [`stop_within`](Self::stop_within).
    pub fn stop(&self) -> Result<(), RunnerError> {
        self.stop_within(self.settings.shutdown_timeout)
    }

    /// Like [`stop`](Self::stop) with an explicit bound.
    ///
    /// The session is always disconnected. A strategy that does not return
    /// in time is detached and reported with a warning.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimedOut` if either thread is still running after
    /// `timeout`, otherwise the strategy's fault if it had one.
    pub fn stop_within(&self, timeout: Duration) -> Result<(), RunnerError> {
        let mut active = self.active.lock();
        let Some(mut run) = active.take() else {
            self.client.connection().disconnect();
            return Ok(());
        };

        tracing::info!(strategy = %run.name, "Stopping strategy");
        run.cancel.cancel();
        let outcome = run.worker.join_within(timeout);
        let reader_exited = self.client.connection().shutdown();

        let Some(outcome) = outcome else {
            tracing::warn!(
                strategy = %run.name,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "Strategy did not observe cancellation in time, detaching it"
            );
            return Err(RunnerError::ShutdownTimedOut(timeout));
        };
        if !reader_exited {
            tracing::warn!("Read thread stuck during shutdown");
            return Err(RunnerError::ShutdownTimedOut(timeout));
        }

        tracing::info!(strategy = %run.name, "Strategy stopped");
        into_result(outcome)
    }
}

impl Drop for StrategyRunner {
    fn drop(&mut self) {
        if let Some(run) = self.active.get_mut().as_ref() {
            run.cancel.cancel();
        }
    }
}

/// Strategy thread body. On a fault the session is torn down right away
/// rather than when someone calls `stop`.
fn run_strategy<S: Strategy>(
    mut strategy: S,
    client: &BrokerClient,
    cancel: &CancellationToken,
) -> Result<(), StrategyFault> {
    let result = panic::catch_unwind(AssertUnwindSafe(|| strategy.run(client, cancel)));
    let fault = match result {
        Ok(Ok(())) => {
            tracing::info!(strategy = %strategy.name(), "Strategy returned");
            return Ok(());
        }
        Ok(Err(err)) => StrategyFault::Failed(format!("{err:#}")),
        Err(payload) => StrategyFault::Panicked(panic_message(&*payload)),
    };

    tracing::error!(strategy = %strategy.name(), error = %fault, "Strategy fault, disconnecting");
    metrics::record_strategy_fault(fault.kind());
    cancel.cancel();
    client.connection().disconnect();
    Err(fault)
}

fn into_result(outcome: WorkerOutcome<Result<(), StrategyFault>>) -> Result<(), RunnerError> {
    match outcome {
        Ok(result) => result.map_err(RunnerError::from),
        Err(panic) => Err(StrategyFault::Panicked(panic).into()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::mpsc;

    use anyhow::bail;

    use super::*;
    use crate::application::ports::{Handshake, MockBrokerTransport};
    use crate::application::services::connection::ConnectionSettings;
    use crate::domain::connection::ConnectionStatus;

    fn runner(shutdown_timeout: Duration) -> StrategyRunner {
        let mut transport = MockBrokerTransport::new();
        transport.expect_connect().returning(|_, _| {
            Ok(Handshake {
                next_order_id: 1,
                server_version: 176,
            })
        });
        transport.expect_read().returning(|timeout| {
            std::thread::sleep(timeout);
            Ok(None)
        });
        transport.expect_disconnect().return_const(());

        let client = BrokerClient::new(
            Arc::new(transport),
            ConnectionSettings {
                handshake_timeout: Duration::from_millis(100),
                read_poll_interval: Duration::from_millis(5),
                join_timeout: Duration::from_secs(2),
            },
        );
        StrategyRunner::new(
            client,
            ConnectionConfig::new("127.0.0.1", 7497, 3),
            RunnerSettings { shutdown_timeout },
        )
    }

    #[test]
    fn start_returns_when_strategy_finishes() {
        let runner = runner(Duration::from_secs(2));
        let result = runner.start(|client: &BrokerClient, _: &CancellationToken| -> anyhow::Result<()> {
            assert!(client.connection().is_connected());
            Ok(())
        });
        assert_eq!(result, Ok(()));
        assert_eq!(runner.client().connection().status(), ConnectionStatus::Disconnected);
        assert!(!runner.is_running());
    }

    #[test]
    fn strategy_error_is_surfaced_and_disconnects() {
        let runner = runner(Duration::from_secs(2));
        let result = runner.start(|_: &BrokerClient, _: &CancellationToken| -> anyhow::Result<()> {
            bail!("no market data")
        });
        assert_eq!(
            result,
            Err(RunnerError::Strategy(StrategyFault::Failed("no market data".into())))
        );
        assert!(!runner.client().connection().is_connected());
    }

    #[test]
    fn strategy_panic_is_captured() {
        let runner = runner(Duration::from_secs(2));
        let result = runner.start(|_: &BrokerClient, _: &CancellationToken| -> anyhow::Result<()> {
            panic!("index out of range")
        });
        assert_eq!(
            result,
            Err(RunnerError::Strategy(StrategyFault::Panicked("index out of range".into())))
        );
        assert!(!runner.client().connection().is_connected());
    }

    #[test]
    fn stop_cancels_cooperative_strategy() {
        let runner = runner(Duration::from_secs(2));
        runner
            .launch(|_: &BrokerClient, cancel: &CancellationToken| -> anyhow::Result<()> {
                while !cancel.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(2));
                }
                Ok(())
            })
            .unwrap();
        assert!(runner.is_running());
        assert_eq!(
            runner.launch(|_: &BrokerClient, _: &CancellationToken| -> anyhow::Result<()> { Ok(()) }),
            Err(RunnerError::AlreadyRunning)
        );

        assert_eq!(runner.stop(), Ok(()));
        assert!(!runner.is_running());
        assert_eq!(runner.client().connection().status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn stop_gives_up_on_stuck_strategy() {
        let runner = runner(Duration::from_millis(30));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        runner
            .launch(move |_: &BrokerClient, _: &CancellationToken| -> anyhow::Result<()> {
                let _ = release_rx.recv();
                Ok(())
            })
            .unwrap();

        assert_eq!(
            runner.stop(),
            Err(RunnerError::ShutdownTimedOut(Duration::from_millis(30)))
        );
        assert!(!runner.client().connection().is_connected());
        release_tx.send(()).unwrap();
    }
}
