use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::pool::PowerPool;
use crate::clock::{until_next_second, Clock};
use crate::device::{DeviceError, Meter};
use crate::transport::{connect_with_retry, Connector, Endpoint};

/// Lifecycle of the sample reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReaderState {
    #[default]
    Connecting,
    Initializing,
    Measuring,
    Faulted,
}

impl ReaderState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Initializing => "initializing",
            Self::Measuring => "measuring",
            Self::Faulted => "faulted",
        }
    }
}

impl fmt::Display for ReaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters reported when the reader finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub samples: u64,
    pub empty_reads: u64,
    pub reconnects: u64,
    pub final_state: ReaderState,
}

impl ReaderStats {
    fn enter(&mut self, state: ReaderState) {
        debug!(from = %self.final_state, to = %state, "reader state change");
        self.final_state = state;
    }
}

/// Polls the meter once per second and appends samples to the shared pool.
pub struct SampleReader<T, M, C> {
    connector: T,
    meter: M,
    clock: Arc<C>,
    pool: Arc<PowerPool>,
    endpoint: Endpoint,
    backoff: Duration,
}

impl<T, M, C> SampleReader<T, M, C>
where
    T: Connector,
    M: Meter<T::Conn>,
    C: Clock,
{
    pub fn new(
        connector: T,
        meter: M,
        clock: Arc<C>,
        pool: Arc<PowerPool>,
        endpoint: Endpoint,
        backoff: Duration,
    ) -> Self {
        Self {
            connector,
            meter,
            clock,
            pool,
            endpoint,
            backoff,
        }
    }

    /// Read until cancelled or until a fault that reconnecting cannot fix.
    ///
    /// Transport faults while measuring reconnect and re-initialize the
    /// device. Any other fault ends the reader after a best-effort teardown.
    pub async fn run(self, cancel: CancellationToken) -> ReaderStats {
        let mut stats = ReaderStats::default();

        let Some(mut conn) = self.connect(&cancel).await else {
            info!("reader cancelled before connecting");
            return stats;
        };

        if let Err(e) = self.acquire(&mut conn, &mut stats, &cancel).await {
            error!(
                address = %self.endpoint.address,
                port = self.endpoint.port,
                state = %stats.final_state,
                error = %e,
                "acquisition failed",
            );
            stats.enter(ReaderState::Faulted);
        }

        self.teardown(conn).await;

        info!(
            samples = stats.samples,
            empty_reads = stats.empty_reads,
            reconnects = stats.reconnects,
            state = %stats.final_state,
            "reader stopped",
        );
        stats
    }

    async fn connect(&self, cancel: &CancellationToken) -> Option<T::Conn> {
        connect_with_retry(
            &self.connector,
            &self.endpoint,
            self.backoff,
            self.clock.as_ref(),
            cancel,
        )
        .await
    }

    async fn start(&self, conn: &mut T::Conn, stats: &mut ReaderStats) -> Result<(), DeviceError> {
        stats.enter(ReaderState::Initializing);
        info!("initializing...");
        self.meter.initialize(conn, self.clock.now()).await?;

        info!("starting measurement...");
        self.meter.start_measure(conn).await?;

        stats.enter(ReaderState::Measuring);
        Ok(())
    }

    async fn acquire(
        &self,
        conn: &mut T::Conn,
        stats: &mut ReaderStats,
        cancel: &CancellationToken,
    ) -> Result<(), DeviceError> {
        self.start(conn, stats).await?;

        loop {
            match self.meter.get_data(conn).await {
                Ok(Some(sample)) => {
                    self.pool.push(sample);
                    stats.samples += 1;
                    debug!(power_w = sample.power_watts, "sample");
                }
                Ok(None) => stats.empty_reads += 1,
                Err(e) if e.is_transport() => {
                    warn!(
                        address = %self.endpoint.address,
                        port = self.endpoint.port,
                        error = %e,
                        "lost meter connection, reconnecting",
                    );
                    stats.reconnects += 1;
                    stats.enter(ReaderState::Connecting);

                    let Some(fresh) = self.connect(cancel).await else {
                        return Ok(());
                    };
                    let stale = std::mem::replace(conn, fresh);
                    if let Err(e) = self.connector.close(stale).await {
                        debug!(error = %e, "closing stale connection");
                    }

                    self.start(conn, stats).await?;
                    continue;
                }
                Err(e) => return Err(e),
            }

            let wait = until_next_second(self.clock.now());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = self.clock.sleep(wait) => {}
            }
        }
    }

    async fn teardown(&self, mut conn: T::Conn) {
        info!("stopping measurement...");
        if let Err(e) = self.meter.stop_measure(&mut conn).await {
            warn!(
                address = %self.endpoint.address,
                port = self.endpoint.port,
                error = %e,
                "failed to stop measurement",
            );
        }
        info!("closing connection...");
        if let Err(e) = self.connector.close(conn).await {
            warn!(
                address = %self.endpoint.address,
                port = self.endpoint.port,
                error = %e,
                "failed to close connection",
            );
        }
    }
}
