use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::aggregate::pool::PowerPool;
use crate::aggregate::{EnergyAggregator, MinuteAggregator};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::device::discovery::{self, StaticDiscovery};
use crate::device::wattchecker::WattChecker;
use crate::device::Meter;
use crate::reader::{ReaderState, ReaderStats, SampleReader};
use crate::record::{Emitter, FileEmitter};
use crate::scheduler::Scheduler;
use crate::transport::{Connector, Endpoint, TcpConnector};

/// How often the scheduler checks for due jobs.
pub const SCHEDULER_POLL: Duration = Duration::from_secs(1);

/// Agent wires discovery, the sample reader and the aggregation schedule.
pub struct Agent {
    cfg: Config,
}

impl Agent {
    /// Creates a new Agent, making sure the record directory exists.
    pub fn new(cfg: Config) -> Result<Self> {
        std::fs::create_dir_all(&cfg.general.data_dir).with_context(|| {
            format!(
                "creating data directory {}",
                cfg.general.data_dir.display()
            )
        })?;

        Ok(Self { cfg })
    }

    /// Locate the meter and log until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<ReaderStats> {
        // 1. Find the meter. Failure here is fatal.
        let disc = StaticDiscovery::new(&self.cfg.device);
        let endpoint = discovery::search(&disc).context("discovering meter")?;
        info!(
            address = %endpoint.address,
            port = endpoint.port,
            "found meter",
        );

        // 2. Build the production pipeline.
        let pipeline = Pipeline {
            connector: TcpConnector::new(self.cfg.transport.read_timeout),
            meter: WattChecker::new(),
            clock: Arc::new(SystemClock),
            emitter: Arc::new(FileEmitter::new(&self.cfg.general.data_dir)),
            endpoint,
            connect_backoff: self.cfg.transport.connect_backoff,
        };

        // 3. Run until shutdown.
        Ok(pipeline.run(cancel).await)
    }
}

/// Reader plus scheduled aggregators sharing one sample pool.
pub struct Pipeline<T, M, C, E: ?Sized> {
    pub connector: T,
    pub meter: M,
    pub clock: Arc<C>,
    pub emitter: Arc<E>,
    pub endpoint: Endpoint,
    pub connect_backoff: Duration,
}

impl<T, M, C, E> Pipeline<T, M, C, E>
where
    T: Connector + 'static,
    T::Conn: 'static,
    M: Meter<T::Conn> + 'static,
    C: Clock + 'static,
    E: Emitter + ?Sized + 'static,
{
    /// Spawn the reader, drive the aggregators until `cancel` fires, then
    /// wait for the reader to tear down.
    ///
    /// A reader that faults ends on its own; aggregation keeps running.
    pub async fn run(self, cancel: CancellationToken) -> ReaderStats {
        let pool = Arc::new(PowerPool::new());

        let reader = SampleReader::new(
            self.connector,
            self.meter,
            Arc::clone(&self.clock),
            Arc::clone(&pool),
            self.endpoint,
            self.connect_backoff,
        );
        let reader_task = tokio::spawn(reader.run(cancel.child_token()));

        let minute = MinuteAggregator::new(Arc::clone(&pool), Arc::clone(&self.emitter));
        let energy = Arc::new(EnergyAggregator::new(pool, self.emitter));

        // Registration order matters: the minute drain must reach the
        // half-hour pool before it is drained in the same poll.
        let now = self.clock.now();
        let mut scheduler = Scheduler::new(SCHEDULER_POLL);
        scheduler.every_minute("minute", now, move |at| {
            minute.aggregate(at);
        });
        {
            let energy = Arc::clone(&energy);
            scheduler.hourly_at("half_hour_00", 0, now, move |at| {
                energy.aggregate(at);
            });
        }
        scheduler.hourly_at("half_hour_30", 30, now, move |at| {
            energy.aggregate(at);
        });

        scheduler.run(self.clock.as_ref(), cancel).await;

        match reader_task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "reader task failed");
                ReaderStats {
                    final_state: ReaderState::Faulted,
                    ..Default::default()
                }
            }
        }
    }
}
