pub mod discovery;
pub mod frame;
pub mod wattchecker;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use thiserror::Error;

use self::frame::FrameError;

/// One instantaneous power reading from the meter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub power_watts: f64,
}

/// Errors raised while talking to the meter.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed by peer")]
    Closed,

    #[error("framing lost: {0}")]
    Frame(#[from] FrameError),

    #[error("unexpected response to {command}: {detail}")]
    Protocol {
        command: &'static str,
        detail: String,
    },
}

impl DeviceError {
    /// Whether the fault lives in the stream connection.
    ///
    /// Transport faults are recovered by reconnecting; anything else ends
    /// acquisition. A stream that lost frame sync is only usable again after
    /// a fresh connection, so framing errors count as transport faults.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Timeout(_) | Self::Closed | Self::Frame(_)
        )
    }
}

/// Request/response protocol of the meter over an established connection `S`.
pub trait Meter<S>: Send + Sync {
    /// Prepare the device for measuring, syncing its clock to `now`.
    fn initialize(
        &self,
        conn: &mut S,
        now: NaiveDateTime,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Start continuous measurement.
    fn start_measure(&self, conn: &mut S)
        -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Stop continuous measurement.
    fn stop_measure(&self, conn: &mut S) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Read one sample. `Ok(None)` when the device had nothing to report.
    fn get_data(
        &self,
        conn: &mut S,
    ) -> impl Future<Output = Result<Option<Sample>, DeviceError>> + Send;
}

impl<S, M: Meter<S>> Meter<S> for Arc<M> {
    fn initialize(
        &self,
        conn: &mut S,
        now: NaiveDateTime,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send {
        (**self).initialize(conn, now)
    }

    fn start_measure(&self, conn: &mut S)
        -> impl Future<Output = Result<(), DeviceError>> + Send {
        (**self).start_measure(conn)
    }

    fn stop_measure(&self, conn: &mut S) -> impl Future<Output = Result<(), DeviceError>> + Send {
        (**self).stop_measure(conn)
    }

    fn get_data(
        &self,
        conn: &mut S,
    ) -> impl Future<Output = Result<Option<Sample>, DeviceError>> + Send {
        (**self).get_data(conn)
    }
}
