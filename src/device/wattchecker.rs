//! WATT CHECKER (REX-BTWATTCH1 family) command set.

use chrono::{Datelike, NaiveDateTime, Timelike};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::frame::{self, FrameError, HEADER_SIZE};
use super::{DeviceError, Meter, Sample};
use crate::transport::Connection;

const CMD_SET_RTC: u8 = 0x01;
const CMD_MEASURE: u8 = 0x02;
const CMD_GET_DATA: u8 = 0x08;

const MEASURE_STOP: u8 = 0x00;
const MEASURE_START: u8 = 0x01;

/// Offset and width of the power field in a measurement payload.
const POWER_OFFSET: usize = 14;
const FIELD_WIDTH: usize = 6;
const MEASUREMENT_LEN: usize = POWER_OFFSET + FIELD_WIDTH;

/// Fixed-point scale of the power field (W = raw / 16^6).
const POWER_SCALE: f64 = 16_777_216.0;

/// Protocol driver for the WATT CHECKER meter.
#[derive(Debug, Clone, Copy, Default)]
pub struct WattChecker;

impl WattChecker {
    pub fn new() -> Self {
        Self
    }

    async fn send<S>(&self, conn: &mut Connection<S>, payload: &[u8]) -> Result<(), DeviceError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let bytes = frame::encode(payload)?;
        conn.write_all(&bytes).await
    }

    /// Read one response frame; the CRC verdict is returned separately so
    /// callers can decide how strict to be.
    async fn receive<S>(
        &self,
        conn: &mut Connection<S>,
    ) -> Result<(Vec<u8>, Result<(), FrameError>), DeviceError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut header = [0u8; HEADER_SIZE];
        conn.read_exact(&mut header).await?;
        let len = frame::decode_header(header)?;

        let mut body = vec![0u8; len + 1];
        conn.read_exact(&mut body).await?;
        let crc = body.pop().unwrap_or_default();
        let verdict = frame::verify(&body, crc);

        Ok((body, verdict))
    }

    async fn command<S>(
        &self,
        conn: &mut Connection<S>,
        name: &'static str,
        payload: &[u8],
    ) -> Result<(), DeviceError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.send(conn, payload).await?;
        let (response, verdict) = self.receive(conn).await?;
        verdict?;
        check_ack(name, payload[0], &response)
    }
}

impl<S> Meter<Connection<S>> for WattChecker
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn initialize(
        &self,
        conn: &mut Connection<S>,
        now: NaiveDateTime,
    ) -> Result<(), DeviceError> {
        let payload = rtc_payload(now);
        self.command(conn, "initialize", &payload).await
    }

    async fn start_measure(&self, conn: &mut Connection<S>) -> Result<(), DeviceError> {
        self.command(conn, "start_measure", &[CMD_MEASURE, MEASURE_START])
            .await
    }

    async fn stop_measure(&self, conn: &mut Connection<S>) -> Result<(), DeviceError> {
        self.command(conn, "stop_measure", &[CMD_MEASURE, MEASURE_STOP])
            .await
    }

    async fn get_data(&self, conn: &mut Connection<S>) -> Result<Option<Sample>, DeviceError> {
        self.send(conn, &[CMD_GET_DATA]).await?;
        let (response, verdict) = self.receive(conn).await?;

        if let Err(e) = verdict {
            debug!(error = %e, "discarding corrupted measurement");
            return Ok(None);
        }

        Ok(parse_measurement(&response))
    }
}

/// Set-RTC command payload for `now`.
pub fn rtc_payload(now: NaiveDateTime) -> [u8; 8] {
    [
        CMD_SET_RTC,
        now.second() as u8,
        now.minute() as u8,
        now.hour() as u8,
        now.day() as u8,
        now.month0() as u8,
        (now.year() - 1900).clamp(0, 255) as u8,
        now.weekday().num_days_from_sunday() as u8,
    ]
}

/// Decode a measurement payload. `None` for anything that is not one.
pub fn parse_measurement(payload: &[u8]) -> Option<Sample> {
    if payload.first() != Some(&CMD_GET_DATA) {
        return None;
    }

    let raw = frame::read_uint_le(payload.get(POWER_OFFSET..MEASUREMENT_LEN)?);
    Some(Sample {
        power_watts: raw as f64 / POWER_SCALE,
    })
}

fn check_ack(name: &'static str, command: u8, response: &[u8]) -> Result<(), DeviceError> {
    match response {
        [echo, ..] if *echo != command => Err(DeviceError::Protocol {
            command: name,
            detail: format!("expected echo {command:#04x}, got {echo:#04x}"),
        }),
        [_, status, ..] if *status != 0 => Err(DeviceError::Protocol {
            command: name,
            detail: format!("status {status:#04x}"),
        }),
        [] => Err(DeviceError::Protocol {
            command: name,
            detail: "empty response".to_string(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::NaiveDate;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;

    fn measurement_payload(power_watts: f64) -> Vec<u8> {
        let mut payload = vec![0u8; MEASUREMENT_LEN];
        payload[0] = CMD_GET_DATA;
        let raw = (power_watts * POWER_SCALE) as u64;
        payload[POWER_OFFSET..MEASUREMENT_LEN].copy_from_slice(&raw.to_le_bytes()[..FIELD_WIDTH]);
        payload
    }

    /// Reads one request frame from the device side and returns its payload.
    async fn read_request(device: &mut DuplexStream) -> Vec<u8> {
        let mut header = [0u8; HEADER_SIZE];
        device.read_exact(&mut header).await.expect("header");
        let len = frame::decode_header(header).expect("valid header");
        let mut body = vec![0u8; len + 1];
        device.read_exact(&mut body).await.expect("body");
        let crc = body.pop().expect("crc byte");
        frame::verify(&body, crc).expect("valid crc");
        body
    }

    async fn reply(device: &mut DuplexStream, payload: &[u8]) {
        let bytes = frame::encode(payload).expect("encodes");
        device.write_all(&bytes).await.expect("reply");
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .expect("valid date")
            .and_hms_opt(h, m, s)
            .expect("valid time")
    }

    fn connection() -> (Connection<DuplexStream>, DuplexStream) {
        let (client, device) = tokio::io::duplex(1024);
        (Connection::new(client, Duration::from_secs(1)), device)
    }

    #[test]
    fn test_rtc_payload() {
        // 2024-05-01 was a Wednesday.
        assert_eq!(
            rtc_payload(at(13, 45, 30)),
            [CMD_SET_RTC, 30, 45, 13, 1, 4, 124, 3]
        );
    }

    #[test]
    fn test_parse_measurement() {
        let sample = parse_measurement(&measurement_payload(123.5)).expect("measurement");
        assert!((sample.power_watts - 123.5).abs() < 1e-6);
    }

    #[test]
    fn test_parse_measurement_rejects_other_payloads() {
        assert_eq!(parse_measurement(&[]), None);
        assert_eq!(parse_measurement(&[CMD_MEASURE, 0x00]), None);
        assert_eq!(parse_measurement(&[CMD_GET_DATA, 0x00, 0x01]), None);
    }

    #[test]
    fn test_check_ack() {
        assert!(check_ack("start_measure", CMD_MEASURE, &[CMD_MEASURE, 0x00]).is_ok());
        assert!(check_ack("start_measure", CMD_MEASURE, &[CMD_MEASURE]).is_ok());

        let err = check_ack("start_measure", CMD_MEASURE, &[CMD_MEASURE, 0x05])
            .expect_err("non-zero status");
        assert!(!err.is_transport());
        assert!(err.to_string().contains("status 0x05"));

        let err = check_ack("initialize", CMD_SET_RTC, &[CMD_GET_DATA]).expect_err("wrong echo");
        assert!(err.to_string().contains("expected echo 0x01"));
    }

    #[tokio::test]
    async fn test_get_data_exchange() {
        let (mut conn, mut device) = connection();

        let device_task = tokio::spawn(async move {
            let request = read_request(&mut device).await;
            assert_eq!(request, vec![CMD_GET_DATA]);
            reply(&mut device, &measurement_payload(200.0)).await;
            device
        });

        let sample = WattChecker::new()
            .get_data(&mut conn)
            .await
            .expect("exchange")
            .expect("sample");
        assert!((sample.power_watts - 200.0).abs() < 1e-6);

        device_task.await.expect("device task");
    }

    #[tokio::test]
    async fn test_get_data_corrupted_crc_is_empty() {
        let (mut conn, mut device) = connection();

        let device_task = tokio::spawn(async move {
            read_request(&mut device).await;
            let mut bytes = frame::encode(&measurement_payload(50.0)).expect("encodes");
            let last = bytes.len() - 1;
            bytes[last] ^= 0xFF;
            device.write_all(&bytes).await.expect("reply");
            device
        });

        let sample = WattChecker::new()
            .get_data(&mut conn)
            .await
            .expect("exchange");
        assert_eq!(sample, None);

        device_task.await.expect("device task");
    }

    #[tokio::test]
    async fn test_get_data_bad_start_byte_is_transport_fault() {
        let (mut conn, mut device) = connection();

        let device_task = tokio::spawn(async move {
            read_request(&mut device).await;
            device.write_all(&[0x00, 0x01, 0x00]).await.expect("reply");
            device
        });

        let err = WattChecker::new()
            .get_data(&mut conn)
            .await
            .expect_err("desynced stream");
        assert!(err.is_transport());

        device_task.await.expect("device task");
    }

    #[tokio::test]
    async fn test_start_and_stop_measure() {
        let (mut conn, mut device) = connection();

        let device_task = tokio::spawn(async move {
            let start = read_request(&mut device).await;
            assert_eq!(start, vec![CMD_MEASURE, MEASURE_START]);
            reply(&mut device, &[CMD_MEASURE, 0x00]).await;

            let stop = read_request(&mut device).await;
            assert_eq!(stop, vec![CMD_MEASURE, MEASURE_STOP]);
            reply(&mut device, &[CMD_MEASURE, 0x00]).await;
            device
        });

        let meter = WattChecker::new();
        meter.start_measure(&mut conn).await.expect("start");
        meter.stop_measure(&mut conn).await.expect("stop");

        device_task.await.expect("device task");
    }

    #[tokio::test]
    async fn test_initialize_sets_rtc_to_given_time() {
        let (mut conn, mut device) = connection();

        let device_task = tokio::spawn(async move {
            let request = read_request(&mut device).await;
            reply(&mut device, &[CMD_SET_RTC, 0x00]).await;
            request
        });

        WattChecker::new()
            .initialize(&mut conn, at(7, 8, 9))
            .await
            .expect("initialize");

        let request = device_task.await.expect("device task");
        assert_eq!(request, rtc_payload(at(7, 8, 9)).to_vec());
    }

    #[tokio::test]
    async fn test_initialize_rejected_is_protocol_fault() {
        let (mut conn, mut device) = connection();

        let device_task = tokio::spawn(async move {
            let request = read_request(&mut device).await;
            assert_eq!(request[0], CMD_SET_RTC);
            assert_eq!(request.len(), 8);
            reply(&mut device, &[CMD_SET_RTC, 0x01]).await;
            device
        });

        let err = WattChecker::new()
            .initialize(&mut conn, at(13, 45, 30))
            .await
            .expect_err("rejected");
        assert!(matches!(
            err,
            DeviceError::Protocol {
                command: "initialize",
                ..
            }
        ));

        device_task.await.expect("device task");
    }

    #[tokio::test]
    async fn test_get_data_silent_device_times_out() {
        let (client, _device) = tokio::io::duplex(1024);
        let mut conn = Connection::new(client, Duration::from_millis(20));

        let err = WattChecker::new()
            .get_data(&mut conn)
            .await
            .expect_err("no reply");
        assert!(matches!(err, DeviceError::Timeout(_)));
    }
}
