//! Transport layer for RTU and TCP
//!
//! A transport owns one physical link and performs exactly one request/response
//! exchange at a time. It knows nothing about retries or fairness; that is the
//! job of [`BusArbiter`](crate::arbiter::BusArbiter), which is the only owner
//! of a transport once the gateway is running.
//!
//! | Transport | Framing | Inter-frame silence |
//! |-----------|---------|---------------------|
//! | [`RtuTransport`] | slave + PDU + CRC16 | 3.5 chars (1.75 ms above 19200 baud) |
//! | [`TcpTransport`] | MBAP + PDU | none |
//! | `MockTransport` (`mock` feature) | none (scripted) | configurable |
//!
//! Both real transports are generic over the byte stream so they can be
//! exercised over `tokio::io::duplex` in tests.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use crate::codec::{BusOp, BusReply, ModbusCodec};
use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{mbap_frame, rtu_frame, rtu_response_len, rtu_unframe, MbapHeader};
use crate::logging::HexFrame;
#[cfg(any(test, feature = "mock"))]
use crate::mock::MockTransport;

/// Link-level counters kept by each transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Response and inter-byte timeouts of one bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTimeouts {
    pub response: Duration,
    pub inter_byte: Duration,
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        Self {
            response: Duration::from_millis(DEFAULT_RESPONSE_TIMEOUT_MS),
            inter_byte: Duration::from_millis(DEFAULT_INTER_BYTE_TIMEOUT_MS),
        }
    }
}

/// One physical Modbus link.
pub trait ModbusTransport: Send + 'static {
    /// Address subsequent exchanges to `slave_id`. Local only, nothing is sent.
    fn select_slave(&mut self, slave_id: u8);

    /// Send the request for `op` to the selected slave and wait for its reply.
    fn exchange(
        &mut self,
        op: &BusOp,
    ) -> impl Future<Output = ModbusResult<BusReply>> + Send;

    /// Silence required between the end of one frame and the next request
    fn inter_frame_silence(&self) -> Duration;

    fn is_connected(&self) -> bool;

    /// Release the link. Further exchanges fail with `TransportClosed`.
    fn close(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    fn stats(&self) -> TransportStats;
}

/// 3.5 character times at `baud_rate`, 11 bits per character
pub fn rtu_silence(baud_rate: u32) -> Duration {
    if baud_rate == 0 || baud_rate > 19_200 {
        return Duration::from_micros(RTU_FIXED_SILENCE_US);
    }
    // 3.5 × 11 bits = 38.5 bit times
    Duration::from_micros(38_500_000 / baud_rate as u64)
}

/// Read into `buf[filled..target]`.
///
/// The first byte of a reply may take `timeouts.response`; once bytes are
/// flowing each further chunk must arrive within `timeouts.inter_byte`.
async fn read_until<R>(
    reader: &mut R,
    buf: &mut [u8],
    mut filled: usize,
    target: usize,
    timeouts: &TransportTimeouts,
) -> ModbusResult<usize>
where
    R: AsyncRead + Unpin,
{
    while filled < target {
        let wait = if filled == 0 {
            timeouts.response
        } else {
            timeouts.inter_byte
        };
        match timeout(wait, reader.read(&mut buf[filled..target])).await {
            Err(_) if filled == 0 => {
                return Err(ModbusError::timeout(
                    "waiting for response",
                    wait.as_millis() as u64,
                ))
            }
            Err(_) => {
                return Err(ModbusError::ShortRead {
                    expected: target,
                    got: filled,
                })
            }
            Ok(Ok(0)) => return Err(ModbusError::TransportClosed),
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => return Err(e.into()),
        }
    }
    Ok(filled)
}

fn record_failure(stats: &mut TransportStats, err: &ModbusError) {
    stats.errors += 1;
    if matches!(err, ModbusError::Timeout { .. }) {
        stats.timeouts += 1;
    }
}

// ============================================================================
// RTU
// ============================================================================

/// Serial line parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Serial line settings of an RTU bus
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SerialSettings {
    pub path: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

/// Modbus RTU over any async byte stream (usually a serial port)
pub struct RtuTransport<S> {
    stream: S,
    slave_id: u8,
    timeouts: TransportTimeouts,
    silence: Duration,
    connected: bool,
    stats: TransportStats,
}

impl<S> RtuTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S, baud_rate: u32, timeouts: TransportTimeouts) -> Self {
        Self {
            stream,
            slave_id: MIN_SLAVE_ID,
            timeouts,
            silence: rtu_silence(baud_rate),
            connected: true,
            stats: TransportStats::default(),
        }
    }

    async fn read_response(&mut self) -> ModbusResult<([u8; MAX_RTU_FRAME], usize)> {
        let mut frame = [0u8; MAX_RTU_FRAME];
        let filled = read_until(&mut self.stream, &mut frame, 0, 3, &self.timeouts).await?;
        let total = rtu_response_len([frame[0], frame[1], frame[2]]);
        if total > MAX_RTU_FRAME {
            return Err(ModbusError::framing(format!("RTU frame length {total} too large")));
        }
        let filled = read_until(&mut self.stream, &mut frame, filled, total, &self.timeouts).await?;
        Ok((frame, filled))
    }

    /// Throw away whatever is already buffered on the line without waiting.
    async fn discard_pending(&mut self) -> ModbusResult<usize> {
        let mut scratch = [0u8; MAX_RTU_FRAME];
        let mut discarded = 0;
        loop {
            match timeout(Duration::ZERO, self.stream.read(&mut scratch)).await {
                Err(_) => return Ok(discarded),
                Ok(Ok(0)) => return Err(ModbusError::TransportClosed),
                Ok(Ok(n)) => discarded += n,
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Discard bytes until the line has been quiet for `quiet`, giving up
    /// after `limit` on a line that never settles.
    ///
    /// Used after a timeout or short read, when the rest of a late frame may
    /// still be on its way.
    async fn discard_until_quiet(&mut self, quiet: Duration, limit: Duration) -> usize {
        let mut scratch = [0u8; MAX_RTU_FRAME];
        let mut discarded = 0;
        let deadline = Instant::now() + limit;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(quiet.min(remaining), self.stream.read(&mut scratch)).await {
                Ok(Ok(n)) if n > 0 => discarded += n,
                _ => break,
            }
        }
        discarded
    }

    async fn transact(&mut self, op: &BusOp) -> ModbusResult<BusReply> {
        if !self.connected {
            return Err(ModbusError::TransportClosed);
        }
        let request = ModbusCodec::encode_request(op)?;
        let frame = rtu_frame(self.slave_id, request.as_slice());

        let stale = self.discard_pending().await?;
        if stale > 0 {
            debug!(slave = self.slave_id, bytes = stale, "discarded stale RTU input");
            self.stats.bytes_received += stale as u64;
        }
        trace!(slave = self.slave_id, frame = %HexFrame(&frame), "RTU >>");

        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        let (buf, len) = self.read_response().await?;
        let response = &buf[..len];
        trace!(slave = self.slave_id, frame = %HexFrame(response), "RTU <<");
        self.stats.responses_received += 1;
        self.stats.bytes_received += len as u64;

        let pdu = rtu_unframe(response, self.slave_id)?;
        ModbusCodec::decode_response(op, pdu)
    }
}

impl<S> ModbusTransport for RtuTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn select_slave(&mut self, slave_id: u8) {
        self.slave_id = slave_id;
    }

    async fn exchange(&mut self, op: &BusOp) -> ModbusResult<BusReply> {
        let result = self.transact(op).await;
        if let Err(err) = &result {
            record_failure(&mut self.stats, err);
            match err {
                ModbusError::TransportClosed => self.connected = false,
                ModbusError::Timeout { .. } | ModbusError::ShortRead { .. } => {
                    let quiet = self.timeouts.inter_byte.max(self.silence);
                    let late = self.discard_until_quiet(quiet, self.timeouts.response).await;
                    if late > 0 {
                        debug!(slave = self.slave_id, bytes = late, "discarded late RTU reply");
                        self.stats.bytes_received += late as u64;
                    }
                }
                _ => {}
            }
        }
        result
    }

    fn inter_frame_silence(&self) -> Duration {
        self.silence
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if self.connected {
            self.connected = false;
            self.stream.shutdown().await?;
        }
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.stats
    }
}

/// Open a serial port as an RTU transport
#[cfg(feature = "rtu")]
pub fn open_serial(
    settings: &SerialSettings,
    timeouts: TransportTimeouts,
) -> ModbusResult<RtuTransport<tokio_serial::SerialStream>> {
    use tokio_serial::SerialPortBuilderExt;

    let parity = match settings.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    };
    let data_bits = match settings.data_bits {
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let stop_bits = match settings.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };

    let port = tokio_serial::new(&settings.path, settings.baud_rate)
        .parity(parity)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .open_native_async()
        .map_err(|e| ModbusError::io(format!("{}: {}", settings.path, e)))?;

    debug!(path = %settings.path, baud = settings.baud_rate, "serial port opened");
    Ok(RtuTransport::new(port, settings.baud_rate, timeouts))
}

// ============================================================================
// TCP
// ============================================================================

/// Modbus TCP over any async byte stream
pub struct TcpTransport<S> {
    stream: S,
    unit_id: u8,
    next_transaction: u16,
    timeouts: TransportTimeouts,
    connected: bool,
    stats: TransportStats,
}

impl TcpTransport<TcpStream> {
    /// Connect to `host:port`, bounded by the response timeout
    pub async fn connect(host: &str, port: u16, timeouts: TransportTimeouts) -> ModbusResult<Self> {
        let stream = timeout(timeouts.response, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                ModbusError::timeout(
                    format!("connecting to {host}:{port}"),
                    timeouts.response.as_millis() as u64,
                )
            })?
            .map_err(|e| ModbusError::io(format!("{host}:{port}: {e}")))?;
        stream.set_nodelay(true)?;
        debug!(host, port, "TCP connection established");
        Ok(Self::new(stream, timeouts))
    }
}

impl<S> TcpTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S, timeouts: TransportTimeouts) -> Self {
        Self {
            stream,
            unit_id: MIN_SLAVE_ID,
            next_transaction: 1,
            timeouts,
            connected: true,
            stats: TransportStats::default(),
        }
    }

    async fn transact(&mut self, op: &BusOp) -> ModbusResult<BusReply> {
        if !self.connected {
            return Err(ModbusError::TransportClosed);
        }
        let request = ModbusCodec::encode_request(op)?;
        let transaction_id = self.next_transaction;
        self.next_transaction = self.next_transaction.wrapping_add(1);

        let frame = mbap_frame(transaction_id, self.unit_id, request.as_slice());
        trace!(unit = self.unit_id, frame = %HexFrame(&frame), "TCP >>");
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        loop {
            let mut header = [0u8; MBAP_HEADER_LEN];
            read_until(&mut self.stream, &mut header, 0, MBAP_HEADER_LEN, &self.timeouts).await?;
            let mbap = MbapHeader::parse(&header)?;

            let mut pdu = [0u8; MAX_PDU_SIZE];
            let pdu_len = mbap.pdu_len();
            read_until(&mut self.stream, &mut pdu, 0, pdu_len, &self.timeouts).await?;
            trace!(
                unit = mbap.unit_id,
                header = %HexFrame(&header),
                pdu = %HexFrame(&pdu[..pdu_len]),
                "TCP <<"
            );
            self.stats.responses_received += 1;
            self.stats.bytes_received += (MBAP_HEADER_LEN + pdu_len) as u64;

            if mbap.transaction_id != transaction_id {
                debug!(
                    expected = transaction_id,
                    got = mbap.transaction_id,
                    "discarding stale TCP reply"
                );
                continue;
            }
            if mbap.unit_id != self.unit_id {
                return Err(ModbusError::framing(format!(
                    "reply from unit {}, expected {}",
                    mbap.unit_id, self.unit_id
                )));
            }
            return ModbusCodec::decode_response(op, &pdu[..pdu_len]);
        }
    }
}

impl<S> ModbusTransport for TcpTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn select_slave(&mut self, slave_id: u8) {
        self.unit_id = slave_id;
    }

    async fn exchange(&mut self, op: &BusOp) -> ModbusResult<BusReply> {
        let result = self.transact(op).await;
        if let Err(err) = &result {
            record_failure(&mut self.stats, err);
            if *err == ModbusError::TransportClosed {
                self.connected = false;
            }
        }
        result
    }

    fn inter_frame_silence(&self) -> Duration {
        Duration::ZERO
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if self.connected {
            self.connected = false;
            self.stream.shutdown().await?;
        }
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.stats
    }
}

// ============================================================================
// Heterogeneous buses
// ============================================================================

/// Any transport the supervisor can open
pub enum AnyTransport {
    Tcp(TcpTransport<TcpStream>),
    #[cfg(feature = "rtu")]
    Rtu(RtuTransport<tokio_serial::SerialStream>),
    #[cfg(any(test, feature = "mock"))]
    Mock(MockTransport),
}

impl ModbusTransport for AnyTransport {
    fn select_slave(&mut self, slave_id: u8) {
        match self {
            Self::Tcp(t) => t.select_slave(slave_id),
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.select_slave(slave_id),
            #[cfg(any(test, feature = "mock"))]
            Self::Mock(t) => t.select_slave(slave_id),
        }
    }

    async fn exchange(&mut self, op: &BusOp) -> ModbusResult<BusReply> {
        match self {
            Self::Tcp(t) => t.exchange(op).await,
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.exchange(op).await,
            #[cfg(any(test, feature = "mock"))]
            Self::Mock(t) => t.exchange(op).await,
        }
    }

    fn inter_frame_silence(&self) -> Duration {
        match self {
            Self::Tcp(t) => t.inter_frame_silence(),
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.inter_frame_silence(),
            #[cfg(any(test, feature = "mock"))]
            Self::Mock(t) => t.inter_frame_silence(),
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Self::Tcp(t) => t.is_connected(),
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.is_connected(),
            #[cfg(any(test, feature = "mock"))]
            Self::Mock(t) => t.is_connected(),
        }
    }

    async fn close(&mut self) -> ModbusResult<()> {
        match self {
            Self::Tcp(t) => t.close().await,
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.close().await,
            #[cfg(any(test, feature = "mock"))]
            Self::Mock(t) => t.close().await,
        }
    }

    fn stats(&self) -> TransportStats {
        match self {
            Self::Tcp(t) => t.stats(),
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.stats(),
            #[cfg(any(test, feature = "mock"))]
            Self::Mock(t) => t.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ReadFunction;
    use tokio::io::{duplex, DuplexStream};
    use tokio::time::sleep;

    fn timeouts() -> TransportTimeouts {
        TransportTimeouts {
            response: Duration::from_millis(200),
            inter_byte: Duration::from_millis(50),
        }
    }

    fn rtu_reply(slave: u8, pdu: &[u8]) -> Vec<u8> {
        rtu_frame(slave, pdu).to_vec()
    }

    async fn read_request(server: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        server.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[test]
    fn test_rtu_silence() {
        assert_eq!(rtu_silence(9600), Duration::from_micros(4010));
        assert_eq!(rtu_silence(19200), Duration::from_micros(2005));
        assert_eq!(rtu_silence(115200), Duration::from_micros(1750));
    }

    #[tokio::test]
    async fn test_rtu_read_exchange() {
        let (client, mut server) = duplex(512);
        let mut transport = RtuTransport::new(client, 9600, timeouts());
        transport.select_slave(1);

        let device = tokio::spawn(async move {
            let request = read_request(&mut server, 8).await;
            assert_eq!(request, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]);
            let mut pdu = vec![0x03, 20];
            for i in 0..10u16 {
                pdu.extend_from_slice(&i.to_be_bytes());
            }
            server.write_all(&rtu_reply(1, &pdu)).await.unwrap();
            server
        });

        let reply = transport
            .exchange(&BusOp::read(ReadFunction::Holding, 0, 10))
            .await
            .unwrap();
        assert_eq!(reply, BusReply::Registers((0..10).collect()));
        assert_eq!(transport.stats().requests_sent, 1);
        assert_eq!(transport.stats().responses_received, 1);
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_rtu_crc_error() {
        let (client, mut server) = duplex(512);
        let mut transport = RtuTransport::new(client, 9600, timeouts());
        transport.select_slave(2);

        let device = tokio::spawn(async move {
            read_request(&mut server, 8).await;
            let mut reply = rtu_reply(2, &[0x04, 0x02, 0x12, 0x34]);
            let last = reply.len() - 1;
            reply[last] ^= 0x55;
            server.write_all(&reply).await.unwrap();
            server
        });

        let err = transport
            .exchange(&BusOp::read(ReadFunction::Input, 5, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Crc { .. }));
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_rtu_exception_reply() {
        let (client, mut server) = duplex(512);
        let mut transport = RtuTransport::new(client, 9600, timeouts());
        transport.select_slave(3);

        let device = tokio::spawn(async move {
            read_request(&mut server, 8).await;
            server.write_all(&rtu_reply(3, &[0x86, 0x02])).await.unwrap();
            server
        });

        let err = transport
            .exchange(&BusOp::WriteSingle {
                address: 1000,
                value: 1,
            })
            .await
            .unwrap_err();
        assert_eq!(err.exception_code(), Some(2));
        device.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtu_timeout_and_short_read() {
        let (client, mut server) = duplex(512);
        let mut transport = RtuTransport::new(client, 9600, timeouts());
        transport.select_slave(1);
        let op = BusOp::read(ReadFunction::Holding, 0, 2);

        let device = tokio::spawn(async move {
            // silent on the first request
            read_request(&mut server, 8).await;
            // reply cut off after four bytes
            read_request(&mut server, 8).await;
            server.write_all(&[0x01, 0x03, 0x04, 0x00]).await.unwrap();
            server
        });

        let err = transport.exchange(&op).await.unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));

        let err = transport.exchange(&op).await.unwrap_err();
        assert_eq!(err, ModbusError::ShortRead { expected: 9, got: 4 });
        assert_eq!(transport.stats().timeouts, 1);
        assert_eq!(transport.stats().errors, 2);
        device.await.unwrap();
    }

    fn one_register(slave: u8, value: u16) -> Vec<u8> {
        let [hi, lo] = value.to_be_bytes();
        rtu_reply(slave, &[0x03, 0x02, hi, lo])
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtu_late_reply_is_not_taken_for_the_next_one() {
        let (client, mut server) = duplex(512);
        let mut transport = RtuTransport::new(client, 9600, timeouts());
        transport.select_slave(1);
        let op = BusOp::read(ReadFunction::Holding, 0, 1);

        let device = tokio::spawn(async move {
            read_request(&mut server, 8).await;
            // answers long after the master gave up
            sleep(Duration::from_millis(300)).await;
            server.write_all(&one_register(1, 10)).await.unwrap();
            read_request(&mut server, 8).await;
            server.write_all(&one_register(1, 20)).await.unwrap();
            server
        });

        let err = transport.exchange(&op).await.unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));
        sleep(Duration::from_millis(200)).await;

        let reply = transport.exchange(&op).await.unwrap();
        assert_eq!(reply, BusReply::Registers(vec![20]));
        assert!(transport.stats().bytes_received >= 14);
        device.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtu_reply_trailing_a_timeout_is_drained() {
        let (client, mut server) = duplex(512);
        let mut transport = RtuTransport::new(client, 9600, timeouts());
        transport.select_slave(1);
        let op = BusOp::read(ReadFunction::Holding, 0, 1);

        let device = tokio::spawn(async move {
            read_request(&mut server, 8).await;
            // lands just after the response timeout, split across two writes
            sleep(Duration::from_millis(210)).await;
            let late = one_register(1, 10);
            server.write_all(&late[..3]).await.unwrap();
            sleep(Duration::from_millis(20)).await;
            server.write_all(&late[3..]).await.unwrap();
            read_request(&mut server, 8).await;
            server.write_all(&one_register(1, 20)).await.unwrap();
            server
        });

        let err = transport.exchange(&op).await.unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));
        let reply = transport.exchange(&op).await.unwrap();
        assert_eq!(reply, BusReply::Registers(vec![20]));
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_rtu_write_single_against_scripted_line() {
        let request = rtu_reply(4, &[0x06, 0x00, 0x0A, 0x00, 0x2A]);
        let stream = tokio_test::io::Builder::new()
            .write(&request)
            .read(&request)
            .build();
        let mut transport = RtuTransport::new(stream, 19200, timeouts());
        transport.select_slave(4);

        let reply = tokio_test::assert_ok!(
            transport
                .exchange(&BusOp::WriteSingle {
                    address: 10,
                    value: 42,
                })
                .await
        );
        assert_eq!(reply, BusReply::Written);
        assert_eq!(transport.stats().bytes_sent, 8);
        assert_eq!(transport.stats().bytes_received, 8);
    }

    #[tokio::test]
    async fn test_rtu_exception_against_scripted_line() {
        let request = rtu_reply(4, &[0x03, 0x00, 0x00, 0x00, 0x01]);
        let stream = tokio_test::io::Builder::new()
            .write(&request)
            .read(&rtu_reply(4, &[0x83, 0x02]))
            .build();
        let mut transport = RtuTransport::new(stream, 19200, timeouts());
        transport.select_slave(4);

        let err = tokio_test::assert_err!(
            transport
                .exchange(&BusOp::read(ReadFunction::Holding, 0, 1))
                .await
        );
        assert_eq!(err.exception_code(), Some(2));
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_rtu_peer_gone_closes_transport() {
        let (client, server) = duplex(64);
        let mut transport = RtuTransport::new(client, 9600, timeouts());
        drop(server);

        let err = transport
            .exchange(&BusOp::read(ReadFunction::Holding, 0, 1))
            .await
            .unwrap_err();
        assert_eq!(err, ModbusError::TransportClosed);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_tcp_exchange_discards_stale_reply() {
        let (client, mut server) = duplex(512);
        let mut transport = TcpTransport::new(client, timeouts());
        transport.select_slave(9);

        let device = tokio::spawn(async move {
            let request = read_request(&mut server, 12).await;
            assert_eq!(&request[..2], &[0x00, 0x01]);
            assert_eq!(request[6], 9);
            // a late reply for an older transaction, then the real one
            server
                .write_all(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x09, 0x03, 0x02, 0xFF, 0xFF])
                .await
                .unwrap();
            server
                .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x09, 0x03, 0x02, 0x00, 0x2A])
                .await
                .unwrap();
            server
        });

        let reply = transport
            .exchange(&BusOp::read(ReadFunction::Holding, 0, 1))
            .await
            .unwrap();
        assert_eq!(reply, BusReply::Registers(vec![42]));
        assert_eq!(transport.inter_frame_silence(), Duration::ZERO);
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_write_multiple() {
        let (client, mut server) = duplex(512);
        let mut transport = TcpTransport::new(client, timeouts());
        transport.select_slave(1);

        let device = tokio::spawn(async move {
            let request = read_request(&mut server, 7 + 10).await;
            assert_eq!(&request[7..], &[0x10, 0x00, 0x64, 0x00, 0x02, 0x04, 0x00, 0x01, 0x86, 0xA0]);
            server
                .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x10, 0x00, 0x64, 0x00, 0x02])
                .await
                .unwrap();
            server
        });

        let reply = transport
            .exchange(&BusOp::WriteMultiple {
                address: 100,
                values: vec![0x0001, 0x86A0],
            })
            .await
            .unwrap();
        assert_eq!(reply, BusReply::Written);
        device.await.unwrap();
    }
}
