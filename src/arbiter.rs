//! Bus arbiter
//!
//! One [`BusArbiter`] owns one physical transport. Every transaction on that
//! bus goes through [`BusArbiter::transact`], which:
//!
//! 1. waits for the bus in FIFO order (`tokio::sync::Mutex` is fair),
//! 2. selects the slave if it differs from the previous transaction,
//! 3. keeps the inter-frame silence since the last frame,
//! 4. retries timeouts, CRC errors, framing errors and short reads up to
//!    [`MAX_RETRIES`] times with a linear backoff,
//! 5. surfaces exception responses immediately.
//!
//! A `TransportClosed` error moves the bus into the closed state; every
//! queued and future transaction then fails fast without touching the link.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::codec::{BusOp, BusReply};
use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};
use crate::transport::{ModbusTransport, TransportStats, TransportTimeouts};

/// Retry behaviour of one bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            backoff_base: Duration::from_millis(RETRY_BACKOFF_BASE_MS),
            backoff_step: Duration::from_millis(RETRY_BACKOFF_STEP_MS),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (0 for the first retry)
    #[inline]
    pub fn backoff(&self, retry: u32) -> Duration {
        self.backoff_base + self.backoff_step * retry
    }

    /// Longest a single transaction can keep the bus
    pub fn worst_case(&self, timeouts: &TransportTimeouts) -> Duration {
        let attempts = self.max_retries + 1;
        let backoff: Duration = (0..self.max_retries).map(|r| self.backoff(r)).sum();
        (timeouts.response + timeouts.inter_byte) * attempts + backoff
    }
}

/// Per-transport state guarded by the arbiter's mutex
struct BusSession<T> {
    transport: T,
    selected_slave: Option<u8>,
    last_transaction: Option<Instant>,
    consecutive_errors: u32,
}

impl<T: ModbusTransport> BusSession<T> {
    async fn keep_silence(&self) {
        let silence = self.transport.inter_frame_silence();
        if let Some(last) = self.last_transaction {
            if !silence.is_zero() {
                sleep_until(last + silence).await;
            }
        }
    }
}

/// Counters of one bus
#[derive(Debug, Default)]
struct BusCounters {
    transactions: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    exceptions: AtomicU64,
}

/// Point-in-time copy of a bus's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub transactions: u64,
    pub failures: u64,
    pub retries: u64,
    pub exceptions: u64,
    pub consecutive_errors: u32,
    pub link: TransportStats,
}

/// Serializes all transactions on one physical transport.
pub struct BusArbiter<T> {
    name: String,
    session: Mutex<BusSession<T>>,
    closed: AtomicBool,
    retry: RetryPolicy,
    timeouts: TransportTimeouts,
    counters: BusCounters,
}

impl<T: ModbusTransport> BusArbiter<T> {
    pub fn new(name: impl Into<String>, transport: T, timeouts: TransportTimeouts) -> Self {
        Self::with_retry(name, transport, timeouts, RetryPolicy::default())
    }

    pub fn with_retry(
        name: impl Into<String>,
        transport: T,
        timeouts: TransportTimeouts,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            session: Mutex::new(BusSession {
                transport,
                selected_slave: None,
                last_transaction: None,
                consecutive_errors: 0,
            }),
            closed: AtomicBool::new(false),
            retry,
            timeouts,
            counters: BusCounters::default(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn timeouts(&self) -> TransportTimeouts {
        self.timeouts
    }

    #[inline]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run `op` against `slave_id` with the bus retry policy.
    pub async fn transact(&self, slave_id: u8, op: &BusOp) -> ModbusResult<BusReply> {
        self.transact_with_retries(slave_id, op, self.retry.max_retries)
            .await
    }

    /// Run `op` against `slave_id`, retrying transient errors at most
    /// `max_retries` times (0 sends exactly one frame).
    pub async fn transact_with_retries(
        &self,
        slave_id: u8,
        op: &BusOp,
        max_retries: u32,
    ) -> ModbusResult<BusReply> {
        if self.is_closed() {
            return Err(ModbusError::TransportClosed);
        }
        op.validate()?;

        let mut session = self.session.lock().await;
        if self.is_closed() {
            return Err(ModbusError::TransportClosed);
        }

        if session.selected_slave != Some(slave_id) {
            debug!(bus = %self.name, slave_id, "selecting slave");
            session.transport.select_slave(slave_id);
            session.selected_slave = Some(slave_id);
        }

        self.counters.transactions.fetch_add(1, Ordering::Relaxed);
        let mut retry = 0;
        loop {
            session.keep_silence().await;
            let result = session.transport.exchange(op).await;
            session.last_transaction = Some(Instant::now());

            match result {
                Ok(reply) => {
                    session.consecutive_errors = 0;
                    return Ok(reply);
                }
                Err(ModbusError::TransportClosed) => {
                    session.consecutive_errors += 1;
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    if !self.closed.swap(true, Ordering::AcqRel) {
                        error!(bus = %self.name, slave_id, "transport closed, bus is now unusable");
                    }
                    return Err(ModbusError::TransportClosed);
                }
                Err(err) if err.is_retryable() && retry < max_retries => {
                    let wait = self.retry.backoff(retry);
                    retry += 1;
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        bus = %self.name,
                        slave_id,
                        attempt = retry,
                        error = %err,
                        "transient bus error, retrying in {:?}",
                        wait
                    );
                    sleep(wait).await;
                }
                Err(err) => {
                    session.consecutive_errors += 1;
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    if err.is_exception() {
                        self.counters.exceptions.fetch_add(1, Ordering::Relaxed);
                    }
                    debug!(bus = %self.name, slave_id, error = %err, "transaction failed");
                    return Err(err);
                }
            }
        }
    }

    /// Close the bus: wait for the transaction in flight, then release the
    /// transport. Waiting and later callers get `TransportClosed`.
    pub async fn close(&self) -> ModbusResult<()> {
        self.closed.store(true, Ordering::Release);
        let mut session = self.session.lock().await;
        let result = session.transport.close().await;
        info!(bus = %self.name, "bus closed");
        result
    }

    /// Counter snapshot; waits for the bus if a transaction is in flight
    pub async fn stats(&self) -> BusStats {
        let session = self.session.lock().await;
        self.stats_with(&session)
    }

    /// Counter snapshot without waiting; link counters are omitted while busy
    pub fn try_stats(&self) -> BusStats {
        match self.session.try_lock() {
            Ok(session) => self.stats_with(&session),
            Err(_) => self.counter_stats(),
        }
    }

    fn stats_with(&self, session: &BusSession<T>) -> BusStats {
        BusStats {
            consecutive_errors: session.consecutive_errors,
            link: session.transport.stats(),
            ..self.counter_stats()
        }
    }

    fn counter_stats(&self) -> BusStats {
        BusStats {
            transactions: self.counters.transactions.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            exceptions: self.counters.exceptions.load(Ordering::Relaxed),
            ..BusStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ReadFunction;
    use crate::error::ExceptionKind;
    use crate::mock::{MockHandle, MockTransport};
    use std::sync::Arc;

    fn arbiter() -> (Arc<BusArbiter<MockTransport>>, MockHandle) {
        let mock = MockTransport::new();
        let handle = mock.handle();
        (
            Arc::new(BusArbiter::new("test", mock, TransportTimeouts::default())),
            handle,
        )
    }

    fn read() -> BusOp {
        BusOp::read(ReadFunction::Holding, 0, 2)
    }

    fn crc_error() -> ModbusError {
        ModbusError::Crc {
            computed: 0x1234,
            received: 0x4321,
        }
    }

    #[test]
    fn test_backoff_is_linear() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(20));
        assert_eq!(policy.backoff(1), Duration::from_millis(50));
        assert_eq!(policy.backoff(2), Duration::from_millis(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_exception_is_not_retried() {
        let (bus, mock) = arbiter();
        mock.push_reply(Err(crc_error()));
        mock.push_reply(Err(crc_error()));
        mock.push_reply(Err(ModbusError::exception(0x83, 0x02)));
        mock.push_reply(Ok(BusReply::Registers(vec![1, 2])));

        let err = bus.transact(1, &read()).await.unwrap_err();
        assert_eq!(
            err,
            ModbusError::Exception {
                function: 0x03,
                kind: ExceptionKind::IllegalDataAddress
            }
        );
        assert_eq!(mock.request_count(), 3);

        let stats = bus.stats().await;
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.exceptions, 1);
        assert_eq!(stats.consecutive_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_after_four_attempts() {
        let (bus, mock) = arbiter();
        mock.set_offline(1, ModbusError::timeout("mock", 1000));

        let start = Instant::now();
        let err = bus.transact(1, &read()).await.unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));
        assert_eq!(mock.request_count(), (MAX_RETRIES + 1) as usize);
        // 20 + 50 + 80 ms of backoff
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_sends_one_frame() {
        let (bus, mock) = arbiter();
        mock.set_offline(4, ModbusError::timeout("mock", 1000));

        assert!(bus.transact_with_retries(4, &read(), 0).await.is_err());
        assert_eq!(mock.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transactions_are_serialized_in_arrival_order() {
        let (bus, mock) = arbiter();
        mock.set_delay(Duration::from_millis(50));

        let start = Instant::now();
        let first = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.transact(1, &read()).await })
        };
        tokio::task::yield_now().await;
        let second = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.transact(2, &read()).await })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));

        let log = mock.requests();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].slave_id, 1);
        assert_eq!(log[1].slave_id, 2);
        assert!(log[0].finished.unwrap() <= log[1].started);
        assert!(!mock.overlapped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inter_frame_silence_enforced() {
        let mock = MockTransport::new().with_silence(Duration::from_millis(4));
        let handle = mock.handle();
        let bus = BusArbiter::new("rtu", mock, TransportTimeouts::default());

        bus.transact(1, &read()).await.unwrap();
        bus.transact(1, &read()).await.unwrap();

        let log = handle.requests();
        let gap = log[1].started - log[0].finished.unwrap();
        assert!(gap >= Duration::from_millis(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_closed_fails_fast() {
        let (bus, mock) = arbiter();
        mock.break_link();

        assert_eq!(
            bus.transact(1, &read()).await,
            Err(ModbusError::TransportClosed)
        );
        assert!(bus.is_closed());
        assert_eq!(mock.request_count(), 1);

        // no further frames once closed
        assert_eq!(
            bus.transact(2, &read()).await,
            Err(ModbusError::TransportClosed)
        );
        assert_eq!(mock.request_count(), 1);
    }

    #[tokio::test]
    async fn test_close_rejects_later_transactions() {
        let (bus, mock) = arbiter();
        bus.transact(1, &read()).await.unwrap();
        bus.close().await.unwrap();

        assert_eq!(
            bus.transact(1, &read()).await,
            Err(ModbusError::TransportClosed)
        );
        assert_eq!(mock.request_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_op_never_reaches_the_wire() {
        let (bus, mock) = arbiter();
        let op = BusOp::read(ReadFunction::Holding, 0, 0);
        assert!(matches!(
            bus.transact(1, &op).await,
            Err(ModbusError::InvalidData { .. })
        ));
        assert_eq!(mock.request_count(), 0);
    }
}
