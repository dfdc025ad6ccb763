//! Modbus transport client.
//!
//! Owns the single connection to the boiler. All reads, writes and lifetick
//! writes are serialized through one mutex-guarded `tokio-modbus` context so
//! the wire never sees interleaved requests; Modbus permits only one
//! outstanding request per connection. Lock waiters are served in FIFO
//! order, which also gives writes submitted mid-cycle their place between
//! the in-flight read and the next one.
//!
//! The client degrades rather than blocks: while disconnected every call
//! fails fast with [`TransportError::NotConnected`] and reconnection is
//! attempted on an exponential backoff schedule with jitter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::{Client, Reader, Writer};
use tokio_modbus::Slave;
use tokio_util::sync::CancellationToken;

use crate::config::{Endpoint, LifetickConfig, ModbusConfig};
use crate::protocol::{ReadClass, ReadFunction};

/// Transport-level failures.
///
/// `NotConnected` is the fail-fast signal while the backoff schedule is
/// pending; everything else concerns a single request and leaves the rest of
/// the poll cycle untouched.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("not connected to the device")]
    NotConnected,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("short response: expected {expected} register word(s), got {got}")]
    ShortResponse { expected: u16, got: usize },

    #[error(transparent)]
    Exception(#[from] tokio_modbus::ExceptionCode),

    #[error(transparent)]
    Modbus(#[from] tokio_modbus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether retrying the same request can help.
    fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_) | TransportError::ShortResponse { .. }
        )
    }

    /// Whether the device rejected the function code for this address range,
    /// meaning discovery should move on to the next candidate.
    fn rejects_function_code(&self) -> bool {
        matches!(
            self,
            TransportError::Exception(
                tokio_modbus::ExceptionCode::IllegalFunction
                    | tokio_modbus::ExceptionCode::IllegalDataAddress
            )
        )
    }

    /// Whether the connection itself is gone.
    fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_) | TransportError::Modbus(tokio_modbus::Error::Transport(_))
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Exponential reconnect backoff with jitter and a capped maximum interval.
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    not_before: Option<Instant>,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max,
            current: initial,
            not_before: None,
        }
    }

    /// Whether a reconnect attempt is due.
    fn ready(&self, now: Instant) -> bool {
        self.not_before.is_none_or(|deadline| now >= deadline)
    }

    /// Record a failed attempt and schedule the next one.
    fn on_failure(&mut self, now: Instant) {
        use rand::Rng;
        let jitter = 1.0 + rand::thread_rng().gen_range(0.0..0.25);
        self.not_before = Some(now + self.current.mul_f64(jitter));
        self.current = (self.current * 2).min(self.max);
    }

    fn reset(&mut self) {
        self.current = self.initial;
        self.not_before = None;
    }
}

struct Shared {
    ctx: Option<Context>,
    backoff: Backoff,
    /// Discovered function code per `(start, count)` block, valid until the
    /// next reconnect.
    pins: HashMap<(u16, u16), ReadFunction>,
    lifetick_counter: u16,
    lifetick_failures: u32,
}

/// Abstraction over the Modbus transport, so the poll coordinator can be
/// exercised against an in-memory fake.
#[async_trait]
pub trait Transport: Send + Sync {
    fn state(&self) -> ConnectionState;

    /// Connect if disconnected and the backoff schedule permits an attempt.
    async fn ensure_connected(&self) -> Result<(), TransportError>;

    async fn disconnect(&self);

    /// Read a register block, resolving the function code adaptively.
    async fn read_block(
        &self,
        read: ReadClass,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    /// Write raw words to a register: FC 06 for one word, FC 16 otherwise.
    async fn write_registers(&self, address: u16, words: &[u16])
        -> Result<(), TransportError>;
}

/// The real `tokio-modbus` backed transport.
pub struct ModbusClient {
    config: ModbusConfig,
    shared: Mutex<Shared>,
    state: std::sync::atomic::AtomicBool,
}

impl ModbusClient {
    pub fn new(config: ModbusConfig) -> Self {
        let backoff = Backoff::new(config.reconnect_initial, config.reconnect_max);
        ModbusClient {
            config,
            shared: Mutex::new(Shared {
                ctx: None,
                backoff,
                pins: HashMap::new(),
                lifetick_counter: 0,
                lifetick_failures: 0,
            }),
            state: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn lifetick_config(&self) -> Option<&LifetickConfig> {
        self.config.lifetick.as_ref()
    }

    fn set_state(&self, connected: bool) {
        self.state
            .store(connected, std::sync::atomic::Ordering::Relaxed);
    }

    async fn open_context(&self) -> Result<Context, TransportError> {
        let slave = Slave(self.config.unit_id);
        match &self.config.endpoint {
            Endpoint::Tcp { host, port } => {
                let addr = format!("{host}:{port}");
                let socket_addr = tokio::net::lookup_host(&addr)
                    .await?
                    .next()
                    .ok_or_else(|| {
                        std::io::Error::new(
                            std::io::ErrorKind::AddrNotAvailable,
                            format!("cannot resolve {addr}"),
                        )
                    })?;
                let connect = tokio_modbus::client::tcp::connect_slave(socket_addr, slave);
                match tokio::time::timeout(self.config.timeout, connect).await {
                    Ok(ctx) => Ok(ctx?),
                    Err(_) => Err(TransportError::Timeout(self.config.timeout)),
                }
            }
            Endpoint::Rtu { device, baud_rate } => {
                let builder = serial_port_builder(device, *baud_rate);
                let port = tokio_serial::SerialStream::open(&builder)
                    .map_err(|e| std::io::Error::other(e.to_string()))?;
                Ok(tokio_modbus::client::rtu::attach_slave(port, slave))
            }
        }
    }

    /// Mark the connection lost: drop the context, clear discovery pins and
    /// arm the backoff.
    fn drop_connection(&self, shared: &mut Shared) {
        if shared.ctx.take().is_some() {
            info!("connection lost, entering disconnected state");
        }
        shared.pins.clear();
        shared.backoff.on_failure(Instant::now());
        self.set_state(false);
    }

    async fn request<T>(
        &self,
        fut: impl std::future::Future<Output = tokio_modbus::Result<T>>,
    ) -> Result<T, TransportError> {
        match tokio::time::timeout(self.config.timeout, fut).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(exception))) => Err(exception.into()),
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Err(TransportError::Timeout(self.config.timeout)),
        }
    }

    async fn read_with_function(
        &self,
        ctx: &mut Context,
        function: ReadFunction,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let words = match function {
            ReadFunction::InputRegisters => {
                self.request(ctx.read_input_registers(start, count)).await?
            }
            ReadFunction::HoldingRegisters => {
                self.request(ctx.read_holding_registers(start, count))
                    .await?
            }
        };
        if words.len() != count as usize {
            return Err(TransportError::ShortResponse {
                expected: count,
                got: words.len(),
            });
        }
        Ok(words)
    }

    /// Retry wrapper: transient failures are retried a bounded number of
    /// times before the error is reported for this request only.
    async fn read_retrying(
        &self,
        ctx: &mut Context,
        function: ReadFunction,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let mut last = None;
        for attempt in 0..=self.config.retries {
            match self.read_with_function(ctx, function, start, count).await {
                Ok(words) => return Ok(words),
                Err(error) if error.is_transient() && attempt < self.config.retries => {
                    debug!(
                        "read {function} {start}+{count} attempt {} failed: {error}",
                        attempt + 1
                    );
                    last = Some(error);
                }
                Err(error) => return Err(error),
            }
        }
        Err(last.unwrap_or(TransportError::Timeout(self.config.timeout)))
    }

    /// Write the next lifetick counter value to the configured register.
    ///
    /// Returns the value written. Consecutive failures are counted and, past
    /// the configured threshold, force a disconnect so the regular reconnect
    /// path takes over.
    pub async fn tick_lifetick(&self) -> Result<u16, TransportError> {
        let Some(lifetick) = self.config.lifetick.clone() else {
            return Err(TransportError::NotConnected);
        };
        let mut shared = self.shared.lock().await;
        let shared = &mut *shared;
        let value = shared.lifetick_counter.wrapping_add(1);
        let Some(ctx) = shared.ctx.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        let result = self
            .request(ctx.write_single_register(lifetick.address, value))
            .await;
        match result {
            Ok(()) => {
                shared.lifetick_counter = value;
                shared.lifetick_failures = 0;
                Ok(value)
            }
            Err(error) => {
                shared.lifetick_failures += 1;
                warn!(
                    "lifetick write failed ({}/{}): {error}",
                    shared.lifetick_failures, lifetick.max_failures
                );
                if error.is_connection_loss() || shared.lifetick_failures >= lifetick.max_failures
                {
                    shared.lifetick_failures = 0;
                    self.drop_connection(shared);
                }
                Err(error)
            }
        }
    }
}

#[async_trait]
impl Transport for ModbusClient {
    fn state(&self) -> ConnectionState {
        if self.state.load(std::sync::atomic::Ordering::Relaxed) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    async fn ensure_connected(&self) -> Result<(), TransportError> {
        let mut shared = self.shared.lock().await;
        if shared.ctx.is_some() {
            return Ok(());
        }
        if !shared.backoff.ready(Instant::now()) {
            return Err(TransportError::NotConnected);
        }
        match self.open_context().await {
            Ok(ctx) => {
                info!("connected to {}", self.config.endpoint);
                shared.ctx = Some(ctx);
                shared.backoff.reset();
                // Function codes are rediscovered after every reconnect.
                shared.pins.clear();
                shared.lifetick_failures = 0;
                self.set_state(true);
                Ok(())
            }
            Err(error) => {
                warn!("connect to {} failed: {error}", self.config.endpoint);
                shared.backoff.on_failure(Instant::now());
                self.set_state(false);
                Err(error)
            }
        }
    }

    async fn disconnect(&self) {
        let mut shared = self.shared.lock().await;
        if let Some(mut ctx) = shared.ctx.take() {
            let _ = ctx.disconnect().await;
            info!("disconnected from {}", self.config.endpoint);
        }
        shared.pins.clear();
        self.set_state(false);
    }

    async fn read_block(
        &self,
        read: ReadClass,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let mut shared = self.shared.lock().await;
        let shared = &mut *shared;
        if shared.ctx.is_none() {
            return Err(TransportError::NotConnected);
        }

        // A pinned function code skips discovery for the rest of the session.
        let pinned = shared.pins.get(&(start, count)).copied();
        let single;
        let candidates: &[ReadFunction] = match pinned {
            Some(function) => {
                single = [function];
                &single
            }
            None => read.candidates(),
        };

        let mut last = None;
        for (index, function) in candidates.iter().enumerate() {
            let result = match shared.ctx.as_mut() {
                Some(ctx) => self.read_retrying(ctx, *function, start, count).await,
                None => Err(TransportError::NotConnected),
            };
            match result {
                Ok(words) => {
                    if pinned.is_none() {
                        if read == ReadClass::Either {
                            debug!("pinned {function} for block {start}+{count}");
                        }
                        shared.pins.insert((start, count), *function);
                    }
                    return Ok(words);
                }
                Err(error)
                    if error.rejects_function_code() && index + 1 < candidates.len() =>
                {
                    debug!("{function} rejected for block {start}+{count}, trying next");
                    last = Some(error);
                }
                Err(error) => {
                    if error.is_connection_loss() {
                        self.drop_connection(shared);
                    }
                    return Err(error);
                }
            }
        }
        Err(last.unwrap_or(TransportError::NotConnected))
    }

    async fn write_registers(
        &self,
        address: u16,
        words: &[u16],
    ) -> Result<(), TransportError> {
        let mut shared = self.shared.lock().await;
        let shared = &mut *shared;
        let result = match shared.ctx.as_mut() {
            None => Err(TransportError::NotConnected),
            Some(ctx) => match words {
                [word] => self.request(ctx.write_single_register(address, *word)).await,
                words => {
                    self.request(ctx.write_multiple_registers(address, words))
                        .await
                }
            },
        };
        if let Err(error) = &result {
            if error.is_connection_loss() {
                self.drop_connection(shared);
            }
        }
        result
    }
}

/// Run the lifetick watchdog until cancelled.
///
/// Writes the heartbeat counter at the configured interval while the client
/// is connected. The failure bookkeeping lives in
/// [`ModbusClient::tick_lifetick`].
pub async fn run_lifetick(client: Arc<ModbusClient>, cancel: CancellationToken) {
    let Some(lifetick) = client.lifetick_config().cloned() else {
        debug!("no lifetick register configured, watchdog not started");
        return;
    };
    info!(
        "lifetick watchdog started: register {}, every {:?}",
        lifetick.address, lifetick.interval
    );
    let mut interval = tokio::time::interval(lifetick.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if client.state() == ConnectionState::Disconnected {
                    continue;
                }
                match client.tick_lifetick().await {
                    Ok(value) => debug!("lifetick {value}"),
                    Err(error) => debug!("lifetick failed: {error}"),
                }
            }
        }
    }
    debug!("lifetick watchdog stopped");
}

/// Serial settings for the KWB service port: 8 data bits, no parity, one
/// stop bit.
pub fn serial_port_builder(device: &str, baud_rate: u32) -> tokio_serial::SerialPortBuilder {
    tokio_serial::new(device, baud_rate)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .data_bits(tokio_serial::DataBits::Eight)
        .flow_control(tokio_serial::FlowControl::None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_up_to_the_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
        assert!(backoff.ready(Instant::now()));

        backoff.on_failure(Instant::now());
        assert_eq!(backoff.current, Duration::from_secs(2));
        backoff.on_failure(Instant::now());
        assert_eq!(backoff.current, Duration::from_secs(4));
        backoff.on_failure(Instant::now());
        backoff.on_failure(Instant::now());
        assert_eq!(backoff.current, Duration::from_secs(8));
        backoff.on_failure(Instant::now());
        assert_eq!(backoff.current, Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_blocks_until_deadline_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(60));
        backoff.on_failure(Instant::now());
        assert!(!backoff.ready(Instant::now()));

        // Jitter stretches the deadline by at most 25%.
        tokio::time::advance(Duration::from_millis(2600)).await;
        assert!(backoff.ready(Instant::now()));

        backoff.reset();
        assert!(backoff.ready(Instant::now()));
        assert_eq!(backoff.current, Duration::from_secs(2));
    }

    #[test]
    fn transient_and_connection_loss_classification() {
        assert!(TransportError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(TransportError::ShortResponse {
            expected: 4,
            got: 2
        }
        .is_transient());
        assert!(!TransportError::NotConnected.is_transient());

        assert!(TransportError::Io(std::io::Error::other("gone")).is_connection_loss());
        assert!(!TransportError::Timeout(Duration::from_secs(1)).is_connection_loss());

        assert!(
            TransportError::Exception(tokio_modbus::ExceptionCode::IllegalFunction)
                .rejects_function_code()
        );
        assert!(
            !TransportError::Exception(tokio_modbus::ExceptionCode::ServerDeviceFailure)
                .rejects_function_code()
        );
    }

    #[tokio::test]
    async fn lifetick_fails_fast_while_disconnected() {
        let config = ModbusConfig {
            lifetick: Some(LifetickConfig {
                address: 8300,
                interval: Duration::from_secs(10),
                max_failures: 3,
            }),
            ..ModbusConfig::default()
        };
        let client = ModbusClient::new(config);
        assert!(matches!(
            client.tick_lifetick().await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn watchdog_exits_immediately_without_lifetick_config() {
        let client = Arc::new(ModbusClient::new(ModbusConfig::default()));
        run_lifetick(client, CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn disconnected_client_fails_fast() {
        let config = ModbusConfig {
            endpoint: Endpoint::Tcp {
                host: "203.0.113.1".to_string(),
                port: 502,
            },
            ..ModbusConfig::default()
        };
        let client = ModbusClient::new(config);
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let result = client.read_block(ReadClass::Either, 0, 4).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));

        let result = client.write_registers(10, &[1]).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }
}
