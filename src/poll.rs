//! Poll coordination and snapshot publication.
//!
//! The coordinator runs the periodic poll cycle: it executes the cached
//! batch plan through the transport, decodes the results and publishes one
//! [`RegisterSnapshot`] per cycle. Snapshots are replaced atomically; a
//! consumer holding the previous `Arc` keeps a consistent view and never
//! observes a half-updated cycle.
//!
//! Failures degrade granularly. A failed block read marks only that block's
//! registers stale — they stay visible with their last-known value — and the
//! remaining blocks of the cycle proceed. Write requests are mediated here:
//! access level, writability and range validation all happen before a single
//! byte reaches the wire, and a successful write is read back immediately so
//! consumers are not left with pre-write state until the next cycle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchPlanner, ReadBlock};
use crate::catalog::Catalog;
use crate::client::{ConnectionState, Transport, TransportError};
use crate::protocol::{AccessLevel, CodecError, RegisterDefinition, Value};

/// Coordinator lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoordinatorState {
    Idle = 0,
    Connecting = 1,
    Polling = 2,
    /// Transport disconnected; polling suspended until it reports back.
    Degraded = 3,
    /// Terminal. No further cycles or writes are accepted.
    Stopped = 4,
}

impl CoordinatorState {
    fn from_u8(value: u8) -> CoordinatorState {
        match value {
            0 => CoordinatorState::Idle,
            1 => CoordinatorState::Connecting,
            2 => CoordinatorState::Polling,
            3 => CoordinatorState::Degraded,
            _ => CoordinatorState::Stopped,
        }
    }
}

/// One register's slot in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    pub value: Value,
    /// Undecoded integer content, kept for diagnostic exposure.
    pub raw: i64,
    /// Raw register words as read from the wire.
    pub words: Vec<u16>,
    /// Set when the last cycle could not refresh this register; `value` and
    /// `raw` then carry the last known good reading.
    pub stale: bool,
}

/// An immutable view of all register values after one poll cycle.
#[derive(Debug, Clone, Default)]
pub struct RegisterSnapshot {
    /// Monotonic cycle counter; 0 means no cycle has completed yet.
    pub cycle: u64,
    entries: BTreeMap<String, SnapshotEntry>,
}

impl RegisterSnapshot {
    pub fn get(&self, id: &str) -> Option<&SnapshotEntry> {
        self.entries.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SnapshotEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Write mediation failures, reported synchronously to the write caller.
#[derive(thiserror::Error, Debug)]
pub enum WriteError {
    #[error("register '{0}' is not part of the catalog")]
    UnknownRegister(String),

    #[error("register '{id}' requires {required} access level for writing")]
    AccessDenied { id: String, required: AccessLevel },

    #[error("register '{0}' is read-only")]
    NotWritable(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("coordinator is stopped")]
    Stopped,
}

/// Drives the poll loop for one device.
///
/// The catalog is fixed for the coordinator's lifetime, so the batch plan is
/// computed once up front; reconfiguration means building a new coordinator.
pub struct PollCoordinator<T: Transport> {
    catalog: Catalog,
    plan: Vec<ReadBlock>,
    transport: Arc<T>,
    poll_interval: Duration,
    snapshot: RwLock<Arc<RegisterSnapshot>>,
    state: AtomicU8,
    cycle: AtomicU64,
    cancel: CancellationToken,
}

impl<T: Transport> PollCoordinator<T> {
    pub fn new(
        catalog: Catalog,
        planner: &BatchPlanner,
        transport: Arc<T>,
        poll_interval: Duration,
    ) -> Self {
        let plan = planner.plan(&catalog);
        info!(
            "poll plan: {} block reads for {} registers",
            plan.len(),
            catalog.len()
        );
        PollCoordinator {
            catalog,
            plan,
            transport,
            poll_interval,
            snapshot: RwLock::new(Arc::new(RegisterSnapshot::default())),
            state: AtomicU8::new(CoordinatorState::Idle as u8),
            cycle: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        CoordinatorState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: CoordinatorState) {
        // Stopped is terminal.
        if self.state() != CoordinatorState::Stopped {
            self.state.store(state as u8, Ordering::Relaxed);
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn plan(&self) -> &[ReadBlock] {
        &self.plan
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> Arc<RegisterSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn publish(&self, snapshot: RegisterSnapshot) {
        let mut slot = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Arc::new(snapshot);
    }

    /// Token to signal shutdown from another task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the poll loop until the cancellation token fires. Terminal:
    /// transitions to `Stopped` and releases the connection.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if self.transport.state() == ConnectionState::Disconnected {
                self.set_state(CoordinatorState::Connecting);
                if let Err(error) = self.transport.ensure_connected().await {
                    debug!("not polling, transport unavailable: {error}");
                    self.set_state(CoordinatorState::Degraded);
                    continue;
                }
            }
            self.poll_once().await;
        }

        self.transport.disconnect().await;
        self.set_state(CoordinatorState::Stopped);
        info!("poll loop stopped after {} cycles", self.cycle.load(Ordering::Relaxed));
    }

    /// Execute one poll cycle and publish the resulting snapshot.
    ///
    /// Each block read failure is isolated: the block's registers keep their
    /// last-known value flagged stale and the cycle continues.
    pub async fn poll_once(&self) {
        self.set_state(CoordinatorState::Polling);
        let previous = self.snapshot();
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        let mut entries = BTreeMap::new();

        for block in &self.plan {
            if self.cancel.is_cancelled() {
                return;
            }
            match self
                .transport
                .read_block(block.read, block.start, block.count)
                .await
            {
                Ok(words) => {
                    for planned in &block.registers {
                        let Some(definition) = self.catalog.get(&planned.id) else {
                            continue;
                        };
                        let range =
                            planned.offset as usize..(planned.offset + planned.count) as usize;
                        let Some(slice) = words.get(range) else {
                            carry_stale(&previous, &planned.id, &mut entries);
                            continue;
                        };
                        match definition.decode(slice, self.catalog.tables()) {
                            Ok(decoded) => {
                                entries.insert(
                                    planned.id.clone(),
                                    SnapshotEntry {
                                        value: decoded.value,
                                        raw: decoded.raw,
                                        words: slice.to_vec(),
                                        stale: false,
                                    },
                                );
                            }
                            Err(error) => {
                                warn!("decode failed: {error}");
                                carry_stale(&previous, &planned.id, &mut entries);
                            }
                        }
                    }
                }
                Err(error) => {
                    warn!(
                        "block read {:?} {}+{} failed, marking {} register(s) stale: {error}",
                        block.read,
                        block.start,
                        block.count,
                        block.registers.len()
                    );
                    for planned in &block.registers {
                        carry_stale(&previous, &planned.id, &mut entries);
                    }
                }
            }
        }

        let fresh = entries.values().filter(|e| !e.stale).count();
        debug!(
            "cycle {cycle}: {fresh}/{} registers fresh",
            entries.len()
        );
        self.publish(RegisterSnapshot { cycle, entries });

        if self.transport.state() == ConnectionState::Disconnected {
            self.set_state(CoordinatorState::Degraded);
        } else {
            self.set_state(CoordinatorState::Idle);
        }
    }

    /// Mediate a write request.
    ///
    /// Order of checks: the register must exist, be writable at the
    /// configured access level and the encoded value must pass range
    /// validation — all before any wire I/O. A transport failure is surfaced
    /// unchanged and never retried; repeating an actuation behind the
    /// caller's back is worse than reporting the failure.
    pub async fn write(&self, id: &str, target: &Value) -> Result<(), WriteError> {
        if self.state() == CoordinatorState::Stopped {
            return Err(WriteError::Stopped);
        }
        let definition = self
            .catalog
            .get(id)
            .ok_or_else(|| WriteError::UnknownRegister(id.to_string()))?;
        match (definition.write_level, definition.writable) {
            (None, _) => return Err(WriteError::NotWritable(id.to_string())),
            (Some(required), false) => {
                return Err(WriteError::AccessDenied {
                    id: id.to_string(),
                    required,
                });
            }
            (Some(_), true) => {}
        }

        let words = definition.encode(target, self.catalog.tables())?;
        self.transport
            .write_registers(definition.address, &words)
            .await?;
        info!("wrote {target} to register '{id}' at {}", definition.address);

        // Proactive read-back so the snapshot reflects the write before the
        // next scheduled cycle.
        self.refresh_register(definition).await;
        Ok(())
    }

    async fn refresh_register(&self, definition: &RegisterDefinition) {
        let count = definition.data_type.register_count();
        match self
            .transport
            .read_block(definition.read, definition.address, count)
            .await
        {
            Ok(words) => match definition.decode(&words, self.catalog.tables()) {
                Ok(decoded) => {
                    let current = self.snapshot();
                    let mut snapshot = (*current).clone();
                    snapshot.entries.insert(
                        definition.id.clone(),
                        SnapshotEntry {
                            value: decoded.value,
                            raw: decoded.raw,
                            words,
                            stale: false,
                        },
                    );
                    self.publish(snapshot);
                }
                Err(error) => warn!("read-back decode of '{}' failed: {error}", definition.id),
            },
            Err(error) => warn!("read-back of '{}' failed: {error}", definition.id),
        }
    }
}

fn carry_stale(
    previous: &RegisterSnapshot,
    id: &str,
    entries: &mut BTreeMap<String, SnapshotEntry>,
) {
    if let Some(entry) = previous.get(id) {
        entries.insert(
            id.to_string(),
            SnapshotEntry {
                stale: true,
                ..entry.clone()
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchPlanner;
    use crate::catalog::{
        CatalogRequest, DefinitionDocuments, EquipmentCounts, RegisterDoc, RegisterEntry,
    };
    use crate::protocol::{DataType, ReadClass, ValueTable, ValueTables};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::collections::{BTreeMap as Map, HashSet};
    use std::sync::Mutex;

    struct FakeDevice {
        words: Map<u16, u16>,
        failing_blocks: HashSet<u16>,
        connected: bool,
        writes: Vec<(u16, Vec<u16>)>,
    }

    struct FakeTransport {
        device: Mutex<FakeDevice>,
    }

    impl FakeTransport {
        fn new(words: &[(u16, u16)]) -> Arc<Self> {
            Arc::new(FakeTransport {
                device: Mutex::new(FakeDevice {
                    words: words.iter().copied().collect(),
                    failing_blocks: HashSet::new(),
                    connected: true,
                    writes: Vec::new(),
                }),
            })
        }

        fn fail_block(&self, start: u16) {
            self.device.lock().unwrap().failing_blocks.insert(start);
        }

        fn heal(&self) {
            let mut device = self.device.lock().unwrap();
            device.failing_blocks.clear();
            device.connected = true;
        }

        fn set_connected(&self, connected: bool) {
            self.device.lock().unwrap().connected = connected;
        }

        fn set_word(&self, address: u16, word: u16) {
            self.device.lock().unwrap().words.insert(address, word);
        }

        fn writes(&self) -> Vec<(u16, Vec<u16>)> {
            self.device.lock().unwrap().writes.clone()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn state(&self) -> ConnectionState {
            if self.device.lock().unwrap().connected {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            }
        }

        async fn ensure_connected(&self) -> Result<(), TransportError> {
            if self.device.lock().unwrap().connected {
                Ok(())
            } else {
                Err(TransportError::NotConnected)
            }
        }

        async fn disconnect(&self) {
            self.device.lock().unwrap().connected = false;
        }

        async fn read_block(
            &self,
            _read: ReadClass,
            start: u16,
            count: u16,
        ) -> Result<Vec<u16>, TransportError> {
            let mut device = self.device.lock().unwrap();
            if !device.connected {
                return Err(TransportError::NotConnected);
            }
            if device.failing_blocks.contains(&start) {
                return Err(TransportError::Timeout(Duration::from_millis(200)));
            }
            Ok((start..start + count)
                .map(|a| device.words.get(&a).copied().unwrap_or(0))
                .collect())
        }

        async fn write_registers(
            &self,
            address: u16,
            words: &[u16],
        ) -> Result<(), TransportError> {
            let mut device = self.device.lock().unwrap();
            if !device.connected {
                return Err(TransportError::NotConnected);
            }
            for (i, word) in words.iter().enumerate() {
                device.words.insert(address + i as u16, *word);
            }
            device.writes.push((address, words.to_vec()));
            Ok(())
        }
    }

    fn fixture_catalog(access_level: crate::protocol::AccessLevel) -> Catalog {
        let registers = vec![
            RegisterEntry {
                starting_address: 100,
                name: "Boiler temperature".to_string(),
                data_type: DataType::S16,
                function_codes: ReadClass::Input,
                unit_value_table: "1/10°C".to_string(),
                user_level: "read".to_string(),
                expert_level: "read".to_string(),
                min: None,
                max: None,
            },
            RegisterEntry {
                starting_address: 101,
                name: "Boiler pump".to_string(),
                data_type: DataType::U16,
                function_codes: ReadClass::Input,
                unit_value_table: "onoff_t".to_string(),
                user_level: "read".to_string(),
                expert_level: "read".to_string(),
                min: None,
                max: None,
            },
            // Far enough away to land in its own block.
            RegisterEntry {
                starting_address: 500,
                name: "DHW setpoint".to_string(),
                data_type: DataType::U16,
                function_codes: ReadClass::Holding,
                unit_value_table: "1/10°C".to_string(),
                user_level: "read_write".to_string(),
                expert_level: "read_write".to_string(),
                min: Some(20.0),
                max: Some(70.0),
            },
            RegisterEntry {
                starting_address: 501,
                name: "Service parameter".to_string(),
                data_type: DataType::U16,
                function_codes: ReadClass::Holding,
                unit_value_table: String::new(),
                user_level: "read".to_string(),
                expert_level: "read_write".to_string(),
                min: None,
                max: None,
            },
        ];
        let mut tables = ValueTables::default();
        tables.0.insert(
            "onoff_t".to_string(),
            ValueTable(Map::from([(0, "Off".to_string()), (1, "On".to_string())])),
        );
        let mut devices = Map::new();
        devices.insert(
            "KWB Easyfire".to_string(),
            RegisterDoc {
                base_model: None,
                registers,
            },
        );
        DefinitionDocuments {
            devices,
            tables,
            ..DefinitionDocuments::default()
        }
        .resolve(&CatalogRequest {
            model: "KWB Easyfire".to_string(),
            firmware_version: "22.7.1".to_string(),
            language: "en".to_string(),
            equipment: EquipmentCounts::default(),
            access_level,
        })
        .unwrap()
    }

    fn make_coordinator(
        transport: Arc<FakeTransport>,
        access_level: crate::protocol::AccessLevel,
    ) -> PollCoordinator<FakeTransport> {
        PollCoordinator::new(
            fixture_catalog(access_level),
            &BatchPlanner::default(),
            transport,
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn a_cycle_publishes_decoded_values() {
        let transport = FakeTransport::new(&[(100, 650), (101, 1), (500, 450), (501, 7)]);
        let coordinator = make_coordinator(transport, crate::protocol::AccessLevel::User);

        coordinator.poll_once().await;
        let snapshot = coordinator.snapshot();

        assert_eq!(snapshot.cycle, 1);
        assert_eq!(snapshot.len(), 4);

        let temperature = snapshot.get("boiler_temperature").unwrap();
        assert_eq!(temperature.value, Value::Decimal(65.0));
        assert_eq!(temperature.raw, 650);
        assert_eq!(temperature.words, vec![650]);
        assert!(!temperature.stale);

        assert_eq!(snapshot.get("boiler_pump").unwrap().value, Value::Bool(true));
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn a_failing_block_is_isolated_and_keeps_last_known_values() {
        let transport = FakeTransport::new(&[(100, 650), (101, 0), (500, 450), (501, 7)]);
        let coordinator = make_coordinator(transport.clone(), crate::protocol::AccessLevel::User);

        coordinator.poll_once().await;

        // Second cycle: the input block at 100 fails, the holding block at
        // 500 keeps updating.
        transport.fail_block(100);
        transport.set_word(500, 500);
        coordinator.poll_once().await;

        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.cycle, 2);

        let temperature = snapshot.get("boiler_temperature").unwrap();
        assert!(temperature.stale);
        assert_eq!(temperature.value, Value::Decimal(65.0));

        let setpoint = snapshot.get("dhw_setpoint").unwrap();
        assert!(!setpoint.stale);
        assert_eq!(setpoint.value, Value::Decimal(50.0));
    }

    #[tokio::test]
    async fn a_register_with_no_prior_reading_is_absent_not_invented() {
        let transport = FakeTransport::new(&[(100, 650), (101, 0), (500, 450), (501, 7)]);
        transport.fail_block(100);
        let coordinator = make_coordinator(transport, crate::protocol::AccessLevel::User);

        coordinator.poll_once().await;
        let snapshot = coordinator.snapshot();
        assert!(snapshot.get("boiler_temperature").is_none());
        assert!(snapshot.get("dhw_setpoint").is_some());
    }

    #[tokio::test]
    async fn snapshots_replace_atomically() {
        let transport = FakeTransport::new(&[(100, 650), (101, 0), (500, 450), (501, 7)]);
        let coordinator = make_coordinator(transport.clone(), crate::protocol::AccessLevel::User);

        coordinator.poll_once().await;
        let held = coordinator.snapshot();

        transport.set_word(100, 700);
        coordinator.poll_once().await;

        // The held snapshot is unaffected by the newer cycle.
        assert_eq!(held.cycle, 1);
        assert_eq!(
            held.get("boiler_temperature").unwrap().value,
            Value::Decimal(65.0)
        );
        assert_eq!(
            coordinator.snapshot().get("boiler_temperature").unwrap().value,
            Value::Decimal(70.0)
        );
    }

    #[tokio::test]
    async fn write_is_mediated_and_read_back() {
        let transport = FakeTransport::new(&[(100, 650), (101, 0), (500, 450), (501, 7)]);
        let coordinator = make_coordinator(transport.clone(), crate::protocol::AccessLevel::User);
        coordinator.poll_once().await;

        coordinator
            .write("dhw_setpoint", &Value::Decimal(55.0))
            .await
            .unwrap();

        assert_eq!(transport.writes(), vec![(500, vec![550])]);
        // Read-back refreshed the snapshot before the next cycle.
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.get("dhw_setpoint").unwrap().value, Value::Decimal(55.0));
        assert_eq!(snapshot.get("dhw_setpoint").unwrap().raw, 550);
    }

    #[tokio::test]
    async fn write_below_required_access_level_issues_no_wire_request() {
        let transport = FakeTransport::new(&[(100, 650), (101, 0), (500, 450), (501, 7)]);
        let coordinator = make_coordinator(transport.clone(), crate::protocol::AccessLevel::User);

        let result = coordinator
            .write("service_parameter", &Value::Integer(1))
            .await;
        assert_matches!(
            result,
            Err(WriteError::AccessDenied {
                required: AccessLevel::Expert,
                ..
            })
        );
        assert!(transport.writes().is_empty());

        // The same register is writable for an expert-level catalog.
        let expert = make_coordinator(transport.clone(), crate::protocol::AccessLevel::Expert);
        expert
            .write("service_parameter", &Value::Integer(1))
            .await
            .unwrap();
        assert_eq!(transport.writes(), vec![(501, vec![1])]);
    }

    #[tokio::test]
    async fn write_rejections_cover_the_full_mediation_chain() {
        let transport = FakeTransport::new(&[(100, 650), (101, 0), (500, 450), (501, 7)]);
        let coordinator = make_coordinator(transport.clone(), crate::protocol::AccessLevel::User);

        assert_matches!(
            coordinator.write("no_such_register", &Value::Integer(1)).await,
            Err(WriteError::UnknownRegister(_))
        );
        assert_matches!(
            coordinator.write("boiler_temperature", &Value::Decimal(20.0)).await,
            Err(WriteError::NotWritable(_))
        );
        // Out of declared range: rejected by the codec, nothing written.
        assert_matches!(
            coordinator.write("dhw_setpoint", &Value::Decimal(95.0)).await,
            Err(WriteError::Codec(CodecError::OutOfRange { .. }))
        );
        assert!(transport.writes().is_empty());
    }

    #[tokio::test]
    async fn disconnected_transport_degrades_and_recovers() {
        let transport = FakeTransport::new(&[(100, 650), (101, 0), (500, 450), (501, 7)]);
        let coordinator = make_coordinator(transport.clone(), crate::protocol::AccessLevel::User);

        coordinator.poll_once().await;
        assert_eq!(coordinator.state(), CoordinatorState::Idle);

        transport.set_connected(false);
        coordinator.poll_once().await;
        assert_eq!(coordinator.state(), CoordinatorState::Degraded);

        // Values survive as stale.
        let snapshot = coordinator.snapshot();
        assert!(snapshot.get("boiler_temperature").unwrap().stale);

        transport.heal();
        coordinator.poll_once().await;
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
        assert!(!coordinator
            .snapshot()
            .get("boiler_temperature")
            .unwrap()
            .stale);
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let transport = FakeTransport::new(&[(100, 650), (101, 0), (500, 450), (501, 7)]);
        let coordinator = Arc::new(PollCoordinator::new(
            fixture_catalog(crate::protocol::AccessLevel::User),
            &BatchPlanner::default(),
            transport,
            Duration::from_millis(10),
        ));

        let cancel = coordinator.cancel_token();
        let runner = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        runner.await.unwrap();

        assert_eq!(coordinator.state(), CoordinatorState::Stopped);
        assert!(coordinator.snapshot().cycle >= 1);

        // Writes are refused after shutdown.
        assert_matches!(
            coordinator.write("dhw_setpoint", &Value::Decimal(55.0)).await,
            Err(WriteError::Stopped)
        );
    }
}
