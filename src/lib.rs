//! A polling engine for KWB heating boilers (Easyfire, Combifire, CF family)
//! speaking Modbus TCP or RTU.
//!
//! The boiler's register layout is not fixed: it depends on the firmware
//! version, the device model (with models inheriting from a base model), the
//! installed equipment (heating circuits, buffer storages, …) and the
//! configured access level. This crate resolves that combination into an
//! immutable register catalog, polls the device in batched block reads and
//! republishes a consistent, typed snapshot at a fixed interval, while
//! mediating writes against access level and value range.
//!
//! # Architecture
//!
//! Data flows one direction for reads and is mediated for writes:
//!
//! ```text
//! catalog -> batch plan -> transport -> codec -> snapshot
//!                             ^
//!            write: access check -> encode -> transport -> read-back
//! ```
//!
//! - [`catalog`] resolves definition documents into a [`catalog::Catalog`].
//! - [`batch`] groups the catalog into block read requests under the Modbus
//!   125-word ceiling.
//! - [`client`] owns the single serialized connection: adaptive function-code
//!   discovery, bounded retries, reconnect backoff and the lifetick watchdog.
//! - [`protocol`] holds the register data model and the pure value codec.
//! - [`poll`] runs the cycle, publishes snapshots and mediates writes.
//! - [`config`] is the host-facing configuration structure.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use kwb_heating_lib::batch::BatchPlanner;
//! use kwb_heating_lib::catalog::DefinitionSource;
//! use kwb_heating_lib::client::{ModbusClient, Transport};
//! use kwb_heating_lib::config::GatewayConfig;
//! use kwb_heating_lib::poll::PollCoordinator;
//!
//! # async fn run(config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
//! let catalog = DefinitionSource::open(&config.definitions_dir)
//!     .build(&config.device.catalog_request())?;
//! let client = Arc::new(ModbusClient::new(config.modbus.clone()));
//! client.ensure_connected().await?;
//!
//! let coordinator = PollCoordinator::new(
//!     catalog,
//!     &BatchPlanner::default(),
//!     client,
//!     Duration::from_secs(30),
//! );
//! coordinator.poll_once().await;
//! for (id, entry) in coordinator.snapshot().iter() {
//!     println!("{id}: {} (raw {})", entry.value, entry.raw);
//! }
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod catalog;
pub mod client;
pub mod config;
pub mod poll;
pub mod protocol;
