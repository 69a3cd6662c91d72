//! Production runner with async I/O.
//!
//! This crate wraps the deterministic unit state machine with the real
//! outside world:
//!
//! - Cluster messages over a line-delimited TCP bus
//! - Timers via tokio sleeps
//! - Device commands on the blocking thread pool
//! - TOML configuration, structured logging, and prometheus metrics
//!
//! # Architecture
//!
//! Uses the event aggregator pattern: a single task owns the state machine
//! and receives events via per-priority mpsc channels. This avoids mutex
//! contention and keeps the machine as deterministic as it is in
//! simulation.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Unit Process                            │
//! │                                                                  │
//! │  UnitRunner (one task)                                           │
//! │  ┌──────────────────────────────────────────────────────────────┐│
//! │  │  loop { event = recv(); actions = machine.handle(event); }   ││
//! │  └──────────────────────────────────────────────────────────────┘│
//! │       ▲                  ▲                    │                  │
//! │       │ events           │ expiries           │ actions          │
//! │  ┌────┴─────┐      ┌─────┴──────┐      ┌──────▼───────────┐      │
//! │  │MessageBus│      │TimerManager│      │ DeviceAdapter    │      │
//! │  │ TCP bus  │      │tokio sleeps│      │ (spawn_blocking) │      │
//! │  └──────────┘      └────────────┘      └──────────────────┘      │
//! │                                                                  │
//! │  Telemetry: tracing + OTLP spans, prometheus /metrics server     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use gridmesh_production::{init_telemetry, LoopbackDevice, UnitConfig, UnitRunner};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = UnitConfig::load("unit.toml")?;
//! let telemetry = init_telemetry(&config.telemetry_config())?;
//!
//! let mut builder = UnitRunner::builder()
//!     .unit_id(config.unit_id())
//!     .policy(config.policy())
//!     .coordinator(config.unit.coordinator)
//!     .bus_config(config.bus_config()?)
//!     .device(Arc::new(LoopbackDevice::new()));
//! if let Some(ready) = telemetry.ready_flag() {
//!     builder = builder.ready_flag(ready);
//! }
//!
//! let mut runner = builder.build().await?;
//! let shutdown = runner.shutdown_handle();
//!
//! // The exit tells the supervisor whether to start a fresh process.
//! let exit = runner.run().await?;
//! if exit.restart {
//!     // exec a new process here
//! }
//!
//! drop(shutdown);
//! telemetry.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod bus;
mod codec;
mod config;
mod device;
pub mod metrics;
mod runner;
pub mod telemetry;
mod timers;

pub use bus::{BusConfig, BusError, BusPeer, MessageBus};
pub use codec::{decode_frame, CodecError, Frame, WIRE_VERSION};
pub use config::{ConfigError, UnitConfig};
pub use device::{DeviceAdapter, DeviceError, LoopbackDevice};
pub use runner::{RunnerError, RunnerExit, ShutdownHandle, UnitRunner, UnitRunnerBuilder};
pub use telemetry::{init_telemetry, ReadyFlag, TelemetryConfig, TelemetryError, TelemetryGuard};
pub use timers::TimerManager;
