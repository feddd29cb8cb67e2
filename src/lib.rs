//! A single-wire multi-drop device bus protocol stack.
//!
//! The wire format, routing rules, and timing constants implemented here
//! mirror a real sensor/actuator bus used to let many small microcontroller
//! peripherals share one serial line with a host. [`bus::Bus`] is the single
//! entry point: hand it a [`driver::Driver`] and drive it with
//! [`bus::Bus::poll`] on whatever cadence your host loop likes.

pub mod ack;
pub mod bus;
pub mod client;
pub mod config;
pub mod control;
pub mod device;
pub mod driver;
pub mod error;
pub mod event_emitter;
pub mod packet;
pub mod register_cache;
pub mod server;
pub mod util;
pub mod waiter;

pub use bus::{Bus, BusEvent, BusEventKind, BusServer};
pub use client::ClientBase;
pub use config::BusConfig;
pub use control::{ControlAction, ControlServer};
pub use device::{ClientId, Device};
pub use driver::Driver;
pub use packet::{DeviceId, Packet};
pub use server::ServerBase;
