//! HS6602 GPS/BeiDou positioning module driver.
//!
//! The HS6602-485 exposes its positioning solution through a Modbus RTU
//! holding-register map on an RS485 serial link (9600 baud 8N1 by default,
//! slave address 1). This module implements the register protocol and a
//! typed client on top of it.
//!
//! # Protocol Overview
//!
//! All values live in 16-bit holding registers read with function 0x03.
//! Multi-register quantities use big-endian register order:
//!
//! - Version is a BCD byte (high nibble major, low nibble minor).
//! - Latitude/longitude are an ASCII direction-code register (`N`/`S`,
//!   `E`/`W`) followed by a 32-bit IEEE float in two registers.
//! - Altitude, ground speed (knots) and ground heading (degrees) are
//!   2-register floats.
//! - Date/time is six consecutive registers (year through second). The
//!   module publishes both a UTC block and a local (UTC+8) block; the
//!   client reads the local block.
//!
//! # Fault Model
//!
//! Register reads are retried a small fixed number of times and then give
//! up with an absent value; the client never propagates transport errors to
//! `read_fix` callers. An antenna open/short report invalidates the fix
//! even when the positioning-status register claims a solution.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use hardware::hs6602::Hs6602;
//!
//! let mut gps = Hs6602::open("/dev/ttyUSB0", 9600, 1, Duration::from_millis(500))?;
//! let fix = gps.read_fix();
//! if fix.valid {
//!     println!("{:?} {:?}", fix.latitude, fix.longitude);
//! }
//! # Ok::<(), hardware::hs6602::TransportError>(())
//! ```

pub mod client;
pub mod fix;
pub mod registers;
pub mod rtu;

pub use client::{Hs6602, READ_RETRY_ATTEMPTS, READ_RETRY_PAUSE};
pub use fix::{AntennaStatus, GpsHealth, PositionFix};
pub use rtu::{RegisterBus, SerialRtuBus, TransportError, TransportResult};
