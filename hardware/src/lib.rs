//! Hardware drivers for the road capture terminal.
//!
//! This crate provides drivers for the field equipment mounted on the
//! capture vehicle:
//!
//! - [`hs6602`] - HS6602 GPS/BeiDou positioning module (Modbus RTU over an
//!   RS485 serial link)
//! - [`camera`] - capture-device management: device resolution, a shared
//!   claim registry so two managers never open the same device, scan and
//!   failover, and JPEG/base64 frame encoding
//!
//! The V4L2 capture backend is only compiled on Linux; the rest of the
//! camera layer (registry, scan logic, manager) is platform independent and
//! works against any [`camera::CaptureBackend`] implementation.

pub mod camera;
pub mod hs6602;
