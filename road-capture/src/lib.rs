//! Unattended capture-to-upload agent for the road photo terminal.
//!
//! Once per configured interval the agent grabs a frame from a vehicle
//! camera, reads a positioning fix from the HS6602 module, pairs them into
//! an upload payload and hands it to a resilient delivery pipeline. Camera
//! faults, positioning gaps and backend outages degrade service but never
//! stall the capture cadence.
//!
//! - [`config`] - TOML + environment configuration
//! - [`upload`] - bounded queue, worker pool, retry/backoff delivery
//! - [`controller`] - the fixed-cadence capture controller

pub mod config;
pub mod controller;
pub mod upload;
