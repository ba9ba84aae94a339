//! Sample programs riding the overlay
//!
//! Shared pieces of the three binaries: command line options, HTTP/1.1 over
//! an overlay stream, and the simulated Modbus/TCP peripheral.

pub mod cli;
pub mod http;
pub mod modbus;
