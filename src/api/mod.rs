//! API Module
//!
//! REST API for submitting claims and registering devices.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
