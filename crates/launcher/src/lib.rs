//! Command-line front end of fleetrun: logging setup, persisted defaults and
//! interrupt handling around [`fleetrun_core`].

pub mod config;
pub mod logging;
pub mod shutdown;
