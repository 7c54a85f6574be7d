#![forbid(unsafe_code)]

//! Diagnostic harness for agents speaking the Agent Client Protocol (ACP)
//! over stdio JSON-RPC.

pub mod acp;
pub mod config;
pub mod errors;
pub mod harness;
pub mod mode;
pub mod report;

pub use config::HarnessConfig;
pub use errors::{AppError, Result};
pub use harness::Harness;
pub use report::{RunReport, Verdict};
