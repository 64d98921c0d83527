//! Code Dojo exercise judge
//!
//! Runs untrusted student programs in hardened child processes, verifies their
//! output against lesson test cases, and records progress on a pass.

pub mod config;
pub mod coordinator;
pub mod curriculum;
pub mod error;
pub mod languages;
pub mod normalizer;
pub mod progress;
pub mod report;
pub mod runner;
pub mod sandbox;
pub mod server;
pub mod verifier;

pub use coordinator::{Coordinator, RunRequest, SubmitRequest};
pub use report::{ExecutionReport, Outcome};
