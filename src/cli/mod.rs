//! CLI Module
//!
//! Exit codes for automation

pub mod exit_codes;

pub use exit_codes::{exit_code_description, exit_code_for, to_exit_code, ExitCodes};
