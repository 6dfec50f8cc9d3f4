//! Console output and logging for kestrel.
//!
//! This module provides:
//! - `print!`/`println!` writing to the serial console
//! - Leveled log macros gated by the `log-*` cargo features

pub mod macros;
