//! Output processing for raw engine terminal bytes.
//!
//! # Example
//!
//! ```
//! use dump_relay::output::OutputSanitizer;
//!
//! let raw = b"\x1b[1mcrash> \x1b[0m";
//! assert_eq!(OutputSanitizer::strip_ansi(raw), "crash> ");
//! ```

mod sanitizer;

pub use sanitizer::OutputSanitizer;
