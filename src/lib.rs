// Copyright (c) 2025 ETH Zurich

//! A bidirectional configuration-editing engine.
//!
//! Line-oriented configuration files are exposed as a mutable tree and
//! written back with formatting, comments and unknown constructs intact.
//! The mechanism is the *lens*: a value that defines both a `get`
//! direction (text to tree) and a `put` direction (tree plus original
//! text back to text).

pub mod augeas;
pub mod error;
pub mod fa;
pub mod get;
pub mod jmt;
pub mod lens;
pub mod pathx;
pub mod put;
pub mod run;
pub mod rx;
pub mod transform;
pub mod tree;

pub use crate::augeas::{Augeas, Flags, SpanInfo};
pub use crate::error::{Error, ErrorCode, Result};
pub use crate::lens::{Lens, Recursion};
pub use crate::rx::Regex;
