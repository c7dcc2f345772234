//! Skiff core: primitives shared by the compiler and the virtual machine
//!
//! Key design principles:
//! - `JsString`: what scripts see as a string (ASCII fast path, UTF-16 slow path)
//! - `SrcFile`/`Position`: where a token, instruction or error came from
//! - `number`: the language's number <-> string conversions, kept out of the
//!   engine so both the compiler (constant folding) and the built-ins share
//!   one implementation

pub mod jsstring;
pub mod number;
pub mod position;

pub use jsstring::JsString;
pub use position::{Position, SrcFile};
