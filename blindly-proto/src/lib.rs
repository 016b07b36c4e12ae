//! Shared protocol definitions for the Blindly chat wire format.

pub mod codec;
pub mod frame;
pub mod message;
