//! `gateio`: wire IO for the client-facing game ports.
//!
//! This crate intentionally avoids tokio-util's codecs and implements just what we need:
//! - The fixed-magic framed packet codec shared by the view-port family
//!   (u32 LE length covering the whole frame, "IXFF" magic, u32 LE type,
//!   16-byte digest), without copying (`BytesMut::split_to(..).freeze()`).
//! - The search sub-protocol's rotating-key block cipher wrapper.

pub mod cipher;
pub mod frame;
pub mod search;
