//! Real media-stack backends.
//!
//! Only compiled in with the matching cargo feature; the default build runs
//! on [`crate::loopback`].

#[cfg(feature = "webrtc-rs")]
pub mod webrtc;
