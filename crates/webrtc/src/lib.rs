//! WebRTC transport for zipline.
//!
//! Implements the [`zipline_connection::PeerTransport`] and
//! [`zipline_connection::DataChannel`] seams on top of the `webrtc` crate:
//! one peer connection and one data channel per connection attempt, with
//! trickled ICE candidates surfaced as transport events.

pub mod transport;

pub use transport::{WebRtcConfig, WebRtcFactory, WebRtcTransport};
