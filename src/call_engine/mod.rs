//! Call Engine Module - WebRTC und lokale Medien
//!
//! Dieses Modul verwaltet:
//! - WebRTC Peer Sessions (Offer/Answer, ICE)
//! - Lokale Medien-Tracks und Geräte
//! - Mikrofon-Capture (Feature `audio`)

#[cfg(feature = "audio")]
mod audio;
mod engine;
mod ice;
mod media;
mod peer;

#[cfg(feature = "audio")]
pub use audio::{CapturedAudioTrack, SystemMediaDevices, FRAME_SIZE, SAMPLE_RATE};
pub use engine::{CallDirection, CallEngine, CallError, CallEvent, CallSession, CallState, RemoteParty};
pub use ice::{Admission, IceCandidateQueue};
pub use media::{
    LocalMedia, MediaDeviceInfo, MediaDevices, MediaError, MediaKind, MediaTrack, RtcTrack,
    RtpMediaDevices,
};
pub use peer::{
    default_ice_servers, IceCandidate, NegotiationError, PeerConnectionState, PeerEvent,
    PeerFactory, PeerSession, SdpType, SessionDescription, WebRtcPeer, WebRtcPeerFactory,
};
