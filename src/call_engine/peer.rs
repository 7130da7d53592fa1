//! Peer Session - Abstraktion über eine WebRTC Peer Connection
//!
//! Die Engine spricht nur mit [`PeerSession`]; [`WebRtcPeerFactory`] liefert
//! die echte Implementierung auf Basis von `webrtc`.

use super::media::{MediaKind, MediaTrack};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),
}

fn webrtc_err(e: webrtc::Error) -> NegotiationError {
    NegotiationError::WebRtc(e.to_string())
}

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// SDP wie er über das Signaling verschickt wird: `{ type, sdp }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    fn to_rtc(&self) -> Result<RTCSessionDescription, NegotiationError> {
        let sdp = self.sdp.clone();
        let result = match self.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(sdp),
            SdpType::Answer => RTCSessionDescription::answer(sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
            SdpType::Rollback => {
                return Err(NegotiationError::InvalidSdp(
                    "rollback is not supported".to_string(),
                ))
            }
        };
        result.map_err(|e| NegotiationError::InvalidSdp(e.to_string()))
    }

    fn from_rtc(desc: RTCSessionDescription) -> Result<Self, NegotiationError> {
        let sdp_type = match desc.sdp_type {
            RTCSdpType::Offer => SdpType::Offer,
            RTCSdpType::Answer => SdpType::Answer,
            RTCSdpType::Pranswer => SdpType::Pranswer,
            RTCSdpType::Rollback => SdpType::Rollback,
            RTCSdpType::Unspecified => {
                return Err(NegotiationError::InvalidSdp("unspecified SDP type".to_string()))
            }
        };
        Ok(Self {
            sdp_type,
            sdp: desc.sdp,
        })
    }
}

/// ICE Candidate im Browser-kompatiblen JSON-Format
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

// ============================================================================
// PEER EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for PeerConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
            _ => Self::New,
        }
    }
}

/// Events einer Peer Session an die Engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Lokal gesammelter Candidate, muss zum Remote-Peer
    LocalCandidate(IceCandidate),
    StateChanged(PeerConnectionState),
    RemoteTrack { kind: MediaKind, track_id: String },
}

// ============================================================================
// TRAITS
// ============================================================================

#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), NegotiationError>;

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Tauscht den gesendeten Video-Track ohne Renegotiation aus
    async fn replace_video_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), NegotiationError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Erstellt eine neue Session; Events gehen an `events`
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerSession>, NegotiationError>;
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![
        // Google STUN Server (kostenlos, für ~90% der Verbindungen)
        RTCIceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            ..Default::default()
        },
    ]
}

// ============================================================================
// WEBRTC IMPLEMENTATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct WebRtcPeerFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcPeerFactory {
    pub fn new(ice_servers: Vec<RTCIceServer>) -> Self {
        Self { ice_servers }
    }

    /// Ergänzt einen TURN-Server für Netze, in denen STUN nicht reicht
    pub fn with_turn_server(
        mut self,
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls: vec![url.into()],
            username: username.into(),
            credential: credential.into(),
            ..Default::default()
        });
        self
    }

    pub fn ice_servers(&self) -> &[RTCIceServer] {
        &self.ice_servers
    }
}

impl Default for WebRtcPeerFactory {
    fn default() -> Self {
        Self::new(default_ice_servers())
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerSession>, NegotiationError> {
        // Media Engine mit Standard-Codecs (Opus, VP8, ...)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);
        register_handlers(&pc, events);

        Ok(Arc::new(WebRtcPeer { pc }))
    }
}

/// Leitet die Callbacks der Peer Connection als [`PeerEvent`] weiter
fn register_handlers(pc: &RTCPeerConnection, events: mpsc::UnboundedSender<PeerEvent>) {
    // Connection State Handler
    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);
        let _ = tx.send(PeerEvent::StateChanged(s.into()));
        Box::pin(async {})
    }));

    // ICE Candidate Handler
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => {
                    let _ = tx.send(PeerEvent::LocalCandidate(init.into()));
                }
                Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    // Track Handler (eingehende Medien)
    let tx = events;
    pc.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        };
        tracing::info!("Received remote {} track: {:?}", kind, track.codec());
        let _ = tx.send(PeerEvent::RemoteTrack {
            kind,
            track_id: track.id(),
        });
        Box::pin(async {})
    }));
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerSession for WebRtcPeer {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), NegotiationError> {
        let Some(rtc_track) = track.rtc_track() else {
            tracing::warn!("Track {} has no RTP backing, not sent", track.id());
            return Ok(());
        };
        self.pc.add_track(rtc_track).await.map_err(webrtc_err)?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        SessionDescription::from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        SessionDescription::from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.pc
            .set_local_description(desc.to_rtc()?)
            .await
            .map_err(webrtc_err)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(desc.to_rtc()?)
            .await
            .map_err(webrtc_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| NegotiationError::InvalidCandidate(e.to_string()))
    }

    async fn replace_video_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), NegotiationError> {
        let Some(rtc_track) = track.rtc_track() else {
            return Err(NegotiationError::WebRtc(format!(
                "track {} has no RTP backing",
                track.id()
            )));
        };

        for sender in self.pc.get_senders().await {
            let is_video = match sender.track().await {
                Some(current) => current.kind() == RTPCodecType::Video,
                None => false,
            };
            if is_video {
                return sender
                    .replace_track(Some(rtc_track))
                    .await
                    .map_err(webrtc_err);
            }
        }

        Err(NegotiationError::WebRtc("no video sender to replace".to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::debug!("Peer connection close failed: {}", e);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::media::RtcTrack;
    use serde_json::json;

    #[test]
    fn test_session_description_wire_format() {
        let desc = SessionDescription::offer("v=0\r\n");
        assert_eq!(
            serde_json::to_value(&desc).unwrap(),
            json!({ "type": "offer", "sdp": "v=0\r\n" })
        );

        let parsed: SessionDescription =
            serde_json::from_value(json!({ "type": "answer", "sdp": "v=0" })).unwrap();
        assert_eq!(parsed, SessionDescription::answer("v=0"));
    }

    #[test]
    fn test_candidate_converts_to_rtc_init() {
        let candidate: IceCandidate = serde_json::from_value(json!({
            "candidate": "candidate:1 1 UDP 2122260223 10.0.0.5 50000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }))
        .unwrap();

        let init: RTCIceCandidateInit = candidate.clone().into();
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(init.sdp_mline_index, Some(0));
        assert_eq!(IceCandidate::from(init), candidate);
    }

    #[test]
    fn test_turn_server_is_appended() {
        let factory = WebRtcPeerFactory::default().with_turn_server("turn:turn.plant.example:3478", "user", "pass");
        assert_eq!(factory.ice_servers().len(), 2);
        assert_eq!(factory.ice_servers()[1].username, "user");
    }

    #[tokio::test]
    async fn test_local_offer_answer_exchange() {
        let factory = WebRtcPeerFactory::new(Vec::new());
        let (caller_tx, _caller_rx) = mpsc::unbounded_channel();
        let (callee_tx, _callee_rx) = mpsc::unbounded_channel();

        let caller = factory.create(caller_tx).await.unwrap();
        let callee = factory.create(callee_tx).await.unwrap();

        caller
            .add_track(Arc::new(RtcTrack::new(MediaKind::Audio, None)))
            .await
            .unwrap();
        let offer = caller.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        caller.set_local_description(offer.clone()).await.unwrap();

        callee.set_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        callee.set_local_description(answer.clone()).await.unwrap();
        caller.set_remote_description(answer).await.unwrap();

        caller.close().await;
        callee.close().await;
    }
}
