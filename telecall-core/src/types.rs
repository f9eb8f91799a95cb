//! Signaling data transfer objects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer from the caller
    Offer,
    /// Answer from the callee
    Answer,
}

/// SDP session description as stored in the call document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP blob
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// True when the SDP blob carries content
    #[must_use]
    pub fn is_usable(&self) -> bool {
        !self.sdp.trim().is_empty()
    }
}

/// Call document: at most one offer and one answer per call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallDocument {
    /// Offer written by the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    /// Answer written by the callee
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
}

impl CallDocument {
    /// Offer, if present and non-empty
    #[must_use]
    pub fn usable_offer(&self) -> Option<&SessionDescription> {
        self.offer
            .as_ref()
            .filter(|d| d.sdp_type == SdpType::Offer && d.is_usable())
    }

    /// Answer, if present and non-empty
    #[must_use]
    pub fn usable_answer(&self) -> Option<&SessionDescription> {
        self.answer
            .as_ref()
            .filter(|d| d.sdp_type == SdpType::Answer && d.is_usable())
    }
}

/// ICE candidate in the standard candidate-init serialization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,
    /// SDP media ID
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only the attribute line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Which side of the negotiation this device plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    /// Creates the offer
    Caller,
    /// Creates the answer
    Callee,
}

impl CallRole {
    /// Candidate sequence this role appends to
    #[must_use]
    pub fn own_candidates(self) -> CandidateRole {
        match self {
            Self::Caller => CandidateRole::Offerer,
            Self::Callee => CandidateRole::Answerer,
        }
    }

    /// Candidate sequence this role subscribes to
    #[must_use]
    pub fn remote_candidates(self) -> CandidateRole {
        match self {
            Self::Caller => CandidateRole::Answerer,
            Self::Callee => CandidateRole::Offerer,
        }
    }
}

impl fmt::Display for CallRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Caller => write!(f, "caller"),
            Self::Callee => write!(f, "callee"),
        }
    }
}

/// Role-scoped candidate sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateRole {
    /// Candidates gathered by the caller
    Offerer,
    /// Candidates gathered by the callee
    Answerer,
}

impl CandidateRole {
    /// Name of the sequence under the call path
    #[must_use]
    pub fn collection(self) -> &'static str {
        match self {
            Self::Offerer => "offerCandidates",
            Self::Answerer => "answerCandidates",
        }
    }
}

/// ICE server descriptor handed to the peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// STUN/TURN URLs
    pub urls: Vec<String>,
    /// Ephemeral username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Ephemeral credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Unauthenticated STUN descriptor
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}
