//! Participant and call identity
//!
//! Both sides of a call derive the call identifier locally from the pair of
//! participant identifiers, so no lookup is needed before subscribing to the
//! signaling channel.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Separator placed between the two sorted participant identifiers
pub const CALL_ID_SEPARATOR: char = '_';

/// Identifier of a call participant (patient or doctor account id)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    /// Create a new participant identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier shared by both participants of a call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    /// Wrap an already-computed call identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Derive the call identifier for a pair of participants.
    ///
    /// The pair is sorted before joining, so `for_participants(a, b)` and
    /// `for_participants(b, a)` always agree.
    #[must_use]
    pub fn for_participants(a: &ParticipantId, b: &ParticipantId) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{first}{CALL_ID_SEPARATOR}{second}"))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two participants of a call, seen from the local device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallParticipants {
    /// The participant running this device
    pub local: ParticipantId,
    /// The other participant
    pub remote: ParticipantId,
}

impl CallParticipants {
    /// Create a participant pair
    pub fn new(local: impl Into<ParticipantId>, remote: impl Into<ParticipantId>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }

    /// Call identifier shared by both participants
    #[must_use]
    pub fn call_id(&self) -> CallId {
        CallId::for_participants(&self.local, &self.remote)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_call_id_from_doctor_and_patient() {
        let doctor = ParticipantId::new("doc1");
        let patient = ParticipantId::new("pat2");

        assert_eq!(CallId::for_participants(&doctor, &patient).as_str(), "doc1_pat2");
        assert_eq!(CallId::for_participants(&patient, &doctor).as_str(), "doc1_pat2");
    }

    #[test]
    fn test_participants_agree_on_call_id() {
        let caller_view = CallParticipants::new("doc1", "pat2");
        let callee_view = CallParticipants::new("pat2", "doc1");
        assert_eq!(caller_view.call_id(), callee_view.call_id());
    }

    #[test]
    fn test_call_id_serialization() {
        let id = CallId::new("doc1_pat2");
        let json = serde_json::to_string(&id).unwrap();
        let deserialized: CallId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, deserialized);
    }

    proptest! {
        #[test]
        fn call_id_is_symmetric(a in "[a-zA-Z0-9]{1,24}", b in "[a-zA-Z0-9]{1,24}") {
            let a = ParticipantId::new(a);
            let b = ParticipantId::new(b);
            prop_assert_eq!(CallId::for_participants(&a, &b), CallId::for_participants(&b, &a));
        }
    }
}
