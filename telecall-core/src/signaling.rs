//! Signaling channel
//!
//! Delivers the call document (offer/answer) and the two role-scoped ICE
//! candidate sequences for one call identifier. Reads are never tail-only: a
//! late subscriber still sees what was written before it joined.

use crate::identity::CallId;
use crate::store::{AppendLog, DocumentStore, StoreError, Subscription};
use crate::types::{CallDocument, CandidateRole, IceCandidate, SdpType, SessionDescription};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Root collection for call documents and candidate sequences
pub const CALLS_COLLECTION: &str = "calls";

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Description does not match the field it is written to
    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    /// Payload could not be encoded
    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Backing store failed
    #[error("Transport error: {0}")]
    TransportError(#[from] StoreError),
}

/// Typed signaling over an injected document store and append log
#[derive(Clone)]
pub struct SignalingChannel {
    documents: Arc<dyn DocumentStore>,
    candidates: Arc<dyn AppendLog>,
}

impl SignalingChannel {
    /// Create a channel over the given store handles
    #[must_use]
    pub fn new(documents: Arc<dyn DocumentStore>, candidates: Arc<dyn AppendLog>) -> Self {
        Self {
            documents,
            candidates,
        }
    }

    /// Path of the call document
    #[must_use]
    pub fn call_path(call_id: &CallId) -> String {
        format!("{CALLS_COLLECTION}/{call_id}")
    }

    /// Path of one role's candidate sequence
    #[must_use]
    pub fn candidates_path(call_id: &CallId, role: CandidateRole) -> String {
        format!("{CALLS_COLLECTION}/{call_id}/{}", role.collection())
    }

    /// Merge-write the offer field of the call document
    ///
    /// # Errors
    ///
    /// Returns error if the description is not an offer or the write fails
    #[tracing::instrument(skip(self, offer), fields(call_id = %call_id))]
    pub async fn write_offer(
        &self,
        call_id: &CallId,
        offer: &SessionDescription,
    ) -> Result<(), SignalingError> {
        self.write_description(call_id, "offer", SdpType::Offer, offer)
            .await
    }

    /// Merge-write the answer field of the call document
    ///
    /// # Errors
    ///
    /// Returns error if the description is not an answer or the write fails
    #[tracing::instrument(skip(self, answer), fields(call_id = %call_id))]
    pub async fn write_answer(
        &self,
        call_id: &CallId,
        answer: &SessionDescription,
    ) -> Result<(), SignalingError> {
        self.write_description(call_id, "answer", SdpType::Answer, answer)
            .await
    }

    async fn write_description(
        &self,
        call_id: &CallId,
        field: &str,
        expected: SdpType,
        description: &SessionDescription,
    ) -> Result<(), SignalingError> {
        if description.sdp_type != expected {
            return Err(SignalingError::InvalidSdp(format!(
                "expected {expected:?}, got {:?}",
                description.sdp_type
            )));
        }
        let mut fields = Map::new();
        fields.insert(field.to_string(), serde_json::to_value(description)?);
        self.documents
            .merge(&Self::call_path(call_id), fields)
            .await?;
        tracing::debug!(field, sdp_len = description.sdp.len(), "Wrote session description");
        Ok(())
    }

    /// Delete the call document. The call id is shared by every call
    /// between the same two participants, so a new offer must not land next
    /// to an earlier call's answer.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn reset_call(&self, call_id: &CallId) -> Result<(), SignalingError> {
        self.documents.delete(&Self::call_path(call_id)).await?;
        tracing::debug!("Reset call document");
        Ok(())
    }

    /// Read the call document; a missing document reads as empty
    ///
    /// # Errors
    ///
    /// Returns error if the read fails or the document is malformed
    pub async fn read_call(&self, call_id: &CallId) -> Result<CallDocument, SignalingError> {
        match self.documents.get(&Self::call_path(call_id)).await? {
            Some(fields) => Ok(serde_json::from_value(Value::Object(fields))?),
            None => Ok(CallDocument::default()),
        }
    }

    /// Subscribe to the call document: current state now, then every change
    ///
    /// # Errors
    ///
    /// Returns error if the subscription cannot be opened
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn subscribe_to_call(
        &self,
        call_id: &CallId,
    ) -> Result<Subscription<CallDocument>, SignalingError> {
        let feed = self.documents.watch(&Self::call_path(call_id)).await?;
        Ok(Subscription::new(feed, decode_call_document))
    }

    /// Append one candidate to a role's sequence.
    ///
    /// Failures are logged here and returned; callers are expected to drop
    /// them since ICE gathers redundant candidates.
    ///
    /// # Errors
    ///
    /// Returns error if the append fails
    pub async fn append_candidate(
        &self,
        call_id: &CallId,
        role: CandidateRole,
        candidate: &IceCandidate,
    ) -> Result<(), SignalingError> {
        let value = serde_json::to_value(candidate)?;
        match self
            .candidates
            .push(&Self::candidates_path(call_id, role), value)
            .await
        {
            Ok(key) => {
                tracing::trace!(call_id = %call_id, ?role, key = %key, "Appended ICE candidate");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(call_id = %call_id, ?role, error = %e, "Failed to append ICE candidate");
                Err(e.into())
            }
        }
    }

    /// Subscribe to a role's candidates, existing ones first
    ///
    /// # Errors
    ///
    /// Returns error if the subscription cannot be opened
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn subscribe_to_candidates(
        &self,
        call_id: &CallId,
        role: CandidateRole,
    ) -> Result<Subscription<IceCandidate>, SignalingError> {
        let feed = self
            .candidates
            .watch_children(&Self::candidates_path(call_id, role))
            .await?;
        Ok(Subscription::new(feed, decode_candidate))
    }

    /// Remove both candidate sequences of a call. Best-effort.
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn purge_call(&self, call_id: &CallId) {
        if let Err(e) = self.candidates.remove(&Self::call_path(call_id)).await {
            tracing::warn!(error = %e, "Failed to purge candidate sequences");
        } else {
            tracing::debug!("Purged candidate sequences");
        }
    }
}

fn decode_call_document(value: Value) -> Option<CallDocument> {
    if value.is_null() {
        return Some(CallDocument::default());
    }
    match serde_json::from_value(value) {
        Ok(doc) => Some(doc),
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed call document");
            None
        }
    }
}

fn decode_candidate(value: Value) -> Option<IceCandidate> {
    match serde_json::from_value::<IceCandidate>(value) {
        Ok(candidate) if !candidate.candidate.is_empty() => Some(candidate),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed ICE candidate");
            None
        }
    }
}
