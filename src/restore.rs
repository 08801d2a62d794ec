//! Restore negotiation.
//!
//! When a document view opens, a local snapshot that differs from the
//! freshly loaded remote copy is offered back to the user instead of being
//! applied silently. The offer is made at most once per load, and a key the
//! user already restored or dismissed is never offered again in the same
//! session.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::snapshot_model::{DocumentKey, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    NoOffer,
    OfferPending,
    Restored,
    Dismissed,
}

/// Keys whose offer was already resolved in this session.
///
/// Cheap to clone; every clone shares the same set.
#[derive(Debug, Clone, Default)]
pub struct RestoreSession {
    resolved: Arc<Mutex<HashSet<DocumentKey>>>,
}

impl RestoreSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_resolved(&self, key: &DocumentKey) -> bool {
        self.resolved.lock().contains(key)
    }

    fn mark_resolved(&self, key: &DocumentKey) {
        self.resolved.lock().insert(key.clone());
    }
}

/// A snapshot found in the local store, tagged with the key it was read for.
#[derive(Debug, Clone)]
pub struct RestoreCandidate<D> {
    pub key: DocumentKey,
    pub snapshot: Snapshot<D>,
}

/// Offer state for one document load.
#[derive(Debug)]
pub struct RestoreNegotiation<D> {
    key: DocumentKey,
    state: RestoreState,
    offer: Option<Snapshot<D>>,
    session: RestoreSession,
}

impl<D> RestoreNegotiation<D>
where
    D: Serialize + Clone,
{
    /// Decides whether to make an offer, right after `remote` finished loading.
    ///
    /// An offer is made only if the candidate was read for `loaded_key`, its
    /// data differs from the remote copy, and the key was not resolved
    /// earlier in `session`.
    pub fn evaluate(
        loaded_key: &DocumentKey,
        remote: Option<&D>,
        candidate: Option<RestoreCandidate<D>>,
        session: &RestoreSession,
    ) -> Self {
        let mut negotiation = Self {
            key: loaded_key.clone(),
            state: RestoreState::NoOffer,
            offer: None,
            session: session.clone(),
        };

        let Some(candidate) = candidate else {
            return negotiation;
        };
        if &candidate.key != loaded_key {
            debug!("Snapshot for {} does not belong to {loaded_key}", candidate.key);
            return negotiation;
        }
        if session.is_resolved(loaded_key) {
            debug!("Restore for {loaded_key} already resolved this session");
            return negotiation;
        }
        if remote.is_some_and(|remote| same_content(remote, &candidate.snapshot.data)) {
            debug!("Snapshot for {loaded_key} matches the remote copy");
            return negotiation;
        }

        info!(
            "Offering to restore {loaded_key} from snapshot taken {}",
            candidate.snapshot.timestamp
        );
        negotiation.state = RestoreState::OfferPending;
        negotiation.offer = Some(candidate.snapshot);
        negotiation
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn state(&self) -> RestoreState {
        self.state
    }

    /// The snapshot on offer, while the offer is pending.
    pub fn offer(&self) -> Option<&Snapshot<D>> {
        match self.state {
            RestoreState::OfferPending => self.offer.as_ref(),
            _ => None,
        }
    }

    /// Accepts the offer and returns the data to put back into the form.
    ///
    /// The snapshot itself stays in the store until the next successful
    /// remote write.
    pub fn restore(&mut self) -> Option<D> {
        if self.state != RestoreState::OfferPending {
            return None;
        }
        let data = self.offer.take()?.data;
        self.state = RestoreState::Restored;
        self.session.mark_resolved(&self.key);
        info!("Restored {} from local snapshot", self.key);
        Some(data)
    }

    /// Rejects the offer. Returns `true` if there was one; the caller clears
    /// the snapshot.
    pub fn dismiss(&mut self) -> bool {
        if self.state != RestoreState::OfferPending {
            return false;
        }
        self.offer = None;
        self.state = RestoreState::Dismissed;
        self.session.mark_resolved(&self.key);
        info!("Dismissed local snapshot of {}", self.key);
        true
    }
}

/// Deep equality through the JSON representation.
fn same_content<D: Serialize>(a: &D, b: &D) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => a == b,
        (Err(e), _) | (_, Err(e)) => {
            warn!("Could not compare drafts, treating them as different: {e}");
            false
        }
    }
}
