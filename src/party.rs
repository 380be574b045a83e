//! Canonical participant ordering.
//!
//! Every party must independently compute the identical ordering and
//! threshold from the same descriptor list, or the distributed protocol
//! diverges. Descriptors arrive in arbitrary order; the set sorts them by
//! their arbitrary-precision numeric key, ties broken by id.

use std::collections::HashSet;

use anyhow::{anyhow, Context};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::TssResult;

/// Caller-supplied participant descriptor, decoded from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartyDescriptor {
    /// Unique id within the session.
    pub id: String,
    /// Display name; not used for ordering.
    pub moniker: String,
    /// Decimal integer of arbitrary size that orders the participants.
    pub unique_key: String,
}

/// One participant identity, immutable for the session's lifetime.
#[derive(Debug, Clone)]
pub struct PartyId {
    id: String,
    moniker: String,
    key: BigInt,
}

impl PartyId {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn moniker(&self) -> &str {
        &self.moniker
    }

    pub fn key(&self) -> &BigInt {
        &self.key
    }
}

/// Ordered participant set, ascending by `(key, id)`.
#[derive(Debug, Clone)]
pub struct ParticipantSet {
    parties: Vec<PartyId>,
}

impl ParticipantSet {
    /// Parse and sort caller-supplied descriptors. Fails on a malformed key,
    /// a duplicate id, or fewer than 2 participants; no partial set is
    /// published.
    pub fn from_descriptors(descriptors: Vec<PartyDescriptor>) -> TssResult<Self> {
        if descriptors.len() < 2 {
            return Err(anyhow!(
                "need at least 2 participants, got {}",
                descriptors.len()
            ));
        }

        let mut seen = HashSet::with_capacity(descriptors.len());
        if !descriptors.iter().all(|d| seen.insert(d.id.as_str())) {
            return Err(anyhow!("participant list contains a duplicate id"));
        }

        let mut parties = descriptors
            .into_iter()
            .map(|d| {
                let key = d.unique_key.parse::<BigInt>().with_context(|| {
                    format!("unique key of [{}] is not a decimal integer", d.id)
                })?;
                Ok(PartyId {
                    id: d.id,
                    moniker: d.moniker,
                    key,
                })
            })
            .collect::<TssResult<Vec<_>>>()?;

        // ids are the tie-break so that equal keys still yield the same
        // ordering on every party
        parties.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.id.cmp(&b.id)));

        Ok(Self { parties })
    }

    /// Position of `id` in the canonical ordering.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.parties.iter().position(|p| p.id == id)
    }

    pub fn get(&self, index: usize) -> Option<&PartyId> {
        self.parties.get(index)
    }

    pub fn len(&self) -> usize {
        self.parties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parties.is_empty()
    }

    /// Protocol threshold `t = floor(n / 2)`.
    pub fn threshold(&self) -> usize {
        self.parties.len() / 2
    }

    /// Ids in canonical order.
    pub fn ids(&self) -> Vec<String> {
        self.parties.iter().map(|p| p.id.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartyId> {
        self.parties.iter()
    }
}
