//! Quality-of-service grouping for outbound writes.
//!
//! Nodes with quality 0–2 are written in a single round trip. Nodes with
//! quality 3 or 4 are staged under a transaction id and committed. The two
//! groups must not share a write; qualities outside 0–4 do not affect the
//! grouping.

use kolibri_protocol::messages::WriteNode;

use crate::error::ClientError;

/// How a write is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    /// One `kolibri.write` round trip.
    Immediate,
    /// `kolibri.write` with a `tid`, then `kolibri.commit`.
    Transactional,
}

/// Picks the write mode for `nodes`, rejecting mixed quality groups.
pub(crate) fn classify(nodes: &[WriteNode]) -> Result<WriteMode, ClientError> {
    let mut immediate = false;
    let mut transactional = false;
    for node in nodes {
        match node.quality {
            0..=2 => immediate = true,
            3..=4 => transactional = true,
            _ => {}
        }
        if immediate && transactional {
            return Err(ClientError::MixedQuality);
        }
    }
    Ok(if transactional {
        WriteMode::Transactional
    } else {
        WriteMode::Immediate
    })
}
