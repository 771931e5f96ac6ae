//! Domain-separated signing for cryptographic operations.
//!
//! Every signed object in the protocol signs the hash of a fact, prefixed by a
//! domain tag and the network id. Domain separation prevents a signature over
//! one kind of fact from being replayed as another.
//!
//! # Domain Tags
//!
//! | Tag | Purpose |
//! |-----|---------|
//! | `isaac_ballot:` | Ballot sign facts |
//! | `isaac_block_map:` | Block maps written after a block is saved |
//! | `isaac_expel:` | Suffrage expel operation signatures |
//! | `isaac_proposal:` | Proposal sign facts |

use crate::{Hash, NetworkId};

/// Domain tag for ballot sign facts.
///
/// Format: `isaac_ballot:` || network_id || fact_hash
pub const DOMAIN_BALLOT: &[u8] = b"isaac_ballot:";

/// Domain tag for block maps.
///
/// Format: `isaac_block_map:` || network_id || block_map_hash
pub const DOMAIN_BLOCK_MAP: &[u8] = b"isaac_block_map:";

/// Domain tag for expel operations.
///
/// Format: `isaac_expel:` || network_id || expel_fact_hash
pub const DOMAIN_EXPEL: &[u8] = b"isaac_expel:";

/// Domain tag for proposals.
///
/// Format: `isaac_proposal:` || network_id || proposal_fact_hash
pub const DOMAIN_PROPOSAL: &[u8] = b"isaac_proposal:";

fn fact_message(domain: &[u8], network_id: &NetworkId, hash: &Hash) -> Vec<u8> {
    let network = network_id.as_bytes();
    let mut message = Vec::with_capacity(domain.len() + network.len() + Hash::BYTES);
    message.extend_from_slice(domain);
    message.extend_from_slice(network);
    message.extend_from_slice(hash.as_bytes());
    message
}

/// Build the signing message for a ballot sign fact.
pub fn ballot_message(network_id: &NetworkId, fact_hash: &Hash) -> Vec<u8> {
    fact_message(DOMAIN_BALLOT, network_id, fact_hash)
}

/// Build the signing message for a block map.
pub fn block_map_message(network_id: &NetworkId, map_hash: &Hash) -> Vec<u8> {
    fact_message(DOMAIN_BLOCK_MAP, network_id, map_hash)
}

/// Build the signing message for an expel operation.
pub fn expel_message(network_id: &NetworkId, fact_hash: &Hash) -> Vec<u8> {
    fact_message(DOMAIN_EXPEL, network_id, fact_hash)
}

/// Build the signing message for a proposal.
pub fn proposal_message(network_id: &NetworkId, fact_hash: &Hash) -> Vec<u8> {
    fact_message(DOMAIN_PROPOSAL, network_id, fact_hash)
}
