//! The local node identity.

use crate::{KeyPair, NodeAddress, PublicKey, Signature};

/// Address and signing key of the local node.
#[derive(Debug, Clone)]
pub struct LocalNode {
    address: NodeAddress,
    keypair: KeyPair,
}

impl LocalNode {
    /// Create a local node.
    pub fn new(address: NodeAddress, keypair: KeyPair) -> Self {
        Self { address, keypair }
    }

    /// Node address.
    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    /// Public key.
    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// Sign a message with the node key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.keypair.sign(message)
    }
}
