//! Simulated quantum channel.
//!
//! A real QKD link leaves both ends holding the same fresh random bits. The
//! simulation draws a block from the shared RNG and delivers the identical
//! bytes, under one block id, to both KMEs of the link.

use qkdnet_core::{
    BlockId, Environment, KmeId, LinkId, Peer, PeerNetwork, QkdError, message::KmeRequest,
};

use crate::SimEnv;

/// One link between two KMEs.
#[derive(Debug, Clone)]
pub struct QuantumChannel {
    /// Link identifier, shared by both ends.
    pub link_id: LinkId,
    /// First end.
    pub a: KmeId,
    /// Second end.
    pub b: KmeId,
    /// Bytes per delivered block.
    pub block_size: usize,
    env: SimEnv,
}

impl QuantumChannel {
    /// Channel with a fresh link id.
    pub fn new(env: SimEnv, a: KmeId, b: KmeId, block_size: usize) -> Self {
        Self { link_id: LinkId::random(&env), a, b, block_size, env }
    }

    /// Delivers one block to both ends, `a` first.
    ///
    /// # Errors
    ///
    /// `PeerUnreachable` if either end cannot be called, or the error the
    /// KME answered with.
    pub async fn deliver(&self, network: &dyn PeerNetwork) -> Result<BlockId, QkdError> {
        let block_id = BlockId::random(&self.env);
        let mut bytes = vec![0u8; self.block_size];
        self.env.random_bytes(&mut bytes);
        let timestamp = self.env.wall_clock_secs();

        for kme in [self.a, self.b] {
            let request = KmeRequest::DeliverBlock {
                link_id: self.link_id,
                block_id,
                timestamp,
                bytes: bytes.clone(),
            };
            network
                .call_kme(kme, request)
                .await
                .map_err(|e| e.unreachable(Peer::Kme(kme)))?
                .into_result()?;
        }

        tracing::trace!(link_id = %self.link_id, %block_id, "block delivered");
        Ok(block_id)
    }

    /// Delivers `count` blocks.
    ///
    /// # Errors
    ///
    /// The first failed delivery.
    pub async fn deliver_many(
        &self,
        network: &dyn PeerNetwork,
        count: usize,
    ) -> Result<(), QkdError> {
        for _ in 0..count {
            self.deliver(network).await?;
        }
        Ok(())
    }
}
