//! Connection-establishment glue. The actual RPC discovery and socket setup
//!  belong to an external collaborator; this module only provides the pieces
//!  the core dictates: a deterministic routing-node selection policy, the
//!  retry walk over it, and the interpretation of the relay's handshake
//!  confirmation.

use crate::error::ClientError;
use std::future::Future;
use tracing::{debug, warn};

/// Seeded round-robin over the configured routing nodes: the seed picks the
///  start index, every subsequent pick advances cyclically. Deterministic for
///  a given (node list, seed) pair, so connection-establishment behavior is
///  testable.
pub struct NodeSelector {
    nodes: Vec<String>,
    next: usize,
}

impl NodeSelector {
    pub fn new(nodes: Vec<String>, seed: u64) -> Result<NodeSelector, ClientError> {
        if nodes.is_empty() {
            return Err(ClientError::NoRoutingNodes);
        }
        let next = (seed % nodes.len() as u64) as usize;
        Ok(NodeSelector { nodes, next })
    }

    pub fn next_node(&mut self) -> &str {
        let current = self.next;
        self.next = (self.next + 1) % self.nodes.len();
        &self.nodes[current]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// The relay's answer to the client-registration handshake. A non-zero code
///  means the relay refused the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeConfirmation {
    pub error_code: u32,
}

impl HandshakeConfirmation {
    pub fn into_result(self) -> Result<(), ClientError> {
        if self.error_code == 0 {
            Ok(())
        }
        else {
            warn!("relay refused the client registration with error code {}", self.error_code);
            Err(ClientError::ConnectionLost)
        }
    }
}

/// Walks the routing-node list until one connection attempt succeeds or the
///  retry budget is exhausted. `attempt` performs one full establishment
///  against the given node (RPC discovery, socket setup, handshake).
pub async fn connect_with_retries<T, F, Fut>(
    selector: &mut NodeSelector,
    retries: u32,
    mut attempt: F,
) -> Result<T, ClientError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut remaining = retries;
    loop {
        let node = selector.next_node().to_owned();
        debug!("connecting via routing node {}", node);

        match attempt(node).await {
            Ok(connected) => return Ok(connected),
            Err(e) => {
                warn!("connection attempt failed, remaining retries: {}: {}", remaining, e);
                if remaining == 0 {
                    return Err(ClientError::ConnectionLost);
                }
                remaining -= 1;
            }
        }
    }
}
