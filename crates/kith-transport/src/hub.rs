//! In-process transport.
//!
//! Every endpoint registered with a [`Hub`] receives framed envelopes on an
//! unbounded channel. Links can be cut in both directions to simulate
//! partitions; sends across a cut link fail with
//! [`TransportError::Unreachable`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kith_types::{Id, NodeId};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::wire::Envelope;
use crate::{messages, Result, Transport, TransportError};

/// A framed envelope delivered to an endpoint.
#[derive(Clone, Debug)]
pub struct Incoming {
    pub from: NodeId,
    pub bytes: Vec<u8>,
}

impl Incoming {
    pub fn envelope(&self) -> Result<Envelope> {
        Envelope::from_bytes(&self.bytes)
    }
}

#[derive(Default)]
struct HubInner {
    nodes: HashMap<NodeId, mpsc::UnboundedSender<Incoming>>,
    cut: HashSet<(NodeId, NodeId)>,
    isolated: HashSet<NodeId>,
    join_keys: HashMap<[u8; 20], (NodeId, Id)>,
    dials: Vec<(NodeId, NodeId, Option<[u8; 20]>)>,
}

impl HubInner {
    fn reachable(&self, from: &NodeId, to: &NodeId) -> bool {
        self.nodes.contains_key(to)
            && !self.isolated.contains(from)
            && !self.isolated.contains(to)
            && !self.cut.contains(&(*from, *to))
    }
}

#[derive(Default)]
pub struct Hub {
    inner: Mutex<HubInner>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn inner(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `node_id`, replacing any previous endpoint with that id.
    pub fn connect(self: &Arc<Self>, node_id: NodeId) -> (HubEndpoint, mpsc::UnboundedReceiver<Incoming>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner().nodes.insert(node_id, tx);
        debug!(node = %node_id, "hub endpoint connected");
        (
            HubEndpoint {
                hub: self.clone(),
                node_id,
            },
            rx,
        )
    }

    pub fn disconnect(&self, node_id: &NodeId) {
        let mut inner = self.inner();
        inner.nodes.remove(node_id);
        inner.join_keys.retain(|_, (owner, _)| owner != node_id);
    }

    /// Cut the link between `a` and `b` in both directions.
    pub fn partition(&self, a: NodeId, b: NodeId) {
        let mut inner = self.inner();
        inner.cut.insert((a, b));
        inner.cut.insert((b, a));
    }

    /// Cut every link of `node`.
    pub fn isolate(&self, node: NodeId) {
        self.inner().isolated.insert(node);
    }

    /// Restore every link.
    pub fn heal(&self) {
        let mut inner = self.inner();
        inner.cut.clear();
        inner.isolated.clear();
    }

    pub fn join_key_owner(&self, hash: &[u8; 20]) -> Option<(NodeId, Id)> {
        self.inner().join_keys.get(hash).copied()
    }

    /// Number of join keys `node` currently serves.
    pub fn join_key_count(&self, node: &NodeId) -> usize {
        self.inner().join_keys.values().filter(|(owner, _)| owner == node).count()
    }

    /// Dials made so far as `(from, to, op key hash)`.
    pub fn dials(&self) -> Vec<(NodeId, NodeId, Option<[u8; 20]>)> {
        self.inner().dials.clone()
    }
}

/// One node's handle on the hub.
#[derive(Clone)]
pub struct HubEndpoint {
    hub: Arc<Hub>,
    node_id: NodeId,
}

impl HubEndpoint {
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }
}

impl Transport for HubEndpoint {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn send(&self, to: &NodeId, envelope: &Envelope) -> Result<()> {
        let bytes = envelope.to_bytes()?;
        let inner = self.hub.inner();
        if !inner.reachable(&self.node_id, to) {
            return Err(TransportError::Unreachable(*to));
        }
        let tx = inner.nodes.get(to).ok_or(TransportError::Unreachable(*to))?;
        trace!(from = %self.node_id, to = %to, code = messages::name(envelope.code), "hub send");
        tx.send(Incoming {
            from: self.node_id,
            bytes,
        })
        .map_err(|_| TransportError::Unreachable(*to))
    }

    fn peers(&self) -> Vec<NodeId> {
        let inner = self.hub.inner();
        inner
            .nodes
            .keys()
            .filter(|id| **id != self.node_id && inner.reachable(&self.node_id, id))
            .copied()
            .collect()
    }

    fn dial(&self, node: &NodeId, op_key_hash: Option<[u8; 20]>) -> Result<()> {
        let mut inner = self.hub.inner();
        inner.dials.push((self.node_id, *node, op_key_hash));
        if !inner.reachable(&self.node_id, node) {
            return Err(TransportError::Unreachable(*node));
        }
        Ok(())
    }

    fn register_join_key(&self, hash: [u8; 20], entity: Id) -> Result<()> {
        self.hub.inner().join_keys.insert(hash, (self.node_id, entity));
        Ok(())
    }

    fn unregister_join_key(&self, hash: &[u8; 20]) -> Result<()> {
        self.hub.inner().join_keys.remove(hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MSG_INIT_ME_INFO;

    #[tokio::test]
    async fn test_send_and_receive() {
        let hub = Hub::new();
        let (a, _rx_a) = hub.connect(Id([1; 32]));
        let (_b, mut rx_b) = hub.connect(Id([2; 32]));

        let envelope = Envelope::new(MSG_INIT_ME_INFO, Id::ZERO, &"hello").expect("envelope");
        a.send(&Id([2; 32]), &envelope).expect("send");

        let incoming = rx_b.recv().await.expect("incoming");
        assert_eq!(incoming.from, Id([1; 32]));
        assert_eq!(incoming.envelope().expect("decode"), envelope);
        assert_eq!(a.peers(), vec![Id([2; 32])]);
    }

    #[test]
    fn test_partition_and_heal() {
        let hub = Hub::new();
        let (a, _rx_a) = hub.connect(Id([1; 32]));
        let (b, _rx_b) = hub.connect(Id([2; 32]));
        let envelope = Envelope::new(MSG_INIT_ME_INFO, Id::ZERO, &()).expect("envelope");

        hub.partition(a.node_id(), b.node_id());
        assert!(matches!(a.send(&b.node_id(), &envelope), Err(TransportError::Unreachable(_))));
        assert!(b.send(&a.node_id(), &envelope).is_err());
        assert!(a.peers().is_empty());

        hub.heal();
        a.send(&b.node_id(), &envelope).expect("send after heal");

        hub.isolate(b.node_id());
        assert!(a.send(&b.node_id(), &envelope).is_err());
        assert!(a.dial(&b.node_id(), None).is_err());
        assert_eq!(hub.dials().len(), 1);
    }

    #[test]
    fn test_join_key_registry() {
        let hub = Hub::new();
        let (a, _rx) = hub.connect(Id([1; 32]));
        a.register_join_key([7; 20], Id([9; 32])).expect("register");
        assert_eq!(hub.join_key_owner(&[7; 20]), Some((Id([1; 32]), Id([9; 32]))));
        assert_eq!(hub.join_key_count(&a.node_id()), 1);
        a.unregister_join_key(&[7; 20]).expect("unregister");
        assert_eq!(hub.join_key_count(&a.node_id()), 0);
    }
}
