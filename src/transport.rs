//! The RPC client a node calls its peers through.
//!
//! A [`Transport`] only has to carry requests and bring back responses; encoding, connections and retries at the
//! wire level are its own business. [`LocalNetwork`] routes between actors of one actix system and can cut nodes
//! off to simulate partitions.

use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use super::NodeId;
use actix::prelude::*;
use futures::future::LocalBoxFuture;
use log::trace;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),
    #[error("request to node {0} timed out")]
    Timeout(NodeId),
    #[error("node {0} dropped the request")]
    Mailbox(NodeId),
}

pub trait Transport: Unpin + 'static {
    fn request_vote(
        &self,
        to: NodeId,
        req: RequestVoteRequest,
    ) -> LocalBoxFuture<'static, Result<RequestVoteResponse, TransportError>>;

    fn append_entries(
        &self,
        to: NodeId,
        req: AppendEntriesRequest,
    ) -> LocalBoxFuture<'static, Result<AppendEntriesResponse, TransportError>>;
}

struct Peer {
    votes: Recipient<RequestVoteRequest>,
    appends: Recipient<AppendEntriesRequest>,
}

#[derive(Default)]
struct Routes {
    peers: HashMap<NodeId, Peer>,
    isolated: HashSet<NodeId>,
}

impl Routes {
    fn connected(&self, from: NodeId, to: NodeId) -> bool {
        !self.isolated.contains(&from) && !self.isolated.contains(&to)
    }
}

/// In-process network between nodes running in the same actix system.
#[derive(Clone)]
pub struct LocalNetwork {
    routes: Rc<RefCell<Routes>>,
    timeout: Duration,
}

impl LocalNetwork {
    pub fn new(timeout: Duration) -> Self {
        LocalNetwork {
            routes: Rc::default(),
            timeout,
        }
    }

    pub fn register(
        &self,
        id: NodeId,
        votes: Recipient<RequestVoteRequest>,
        appends: Recipient<AppendEntriesRequest>,
    ) {
        self.routes
            .borrow_mut()
            .peers
            .insert(id, Peer { votes, appends });
    }

    /// Drop all traffic to and from `id` until it is healed.
    pub fn isolate(&self, id: NodeId) {
        self.routes.borrow_mut().isolated.insert(id);
    }

    pub fn heal(&self, id: NodeId) {
        self.routes.borrow_mut().isolated.remove(&id);
    }

    /// The transport node `own_id` sends through.
    pub fn transport(&self, own_id: NodeId) -> LocalTransport {
        LocalTransport {
            own_id,
            network: self.clone(),
        }
    }

    fn route<M>(
        &self,
        from: NodeId,
        to: NodeId,
        msg: M,
        pick: impl FnOnce(&Peer) -> Recipient<M>,
    ) -> LocalBoxFuture<'static, Result<M::Result, TransportError>>
    where
        M: Message + Send + std::fmt::Debug + 'static,
        M::Result: Send,
    {
        let recipient = {
            let routes = self.routes.borrow();
            match routes.peers.get(&to) {
                Some(peer) if routes.connected(from, to) => pick(peer),
                _ => return Box::pin(futures::future::ready(Err(TransportError::Unreachable(to)))),
            }
        };
        trace!("{} -> {}: {:?}", from, to, msg);
        let routes = self.routes.clone();
        let timeout = self.timeout;
        Box::pin(async move {
            let res = match tokio::time::timeout(timeout, recipient.send(msg)).await {
                Ok(Ok(res)) => res,
                Ok(Err(_)) => return Err(TransportError::Mailbox(to)),
                Err(_) => return Err(TransportError::Timeout(to)),
            };
            // a partition that opened while the request was in flight swallows the response
            if routes.borrow().connected(from, to) {
                Ok(res)
            } else {
                Err(TransportError::Unreachable(to))
            }
        })
    }
}

pub struct LocalTransport {
    own_id: NodeId,
    network: LocalNetwork,
}

impl Transport for LocalTransport {
    fn request_vote(
        &self,
        to: NodeId,
        req: RequestVoteRequest,
    ) -> LocalBoxFuture<'static, Result<RequestVoteResponse, TransportError>> {
        self.network
            .route(self.own_id, to, req, |peer| peer.votes.clone())
    }

    fn append_entries(
        &self,
        to: NodeId,
        req: AppendEntriesRequest,
    ) -> LocalBoxFuture<'static, Result<AppendEntriesResponse, TransportError>> {
        self.network
            .route(self.own_id, to, req, |peer| peer.appends.clone())
    }
}
