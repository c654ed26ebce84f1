//! A [`Server`] running as an actix actor.
//!
//! The actor is the single writer of the node's state: timer events, inbound RPCs, RPC responses and client
//! commands are all handled one at a time on its context. Outbound RPCs run as futures spawned on the same
//! context, in parallel per peer, and their results re-enter the actor before they touch any state.

use super::config::Config;
use super::error::Error;
use super::publisher::StateMachine;
use super::rpc::*;
use super::server::Server;
use super::state::{Replication, Role};
use super::storage::Storage;
use super::timer::{ElectionTimeout, ElectionTimer, Heartbeat, Timers};
use super::transport::{Transport, TransportError};
use super::{LogIndex, NodeId, Term};
use actix::prelude::*;
use futures::channel::oneshot;
use log::{debug, info, trace};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("not the leader (known leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },
    #[error("entry {index} was replaced by another leader's entry")]
    Overwritten { index: LogIndex },
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("command was not applied in time")]
    Timeout,
    #[error("node dropped the command")]
    Canceled,
}

/// Replicate a payload through the cluster; resolves with the state machine's output once it is applied.
#[derive(Message, Debug, Clone)]
#[rtype(result = "Result<Vec<u8>, CommandError>")]
pub struct ClientCommand(pub Vec<u8>);

#[derive(Message)]
#[rtype(result = "NodeStatus")]
pub struct GetStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: Role,
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    pub degraded: bool,
}

/// A client waiting for the entry it submitted.
struct Pending {
    term: Term,
    reply: oneshot::Sender<Result<Vec<u8>, CommandError>>,
}

pub struct Node<S, M, T> {
    server: Server<S, M>,
    transport: T,
    timers: Timers,
    election_timer: ElectionTimer,
    heartbeat_interval: Duration,
    command_timeout: Duration,
    status_interval: Duration,
    pending: HashMap<LogIndex, Pending>,
}

impl<S, M, T> Node<S, M, T>
where
    S: Storage + Unpin + 'static,
    M: StateMachine + Unpin + 'static,
    T: Transport,
{
    pub fn new(config: &Config, server: Server<S, M>, transport: T) -> Self {
        let (min, max) = config.election_timeout();
        Node {
            server,
            transport,
            timers: Timers::Uninitialised,
            election_timer: ElectionTimer::new(min, max),
            heartbeat_interval: config.heartbeat_interval(),
            command_timeout: config.command_timeout(),
            status_interval: config.status_interval(),
            pending: HashMap::new(),
        }
    }

    /// Recover a node from `storage` with the members and limits named in `config`.
    pub fn from_config(config: &Config, storage: S, state_machine: M, transport: T) -> Result<Self, Error> {
        config.validate()?;
        let server = Server::new(config.id, config.peer_ids(), storage, state_machine)?
            .with_max_entries(config.max_entries_per_append);
        Ok(Self::new(config, server, transport))
    }

    pub fn status(&self) -> NodeStatus {
        let state = self.server.get_state();
        NodeStatus {
            id: state.id(),
            role: state.role(),
            term: state.current_term(),
            voted_for: state.voted_for(),
            leader: state.leader_id(),
            commit_index: state.commit_index(),
            last_applied: self.server.last_applied(),
            last_log_index: state.log().last_index(),
            last_log_term: state.log().last_term(),
            degraded: state.is_degraded(),
        }
    }

    /// Bookkeeping after anything touched the server: keep the timer slot in step with the role and hand newly
    /// committed entries to the state machine.
    fn after_event(&mut self, ctx: &mut Context<Self>) {
        if self.server.is_leader() {
            if !self.timers.is_heartbeat() {
                info!("{}; leading term {}", self.server.id(), self.server.current_term());
                self.broadcast_append(ctx);
                self.timers.reset_heartbeat(self.heartbeat_interval, ctx);
            }
        } else if self.timers.is_heartbeat() {
            self.timers.reset_election_timer(&self.election_timer, ctx);
        }
        self.publish();
    }

    fn publish(&mut self) {
        for applied in self.server.apply_committed() {
            trace!("{}; applied {}", self.server.id(), applied.index);
            if let Some(pending) = self.pending.remove(&applied.index) {
                let outcome = if pending.term == applied.term {
                    Ok(applied.output)
                } else {
                    Err(CommandError::Overwritten {
                        index: applied.index,
                    })
                };
                let _ = pending.reply.send(outcome);
            }
        }
    }

    fn request_vote(&mut self, peer: NodeId, req: RequestVoteRequest, ctx: &mut Context<Self>) {
        trace!("{}; requesting vote from {}", self.server.id(), peer);
        ctx.spawn(
            fut::wrap_future::<_, Self>(self.transport.request_vote(peer, req))
                .map(move |res, node, ctx| node.on_vote(peer, res, ctx)),
        );
    }

    fn on_vote(
        &mut self,
        peer: NodeId,
        res: Result<RequestVoteResponse, TransportError>,
        ctx: &mut Context<Self>,
    ) {
        match res {
            Ok(res) => {
                self.server.receive_vote(peer, res);
                self.after_event(ctx);
            }
            Err(e) => debug!("{}; no vote from {}: {}", self.server.id(), peer, e),
        }
    }

    fn broadcast_append(&mut self, ctx: &mut Context<Self>) {
        for (peer, req) in self.server.heartbeat() {
            self.send_append(peer, req, ctx);
        }
    }

    fn send_append(&mut self, peer: NodeId, req: AppendEntriesRequest, ctx: &mut Context<Self>) {
        let sent = SentAppend::from(&req);
        ctx.spawn(
            fut::wrap_future::<_, Self>(self.transport.append_entries(peer, req))
                .map(move |res, node, ctx| node.on_append_response(peer, sent, res, ctx)),
        );
    }

    fn on_append_response(
        &mut self,
        peer: NodeId,
        sent: SentAppend,
        res: Result<AppendEntriesResponse, TransportError>,
        ctx: &mut Context<Self>,
    ) {
        let res = match res {
            Ok(res) => res,
            Err(e) => {
                // nothing changes; the next heartbeat resends from the same nextIndex
                debug!("{}; append to {} failed: {}", self.server.id(), peer, e);
                return;
            }
        };
        match self.server.receive_append_entries_response(peer, sent, res) {
            Replication::Retry => {
                if let Some(req) = self.server.append_request_for(peer) {
                    debug!(
                        "{}; {} diverges, retrying after {}",
                        self.server.id(),
                        peer,
                        req.prev_log_index
                    );
                    self.send_append(peer, req, ctx);
                }
            }
            Replication::Progress => {
                // stream the next batch to a peer which is still catching up
                if let Some(req) = self.server.append_request_for(peer) {
                    if !req.entries.is_empty() && req.prev_log_index == sent.match_index() {
                        self.send_append(peer, req, ctx);
                    }
                }
            }
            Replication::Backoff => {
                debug!("{}; {} keeps rejecting, retrying on the next heartbeat", self.server.id(), peer);
            }
            Replication::SteppedDown | Replication::Ignored => {}
        }
        self.after_event(ctx);
    }
}

impl<S, M, T> Actor for Node<S, M, T>
where
    S: Storage + Unpin + 'static,
    M: StateMachine + Unpin + 'static,
    T: Transport,
{
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            "{}; starting with peers {:?} in term {}",
            self.server.id(),
            self.server.peers(),
            self.server.current_term()
        );
        self.timers.reset_election_timer(&self.election_timer, ctx);
        ctx.run_interval(self.status_interval, |node, _ctx| {
            node.server.get_state().log_progress()
        });
    }

    fn stopped(&mut self, ctx: &mut Self::Context) {
        self.timers.cancel(ctx);
        info!("{}; stopped", self.server.id());
    }
}

impl<S, M, T> Handler<ElectionTimeout> for Node<S, M, T>
where
    S: Storage + Unpin + 'static,
    M: StateMachine + Unpin + 'static,
    T: Transport,
{
    type Result = ();

    fn handle(&mut self, _: ElectionTimeout, ctx: &mut Self::Context) -> Self::Result {
        match self.server.election_timeout() {
            Ok(Some(req)) => {
                for peer in self.server.peers().to_vec() {
                    self.request_vote(peer, req, ctx);
                }
            }
            Ok(None) => {}
            Err(e) => info!("{}; cannot start an election: {}", self.server.id(), e),
        }
        // a candidate that hears nothing tries again with a fresh timeout
        self.timers.reset_election_timer(&self.election_timer, ctx);
        self.after_event(ctx);
    }
}

impl<S, M, T> Handler<Heartbeat> for Node<S, M, T>
where
    S: Storage + Unpin + 'static,
    M: StateMachine + Unpin + 'static,
    T: Transport,
{
    type Result = ();

    fn handle(&mut self, _: Heartbeat, ctx: &mut Self::Context) -> Self::Result {
        if !self.server.is_leader() {
            return;
        }
        self.broadcast_append(ctx);
        self.timers.reset_heartbeat(self.heartbeat_interval, ctx);
        // retries a state machine that failed to apply earlier
        self.publish();
    }
}

impl<S, M, T> Handler<RequestVoteRequest> for Node<S, M, T>
where
    S: Storage + Unpin + 'static,
    M: StateMachine + Unpin + 'static,
    T: Transport,
{
    type Result = MessageResult<RequestVoteRequest>;

    fn handle(&mut self, req: RequestVoteRequest, ctx: &mut Self::Context) -> Self::Result {
        let res = self.server.receive_request_vote(req);
        if res.vote_granted {
            self.timers.reset_election_timer(&self.election_timer, ctx);
        }
        self.after_event(ctx);
        MessageResult(res)
    }
}

impl<S, M, T> Handler<AppendEntriesRequest> for Node<S, M, T>
where
    S: Storage + Unpin + 'static,
    M: StateMachine + Unpin + 'static,
    T: Transport,
{
    type Result = MessageResult<AppendEntriesRequest>;

    fn handle(&mut self, req: AppendEntriesRequest, ctx: &mut Self::Context) -> Self::Result {
        let from_current_leader = req.term >= self.server.current_term();
        let res = self.server.receive_append_entries(req);
        if from_current_leader && !self.server.is_leader() {
            self.timers.reset_election_timer(&self.election_timer, ctx);
        }
        self.after_event(ctx);
        MessageResult(res)
    }
}

impl<S, M, T> Handler<ClientCommand> for Node<S, M, T>
where
    S: Storage + Unpin + 'static,
    M: StateMachine + Unpin + 'static,
    T: Transport,
{
    type Result = ResponseActFuture<Self, Result<Vec<u8>, CommandError>>;

    fn handle(&mut self, ClientCommand(payload): ClientCommand, ctx: &mut Self::Context) -> Self::Result {
        let (index, term) = match self.server.command(payload) {
            Ok(ptr) => ptr,
            Err(Error::NotLeader { leader }) => {
                return Box::pin(fut::ready(Err(CommandError::NotLeader { leader })));
            }
            Err(e) => return Box::pin(fut::ready(Err(CommandError::Storage(e.to_string())))),
        };
        debug!("{}; command appended at {} in term {}", self.server.id(), index, term);
        let (reply, receiver) = oneshot::channel();
        if let Some(previous) = self.pending.insert(index, Pending { term, reply }) {
            let _ = previous.reply.send(Err(CommandError::Overwritten { index }));
        }
        // replicate now instead of on the next heartbeat
        self.broadcast_append(ctx);
        self.publish();
        let timeout = self.command_timeout;
        Box::pin(
            async move {
                match tokio::time::timeout(timeout, receiver).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(oneshot::Canceled)) => Err(CommandError::Canceled),
                    Err(_) => Err(CommandError::Timeout),
                }
            }
            .into_actor(self),
        )
    }
}

impl<S, M, T> Handler<GetStatus> for Node<S, M, T>
where
    S: Storage + Unpin + 'static,
    M: StateMachine + Unpin + 'static,
    T: Transport,
{
    type Result = MessageResult<GetStatus>;

    fn handle(&mut self, _: GetStatus, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.status())
    }
}
