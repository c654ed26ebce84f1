use actix::prelude::*;
use std::time::Duration;

/// Randomized election timeout. Each countdown draws a fresh duration from `min..=max` so that split votes
/// resolve: the node whose timer fires first usually wins the next election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionTimer {
    min: Duration,
    max: Duration,
}

impl ElectionTimer {
    pub fn new(min: Duration, max: Duration) -> Self {
        assert!(min <= max, "empty election timeout window");
        ElectionTimer { min, max }
    }

    pub fn next_timeout(&self) -> Duration {
        let rand: f64 = random_number::rand::random();
        self.min + (self.max - self.min).mul_f64(rand)
    }
}

/// Fired when no leader was heard from, and no vote granted, for a whole election timeout.
#[derive(Message)]
#[rtype(result = "()")]
pub struct ElectionTimeout;

/// Fired every heartbeat interval while leader.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Heartbeat;

/// The one timer slot of a node: a follower or candidate counts down to an election, a leader to its next
/// heartbeat.
pub enum Timers {
    Uninitialised,
    Election(SpawnHandle),
    Heartbeat(SpawnHandle),
}

impl Timers {
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Timers::Heartbeat(_))
    }

    fn replace<A>(&mut self, next: Timers, ctx: &mut Context<A>)
    where
        A: Actor<Context = Context<A>>,
    {
        match std::mem::replace(self, next) {
            Timers::Election(handle) | Timers::Heartbeat(handle) => {
                ctx.cancel_future(handle);
            }
            Timers::Uninitialised => {}
        }
    }

    pub fn reset_election_timer<A>(&mut self, timer: &ElectionTimer, ctx: &mut Context<A>)
    where
        A: Actor<Context = Context<A>> + Handler<ElectionTimeout>,
    {
        let handle = ctx.notify_later(ElectionTimeout, timer.next_timeout());
        self.replace(Timers::Election(handle), ctx);
    }

    pub fn reset_heartbeat<A>(&mut self, interval: Duration, ctx: &mut Context<A>)
    where
        A: Actor<Context = Context<A>> + Handler<Heartbeat>,
    {
        let handle = ctx.notify_later(Heartbeat, interval);
        self.replace(Timers::Heartbeat(handle), ctx);
    }

    pub fn cancel<A>(&mut self, ctx: &mut Context<A>)
    where
        A: Actor<Context = Context<A>>,
    {
        self.replace(Timers::Uninitialised, ctx);
    }
}
