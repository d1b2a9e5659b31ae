//! Reliable delivery bookkeeping.
//!
//! Both tables take the current time as argument and never sleep, the caller
//! owns the timers.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::rmp::ReliableMessageProtocolConfig;

/// Sent message waiting for an ack.
struct UnackedMessage {
    /// Encoded message bytes to retransmit
    data: Vec<u8>,
    exchange_id: u16,
    /// Number of times the message was sent so far
    send_count: u32,
    next_retransmit: Instant,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetransmitAction {
    Resend { counter: u32, data: Vec<u8> },
    /// Retransmissions exhausted, peer did not ack in time.
    GiveUp { counter: u32, exchange_id: u16 },
}

pub struct RetransmitTable {
    config: ReliableMessageProtocolConfig,
    unacked: HashMap<u32, UnackedMessage>,
}

impl RetransmitTable {
    pub fn new(config: ReliableMessageProtocolConfig) -> Self {
        Self {
            config,
            unacked: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ReliableMessageProtocolConfig {
        &self.config
    }

    /// Track message which was just sent for the first time.
    pub fn track(&mut self, counter: u32, exchange_id: u16, data: Vec<u8>, now: Instant) {
        let next_retransmit = now + self.config.retransmit_timeout_random(0);
        log::trace!("tracking sent message counter:{} exchange:{}", counter, exchange_id);
        self.unacked.insert(
            counter,
            UnackedMessage {
                data,
                exchange_id,
                send_count: 1,
                next_retransmit,
            },
        );
    }

    /// Returns true when the counter was waiting for an ack.
    pub fn ack(&mut self, counter: u32) -> bool {
        let found = self.unacked.remove(&counter).is_some();
        if found {
            log::trace!("received ack for counter:{}", counter);
        }
        found
    }

    pub fn remove_exchange(&mut self, exchange_id: u16) {
        self.unacked.retain(|_, m| m.exchange_id != exchange_id);
    }

    pub fn len(&self) -> usize {
        self.unacked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unacked.is_empty()
    }

    /// Earliest time `poll` has something to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.unacked.values().map(|m| m.next_retransmit).min()
    }

    /// Messages due at `now`: either to be sent again or given up.
    pub fn poll(&mut self, now: Instant) -> Vec<RetransmitAction> {
        let mut out = Vec::new();
        let max_sends = self.config.max_retrans as u32 + 1;
        let mut to_remove = Vec::new();
        for (counter, msg) in self.unacked.iter_mut() {
            if now < msg.next_retransmit {
                continue;
            }
            if msg.send_count >= max_sends {
                log::debug!(
                    "giving up on counter {} exchange {} after {} sends",
                    counter,
                    msg.exchange_id,
                    msg.send_count
                );
                to_remove.push(*counter);
                out.push(RetransmitAction::GiveUp {
                    counter: *counter,
                    exchange_id: msg.exchange_id,
                });
                continue;
            }
            log::trace!("retransmit counter = {} exchange = {}", counter, msg.exchange_id);
            msg.next_retransmit = now + self.config.retransmit_timeout_random(msg.send_count);
            msg.send_count += 1;
            out.push(RetransmitAction::Resend {
                counter: *counter,
                data: msg.data.clone(),
            });
        }
        for counter in to_remove {
            self.unacked.remove(&counter);
        }
        out
    }
}

struct PendingAck {
    counter: u32,
    deadline: Instant,
    initiator: bool,
}

/// Acks held back for a while so they can ride on the next message of the exchange.
pub struct AckTable {
    timeout: Duration,
    pending: HashMap<u16, PendingAck>,
}

impl AckTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: HashMap::new(),
        }
    }

    /// Remember to ack `counter` on `exchange_id`. `initiator` is our role in the exchange.
    ///
    /// Returns counter of an older pending ack on the same exchange which must be
    /// sent right away.
    pub fn pending(&mut self, exchange_id: u16, counter: u32, initiator: bool, now: Instant) -> Option<u32> {
        let replaced = self.pending.insert(
            exchange_id,
            PendingAck {
                counter,
                deadline: now + self.timeout,
                initiator,
            },
        );
        replaced.map(|p| p.counter).filter(|c| *c != counter)
    }

    /// Take pending ack of the exchange to piggyback it.
    pub fn take(&mut self, exchange_id: u16) -> Option<u32> {
        self.pending.remove(&exchange_id).map(|p| p.counter)
    }

    /// Acks whose time ran out, as (exchange, counter, initiator).
    pub fn expired(&mut self, now: Instant) -> Vec<(u16, u32, bool)> {
        let due: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(e, _)| *e)
            .collect();
        due.into_iter()
            .filter_map(|e| self.pending.remove(&e).map(|p| (e, p.counter, p.initiator)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
