//! Message counter synchronization exchange.
//!
//! The node which receives a secure message while its peer counter is not
//! synchronized sends `MsgCounterSyncReq` carrying a random challenge and keeps
//! the received message aside. The peer answers with `MsgCounterSyncRsp`
//! holding the counter of that response and the echoed challenge.
//! [CounterSync::complete] verifies the echo and hands the held back messages
//! over for normal processing.

use std::time::{Duration, Instant};
use std::{collections::VecDeque, io::Read};

use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::RngCore;

use crate::config;
use crate::error::CounterError;
use crate::local_counter::LocalMessageCounter;
use crate::messages::ProtocolMessageHeader;
use crate::peer_counter::{Challenge, PeerMessageCounter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub challenge: Challenge,
}

impl SyncRequest {
    pub fn encode(&self) -> Vec<u8> {
        self.challenge.to_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let challenge = payload
            .try_into()
            .map_err(|_| anyhow::anyhow!("sync request must carry 8 bytes, got {}", payload.len()))?;
        Ok(Self { challenge })
    }

    /// Protocol header + payload of the request, sent reliably as exchange initiator.
    pub fn message(&self, exchange_id: u16) -> Result<Vec<u8>> {
        let mut out = ProtocolMessageHeader::new(
            exchange_id,
            ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL,
            ProtocolMessageHeader::OPCODE_MSG_COUNTER_SYNC_REQ,
            ProtocolMessageHeader::FLAG_INITIATOR | ProtocolMessageHeader::FLAG_RELIABILITY,
        )
        .encode()?;
        out.extend_from_slice(&self.encode());
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResponse {
    pub counter: u32,
    pub response: Challenge,
}

impl SyncResponse {
    const LEN: usize = 4 + config::MESSAGE_COUNTER_SYNC_CHALLENGE_SIZE;

    /// Answer a request. The counter reported is the one the response
    /// message itself is going to carry.
    pub fn answer(local: &LocalMessageCounter, request: &SyncRequest) -> Self {
        Self {
            counter: local.value(),
            response: request.challenge,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.write_u32::<LittleEndian>(self.counter)?;
        out.extend_from_slice(&self.response);
        Ok(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != Self::LEN {
            anyhow::bail!("sync response must carry {} bytes, got {}", Self::LEN, payload.len());
        }
        let mut cursor = std::io::Cursor::new(payload);
        let counter = cursor.read_u32::<LittleEndian>()?;
        let mut response = Challenge::default();
        cursor.read_exact(&mut response)?;
        Ok(Self { counter, response })
    }

    /// Protocol header + payload of the response on the requester's exchange,
    /// acknowledging the request.
    pub fn message(&self, exchange_id: u16, ack_counter: u32) -> Result<Vec<u8>> {
        let mut header = ProtocolMessageHeader::new(
            exchange_id,
            ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL,
            ProtocolMessageHeader::OPCODE_MSG_COUNTER_SYNC_RSP,
            0,
        );
        header.set_ack(ack_counter);
        let mut out = header.encode()?;
        out.extend_from_slice(&self.encode()?);
        Ok(out)
    }
}

/// Bookkeeping of the requesting side for one session.
#[derive(Debug)]
pub struct CounterSync {
    exchange_id: Option<u16>,
    deadline: Option<Instant>,
    timeout: Duration,
    queue: VecDeque<Vec<u8>>,
    queue_size: usize,
}

impl CounterSync {
    pub fn new() -> Self {
        Self::with_limits(config::MESSAGE_COUNTER_SYNC_TIMEOUT, config::MESSAGE_COUNTER_SYNC_QUEUE_SIZE)
    }

    pub fn with_limits(timeout: Duration, queue_size: usize) -> Self {
        Self {
            exchange_id: None,
            deadline: None,
            timeout,
            queue: VecDeque::new(),
            queue_size,
        }
    }

    /// Start synchronization of `counter` on `exchange_id`.
    pub fn begin<const N: usize>(
        &mut self,
        counter: &mut PeerMessageCounter<N>,
        exchange_id: u16,
        now: Instant,
    ) -> SyncRequest {
        let mut challenge = Challenge::default();
        rand::thread_rng().fill_bytes(&mut challenge);
        counter.start_sync(challenge);
        self.exchange_id = Some(exchange_id);
        self.deadline = Some(now + self.timeout);
        log::debug!("starting message counter sync on exchange {}", exchange_id);
        SyncRequest { challenge }
    }

    pub fn in_progress(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn exchange_id(&self) -> Option<u16> {
        self.exchange_id
    }

    /// Keep raw message until synchronization finishes.
    pub fn queue(&mut self, raw: Vec<u8>) {
        if self.queue.len() >= self.queue_size {
            log::debug!("message counter sync queue full, dropping oldest message");
            self.queue.pop_front();
        }
        self.queue.push_back(raw);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Handle response. On success returns the queued messages in arrival order.
    pub fn complete<const N: usize>(
        &mut self,
        counter: &mut PeerMessageCounter<N>,
        response: &SyncResponse,
    ) -> Result<Vec<Vec<u8>>, CounterError> {
        counter.verify_challenge(response.counter, &response.response)?;
        log::debug!("message counter synced at {}", response.counter);
        self.exchange_id = None;
        self.deadline = None;
        Ok(self.queue.drain(..).collect())
    }

    /// Abandon synchronization which was not answered in time.
    ///
    /// Returns exchange of the abandoned request.
    pub fn expire<const N: usize>(&mut self, counter: &mut PeerMessageCounter<N>, now: Instant) -> Option<u16> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                log::debug!("message counter sync timed out, dropping {} messages", self.queue.len());
                counter.sync_fail();
                self.deadline = None;
                self.queue.clear();
                self.exchange_id.take()
            }
            _ => None,
        }
    }
}

impl Default for CounterSync {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake() {
        let now = Instant::now();
        let mut counter = PeerMessageCounter::<32>::new();
        let mut sync = CounterSync::new();
        let req = sync.begin(&mut counter, 10, now);
        assert!(counter.is_synchronizing());
        assert!(sync.in_progress());
        sync.queue(vec![1]);
        sync.queue(vec![2]);

        let req = SyncRequest::decode(&req.encode()).unwrap();
        let responder = LocalMessageCounter::with_value(5000);
        let rsp = SyncResponse::answer(&responder, &req);
        assert_eq!(rsp.counter, 5000);
        let rsp = SyncResponse::decode(&rsp.encode().unwrap()).unwrap();

        let queued = sync.complete(&mut counter, &rsp).unwrap();
        assert_eq!(queued, vec![vec![1], vec![2]]);
        assert!(!sync.in_progress());
        assert_eq!(sync.queued(), 0);
        assert_eq!(counter.verify(5000), Err(CounterError::InvalidArgument));
        counter.verify(5001).unwrap();
    }

    #[test]
    fn test_wrong_challenge() {
        let now = Instant::now();
        let mut counter = PeerMessageCounter::<32>::new();
        let mut sync = CounterSync::new();
        let req = sync.begin(&mut counter, 10, now);
        let mut bad = req.challenge;
        bad[0] ^= 0xff;
        let rsp = SyncResponse { counter: 1, response: bad };
        assert_eq!(sync.complete(&mut counter, &rsp), Err(CounterError::InvalidArgument));
        assert!(counter.is_synchronizing());
        assert!(sync.in_progress());
    }

    #[test]
    fn test_expire() {
        let now = Instant::now();
        let mut counter = PeerMessageCounter::<32>::new();
        let mut sync = CounterSync::with_limits(Duration::from_millis(100), 2);
        sync.begin(&mut counter, 33, now);
        sync.queue(vec![1]);
        sync.queue(vec![2]);
        sync.queue(vec![3]);
        assert_eq!(sync.queued(), 2);
        assert_eq!(sync.expire(&mut counter, now + Duration::from_millis(50)), None);
        assert!(counter.is_synchronizing());
        assert_eq!(sync.expire(&mut counter, now + Duration::from_millis(100)), Some(33));
        assert!(!counter.is_sync_started());
        assert_eq!(sync.queued(), 0);
        assert!(!sync.in_progress());
        assert_eq!(sync.expire(&mut counter, now + Duration::from_secs(1)), None);
    }

    #[test]
    fn test_payload_sizes() {
        assert!(SyncRequest::decode(&[1, 2, 3]).is_err());
        assert!(SyncResponse::decode(&[0; 11]).is_err());
        assert!(SyncResponse::decode(&[0; 13]).is_err());
    }

    #[test]
    fn test_messages() {
        let req = SyncRequest { challenge: [3; 8] };
        let data = req.message(7).unwrap();
        let (h, payload) = ProtocolMessageHeader::decode(&data).unwrap();
        assert!(h.is_secure_channel(ProtocolMessageHeader::OPCODE_MSG_COUNTER_SYNC_REQ));
        assert!(h.is_initiator());
        assert!(h.needs_ack());
        assert_eq!(payload, &[3; 8]);

        let rsp = SyncResponse { counter: 0x0a0b0c0d, response: [3; 8] };
        let data = rsp.message(7, 1234).unwrap();
        let (h, payload) = ProtocolMessageHeader::decode(&data).unwrap();
        assert!(h.is_secure_channel(ProtocolMessageHeader::OPCODE_MSG_COUNTER_SYNC_RSP));
        assert!(!h.is_initiator());
        assert_eq!(h.ack_counter, Some(1234));
        assert_eq!(&payload[..4], &[0x0d, 0x0c, 0x0b, 0x0a]);
    }
}
