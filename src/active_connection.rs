use anyhow::{Context, Result};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    config,
    counter_sync::{CounterSync, SyncRequest, SyncResponse},
    messages::{self, Message, MessageHeader, ProtocolMessageHeader},
    peer_counter::SyncStatus,
    retransmit::{AckTable, RetransmitAction, RetransmitTable},
    rmp::ReliableMessageProtocolConfig,
    session::{Inbound, Session},
    transport,
};

/// State shared between the connection handle and its read loop.
struct Shared {
    session: Mutex<Session>,
    /// Routing responses to waiting callers by exchange ID
    pending_exchanges: Mutex<HashMap<u16, oneshot::Sender<Message>>>,
    retransmit: Mutex<RetransmitTable>,
    acks: Mutex<AckTable>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connection with background read task for continuous message handling.
///
/// Incoming messages pass the replay check of the session. Counter
/// synchronization with the peer is started automatically the first time a
/// message arrives before the peer counter is known.
pub struct ActiveConnection {
    transport_conn: Arc<transport::Connection>,
    shared: Arc<Shared>,

    /// Events channel (unsolicited messages)
    event_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,

    cancel: CancellationToken,
}

impl ActiveConnection {
    /// Create from transport connection and session.
    /// Spawns a background task that continuously reads from the connection.
    pub fn new(conn: Arc<transport::Connection>, session: Session, rmp: ReliableMessageProtocolConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();

        let shared = Arc::new(Shared {
            session: Mutex::new(session),
            pending_exchanges: Mutex::new(HashMap::new()),
            retransmit: Mutex::new(RetransmitTable::new(rmp)),
            acks: Mutex::new(AckTable::new(rmp.ack_timeout)),
        });

        let read_loop_conn = conn.clone();
        let read_loop_shared = shared.clone();
        let read_loop_cancel = cancel.clone();
        tokio::spawn(async move {
            connection_read_loop(read_loop_conn, read_loop_shared, event_tx, read_loop_cancel).await;
        });

        Self {
            transport_conn: conn,
            shared,
            event_rx: tokio::sync::Mutex::new(event_rx),
            cancel,
        }
    }

    /// Send request and wait for response on specific exchange.
    ///
    /// Fails when the peer does not acknowledge the request after all retransmissions.
    pub async fn request(&self, exchange_id: u16, data: &[u8]) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending_exchanges).insert(exchange_id, tx);

        if let Err(e) = send_on_exchange(&self.transport_conn, &self.shared, exchange_id, data).await {
            log::debug!("error sending request on exchange {}: {:?}", exchange_id, e);
            lock(&self.shared.pending_exchanges).remove(&exchange_id);
            return Err(e);
        }

        rx.await.context("no response received - peer unreachable")
    }

    /// Send message on exchange without waiting for a response.
    /// Messages with reliability flag are retransmitted until acknowledged.
    pub async fn send(&self, exchange_id: u16, data: &[u8]) -> Result<()> {
        send_on_exchange(&self.transport_conn, &self.shared, exchange_id, data).await
    }

    /// Receive next event. Returns None when connection is closed.
    pub async fn recv_event(&self) -> Option<Message> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await
    }

    /// Try receive event without blocking.
    pub fn try_recv_event(&self) -> Option<Message> {
        match self.event_rx.try_lock() {
            Ok(mut rx) => rx.try_recv().ok(),
            Err(_) => None,
        }
    }

    pub fn peer_counter_status(&self) -> SyncStatus {
        lock(&self.shared.session).peer_counter().status()
    }

    /// Number of sent messages still waiting for an ack.
    pub fn unacked(&self) -> usize {
        lock(&self.shared.retransmit).len()
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Encode and send, piggyback pending ack of the exchange, track reliable messages.
async fn send_on_exchange(
    transport_conn: &transport::Connection,
    shared: &Shared,
    exchange_id: u16,
    data: &[u8],
) -> Result<()> {
    let (header, _) = ProtocolMessageHeader::decode(data)?;
    let pending_ack = lock(&shared.acks).take(exchange_id);
    let data = match pending_ack {
        Some(ack) => {
            log::trace!("piggyback ack for counter:{} on exchange:{}", ack, exchange_id);
            messages::with_ack(data, ack)?
        }
        None => data.to_vec(),
    };
    let encoded = lock(&shared.session).encode_message(&data)?;
    let counter = MessageHeader::decode(&encoded)?.0.message_counter;
    if header.needs_ack() {
        lock(&shared.retransmit).track(counter, exchange_id, encoded.clone(), Instant::now());
    }
    if let Err(e) = transport_conn.send(&encoded).await {
        log::debug!("error sending message on exchange {}: {:?}", exchange_id, e);
        lock(&shared.retransmit).ack(counter);
        return Err(e);
    }
    Ok(())
}

async fn send_standalone_ack(
    transport_conn: &transport::Connection,
    shared: &Shared,
    exchange_id: u16,
    counter: u32,
    initiator: bool,
) -> Result<()> {
    let ack = messages::ack(exchange_id, counter, initiator)?;
    let out = lock(&shared.session).encode_message(&ack)?;
    transport_conn.send(&out).await?;
    log::trace!("sending ack for exchange:{} counter:{}", exchange_id, counter);
    Ok(())
}

async fn connection_read_loop(
    transport_conn: Arc<transport::Connection>,
    shared: Arc<Shared>,
    event_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    let mut sync = CounterSync::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            result = transport_conn.receive(config::RECEIVE_TICK) => {
                match result {
                    Ok(data) => {
                        log::trace!("received {} bytes", data.len());
                        let mut work = VecDeque::from([data]);
                        while let Some(raw) = work.pop_front() {
                            match process_incoming(raw, &transport_conn, &shared, &mut sync, &event_tx).await {
                                Ok(requeued) => work.extend(requeued),
                                Err(e) => log::debug!("error processing incoming message: {:?}", e),
                            }
                        }
                    }
                    Err(e) if e.downcast_ref::<tokio::time::error::Elapsed>().is_none() => {
                        log::debug!("connection closed: {:?}", e);
                        break;
                    }
                    Err(_) => {}
                }
            }
        }
        if let Err(e) = run_timers(&transport_conn, &shared, &mut sync).await {
            log::debug!("error handling timers: {:?}", e);
        }
    }
}

/// Process one raw message. Returns messages released by a finished counter sync.
async fn process_incoming(
    raw: Vec<u8>,
    transport_conn: &transport::Connection,
    shared: &Shared,
    sync: &mut CounterSync,
    event_tx: &mpsc::Sender<Message>,
) -> Result<Vec<Vec<u8>>> {
    let decoded = lock(&shared.session).decode_message(&raw);
    let inbound = match decoded {
        Ok(inbound) => inbound,
        Err(e) => {
            log::debug!("dropping incoming message: {:?}", e);
            return Ok(Vec::new());
        }
    };
    log::trace!("received message {:?}", inbound);

    if let Some(ack) = inbound.message().protocol_header.ack_counter {
        lock(&shared.retransmit).ack(ack);
    }

    match inbound {
        Inbound::Duplicate(message) => {
            // lost ack may be reason for duplicate
            if message.protocol_header.needs_ack() {
                send_standalone_ack(
                    transport_conn,
                    shared,
                    message.protocol_header.exchange_id,
                    message.message_header.message_counter,
                    !message.protocol_header.is_initiator(),
                )
                .await?;
            }
            log::trace!(
                "dropping duplicate message exchange:{} counter:{}",
                message.protocol_header.exchange_id,
                message.message_header.message_counter
            );
            Ok(Vec::new())
        }
        Inbound::Unsynchronized(message) => handle_unsynchronized(raw, message, transport_conn, shared, sync).await,
        Inbound::Accepted(message) => {
            handle_accepted(message, transport_conn, shared, event_tx).await?;
            Ok(Vec::new())
        }
    }
}

async fn handle_unsynchronized(
    raw: Vec<u8>,
    message: Message,
    transport_conn: &transport::Connection,
    shared: &Shared,
    sync: &mut CounterSync,
) -> Result<Vec<Vec<u8>>> {
    let header = &message.protocol_header;
    if header.is_secure_channel(ProtocolMessageHeader::OPCODE_MSG_COUNTER_SYNC_REQ) {
        answer_sync_request(&message, transport_conn, shared).await?;
        return Ok(Vec::new());
    }
    if header.is_secure_channel(ProtocolMessageHeader::OPCODE_MSG_COUNTER_SYNC_RSP) {
        let response = SyncResponse::decode(&message.payload)?;
        let completed = {
            let mut session = lock(&shared.session);
            sync.complete(session.peer_counter_mut(), &response)
        };
        return match completed {
            Ok(queued) => {
                log::debug!("peer counter synchronized, processing {} queued messages", queued.len());
                Ok(queued)
            }
            Err(e) => {
                log::debug!("dropping counter sync response: {}", e);
                Ok(Vec::new())
            }
        };
    }

    sync.queue(raw);
    if sync.in_progress() {
        return Ok(Vec::new());
    }
    let exchange_id: u16 = rand::random();
    let request = {
        let mut session = lock(&shared.session);
        sync.begin(session.peer_counter_mut(), exchange_id, Instant::now())
    };
    send_on_exchange(transport_conn, shared, exchange_id, &request.message(exchange_id)?).await?;
    Ok(Vec::new())
}

async fn handle_accepted(
    message: Message,
    transport_conn: &transport::Connection,
    shared: &Shared,
    event_tx: &mpsc::Sender<Message>,
) -> Result<()> {
    let header = &message.protocol_header;
    if header.is_secure_channel(ProtocolMessageHeader::OPCODE_MSG_COUNTER_SYNC_REQ) {
        return answer_sync_request(&message, transport_conn, shared).await;
    }
    if header.is_secure_channel(ProtocolMessageHeader::OPCODE_MSG_COUNTER_SYNC_RSP) {
        log::trace!("ignoring counter sync response, peer counter already synchronized");
        return Ok(());
    }

    if header.needs_ack() {
        let now = Instant::now();
        let initiator = !header.is_initiator();
        let replaced = lock(&shared.acks).pending(
            header.exchange_id,
            message.message_header.message_counter,
            initiator,
            now,
        );
        if let Some(older) = replaced {
            send_standalone_ack(transport_conn, shared, header.exchange_id, older, initiator).await?;
        }
    }

    if header.is_standalone_ack() {
        log::trace!(
            "standalone ack exchange:{} ack_counter:{:?}",
            header.exchange_id,
            header.ack_counter
        );
        return Ok(());
    }

    let exchange_id = header.exchange_id;
    let sender = lock(&shared.pending_exchanges).remove(&exchange_id);
    match sender {
        Some(tx) => {
            _ = tx.send(message);
        }
        None => {
            _ = event_tx.send(message).await;
        }
    }
    Ok(())
}

async fn answer_sync_request(message: &Message, transport_conn: &transport::Connection, shared: &Shared) -> Result<()> {
    let request = SyncRequest::decode(&message.payload)?;
    let encoded = {
        let session = lock(&shared.session);
        // response carries the counter it reports, keep session locked in between
        let response = SyncResponse::answer(session.local_counter(), &request);
        let data = response.message(
            message.protocol_header.exchange_id,
            message.message_header.message_counter,
        )?;
        session.encode_message(&data)?
    };
    log::debug!("answering counter sync request on exchange {}", message.protocol_header.exchange_id);
    transport_conn.send(&encoded).await
}

async fn run_timers(transport_conn: &transport::Connection, shared: &Shared, sync: &mut CounterSync) -> Result<()> {
    let now = Instant::now();

    let abandoned = {
        let mut session = lock(&shared.session);
        sync.expire(session.peer_counter_mut(), now)
    };
    if let Some(exchange_id) = abandoned {
        log::warn!("message counter sync with {} timed out", transport_conn.remote_address());
        lock(&shared.retransmit).remove_exchange(exchange_id);
    }

    let expired_acks = lock(&shared.acks).expired(now);
    for (exchange_id, counter, initiator) in expired_acks {
        send_standalone_ack(transport_conn, shared, exchange_id, counter, initiator).await?;
    }

    let actions = lock(&shared.retransmit).poll(now);
    for action in actions {
        match action {
            RetransmitAction::Resend { data, .. } => {
                if let Err(e) = transport_conn.send(&data).await {
                    log::debug!("retransmit failed: {:?}", e);
                }
            }
            RetransmitAction::GiveUp { counter, exchange_id } => {
                log::warn!(
                    "peer {} unreachable, message counter {} on exchange {} not acknowledged",
                    transport_conn.remote_address(),
                    counter,
                    exchange_id
                );
                // closes channel of waiting request
                lock(&shared.pending_exchanges).remove(&exchange_id);
            }
        }
    }
    Ok(())
}
