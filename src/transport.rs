//! UDP transport shared by all connections.
//!
//! One socket is bound locally, incoming datagrams are routed to the
//! [Connection] registered for their source address. Datagrams from unknown
//! addresses are dropped.

use anyhow::{Context, Result};
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::UdpSocket, sync::Mutex};

/// Largest Matter message carried over UDP.
pub const MAX_DATAGRAM_SIZE: usize = 1280;

const CONNECTION_QUEUE_SIZE: usize = 32;

enum RemoveCommand {
    Connection(SocketAddr),
    Stop,
}

pub struct Transport {
    socket: Arc<UdpSocket>,
    connections: Mutex<HashMap<SocketAddr, tokio::sync::mpsc::Sender<Vec<u8>>>>,
    remove_channel_sender: tokio::sync::mpsc::UnboundedSender<RemoveCommand>,
    stop_receive_token: tokio_util::sync::CancellationToken,
}

/// Virtual connection to one remote address.
pub struct Connection {
    transport: Arc<Transport>,
    remote_address: SocketAddr,
    receiver: Mutex<tokio::sync::mpsc::Receiver<Vec<u8>>>,
}

impl Transport {
    async fn read_from_socket_loop(
        socket: Arc<UdpSocket>,
        stop_receive_token: tokio_util::sync::CancellationToken,
        self_weak: std::sync::Weak<Transport>,
    ) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, addr) = {
                tokio::select! {
                    recv_resp = socket.recv_from(&mut buf) => recv_resp,
                    _ = stop_receive_token.cancelled() => break
                }
            }?;
            let self_strong = self_weak
                .upgrade()
                .context("weakpointer to self is gone - just stop")?;
            let cons = self_strong.connections.lock().await;
            match cons.get(&addr) {
                Some(sender) => {
                    if sender.try_send(buf[..n].to_vec()).is_err() {
                        log::debug!("connection queue for {} full, dropping datagram", addr);
                    }
                }
                None => log::trace!("dropping {} bytes from unknown peer {}", n, addr),
            }
        }
        Ok(())
    }

    async fn read_from_delete_queue_loop(
        mut remove_channel_receiver: tokio::sync::mpsc::UnboundedReceiver<RemoveCommand>,
        self_weak: std::sync::Weak<Transport>,
    ) -> Result<()> {
        while let Some(RemoveCommand::Connection(to_remove)) = remove_channel_receiver.recv().await {
            let self_strong = self_weak
                .upgrade()
                .context("weak to self is gone - just stop")?;
            let mut cons = self_strong.connections.lock().await;
            _ = cons.remove(&to_remove);
        }
        Ok(())
    }

    pub async fn new(local: &str) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(local)
            .await
            .context(format!("binding udp socket to {}", local))?;
        let (remove_channel_sender, remove_channel_receiver) = tokio::sync::mpsc::unbounded_channel();
        let stop_receive_token = tokio_util::sync::CancellationToken::new();
        let stop_receive_token_child = stop_receive_token.child_token();
        let o = Arc::new(Self {
            socket: Arc::new(socket),
            connections: Mutex::new(HashMap::new()),
            remove_channel_sender,
            stop_receive_token,
        });
        let self_weak = Arc::downgrade(&o);
        let socket = o.socket.clone();
        tokio::spawn(async move {
            if let Err(e) = Self::read_from_socket_loop(socket, stop_receive_token_child, self_weak).await {
                log::debug!("transport receive loop finished: {:?}", e);
            }
        });
        let self_weak = Arc::downgrade(&o);
        tokio::spawn(async move {
            _ = Self::read_from_delete_queue_loop(remove_channel_receiver, self_weak).await;
        });
        Ok(o)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Register connection to `remote`. Replaces previous connection to the same address.
    pub async fn create_connection(self: &Arc<Self>, remote: &str) -> Result<Arc<Connection>> {
        let remote_address: SocketAddr = remote
            .parse()
            .context(format!("invalid remote address {}", remote))?;
        let mut clock = self.connections.lock().await;
        let (sender, receiver) = tokio::sync::mpsc::channel(CONNECTION_QUEUE_SIZE);
        clock.insert(remote_address, sender);
        Ok(Arc::new(Connection {
            transport: self.clone(),
            remote_address,
            receiver: Mutex::new(receiver),
        }))
    }
}

impl Connection {
    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_DATAGRAM_SIZE {
            anyhow::bail!("message of {} bytes exceeds {}", data.len(), MAX_DATAGRAM_SIZE);
        }
        self.transport.socket.send_to(data, self.remote_address).await?;
        Ok(())
    }

    pub async fn receive(&self, timeout: Duration) -> Result<Vec<u8>> {
        let mut ch = self.receiver.lock().await;
        let rec_future = ch.recv();
        let with_timeout = tokio::time::timeout(timeout, rec_future);
        with_timeout.await?.context("eof")
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        _ = self.remove_channel_sender.send(RemoveCommand::Stop);
        self.stop_receive_token.cancel();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        _ = self
            .transport
            .remove_channel_sender
            .send(RemoveCommand::Connection(self.remote_address));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demultiplex() {
        let a = Transport::new("127.0.0.1:0").await.unwrap();
        let b = Transport::new("127.0.0.1:0").await.unwrap();
        let c = Transport::new("127.0.0.1:0").await.unwrap();
        let a_to_b = a.create_connection(&b.local_addr().unwrap().to_string()).await.unwrap();
        let b_to_a = b.create_connection(&a.local_addr().unwrap().to_string()).await.unwrap();
        let c_to_b = c.create_connection(&b.local_addr().unwrap().to_string()).await.unwrap();

        c_to_b.send(b"unknown").await.unwrap();
        a_to_b.send(b"ping").await.unwrap();
        let got = b_to_a.receive(Duration::from_secs(2)).await.unwrap();
        assert_eq!(got, b"ping");
        assert!(b_to_a.receive(Duration::from_millis(100)).await.is_err());
        assert_eq!(a_to_b.remote_address(), b.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_bad_address() {
        let a = Transport::new("127.0.0.1:0").await.unwrap();
        assert!(a.create_connection("not an address").await.is_err());
        let a_to_a = a.create_connection(&a.local_addr().unwrap().to_string()).await.unwrap();
        assert!(a_to_a.send(&[0u8; MAX_DATAGRAM_SIZE + 1]).await.is_err());
    }
}
