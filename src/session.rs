use anyhow::Result;
use byteorder::{LittleEndian, WriteBytesExt};

use crate::{
    error::CounterError,
    local_counter::LocalMessageCounter,
    messages::{self, Destination, Message},
    peer_counter::PeerMessageCounter,
    util::cryptoutil::{self, SessionKey},
};

/// Result of decoding an incoming message.
#[derive(Debug)]
pub enum Inbound {
    /// Authenticated and recorded in the peer counter.
    Accepted(Message),
    /// Authenticated, but its counter was seen before or is too old.
    /// Only useful to re-send a lost ack.
    Duplicate(Message),
    /// Authenticated while the peer counter is not synchronized; counter not recorded.
    Unsynchronized(Message),
}

impl Inbound {
    pub fn message(&self) -> &Message {
        match self {
            Inbound::Accepted(m) | Inbound::Duplicate(m) | Inbound::Unsynchronized(m) => m,
        }
    }
}

pub struct Session {
    /// session id used by peer, put into outgoing messages
    pub session_id: u16,
    /// session id we expect in incoming messages
    pub my_session_id: u16,
    pub local_node: Option<[u8; 8]>,
    pub remote_node: Option<[u8; 8]>,
    encrypt_key: Option<SessionKey>,
    decrypt_key: Option<SessionKey>,
    local_counter: LocalMessageCounter,
    peer_counter: PeerMessageCounter,
}

impl Session {
    pub fn new() -> Self {
        Self {
            session_id: 0,
            my_session_id: 0,
            local_node: Some([0; 8]),
            remote_node: None,
            encrypt_key: None,
            decrypt_key: None,
            local_counter: LocalMessageCounter::new(),
            peer_counter: PeerMessageCounter::new(),
        }
    }

    pub fn set_encrypt_key(&mut self, k: &[u8]) -> Result<()> {
        self.encrypt_key = Some(Self::key(k)?);
        Ok(())
    }

    pub fn set_decrypt_key(&mut self, k: &[u8]) -> Result<()> {
        self.decrypt_key = Some(Self::key(k)?);
        Ok(())
    }

    fn key(k: &[u8]) -> Result<SessionKey> {
        if k.len() != 16 {
            anyhow::bail!("session key must be 16 bytes, got {}", k.len());
        }
        Ok(*SessionKey::from_slice(k))
    }

    pub fn is_secure(&self) -> bool {
        self.decrypt_key.is_some()
    }

    pub fn local_counter(&self) -> &LocalMessageCounter {
        &self.local_counter
    }

    pub fn set_local_counter(&mut self, counter: LocalMessageCounter) {
        self.local_counter = counter;
    }

    pub fn peer_counter(&self) -> &PeerMessageCounter {
        &self.peer_counter
    }

    pub fn peer_counter_mut(&mut self) -> &mut PeerMessageCounter {
        &mut self.peer_counter
    }

    /// Prefix `data` (protocol header + payload) with message header and encrypt it.
    pub fn encode_message(&self, data: &[u8]) -> Result<Vec<u8>> {
        let counter = self.local_counter.advance()?;
        let header = messages::MessageHeader {
            session_id: self.session_id,
            security_flags: 0,
            message_counter: counter,
            source_node_id: self.local_node,
            destination: self.remote_node.map(Destination::Node),
        };
        let mut out = header.encode()?;
        match &self.encrypt_key {
            Some(key) => {
                let nonce = Self::make_nonce(header.security_flags, counter, self.local_node.as_ref())?;
                let enc = cryptoutil::aes128_ccm_encrypt(key, &nonce, &out, data)?;
                out.extend_from_slice(&enc);
            }
            None => out.extend_from_slice(data),
        };
        Ok(out)
    }

    /// Decode incoming message.
    ///
    /// The counter is checked before the message is authenticated and recorded
    /// only after authentication succeeded. Errors mean the message must be dropped.
    pub fn decode_message(&mut self, data: &[u8]) -> Result<Inbound> {
        let Some(key) = self.decrypt_key else {
            return Ok(Inbound::Accepted(Message::decode(data)?));
        };
        let (header, rest) = messages::MessageHeader::decode(data)?;
        if header.session_id != self.my_session_id {
            anyhow::bail!(
                "session id mismatch. expected:{} got:{}",
                self.my_session_id,
                header.session_id
            );
        }
        let counter = header.message_counter;
        let verified = if self.peer_counter.is_sync_completed() {
            Some(self.peer_counter.verify(counter))
        } else {
            None
        };

        let aad = &data[..data.len() - rest.len()];
        let nonce = Self::make_nonce(header.security_flags, counter, self.remote_node.as_ref())?;
        let plain = cryptoutil::aes128_ccm_decrypt(&key, &nonce, aad, rest)?;
        let mut decoded = Vec::with_capacity(aad.len() + plain.len());
        decoded.extend_from_slice(aad);
        decoded.extend_from_slice(&plain);
        let message = Message::decode(&decoded)?;

        match verified {
            None => {
                log::trace!("counter {} received before peer counter sync", counter);
                Ok(Inbound::Unsynchronized(message))
            }
            Some(Err(CounterError::InvalidArgument)) => {
                log::trace!("duplicate message counter {}", counter);
                Ok(Inbound::Duplicate(message))
            }
            Some(Err(e)) => Err(e.into()),
            Some(Ok(())) => {
                self.peer_counter.commit(counter)?;
                Ok(Inbound::Accepted(message))
            }
        }
    }

    fn make_nonce(security_flags: u8, counter: u32, node: Option<&[u8; 8]>) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(cryptoutil::NONCE_LEN);
        out.write_u8(security_flags)?;
        out.write_u32::<LittleEndian>(counter)?;
        out.extend_from_slice(node.unwrap_or(&[0; 8]));
        Ok(out)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::messages::ProtocolMessageHeader;

    const KEY_A: [u8; 16] = [1; 16];
    const KEY_B: [u8; 16] = [2; 16];

    /// Pair of sessions talking to each other.
    pub(crate) fn session_pair() -> (Session, Session) {
        let mut a = Session::new();
        let mut b = Session::new();
        a.session_id = 200;
        a.my_session_id = 100;
        b.session_id = 100;
        b.my_session_id = 200;
        a.local_node = Some([0xa; 8]);
        a.remote_node = Some([0xb; 8]);
        b.local_node = Some([0xb; 8]);
        b.remote_node = Some([0xa; 8]);
        a.set_encrypt_key(&KEY_A).unwrap();
        b.set_decrypt_key(&KEY_A).unwrap();
        b.set_encrypt_key(&KEY_B).unwrap();
        a.set_decrypt_key(&KEY_B).unwrap();
        (a, b)
    }

    fn payload(exchange: u16) -> Vec<u8> {
        let mut out = ProtocolMessageHeader::new(exchange, 1, 2, ProtocolMessageHeader::FLAG_INITIATOR)
            .encode()
            .unwrap();
        out.extend_from_slice(b"hello");
        out
    }

    #[test]
    fn test_accept_and_duplicate() {
        let (a, mut b) = session_pair();
        let first = a.local_counter().value();
        b.peer_counter_mut().set_counter(first);
        let m1 = a.encode_message(&payload(1)).unwrap();
        let m2 = a.encode_message(&payload(2)).unwrap();

        match b.decode_message(&m2).unwrap() {
            Inbound::Accepted(m) => {
                assert_eq!(m.protocol_header.exchange_id, 2);
                assert_eq!(m.payload, b"hello");
                assert_eq!(m.message_header.message_counter, first + 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(b.decode_message(&m1).unwrap(), Inbound::Accepted(_)));
        assert!(matches!(b.decode_message(&m1).unwrap(), Inbound::Duplicate(_)));
        assert!(matches!(b.decode_message(&m2).unwrap(), Inbound::Duplicate(_)));
        assert_eq!(b.peer_counter().max_counter(), Some(first + 1));
    }

    #[test]
    fn test_forged_message_does_not_move_window() {
        let (a, mut b) = session_pair();
        b.peer_counter_mut().set_counter(a.local_counter().value());
        let good = a.encode_message(&payload(1)).unwrap();

        // same header with counter far ahead, payload not matching the tag
        let mut forged = good.clone();
        forged[4..8].copy_from_slice(&(a.local_counter().value() + 1000).to_le_bytes());
        assert!(b.decode_message(&forged).is_err());
        let max = b.peer_counter().max_counter();

        let mut tampered = good.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x55;
        assert!(b.decode_message(&tampered).is_err());
        assert_eq!(b.peer_counter().max_counter(), max);
        assert!(matches!(b.decode_message(&good).unwrap(), Inbound::Accepted(_)));
    }

    #[test]
    fn test_unsynchronized() {
        let (a, mut b) = session_pair();
        let m = a.encode_message(&payload(3)).unwrap();
        match b.decode_message(&m).unwrap() {
            Inbound::Unsynchronized(m) => assert_eq!(m.protocol_header.exchange_id, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!b.peer_counter().is_sync_started());
    }

    #[test]
    fn test_session_id_mismatch() {
        let (a, mut b) = session_pair();
        b.my_session_id = 5;
        let m = a.encode_message(&payload(3)).unwrap();
        assert!(b.decode_message(&m).is_err());
    }

    #[test]
    fn test_unsecured_passthrough() {
        let a = Session::new();
        let mut b = Session::new();
        let m = a.encode_message(&payload(9)).unwrap();
        assert!(!b.is_secure());
        match b.decode_message(&m).unwrap() {
            Inbound::Accepted(m) => assert_eq!(m.payload, b"hello"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bad_key_length() {
        let mut s = Session::new();
        assert!(s.set_encrypt_key(&[0; 15]).is_err());
    }
}
