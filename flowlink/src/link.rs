//! Datagram link: framing, peer admission and inbound dispatch.
//!
//! Wraps a [`Transport`] with the pieces every role needs:
//!
//! - outbound frames are `[type][payload]`; send failures are logged and
//!   counted, never returned
//! - admitting a peer clears any previous entry first, so re-admission is an
//!   idempotent refresh of the radio's peer-table slot
//! - inbound frames are routed by their type byte to an ordered list of
//!   handlers; every handler registered for the type fires, in registration
//!   order, with the type byte stripped

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::Cell;

use log::{debug, warn};

use crate::traits::Transport;
use crate::types::{Error, MacAddr, MessageType, NodeId};
use crate::wire::{split_frame, Message};

/// Inbound frame with its type byte already parsed off.
#[derive(Clone, Copy, Debug)]
pub struct Inbound<'a> {
    pub from: NodeId,
    pub kind: MessageType,
    pub payload: &'a [u8],
}

impl Inbound<'_> {
    /// Decode the payload into a typed message.
    pub fn message(&self) -> Result<Message, crate::wire::DecodeError> {
        Message::decode_payload(self.kind, self.payload)
    }
}

/// Frame counters.
#[derive(Debug, Default)]
pub struct LinkMetrics {
    frames_sent: Cell<u32>,
    send_failures: Cell<u32>,
    frames_received: Cell<u32>,
    frames_dropped: Cell<u32>,
}

impl LinkMetrics {
    fn bump(counter: &Cell<u32>) {
        counter.set(counter.get().wrapping_add(1));
    }

    /// Frames the radio accepted.
    pub fn frames_sent(&self) -> u32 {
        self.frames_sent.get()
    }

    pub fn send_failures(&self) -> u32 {
        self.send_failures.get()
    }

    /// Well-formed inbound frames.
    pub fn frames_received(&self) -> u32 {
        self.frames_received.get()
    }

    /// Inbound frames dropped as malformed or unhandled.
    pub fn frames_dropped(&self) -> u32 {
        self.frames_dropped.get()
    }
}

/// Ordered handler lists keyed by message type.
pub struct HandlerTable<H> {
    entries: BTreeMap<MessageType, Vec<H>>,
    max_per_type: usize,
}

impl<H> HandlerTable<H> {
    pub fn new(max_per_type: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            max_per_type,
        }
    }

    /// Append `handler` to the list for `kind`.
    pub fn register(&mut self, kind: MessageType, handler: H) -> Result<(), Error> {
        let list = self.entries.entry(kind).or_default();
        if list.len() >= self.max_per_type {
            return Err(Error::HandlerTableFull(kind));
        }
        list.push(handler);
        Ok(())
    }

    /// Handlers for `kind`, in registration order.
    pub fn handlers(&self, kind: MessageType) -> &[H] {
        self.entries.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// A transport plus framing, admission and dispatch.
pub struct Link<T, H> {
    transport: T,
    handlers: HandlerTable<H>,
    metrics: LinkMetrics,
}

impl<T: Transport, H> Link<T, H> {
    pub fn new(transport: T, max_handlers_per_type: usize) -> Self {
        Self {
            transport,
            handlers: HandlerTable::new(max_handlers_per_type),
            metrics: LinkMetrics::default(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn metrics(&self) -> &LinkMetrics {
        &self.metrics
    }

    /// Best-effort send of `[kind][payload]` to `to`.
    pub fn send(&self, to: &NodeId, kind: MessageType, payload: &[u8]) {
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(kind.as_u8());
        frame.extend_from_slice(payload);

        match self.transport.send(to, &frame) {
            Ok(()) => {
                LinkMetrics::bump(&self.metrics.frames_sent);
                debug!("tx {:?} to {} ({} bytes)", kind, MacAddr(*to), frame.len());
            }
            Err(e) => {
                LinkMetrics::bump(&self.metrics.send_failures);
                warn!("send {:?} to {} failed: {:?}", kind, MacAddr(*to), e);
            }
        }
    }

    pub fn send_message(&self, to: &NodeId, msg: &Message) {
        self.send(to, msg.message_type(), &msg.encode_payload());
    }

    /// Admit `addr` as a transport peer, clearing any previous entry first.
    pub fn admit(&self, addr: &NodeId) -> Result<(), Error> {
        let _ = self.transport.remove_peer(addr);
        self.transport.add_peer(addr).map_err(|e| {
            warn!("admit {} failed: {:?}", MacAddr(*addr), e);
            Error::PeerRejected(MacAddr(*addr))
        })
    }

    /// Release `addr`'s peer slot. Unknown addresses are ignored.
    pub fn evict(&self, addr: &NodeId) {
        if let Err(e) = self.transport.remove_peer(addr) {
            debug!("evict {}: {:?}", MacAddr(*addr), e);
        }
    }

    pub fn register_handler(&mut self, kind: MessageType, handler: H) -> Result<(), Error> {
        self.handlers.register(kind, handler)
    }

    pub fn handlers(&self, kind: MessageType) -> &[H] {
        self.handlers.handlers(kind)
    }

    /// Parse one raw datagram and hand it to every handler registered for its type.
    ///
    /// Returns the number of handlers invoked. Frames with an unknown type
    /// byte, or with no handler, are dropped.
    pub fn dispatch<F>(&self, from: &NodeId, data: &[u8], mut f: F) -> usize
    where
        F: FnMut(&H, Inbound<'_>),
    {
        let (kind, payload) = match split_frame(data) {
            Ok(parts) => parts,
            Err(e) => {
                LinkMetrics::bump(&self.metrics.frames_dropped);
                warn!("drop frame from {}: {}", MacAddr(*from), e);
                return 0;
            }
        };

        let handlers = self.handlers.handlers(kind);
        if handlers.is_empty() {
            LinkMetrics::bump(&self.metrics.frames_dropped);
            debug!("no handler for {:?} from {}", kind, MacAddr(*from));
            return 0;
        }

        LinkMetrics::bump(&self.metrics.frames_received);
        debug!("rx {:?} from {} ({} bytes)", kind, MacAddr(*from), data.len());
        let inbound = Inbound {
            from: *from,
            kind,
            payload,
        };
        for handler in handlers {
            f(handler, inbound);
        }
        handlers.len()
    }

    /// Count a frame that parsed at the link level but failed payload decoding.
    pub fn note_malformed(&self, inbound: &Inbound<'_>, err: crate::wire::DecodeError) {
        LinkMetrics::bump(&self.metrics.frames_dropped);
        warn!(
            "malformed {:?} from {}: {}",
            inbound.kind,
            MacAddr(inbound.from),
            err
        );
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::traits::test_impls::MockTransport;

    const A: NodeId = [0xA0, 0, 0, 0, 0, 1];
    const B: NodeId = [0xB0, 0, 0, 0, 0, 2];

    fn link() -> Link<MockTransport, u8> {
        Link::new(MockTransport::new(), 4)
    }

    #[test]
    fn test_send_prepends_type_byte() {
        let link = link();
        link.admit(&A).unwrap();
        link.send(&A, MessageType::DataRequest, &[]);
        link.send_message(&A, &Message::PairConfirm { success: true });
        assert_eq!(
            link.transport().take_sent(),
            vec![(A, vec![0x11]), (A, vec![0x90, 1])]
        );
        assert_eq!(link.metrics().frames_sent(), 2);
    }

    #[test]
    fn test_send_failure_is_only_counted() {
        let link = link();
        // B was never admitted.
        link.send(&B, MessageType::DataRequest, &[]);
        link.admit(&A).unwrap();
        link.transport().set_fail_sends(true);
        link.send(&A, MessageType::DataRequest, &[]);
        assert_eq!(link.metrics().send_failures(), 2);
        assert!(link.transport().take_sent().is_empty());
    }

    #[test]
    fn test_readmission_is_idempotent() {
        let link = link();
        link.admit(&A).unwrap();
        link.admit(&B).unwrap();
        link.admit(&A).unwrap();
        assert_eq!(link.transport().peers(), vec![B, A]);
        link.evict(&A);
        link.evict(&A);
        assert_eq!(link.transport().peers(), vec![B]);
    }

    #[test]
    fn test_all_handlers_fire_in_registration_order() {
        let mut link = link();
        link.register_handler(MessageType::DataResponse, 1).unwrap();
        link.register_handler(MessageType::DataRequest, 9).unwrap();
        link.register_handler(MessageType::DataResponse, 2).unwrap();
        link.register_handler(MessageType::DataResponse, 3).unwrap();

        let mut seen = Vec::new();
        let fired = link.dispatch(&A, &[0x91, 0], |h, inbound| {
            assert_eq!(inbound.from, A);
            assert_eq!(inbound.kind, MessageType::DataResponse);
            assert_eq!(inbound.payload, &[0]);
            seen.push(*h);
        });
        assert_eq!(fired, 3);
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(link.metrics().frames_received(), 1);
    }

    #[test]
    fn test_handler_table_capacity() {
        let mut link: Link<MockTransport, u8> = Link::new(MockTransport::new(), 1);
        link.register_handler(MessageType::PairRequest, 0).unwrap();
        assert_eq!(
            link.register_handler(MessageType::PairRequest, 1),
            Err(Error::HandlerTableFull(MessageType::PairRequest))
        );
        // Other types have their own list.
        assert!(link.register_handler(MessageType::PairConfirm, 1).is_ok());
    }

    #[test]
    fn test_unknown_and_unhandled_frames_dropped() {
        let mut link = link();
        link.register_handler(MessageType::PairRequest, 0).unwrap();
        let mut calls = 0;
        assert_eq!(link.dispatch(&A, &[0x42], |_, _| calls += 1), 0);
        assert_eq!(link.dispatch(&A, &[], |_, _| calls += 1), 0);
        assert_eq!(link.dispatch(&A, &[0x11], |_, _| calls += 1), 0);
        assert_eq!(calls, 0);
        assert_eq!(link.metrics().frames_dropped(), 3);
    }

    #[test]
    fn test_inbound_decodes_payload() {
        let mut link = link();
        link.register_handler(MessageType::PairConfirm, 0).unwrap();
        link.dispatch(&B, &[0x90, 1], |_, inbound| {
            assert_eq!(inbound.message(), Ok(Message::PairConfirm { success: true }));
        });
    }
}
