//! Link protocol engine
//!
//! One `Link` runs each end of a serial connection. The receive side reassembles packets from an
//! `InputBuffer`, rejects damaged ones with a NACK, suppresses retransmitted duplicates through
//! the flip-flop bit and dispatches new ones to a `PacketHandler`. The send side keeps a single
//! packet in flight and retransmits it verbatim on NACK or timeout until a retry budget runs out.

use crate::input_buffer::InputBuffer;
use crate::output_buffer::{OutputBuffer, ScratchOutput};
use crate::packet::{self, Frame, Packet};
use crate::protocol::{control, event, Reply};
use crate::transport_output::TransportOutput;
use log::{debug, error, warn};

/// Timing and retry parameters of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    /// Age in µs after which a partially received packet is discarded
    pub rx_timeout_us: u32,
    /// Time in µs after which an unacknowledged packet is sent again
    pub resend_timeout_us: u32,
    /// Retransmissions of one packet before the link is declared failed
    pub max_retries: u8,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            rx_timeout_us: 2_000,
            resend_timeout_us: 20_000,
            max_retries: 5,
        }
    }
}

/// Fatal link failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("no acknowledgement after {0} retransmissions")]
    RetriesExhausted(u8),
}

/// Outcome of a packet this end sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Ack,
    AckWait,
    Stall,
    /// The peer acknowledged a RESET request
    Reset,
}

/// Receiver of packets accepted by the link
pub trait PacketHandler {
    /// Applies a new packet and decides the reply
    ///
    /// Called at most once per distinct packet.
    fn handle(&mut self, command: u8, payload: &[u8]) -> Reply;

    /// The peer reset the link or announced a restart
    fn link_reset(&mut self) {}
}

/// Supplier of packets to transmit
pub trait PacketSource {
    /// Returns the next packet to send, called only while nothing is in flight
    fn next_packet(&mut self) -> Option<Packet>;
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    sent_at: u32,
    retries: u8,
    is_reset: bool,
}

/// Protocol link implementation
pub struct Link<O: TransportOutput> {
    output: O,
    config: LinkConfig,
    in_flipflop: bool,
    out_flipflop: bool,
    last_reply: u8,
    rx_started: Option<u32>,
    in_flight: Option<InFlight>,
    last_sent: ScratchOutput,
    delivery: Option<Delivery>,
    failed: bool,
}

impl<O: TransportOutput> Link<O> {
    pub fn new(output: O, config: LinkConfig) -> Self {
        Link {
            output,
            config,
            in_flipflop: false,
            out_flipflop: false,
            last_reply: control::ACK,
            rx_started: None,
            in_flight: None,
            last_sent: ScratchOutput::new(),
            delivery: None,
            failed: false,
        }
    }

    pub fn output(&mut self) -> &mut O {
        &mut self.output
    }

    /// True when no packet is waiting for its acknowledgement
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Takes the outcome of the last completed transmission
    pub fn take_delivery(&mut self) -> Option<Delivery> {
        self.delivery.take()
    }

    /// Clears all link state, including a failure
    pub fn reset(&mut self) {
        self.in_flipflop = false;
        self.out_flipflop = false;
        self.last_reply = control::ACK;
        self.rx_started = None;
        self.in_flight = None;
        self.delivery = None;
        self.failed = false;
    }

    /// Announces a (re)started endpoint to the peer
    pub fn announce(&mut self) {
        self.reset();
        self.output.output(&[control::INIT]);
    }

    /// Asks the peer to reset its link state; completes with `Delivery::Reset`
    pub fn reset_request(&mut self, now: u32) {
        self.reset();
        self.last_sent.reset();
        self.last_sent.output_byte(control::RESET);
        self.output.output(self.last_sent.result());
        self.in_flight = Some(InFlight {
            sent_at: now,
            retries: 0,
            is_reset: true,
        });
    }

    /// Decodes packets and control codes from an `InputBuffer`
    ///
    /// Consumed bytes are popped from `input`; an incomplete packet stays in place.
    pub fn receive(
        &mut self,
        input: &mut impl InputBuffer,
        now: u32,
        handler: &mut impl PacketHandler,
    ) -> Result<(), LinkError> {
        let mut result = Ok(());
        let mut data = input.data();
        while let Some(&first) = data.first() {
            if first & packet::FLIPFLOP_BIT != 0 {
                data = &data[1..];
                if let Err(e) = self.handle_control(first, now, handler) {
                    result = Err(e);
                    break;
                }
                continue;
            }

            let len = first as usize;
            if !packet::is_valid_length(len) {
                warn!("invalid packet length {len}, flushing input");
                data = &[];
                self.rx_started = None;
                self.output.output(&[control::NACK]);
                break;
            }

            let wire_len = packet::wire_length(len);
            if data.len() < wire_len {
                let started = *self.rx_started.get_or_insert(now);
                if now.wrapping_sub(started) > self.config.rx_timeout_us {
                    warn!("discarding stalled partial packet ({} bytes)", data.len());
                    data = &[];
                    self.rx_started = None;
                    self.output.output(&[control::NACK]);
                }
                break;
            }

            self.rx_started = None;
            let (wire, rest) = data.split_at(wire_len);
            data = rest;
            match packet::decode(wire) {
                Ok(frame) => self.accept(frame, handler),
                Err(e) => {
                    warn!("rejecting packet: {e}");
                    self.output.output(&[control::NACK]);
                }
            }
        }

        let remaining = data.len();
        let consumed = input.available() - remaining;
        if consumed > 0 {
            input.pop(consumed);
        }
        result
    }

    fn accept(&mut self, frame: Frame<'_>, handler: &mut impl PacketHandler) {
        if frame.flipflop != self.in_flipflop {
            debug!("duplicate of command {:#04x}, repeating reply", frame.command);
            self.output.output(&[self.last_reply]);
            return;
        }
        self.in_flipflop = !self.in_flipflop;
        let reply = handler.handle(frame.command, frame.payload);
        if reply == Reply::Stall {
            warn!("stalled command {:#04x}", frame.command);
        }
        self.last_reply = reply.code();
        self.output.output(&[self.last_reply]);
    }

    fn handle_control(
        &mut self,
        code: u8,
        now: u32,
        handler: &mut impl PacketHandler,
    ) -> Result<(), LinkError> {
        match code {
            control::ACK => self.complete(Delivery::Ack),
            control::ACKWAIT => self.complete(Delivery::AckWait),
            control::STALL => self.complete(Delivery::Stall),
            control::NACK => {
                if self.in_flight.is_some() {
                    debug!("nack, retransmitting");
                    return self.retransmit(now);
                }
            }
            control::RESET => {
                debug!("peer requested link reset");
                self.reset();
                handler.link_reset();
                self.output.output(&[control::ACKRESET]);
            }
            control::INIT => {
                debug!("peer restarted");
                self.reset();
                handler.link_reset();
            }
            control::ACKRESET => {
                if matches!(self.in_flight, Some(InFlight { is_reset: true, .. })) {
                    self.in_flight = None;
                    self.delivery = Some(Delivery::Reset);
                }
            }
            other => warn!("ignoring unknown control code {other:#04x}"),
        }
        Ok(())
    }

    fn complete(&mut self, delivery: Delivery) {
        match self.in_flight {
            Some(InFlight {
                is_reset: false, ..
            }) => {
                self.in_flight = None;
                self.out_flipflop = !self.out_flipflop;
                self.delivery = Some(delivery);
            }
            _ => debug!("ignoring stray {delivery:?}"),
        }
    }

    fn retransmit(&mut self, now: u32) -> Result<(), LinkError> {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return Ok(());
        };
        in_flight.retries += 1;
        if in_flight.retries > self.config.max_retries {
            error!("link failed after {} retransmissions", self.config.max_retries);
            self.failed = true;
            self.in_flight = None;
            return Err(LinkError::RetriesExhausted(self.config.max_retries));
        }
        in_flight.sent_at = now;
        self.output.output(self.last_sent.result());
        Ok(())
    }

    /// Drives the send side: retransmits on timeout or sends the next packet
    pub fn poll_send(
        &mut self,
        now: u32,
        source: &mut impl PacketSource,
    ) -> Result<(), LinkError> {
        if self.failed {
            return Err(LinkError::RetriesExhausted(self.config.max_retries));
        }
        if let Some(in_flight) = self.in_flight {
            if now.wrapping_sub(in_flight.sent_at) > self.config.resend_timeout_us {
                debug!("acknowledgement timeout, retransmitting");
                return self.retransmit(now);
            }
            return Ok(());
        }
        if let Some(packet) = source.next_packet() {
            self.send(&packet, now);
        }
        Ok(())
    }

    /// Transmits `packet` immediately; the link must be idle
    pub fn send(&mut self, packet: &Packet, now: u32) {
        debug_assert!(self.in_flight.is_none());
        self.last_sent.reset();
        packet.encode(self.out_flipflop, &mut self.last_sent);
        self.output.output(self.last_sent.result());
        self.in_flight = Some(InFlight {
            sent_at: now,
            retries: 0,
            is_reset: false,
        });
    }

    /// The bytes of the last transmitted packet
    pub fn last_sent(&self) -> &[u8] {
        self.last_sent.result()
    }
}

/// Maximum number of queued LIMIT/SENSE notifications
pub const POSITION_EVENTS: usize = 4;

/// Payload bytes of the position before the change in a SENSE event
const SENSE_BEFORE: core::ops::Range<usize> = 3..7;

/// Pending firmware notifications, sent in strict priority order
///
/// Position callbacks (LIMIT, SENSE) and move callbacks come first, then temperature callbacks,
/// then the reply to an explicit request and last the generic CONTINUE notification.
#[derive(Debug, Default)]
pub struct Outbox {
    position: heapless::Deque<Packet, POSITION_EVENTS>,
    movecb: u32,
    tempcb: u8,
    reply: Option<Packet>,
    continue_pending: bool,
}

impl Outbox {
    pub fn new() -> Self {
        Outbox::default()
    }

    /// Queues a LIMIT or SENSE event
    ///
    /// A full queue makes room by folding a SENSE into the newest SENSE of the same motor, or by
    /// evicting the oldest SENSE. A LIMIT is only ever superseded by a later LIMIT, and only when
    /// the queue holds nothing else.
    pub fn push_position(&mut self, packet: Packet) {
        if !self.position.is_full() {
            let _ = self.position.push_back(packet);
            return;
        }
        if packet.command == event::SENSE {
            let same_motor = self
                .position
                .iter_mut()
                .filter(|q| q.command == event::SENSE && q.payload.get(..2) == packet.payload.get(..2))
                .last();
            if let Some(queued) = same_motor {
                // Keep the first position before the change, take state and final position.
                let mut merged = packet;
                if let (Some(before), Some(slot)) =
                    (queued.payload.get(SENSE_BEFORE), merged.payload.get_mut(SENSE_BEFORE))
                {
                    slot.copy_from_slice(before);
                }
                *queued = merged;
                return;
            }
        }
        if self.evict_oldest_sense() {
            let _ = self.position.push_back(packet);
        } else if packet.command == event::LIMIT {
            warn!("position event queue holds only limits, replacing the newest");
            if let Some(last) = self.position.back_mut() {
                *last = packet;
            }
        } else {
            warn!("position event queue holds only limits, dropping sense event");
        }
    }

    fn evict_oldest_sense(&mut self) -> bool {
        let Some(index) = self.position.iter().position(|p| p.command == event::SENSE) else {
            return false;
        };
        warn!("position event queue full, dropping oldest sense event");
        let mut kept = heapless::Deque::new();
        for (i, packet) in self.position.iter().enumerate() {
            if i != index {
                let _ = kept.push_back(packet.clone());
            }
        }
        self.position = kept;
        true
    }

    pub fn add_movecb(&mut self, count: u32) {
        self.movecb = self.movecb.saturating_add(count);
    }

    pub fn set_tempcb(&mut self, temp: u8) {
        self.tempcb |= 1 << (temp & 7);
    }

    /// Stores the reply to a request; hands it back if a previous reply is still pending
    pub fn set_reply(&mut self, packet: Packet) -> Result<(), Packet> {
        if self.reply.is_some() {
            return Err(packet);
        }
        self.reply = Some(packet);
        Ok(())
    }

    pub fn has_reply(&self) -> bool {
        self.reply.is_some()
    }

    pub fn request_continue(&mut self) {
        self.continue_pending = true;
    }

    pub fn pending_movecb(&self) -> u32 {
        self.movecb
    }

    pub fn clear(&mut self) {
        *self = Outbox::default();
    }
}

impl PacketSource for Outbox {
    fn next_packet(&mut self) -> Option<Packet> {
        if let Some(packet) = self.position.pop_front() {
            return Some(packet);
        }
        if self.movecb > 0 {
            let count = self.movecb.min(u8::MAX as u32);
            self.movecb -= count;
            return Some(Packet::new(event::MOVECB).with(count as u8));
        }
        if self.tempcb != 0 {
            let temp = self.tempcb.trailing_zeros() as u8;
            self.tempcb &= !(1 << temp);
            return Some(Packet::new(event::TEMPCB).with(temp));
        }
        if let Some(packet) = self.reply.take() {
            return Some(packet);
        }
        if self.continue_pending {
            self.continue_pending = false;
            return Some(Packet::new(event::CONTINUE));
        }
        None
    }
}
