//! Handshake and teardown tracking for a captured connection
//!
//! The machine only follows the passive view of the service side: it moves
//! through the three-way handshake to `Established`, where reassembly
//! buffers exist, and through the service-side close to `Closed`, where they
//! are released. Any event without a table entry leaves the state alone.

use crate::packet::{Direction, ParsedPacket, TcpFlags};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Listen,
    SynReceived1,
    SynReceived2,
    Established,
    CloseWait,
    LastAck,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    ReceiveSyn,
    SendSynAck,
    ReceiveAck,
    ReceiveFin,
    SendAck,
    SendFin,
    ReceiveRst,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Listen => "LISTEN",
            State::SynReceived1 => "SYN_RECEIVED_1",
            State::SynReceived2 => "SYN_RECEIVED_2",
            State::Established => "ESTABLISHED",
            State::CloseWait => "CLOSE_WAIT",
            State::LastAck => "LAST_ACK",
            State::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Event::ReceiveSyn => "RECEIVE_SYN",
            Event::SendSynAck => "SEND_SYN_ACK",
            Event::ReceiveAck => "RECEIVE_ACK",
            Event::ReceiveFin => "RECEIVE_FIN",
            Event::SendAck => "SEND_ACK",
            Event::SendFin => "SEND_FIN",
            Event::ReceiveRst => "RECEIVE_RST",
        };
        f.write_str(name)
    }
}

impl Event {
    /// Derive the control event for a packet, seen from the service side.
    ///
    /// Returns `None` for flag combinations the machine has no event for,
    /// such as an outbound bare SYN.
    pub fn from_packet(packet: &ParsedPacket) -> Option<Event> {
        let flags = packet.flags;

        if flags.contains(TcpFlags::RST) {
            return Some(Event::ReceiveRst);
        }

        match packet.direction {
            Direction::Inbound => {
                if flags.contains(TcpFlags::SYN) {
                    (!flags.contains(TcpFlags::ACK)).then_some(Event::ReceiveSyn)
                } else if flags.contains(TcpFlags::FIN) {
                    Some(Event::ReceiveFin)
                } else if flags.contains(TcpFlags::ACK) {
                    Some(Event::ReceiveAck)
                } else {
                    None
                }
            }
            Direction::Outbound => {
                if flags.contains(TcpFlags::SYN) {
                    flags.contains(TcpFlags::ACK).then_some(Event::SendSynAck)
                } else if flags.contains(TcpFlags::FIN) {
                    Some(Event::SendFin)
                } else if flags.contains(TcpFlags::ACK) {
                    Some(Event::SendAck)
                } else {
                    None
                }
            }
        }
    }
}

/// The transition table. `None` means the event is a no-op in `from`.
pub fn next_state(from: State, event: Event) -> Option<State> {
    use Event::*;
    use State::*;

    match (from, event) {
        (Listen, ReceiveSyn) => Some(SynReceived1),
        (SynReceived1, SendSynAck) => Some(SynReceived2),
        (SynReceived2, ReceiveAck) => Some(Established),
        (Established, ReceiveFin) => Some(CloseWait),
        (CloseWait, SendFin) => Some(LastAck),
        (LastAck, ReceiveAck) => Some(Closed),
        (Established, ReceiveRst) | (Listen, ReceiveRst) => Some(Closed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Utc;

    fn packet(direction: Direction, flags: TcpFlags) -> ParsedPacket {
        let (source, destination) = match direction {
            Direction::Inbound => ("10.0.0.2:40000", "10.0.0.1:50051"),
            Direction::Outbound => ("10.0.0.1:50051", "10.0.0.2:40000"),
        };
        ParsedPacket {
            source: source.parse().unwrap(),
            destination: destination.parse().unwrap(),
            seq: 0,
            ack: 0,
            flags,
            payload: Bytes::new(),
            direction,
            timestamp: Utc::now(),
        }
    }

    fn run(events: &[Event]) -> State {
        events.iter().fold(State::Listen, |state, &event| {
            next_state(state, event).unwrap_or(state)
        })
    }

    #[test]
    fn test_handshake_reaches_established() {
        assert_eq!(
            run(&[Event::ReceiveSyn, Event::SendSynAck, Event::ReceiveAck]),
            State::Established
        );
    }

    #[test]
    fn test_out_of_order_events_do_not_skip_states() {
        assert_eq!(next_state(State::Listen, Event::SendSynAck), None);
        assert_eq!(next_state(State::Listen, Event::ReceiveAck), None);
        assert_eq!(next_state(State::SynReceived1, Event::ReceiveAck), None);
        assert_eq!(run(&[Event::ReceiveSyn, Event::ReceiveAck]), State::SynReceived1);
        assert_eq!(
            run(&[Event::SendSynAck, Event::ReceiveSyn, Event::ReceiveAck]),
            State::SynReceived1
        );
    }

    #[test]
    fn test_teardown_and_reset() {
        let established = run(&[Event::ReceiveSyn, Event::SendSynAck, Event::ReceiveAck]);
        assert_eq!(next_state(established, Event::ReceiveRst), Some(State::Closed));
        assert_eq!(next_state(State::Listen, Event::ReceiveRst), Some(State::Closed));
        assert_eq!(next_state(State::SynReceived1, Event::ReceiveRst), None);

        assert_eq!(
            run(&[
                Event::ReceiveSyn,
                Event::SendSynAck,
                Event::ReceiveAck,
                Event::ReceiveFin,
                Event::SendAck,
                Event::SendFin,
                Event::ReceiveAck,
            ]),
            State::Closed
        );
        assert_eq!(next_state(State::Closed, Event::ReceiveSyn), None);
    }

    #[test]
    fn test_event_from_flags() {
        use Direction::*;

        let cases = [
            (Inbound, TcpFlags::SYN, Some(Event::ReceiveSyn)),
            (Outbound, TcpFlags::SYN | TcpFlags::ACK, Some(Event::SendSynAck)),
            (Inbound, TcpFlags::ACK, Some(Event::ReceiveAck)),
            (Inbound, TcpFlags::FIN | TcpFlags::ACK, Some(Event::ReceiveFin)),
            (Outbound, TcpFlags::ACK, Some(Event::SendAck)),
            (Outbound, TcpFlags::FIN | TcpFlags::ACK, Some(Event::SendFin)),
            (Outbound, TcpFlags::RST, Some(Event::ReceiveRst)),
            (Inbound, TcpFlags::RST | TcpFlags::ACK, Some(Event::ReceiveRst)),
            (Inbound, TcpFlags::SYN | TcpFlags::ACK, None),
            (Outbound, TcpFlags::SYN, None),
            (Inbound, TcpFlags::empty(), None),
        ];

        for (direction, flags, expected) in cases {
            assert_eq!(
                Event::from_packet(&packet(direction, flags)),
                expected,
                "{:?} {:?}",
                direction,
                flags
            );
        }
    }

    #[test]
    fn test_display_names() {
        assert_eq!(State::SynReceived2.to_string(), "SYN_RECEIVED_2");
        assert_eq!(Event::SendSynAck.to_string(), "SEND_SYN_ACK");
    }
}
