use crate::channel::Channel;
use anyhow::bail;
use bytes::{Buf, BufMut};
use std::fmt::{Debug, Display, Formatter};

/// Per-peer packet sequence number, assigned strictly increasing from 1.
///  `ZERO` never travels as an assigned number; it is the out-of-band marker
///  used by connectionless packets (server-info) and the ordering filter's
///  initial high-water mark.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn from_raw(value: u64) -> SequenceNumber {
        SequenceNumber(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(self.0 + 1)
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result code carried in a connection response (CRS) packet, and returned
///  from [`Client::connect`](crate::Client::connect).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectCode {
    Success,
    UnsupportedProtocolVersion,
    InvalidAuthentication,
    /// Never sent on the wire: the local outcome of a connect attempt that
    ///  saw no answer within its timeout.
    NoResponse,
}

impl ConnectCode {
    pub fn to_wire(self) -> u32 {
        match self {
            ConnectCode::Success => 0,
            ConnectCode::UnsupportedProtocolVersion => 1,
            ConnectCode::InvalidAuthentication => 2,
            ConnectCode::NoResponse => 3,
        }
    }

    pub fn from_wire(raw: u32) -> anyhow::Result<ConnectCode> {
        match raw {
            0 => Ok(ConnectCode::Success),
            1 => Ok(ConnectCode::UnsupportedProtocolVersion),
            2 => Ok(ConnectCode::InvalidAuthentication),
            3 => Ok(ConnectCode::NoResponse),
            _ => bail!("unknown connect code {}", raw),
        }
    }
}

/// The fixed part of the header: first byte, sequence number, ack count.
pub const HEADER_FIXED_LEN: usize = 1 + 8 + 4;

/// Upper bound for a serialized frame: fixed header, a full ack list, and
///  the largest body (a length prefix plus `max_payload` bytes). Receive
///  buffers are sized from this.
pub fn max_datagram_len(max_payload: usize, ack_capacity: usize) -> usize {
    HEADER_FIXED_LEN + ack_capacity * size_of::<u64>() + size_of::<u32>() + max_payload
}

#[derive(Clone, Eq, PartialEq)]
pub struct PacketHeader {
    pub channel: Channel,
    pub sequence: SequenceNumber,
    /// Recently received reliable sequence numbers the sender acknowledges,
    ///  most recent first. Piggybacked on every packet.
    pub acks: Vec<SequenceNumber>,
}

impl PacketHeader {
    pub fn new(channel: Channel, sequence: SequenceNumber, acks: Vec<SequenceNumber>) -> PacketHeader {
        PacketHeader { channel, sequence, acks }
    }

    fn ser(&self, type_code: u8, buf: &mut impl BufMut) {
        buf.put_u8(type_code | self.channel.bits());
        buf.put_u64_le(self.sequence.to_raw());
        buf.put_u32_le(self.acks.len() as u32);
        for ack in &self.acks {
            buf.put_u64_le(ack.to_raw());
        }
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<(PacketHeader, u8)> {
        let type_and_channel = buf.try_get_u8()?;
        let Some(channel) = Channel::from_bits(type_and_channel & 0xf0) else {
            bail!("unsupported channel flags {:#04x}", type_and_channel & 0xf0);
        };
        let type_code = type_and_channel & 0x0f;

        let sequence = SequenceNumber::from_raw(buf.try_get_u64_le()?);

        let ack_count = buf.try_get_u32_le()? as usize;
        if ack_count * size_of::<u64>() > buf.remaining() {
            bail!("ack list of {} entries overruns the datagram", ack_count);
        }
        let mut acks = Vec::with_capacity(ack_count);
        for _ in 0..ack_count {
            acks.push(SequenceNumber::from_raw(buf.try_get_u64_le()?));
        }

        Ok((PacketHeader { channel, sequence, acks }, type_code))
    }
}

impl Debug for PacketHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}+{}acks", self.channel.label(), self.sequence, self.acks.len())
    }
}

/// A decoded packet body, tagged by the type nibble of the first header byte.
///  Decoding happens once at the edge; everything downstream dispatches with
///  an exhaustive match.
#[derive(Clone, Eq, PartialEq)]
pub enum Packet {
    ConnectionRequest {
        protocol_id: u32,
        /// transmitted as zero and never consulted; reserved
        protocol_version: u32,
    },
    Challenge { challenge: Vec<u8> },
    ChallengeResponse { response: Vec<u8> },
    ConnectionResponse { code: ConnectCode, client_id: u64 },
    KeepAlive,
    ApplicationData { data: Vec<u8> },
    Termination { reason: String },
    TerminationAck,
    ServerInfoRequest,
    ServerInfoResponse { info: Vec<u8> },
}

impl Packet {
    pub fn type_code(&self) -> u8 {
        match self {
            Packet::ConnectionRequest { .. } => 0,
            Packet::Challenge { .. } => 1,
            Packet::ChallengeResponse { .. } => 2,
            Packet::ConnectionResponse { .. } => 3,
            Packet::KeepAlive => 4,
            Packet::ApplicationData { .. } => 5,
            Packet::Termination { .. } => 6,
            Packet::TerminationAck => 7,
            Packet::ServerInfoRequest => 8,
            Packet::ServerInfoResponse { .. } => 9,
        }
    }

    fn ser_body(&self, buf: &mut impl BufMut) {
        match self {
            Packet::ConnectionRequest { protocol_id, protocol_version } => {
                buf.put_u32_le(*protocol_id);
                buf.put_u32_le(*protocol_version);
            }
            Packet::Challenge { challenge } => put_bounded_bytes(buf, challenge),
            Packet::ChallengeResponse { response } => put_bounded_bytes(buf, response),
            Packet::ConnectionResponse { code, client_id } => {
                buf.put_u32_le(code.to_wire());
                buf.put_u64_le(*client_id);
            }
            Packet::KeepAlive => {}
            Packet::ApplicationData { data } => put_bounded_bytes(buf, data),
            Packet::Termination { reason } => put_bounded_bytes(buf, reason.as_bytes()),
            Packet::TerminationAck => {}
            Packet::ServerInfoRequest => {}
            Packet::ServerInfoResponse { info } => put_bounded_bytes(buf, info),
        }
    }

    fn deser_body(type_code: u8, buf: &mut impl Buf, max_payload: usize) -> anyhow::Result<Packet> {
        let packet = match type_code {
            0 => Packet::ConnectionRequest {
                protocol_id: buf.try_get_u32_le()?,
                protocol_version: buf.try_get_u32_le()?,
            },
            1 => Packet::Challenge { challenge: get_bounded_bytes(buf, max_payload)? },
            2 => Packet::ChallengeResponse { response: get_bounded_bytes(buf, max_payload)? },
            3 => Packet::ConnectionResponse {
                code: ConnectCode::from_wire(buf.try_get_u32_le()?)?,
                client_id: buf.try_get_u64_le()?,
            },
            4 => Packet::KeepAlive,
            5 => Packet::ApplicationData { data: get_bounded_bytes(buf, max_payload)? },
            6 => Packet::Termination {
                reason: String::from_utf8(get_bounded_bytes(buf, max_payload)?)
                    .map_err(|_| anyhow::anyhow!("termination reason is not valid UTF-8"))?,
            },
            7 => Packet::TerminationAck,
            8 => Packet::ServerInfoRequest,
            9 => Packet::ServerInfoResponse { info: get_bounded_bytes(buf, max_payload)? },
            other => bail!("unknown packet type {}", other),
        };
        Ok(packet)
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Packet::ConnectionRequest { protocol_id, .. } => write!(f, "CR(proto {})", protocol_id),
            Packet::Challenge { challenge } => write!(f, "CH({}b)", challenge.len()),
            Packet::ChallengeResponse { response } => write!(f, "CHR({}b)", response.len()),
            Packet::ConnectionResponse { code, client_id } => write!(f, "CRS({:?},{})", code, client_id),
            Packet::KeepAlive => write!(f, "KA"),
            Packet::ApplicationData { data } => write!(f, "AD({}b)", data.len()),
            Packet::Termination { reason } => write!(f, "CT({:?})", reason),
            Packet::TerminationAck => write!(f, "CTA"),
            Packet::ServerInfoRequest => write!(f, "SIRQ"),
            Packet::ServerInfoResponse { info } => write!(f, "SIRS({}b)", info.len()),
        }
    }
}

/// One wire datagram: header plus typed body.
#[derive(Clone, Eq, PartialEq)]
pub struct Frame {
    pub header: PacketHeader,
    pub packet: Packet,
}

impl Frame {
    pub fn ser(&self, buf: &mut impl BufMut) {
        self.header.ser(self.packet.type_code(), buf);
        self.packet.ser_body(buf);
    }

    /// Decoding is fail-soft by contract: any error means the datagram is
    ///  dropped by the caller, never answered.
    pub fn deser(buf: &mut impl Buf, max_payload: usize) -> anyhow::Result<Frame> {
        let (header, type_code) = PacketHeader::deser(buf)?;
        let packet = Packet::deser_body(type_code, buf, max_payload)?;
        Ok(Frame { header, packet })
    }
}

impl Debug for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FRM{{{:?} {:?}}}", self.header, self.packet)
    }
}

fn put_bounded_bytes(buf: &mut impl BufMut, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

fn get_bounded_bytes(buf: &mut impl Buf, max_payload: usize) -> anyhow::Result<Vec<u8>> {
    let len = buf.try_get_u32_le()? as usize;
    if len > max_payload {
        bail!("length-prefixed field of {} bytes exceeds the payload bound of {}", len, max_payload);
    }
    if len > buf.remaining() {
        bail!("length-prefixed field of {} bytes overruns the datagram", len);
    }
    let mut data = vec![0u8; len];
    buf.copy_to_slice(&mut data);
    Ok(data)
}
