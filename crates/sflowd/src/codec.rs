//! sFlow v5 wire codec.
//!
//! Produces XDR (big-endian, 4-byte aligned) datagrams as described in
//! <https://sflow.org/sflow_version_5.txt>. Only the structures the daemon
//! exports are implemented: flow samples carrying a raw packet header record
//! and counter samples carrying a generic interface counters record.

use byteorder::{BigEndian, ByteOrder};
use std::net::IpAddr;
use std::time::Instant;

use crate::error::CodecError;
use crate::tables::wire::*;

/// Raw packet header flow record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacketHeader {
    pub protocol: u32,
    pub frame_length: u32,
    pub stripped: u32,
    pub header: Vec<u8>,
}

/// Flow records carried by a flow sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowRecord {
    RawPacketHeader(RawPacketHeader),
}

/// Generic interface counters record (RFC 2233 ifTable subset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GenericInterfaceCounters {
    pub if_index: u32,
    pub if_type: u32,
    pub if_speed: u64,
    pub if_direction: u32,
    pub if_status: u32,
    pub if_in_octets: u64,
    pub if_in_ucast_pkts: u32,
    pub if_in_multicast_pkts: u32,
    pub if_in_broadcast_pkts: u32,
    pub if_in_discards: u32,
    pub if_in_errors: u32,
    pub if_in_unknown_protos: u32,
    pub if_out_octets: u64,
    pub if_out_ucast_pkts: u32,
    pub if_out_multicast_pkts: u32,
    pub if_out_broadcast_pkts: u32,
    pub if_out_discards: u32,
    pub if_out_errors: u32,
    pub if_promiscuous_mode: u32,
}

/// Counter records carried by a counter sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterRecord {
    GenericInterface(GenericInterfaceCounters),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSample {
    pub sequence_number: u32,
    pub source_id_type: u32,
    pub source_id_index: u32,
    pub sampling_rate: u32,
    pub sample_pool: u32,
    pub drops: u32,
    pub input: u32,
    pub output: u32,
    pub records: Vec<FlowRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSample {
    pub sequence_number: u32,
    pub source_id_type: u32,
    pub source_id_index: u32,
    pub records: Vec<CounterRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sample {
    Flow(FlowSample),
    Counter(CounterSample),
}

impl Sample {
    /// Number of records carried by this sample.
    pub fn record_count(&self) -> usize {
        match self {
            Self::Flow(s) => s.records.len(),
            Self::Counter(s) => s.records.len(),
        }
    }
}

/// Append-only XDR buffer.
#[derive(Debug, Default)]
struct XdrWriter {
    buf: Vec<u8>,
}

impl XdrWriter {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    fn put_u32(&mut self, value: u32) {
        let mut tmp = [0u8; 4];
        BigEndian::write_u32(&mut tmp, value);
        self.buf.extend_from_slice(&tmp);
    }

    fn put_u64(&mut self, value: u64) {
        let mut tmp = [0u8; 8];
        BigEndian::write_u64(&mut tmp, value);
        self.buf.extend_from_slice(&tmp);
    }

    /// Variable-length opaque: length word, bytes, zero padding to 4.
    fn put_opaque(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        let len = u32::try_from(bytes.len()).map_err(|_| CodecError::HeaderTooLong(bytes.len()))?;
        self.put_u32(len);
        self.buf.extend_from_slice(bytes);
        let pad = (4 - bytes.len() % 4) % 4;
        self.buf.extend(std::iter::repeat(0u8).take(pad));
        Ok(())
    }

    fn put_ip(&mut self, addr: &IpAddr) {
        match addr {
            IpAddr::V4(v4) => {
                self.put_u32(ADDRESS_TYPE_IPV4);
                self.buf.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                self.put_u32(ADDRESS_TYPE_IPV6);
                self.buf.extend_from_slice(&v6.octets());
            }
        }
    }

    /// Writes `format`, then the length of whatever `body` appends, then the body.
    fn put_structure<F>(&mut self, format: u32, body: F) -> Result<(), CodecError>
    where
        F: FnOnce(&mut XdrWriter) -> Result<(), CodecError>,
    {
        let mut inner = XdrWriter::default();
        body(&mut inner)?;
        self.put_u32(format);
        self.put_u32(inner.buf.len() as u32);
        self.buf.extend_from_slice(&inner.buf);
        Ok(())
    }

    fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

fn source_id(source_type: u32, index: u32) -> u32 {
    (source_type << 24) | (index & 0x00ff_ffff)
}

/// Encoder bound to one agent address.
///
/// Numbers the datagrams it produces; sample sequence numbers are supplied by
/// the caller.
#[derive(Debug)]
pub struct SflowV5Codec {
    agent_address: IpAddr,
    sub_agent_id: u32,
    datagram_sequence: u32,
    boot: Instant,
}

impl SflowV5Codec {
    pub fn new(agent_address: IpAddr, sub_agent_id: u32) -> Self {
        Self {
            agent_address,
            sub_agent_id,
            datagram_sequence: 0,
            boot: Instant::now(),
        }
    }

    pub fn agent_address(&self) -> IpAddr {
        self.agent_address
    }

    /// Encodes one datagram carrying `samples`.
    pub fn encode(&mut self, samples: &[Sample]) -> Result<Vec<u8>, CodecError> {
        if samples.is_empty() {
            return Err(CodecError::Empty);
        }

        self.datagram_sequence = self.datagram_sequence.wrapping_add(1);
        // sysUptime wraps at 2^32 ms, like the agent MIB counter
        let uptime_ms = self.boot.elapsed().as_millis() as u32;

        let mut w = XdrWriter::with_capacity(256);
        w.put_u32(SFLOW_VERSION);
        w.put_ip(&self.agent_address);
        w.put_u32(self.sub_agent_id);
        w.put_u32(self.datagram_sequence);
        w.put_u32(uptime_ms);
        w.put_u32(samples.len() as u32);

        for sample in samples {
            match sample {
                Sample::Flow(flow) => w.put_structure(FLOW_SAMPLE_FORMAT, |b| encode_flow(b, flow))?,
                Sample::Counter(ctr) => {
                    w.put_structure(COUNTER_SAMPLE_FORMAT, |b| encode_counter(b, ctr))?
                }
            }
        }

        Ok(w.into_inner())
    }
}

fn encode_flow(w: &mut XdrWriter, sample: &FlowSample) -> Result<(), CodecError> {
    w.put_u32(sample.sequence_number);
    w.put_u32(source_id(sample.source_id_type, sample.source_id_index));
    w.put_u32(sample.sampling_rate);
    w.put_u32(sample.sample_pool);
    w.put_u32(sample.drops);
    w.put_u32(sample.input);
    w.put_u32(sample.output);
    w.put_u32(sample.records.len() as u32);
    for record in &sample.records {
        match record {
            FlowRecord::RawPacketHeader(raw) => {
                w.put_structure(RAW_PACKET_HEADER_FORMAT, |b| {
                    b.put_u32(raw.protocol);
                    b.put_u32(raw.frame_length);
                    b.put_u32(raw.stripped);
                    b.put_opaque(&raw.header)
                })?;
            }
        }
    }
    Ok(())
}

fn encode_counter(w: &mut XdrWriter, sample: &CounterSample) -> Result<(), CodecError> {
    w.put_u32(sample.sequence_number);
    w.put_u32(source_id(sample.source_id_type, sample.source_id_index));
    w.put_u32(sample.records.len() as u32);
    for record in &sample.records {
        match record {
            CounterRecord::GenericInterface(c) => {
                w.put_structure(GENERIC_INTERFACE_COUNTERS_FORMAT, |b| {
                    b.put_u32(c.if_index);
                    b.put_u32(c.if_type);
                    b.put_u64(c.if_speed);
                    b.put_u32(c.if_direction);
                    b.put_u32(c.if_status);
                    b.put_u64(c.if_in_octets);
                    b.put_u32(c.if_in_ucast_pkts);
                    b.put_u32(c.if_in_multicast_pkts);
                    b.put_u32(c.if_in_broadcast_pkts);
                    b.put_u32(c.if_in_discards);
                    b.put_u32(c.if_in_errors);
                    b.put_u32(c.if_in_unknown_protos);
                    b.put_u64(c.if_out_octets);
                    b.put_u32(c.if_out_ucast_pkts);
                    b.put_u32(c.if_out_multicast_pkts);
                    b.put_u32(c.if_out_broadcast_pkts);
                    b.put_u32(c.if_out_discards);
                    b.put_u32(c.if_out_errors);
                    b.put_u32(c.if_promiscuous_mode);
                    Ok(())
                })?;
            }
        }
    }
    Ok(())
}
