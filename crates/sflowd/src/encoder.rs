//! Datagram encoder
//!
//! Turns one interface record into one collector-ready sFlow datagram. The
//! wire codec is rebuilt whenever the agent address changes; the flow and
//! counter sample sequence numbers live here so they survive a rebuild.

use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::debug;

use crate::codec::{
    CounterRecord, CounterSample, FlowRecord, FlowSample, GenericInterfaceCounters,
    RawPacketHeader, Sample, SflowV5Codec,
};
use crate::dispatch::{CounterSampleRecord, FlowSampleRecord};
use crate::error::CodecError;
use crate::tables::counters::*;
use crate::tables::wire::{
    HEADER_PROTOCOL_ETHERNET_ISO88023, IF_TYPE_ETHERNET_CSMACD, SFLOW_SUB_AGENT_ID,
    SOURCE_ID_TYPE_IFINDEX,
};

/// Encoded datagram ready for transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    /// Sample records carried, added to a collector's export counter on send
    pub num_samples: u32,
}

/// Global tunables read by the encoder on every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeLimits {
    pub max_sampled_size: u32,
    /// 0 disables the check
    pub max_datagram_size: u32,
}

/// Encoder state carried across records.
#[derive(Debug, Default)]
pub struct DatagramEncoder {
    codec: Option<SflowV5Codec>,
    flow_sample_seq: u32,
    counter_sample_seq: u32,
}

impl DatagramEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discards the current codec and binds a new one to `agent_address`.
    pub fn rebind(&mut self, agent_address: IpAddr) {
        debug!(agent = %agent_address, "Rebuilding sFlow encoder");
        self.codec = Some(SflowV5Codec::new(agent_address, SFLOW_SUB_AGENT_ID));
    }

    /// Drops the codec; records fail to encode until the next rebind.
    pub fn clear(&mut self) {
        self.codec = None;
    }

    pub fn agent_address(&self) -> Option<IpAddr> {
        self.codec.as_ref().map(SflowV5Codec::agent_address)
    }

    pub fn flow_sample_seq(&self) -> u32 {
        self.flow_sample_seq
    }

    pub fn counter_sample_seq(&self) -> u32 {
        self.counter_sample_seq
    }

    /// Encodes a captured packet as a flow sample with a raw header record.
    pub fn encode_flow_sample(
        &mut self,
        record: &FlowSampleRecord,
        sampling_rate: u32,
        limits: &EncodeLimits,
    ) -> Result<Datagram, CodecError> {
        if self.codec.is_none() {
            return Err(CodecError::NotInitialized);
        }

        let frame_length = record.frame_length.max(record.data.len() as u32);
        let header_len = record.data.len().min(limits.max_sampled_size as usize + 1);
        let if_index = record.if_index as u32;

        let sample = Sample::Flow(FlowSample {
            sequence_number: self.flow_sample_seq,
            source_id_type: SOURCE_ID_TYPE_IFINDEX,
            source_id_index: if_index,
            sampling_rate,
            sample_pool: 0,
            drops: 0,
            input: if_index,
            output: 0,
            records: vec![FlowRecord::RawPacketHeader(RawPacketHeader {
                protocol: HEADER_PROTOCOL_ETHERNET_ISO88023,
                frame_length,
                stripped: 0,
                header: record.data[..header_len].to_vec(),
            })],
        });
        self.flow_sample_seq = self.flow_sample_seq.wrapping_add(1);

        self.finish(sample, limits)
    }

    /// Encodes a counter record as a counter sample.
    pub fn encode_counter_sample(
        &mut self,
        record: &CounterSampleRecord,
        limits: &EncodeLimits,
    ) -> Result<Datagram, CodecError> {
        if self.codec.is_none() {
            return Err(CodecError::NotInitialized);
        }

        let counters = match record.record_type {
            GENERIC_IF_CTRS => generic_interface_counters(record.if_index as u32, &record.values),
            other => return Err(CodecError::UnsupportedCounter(other)),
        };

        let sample = Sample::Counter(CounterSample {
            sequence_number: self.counter_sample_seq,
            source_id_type: SOURCE_ID_TYPE_IFINDEX,
            source_id_index: record.if_index as u32,
            records: vec![CounterRecord::GenericInterface(counters)],
        });
        self.counter_sample_seq = self.counter_sample_seq.wrapping_add(1);

        self.finish(sample, limits)
    }

    fn finish(&mut self, sample: Sample, limits: &EncodeLimits) -> Result<Datagram, CodecError> {
        let codec = self.codec.as_mut().ok_or(CodecError::NotInitialized)?;
        let num_samples = sample.record_count() as u32;
        let bytes = codec.encode(std::slice::from_ref(&sample))?;

        let limit = limits.max_datagram_size as usize;
        if limit > 0 && bytes.len() > limit {
            return Err(CodecError::DatagramTooLarge {
                size: bytes.len(),
                limit,
            });
        }

        Ok(Datagram { bytes, num_samples })
    }
}

fn generic_interface_counters(if_index: u32, values: &BTreeMap<u32, u64>) -> GenericInterfaceCounters {
    let get = |kind: u32| values.get(&kind).copied().unwrap_or(0);
    // 32-bit packet counters wrap like their MIB counterparts
    let get32 = |kind: u32| get(kind) as u32;

    GenericInterfaceCounters {
        if_index,
        if_type: IF_TYPE_ETHERNET_CSMACD,
        if_speed: get(GEN_IF_CTR_SPEED),
        if_direction: get32(GEN_IF_CTR_DUPLEX),
        if_status: get32(GEN_IF_CTR_OPERSTATUS),
        if_in_octets: get(GEN_IF_CTR_IN_OCTETS),
        if_in_ucast_pkts: get32(GEN_IF_CTR_IN_UCAST),
        if_in_multicast_pkts: get32(GEN_IF_CTR_IN_MCAST),
        if_in_broadcast_pkts: get32(GEN_IF_CTR_IN_BCAST),
        if_in_discards: get32(GEN_IF_CTR_IN_DISCARDS),
        if_in_errors: get32(GEN_IF_CTR_IN_ERRORS),
        if_in_unknown_protos: get32(GEN_IF_CTR_IN_UNKNOWN_PROTO),
        if_out_octets: get(GEN_IF_CTR_OUT_OCTETS),
        if_out_ucast_pkts: get32(GEN_IF_CTR_OUT_UCAST),
        if_out_multicast_pkts: get32(GEN_IF_CTR_OUT_MCAST),
        if_out_broadcast_pkts: get32(GEN_IF_CTR_OUT_BCAST),
        if_out_discards: get32(GEN_IF_CTR_OUT_DISCARDS),
        if_out_errors: get32(GEN_IF_CTR_OUT_ERRORS),
        if_promiscuous_mode: get32(GEN_IF_CTR_PROM_MODE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, ByteOrder};

    const LIMITS: EncodeLimits = EncodeLimits {
        max_sampled_size: 128,
        max_datagram_size: 1400,
    };

    fn bound() -> DatagramEncoder {
        let mut enc = DatagramEncoder::new();
        enc.rebind("192.0.2.1".parse().unwrap());
        enc
    }

    fn flow(len: usize) -> FlowSampleRecord {
        FlowSampleRecord {
            if_index: 9,
            data: (0..len).map(|i| i as u8).collect(),
            frame_length: len as u32,
        }
    }

    // Offset of the raw header length word in an IPv4 flow datagram
    const HEADER_LEN_OFFSET: usize = 28 + 40 + 20;

    #[test]
    fn test_unbound_encoder_fails() {
        let mut enc = DatagramEncoder::new();
        assert_eq!(
            enc.encode_flow_sample(&flow(64), 100, &LIMITS),
            Err(CodecError::NotInitialized)
        );
        assert_eq!(enc.flow_sample_seq(), 0);
    }

    #[test]
    fn test_short_frame_is_not_truncated() {
        let mut enc = bound();
        let dgram = enc.encode_flow_sample(&flow(64), 100, &LIMITS).unwrap();
        assert_eq!(BigEndian::read_u32(&dgram.bytes[HEADER_LEN_OFFSET..]), 64);
        assert_eq!(dgram.num_samples, 1);
    }

    #[test]
    fn test_long_frame_truncated_to_max_plus_one() {
        let mut enc = bound();
        let dgram = enc.encode_flow_sample(&flow(1500), 100, &LIMITS).unwrap();
        // frame length keeps the untruncated size
        assert_eq!(BigEndian::read_u32(&dgram.bytes[HEADER_LEN_OFFSET - 8..]), 1500);
        assert_eq!(BigEndian::read_u32(&dgram.bytes[HEADER_LEN_OFFSET..]), 129);
    }

    #[test]
    fn test_partially_captured_frame_reports_wire_length() {
        let mut enc = bound();
        let record = FlowSampleRecord {
            frame_length: 9000,
            ..flow(2048)
        };
        let dgram = enc.encode_flow_sample(&record, 100, &LIMITS).unwrap();
        assert_eq!(BigEndian::read_u32(&dgram.bytes[HEADER_LEN_OFFSET - 8..]), 9000);
        assert_eq!(BigEndian::read_u32(&dgram.bytes[HEADER_LEN_OFFSET..]), 129);
    }

    #[test]
    fn test_sequence_numbers_are_independent_and_survive_rebind() {
        let mut enc = bound();
        enc.encode_flow_sample(&flow(10), 1, &LIMITS).unwrap();
        enc.encode_flow_sample(&flow(10), 1, &LIMITS).unwrap();

        let ctr = CounterSampleRecord {
            if_index: 9,
            record_type: GENERIC_IF_CTRS,
            values: BTreeMap::new(),
        };
        enc.encode_counter_sample(&ctr, &LIMITS).unwrap();
        assert_eq!(enc.flow_sample_seq(), 2);
        assert_eq!(enc.counter_sample_seq(), 1);

        enc.rebind("192.0.2.2".parse().unwrap());
        enc.encode_flow_sample(&flow(10), 1, &LIMITS).unwrap();
        assert_eq!(enc.flow_sample_seq(), 3);
        assert_eq!(enc.agent_address(), Some("192.0.2.2".parse().unwrap()));
    }

    #[test]
    fn test_unsupported_counter_kind() {
        let mut enc = bound();
        let ctr = CounterSampleRecord {
            if_index: 9,
            record_type: 77,
            values: BTreeMap::new(),
        };
        assert_eq!(
            enc.encode_counter_sample(&ctr, &LIMITS),
            Err(CodecError::UnsupportedCounter(77))
        );
        assert_eq!(enc.counter_sample_seq(), 0);
    }

    #[test]
    fn test_counter_values_mapped() {
        let mut enc = bound();
        let values = BTreeMap::from([
            (GEN_IF_CTR_SPEED, 25_000_000_000),
            (GEN_IF_CTR_DUPLEX, 1),
            (GEN_IF_CTR_OPERSTATUS, 1),
            (GEN_IF_CTR_IN_OCTETS, 1 << 40),
            (GEN_IF_CTR_OUT_ERRORS, 3),
        ]);
        let ctr = CounterSampleRecord {
            if_index: 4,
            record_type: GENERIC_IF_CTRS,
            values,
        };
        let dgram = enc.encode_counter_sample(&ctr, &LIMITS).unwrap();
        // generic counters body starts after header(28) + sample(20) + record header(8)
        let b = &dgram.bytes[56..];
        assert_eq!(BigEndian::read_u32(&b[0..]), 4);
        assert_eq!(BigEndian::read_u64(&b[8..]), 25_000_000_000);
        assert_eq!(BigEndian::read_u32(&b[16..]), 1);
        assert_eq!(BigEndian::read_u32(&b[20..]), 1);
        assert_eq!(BigEndian::read_u64(&b[24..]), 1 << 40);
        assert_eq!(BigEndian::read_u32(&b[80..]), 3);
    }

    #[test]
    fn test_datagram_size_limit() {
        let mut enc = bound();
        let tight = EncodeLimits {
            max_sampled_size: 256,
            max_datagram_size: 100,
        };
        assert!(matches!(
            enc.encode_flow_sample(&flow(512), 1, &tight),
            Err(CodecError::DatagramTooLarge { limit: 100, .. })
        ));

        let unlimited = EncodeLimits {
            max_sampled_size: 256,
            max_datagram_size: 0,
        };
        assert!(enc.encode_flow_sample(&flow(512), 1, &unlimited).is_ok());
    }
}
