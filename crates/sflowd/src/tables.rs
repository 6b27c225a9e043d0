//! Constants for sflowd

/// Object names used in validation messages
pub mod objects {
    pub const SFLOW_GLOBAL: &str = "SflowGlobal";
    pub const SFLOW_COLLECTOR: &str = "SflowCollector";
    pub const SFLOW_INTF: &str = "SflowIntf";
}

/// Admin/oper state strings accepted on the configuration surface
pub mod states {
    pub const ADMIN_STATE_UP: &str = "UP";
    pub const ADMIN_STATE_DOWN: &str = "DOWN";
}

/// Configuration limits
pub mod limits {
    /// Largest captured header (bytes) an operator may request
    pub const SFLOW_PKT_MAX_SAMPLED_SIZE: i32 = 256;

    /// Largest UDP payload over IPv4
    pub const MAX_UDP_DATAGRAM_SIZE: i32 = 65507;

    /// Largest UDP port number
    pub const MAX_UDP_PORT: i32 = 65535;
}

/// Mailbox sizes
pub mod queues {
    /// Interface tasks to Aggregation, one queue per record kind
    pub const INTF_RECORD_QUEUE_SIZE: usize = 100;

    /// Encoder rebind/clear and stats requests into Aggregation
    pub const AGGREGATION_CONTROL_QUEUE_SIZE: usize = 100;

    /// Aggregation to Fan-out datagram-ready events
    pub const DGRAM_READY_QUEUE_SIZE: usize = 100;

    /// Fan-out to one collector
    pub const COLLECTOR_QUEUE_SIZE: usize = 100;

    /// Registration, receipts and termination signals into Fan-out
    pub const FANOUT_CONTROL_QUEUE_SIZE: usize = 100;

    /// Configuration requests into the server loop
    pub const SERVER_REQUEST_QUEUE_SIZE: usize = 100;
}

/// sFlow v5 wire constants
pub mod wire {
    pub const SFLOW_VERSION: u32 = 5;
    pub const SFLOW_SUB_AGENT_ID: u32 = 0;

    pub const ADDRESS_TYPE_IPV4: u32 = 1;
    pub const ADDRESS_TYPE_IPV6: u32 = 2;

    /// Sample formats (enterprise 0)
    pub const FLOW_SAMPLE_FORMAT: u32 = 1;
    pub const COUNTER_SAMPLE_FORMAT: u32 = 2;

    /// Record formats (enterprise 0)
    pub const RAW_PACKET_HEADER_FORMAT: u32 = 1;
    pub const GENERIC_INTERFACE_COUNTERS_FORMAT: u32 = 1;

    /// Header protocol for raw packet header records
    pub const HEADER_PROTOCOL_ETHERNET_ISO88023: u32 = 1;

    /// Source id type for ifIndex-based data sources
    pub const SOURCE_ID_TYPE_IFINDEX: u32 = 0;

    /// ifType reported in generic interface counters (ethernetCsmacd)
    pub const IF_TYPE_ETHERNET_CSMACD: u32 = 6;

    pub const IF_DIRECTION_FULL_DUPLEX: u32 = 1;
    pub const IF_DIRECTION_HALF_DUPLEX: u32 = 2;

    pub const IF_OPER_STATUS_UP: u32 = 1;
    pub const IF_OPER_STATUS_DOWN: u32 = 0;

    pub const IF_PROMISCUOUS_MODE_UNSUPPORTED: u32 = 0;
}

/// Counter record types and the counter kinds they carry
pub mod counters {
    /// Generic interface counters record type
    pub const GENERIC_IF_CTRS: u32 = 1;

    pub const GEN_IF_CTR_SPEED: u32 = 0;
    pub const GEN_IF_CTR_DUPLEX: u32 = 1;
    pub const GEN_IF_CTR_OPERSTATUS: u32 = 2;
    pub const GEN_IF_CTR_IN_OCTETS: u32 = 3;
    pub const GEN_IF_CTR_IN_UCAST: u32 = 4;
    pub const GEN_IF_CTR_IN_MCAST: u32 = 5;
    pub const GEN_IF_CTR_IN_BCAST: u32 = 6;
    pub const GEN_IF_CTR_IN_DISCARDS: u32 = 7;
    pub const GEN_IF_CTR_IN_ERRORS: u32 = 8;
    pub const GEN_IF_CTR_IN_UNKNOWN_PROTO: u32 = 9;
    pub const GEN_IF_CTR_OUT_OCTETS: u32 = 10;
    pub const GEN_IF_CTR_OUT_UCAST: u32 = 11;
    pub const GEN_IF_CTR_OUT_MCAST: u32 = 12;
    pub const GEN_IF_CTR_OUT_BCAST: u32 = 13;
    pub const GEN_IF_CTR_OUT_DISCARDS: u32 = 14;
    pub const GEN_IF_CTR_OUT_ERRORS: u32 = 15;
    pub const GEN_IF_CTR_PROM_MODE: u32 = 16;
}
