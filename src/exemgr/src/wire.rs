//! On-the-wire records exchanged with clients, executors and the resource
//! manager.
//!
//! Everything here is packed little-endian with fixed offsets; the decode
//! side reads field by field instead of transmuting so a malformed peer can
//! at worst produce a nonsensical record, never undefined behavior.

use std::sync::atomic::{fence, Ordering};

/// A client-originated request to create (or tear down) an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    /// NUL-padded ASCII address the executor must connect back to.
    pub listen_address: [u8; 16],
    pub listen_port: i32,
    pub input_buf_size: i32,
    pub func_buf_size: i32,
    pub hot_timeout: i32,
    /// Positive: number of cores requested. Zero or negative: tear down.
    pub cores: i16,
}

impl AllocationRequest {
    /// Packed wire size: 16 + 4 * 4 + 2.
    pub const WIRE_SIZE: usize = 34;

    pub fn listen_address_str(&self) -> &str {
        let end = self
            .listen_address
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.listen_address.len());
        std::str::from_utf8(&self.listen_address[..end]).unwrap_or("")
    }

    pub fn encode_to(&self, buf: &mut [u8]) {
        assert!(buf.len() >= Self::WIRE_SIZE);
        buf[0..16].copy_from_slice(&self.listen_address);
        buf[16..20].copy_from_slice(&self.listen_port.to_le_bytes());
        buf[20..24].copy_from_slice(&self.input_buf_size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.func_buf_size.to_le_bytes());
        buf[28..32].copy_from_slice(&self.hot_timeout.to_le_bytes());
        buf[32..34].copy_from_slice(&self.cores.to_le_bytes());
    }

    pub fn decode_from(buf: &[u8]) -> Self {
        assert!(buf.len() >= Self::WIRE_SIZE);
        let mut listen_address = [0u8; 16];
        listen_address.copy_from_slice(&buf[0..16]);
        AllocationRequest {
            listen_address,
            listen_port: i32::from_le_bytes(buf[16..20].try_into().unwrap()),
            input_buf_size: i32::from_le_bytes(buf[20..24].try_into().unwrap()),
            func_buf_size: i32::from_le_bytes(buf[24..28].try_into().unwrap()),
            hot_timeout: i32::from_le_bytes(buf[28..32].try_into().unwrap()),
            cores: i16::from_le_bytes(buf[32..34].try_into().unwrap()),
        }
    }

    /// Builds the fixed-size address field from a textual address.
    pub fn pack_address(addr: &str) -> [u8; 16] {
        let mut out = [0u8; 16];
        let bytes = addr.as_bytes();
        let n = bytes.len().min(15);
        out[..n].copy_from_slice(&bytes[..n]);
        out
    }
}

/// A grant received from the upstream resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub lease_id: u32,
    pub cores: u32,
    pub memory: u32,
}

impl LeaseGrant {
    pub const WIRE_SIZE: usize = 12;

    pub fn encode_to(&self, buf: &mut [u8]) {
        assert!(buf.len() >= Self::WIRE_SIZE);
        buf[0..4].copy_from_slice(&self.lease_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.cores.to_le_bytes());
        buf[8..12].copy_from_slice(&self.memory.to_le_bytes());
    }

    pub fn decode_from(buf: &[u8]) -> Self {
        assert!(buf.len() >= Self::WIRE_SIZE);
        LeaseGrant {
            lease_id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            cores: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            memory: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }
}

/// Usage counters an executor writes back into its client's accounting
/// region via RDMA writes and atomics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Accounting {
    pub hot_polling_ns: u64,
    pub execution_ns: u64,
}

impl Accounting {
    pub const WIRE_SIZE: usize = 16;

    /// Reads the region the executor writes remotely. The acquire fence
    /// orders the loads after whatever made the caller believe the executor
    /// is done (its exit status).
    pub fn load_from(buf: &[u8]) -> Self {
        assert!(buf.len() >= Self::WIRE_SIZE);
        fence(Ordering::Acquire);
        Accounting {
            hot_polling_ns: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            execution_ns: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        }
    }

    pub fn store_to(&self, buf: &mut [u8]) {
        assert!(buf.len() >= Self::WIRE_SIZE);
        buf[0..8].copy_from_slice(&self.hot_polling_ns.to_le_bytes());
        buf[8..16].copy_from_slice(&self.execution_ns.to_le_bytes());
    }
}
