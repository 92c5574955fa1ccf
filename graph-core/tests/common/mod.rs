//! Shared byte-packing helpers for integration tests, mirroring the
//! little-endian f32 <-> `DeviceBuffer` conversion `graph-cli` uses.

use graph_core::engine::DeviceBuffer;

#[allow(dead_code)]
pub fn buffer_from(values: &[f32]) -> DeviceBuffer {
    let buf = DeviceBuffer::zeroed(values.len() * 4);
    {
        let mut bytes = buf.data.lock();
        bytes.clear();
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
    }
    buf
}

#[allow(dead_code)]
pub fn read_buffer(buf: &DeviceBuffer) -> Vec<f32> {
    buf.data
        .lock()
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
