//! Wire framing constants and the two serializer seams `spec.md` §9 calls
//! out: one for structured messages (task batches, results, exceptions),
//! one for payloads forwarded verbatim between client and Manager.

use crate::task::Task;

/// Sent to a Manager in reply to its heartbeat (`spec.md` §6).
pub const HEARTBEAT_CODE: u32 = u32::MAX; // 2^32 - 1
/// Sent to a Manager acknowledging it has been drained (`spec.md` §6).
pub const DRAINED_CODE: u32 = u32::MAX - 1; // 2^32 - 2

/// Encode a framing constant as 4 little-endian bytes.
///
/// The original implementation pickles these constants; this crate has no
/// pickle-compatible encoder available, so it substitutes a deterministic
/// little-endian `u32` encoding instead. Bit-exact interop with a deployment
/// expecting the pickled form would require swapping this function, which is
/// exactly why it's exposed rather than inlined at call sites.
pub fn encode_framing_code(code: u32) -> [u8; 4] {
    code.to_le_bytes()
}

/// Structured-message serializer seam: encodes a batch of tasks into the
/// single opaque payload a Manager expects on `manager_router`
/// (`spec.md` §6 "Outbound task batch to Manager").
pub trait StructSerializer: Send + Sync {
    fn encode_task_batch(&self, tasks: &[Task]) -> Vec<u8>;
}

/// The production serializer: JSON, matching the wire format the client
/// driver already uses for the startup configuration blob.
pub struct JsonSerializer;

impl StructSerializer for JsonSerializer {
    fn encode_task_batch(&self, tasks: &[Task]) -> Vec<u8> {
        serde_json::to_vec(tasks).expect("Task serializes infallibly")
    }
}

/// An identity serializer for tests: encodes a batch as its task_ids so
/// assertions don't need to round-trip JSON.
#[cfg(test)]
pub struct IdentitySerializer;

#[cfg(test)]
impl StructSerializer for IdentitySerializer {
    fn encode_task_batch(&self, tasks: &[Task]) -> Vec<u8> {
        tasks.iter().flat_map(|t| t.task_id.to_le_bytes()).collect()
    }
}
