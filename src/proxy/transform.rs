/// Content manipulation applied to forwarded chunks.
///
/// Each chunk passes through exactly one of the methods, once, in the order
/// it was read. Chunks are whatever the transport delivered; they carry no
/// relation to message boundaries of the wrapped protocol.
pub trait Transform: Send + Sync + 'static {
    /// Applied to bytes travelling from the downstream client to the target.
    fn transform_outbound(&self, chunk: Vec<u8>) -> Vec<u8> {
        chunk
    }

    /// Applied to bytes travelling from the target back to the client.
    fn transform_inbound(&self, chunk: Vec<u8>) -> Vec<u8> {
        chunk
    }
}

/// Forwards every chunk untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Transform for Passthrough {}
