use std::io;

/// Writes a message into a byte buffer.
pub trait Serialize<'a> {
    /// Serializes `self` into `buf`.
    ///
    /// # Arguments
    /// * `buf` - The buffer the header and any owned bytes are appended to.
    ///
    /// # Returns
    /// An optional borrowed tail that must be written right after `buf`, this is
    /// how tensor payloads avoid being copied into the buffer.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}
