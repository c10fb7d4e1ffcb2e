/// Size in bytes of a null-terminated UTF-16 string at the start of `v`,
/// terminator included. Unterminated input consumes the whole buffer.
pub fn null_utf16_size(v: &[u8]) -> usize {
    let chars = v.chunks_exact(2).take_while(|&a| a != [0, 0]).count();
    (chars * 2 + 2).min(v.len())
}

/// Size in bytes of a null-terminated 8-bit string at the start of `v`,
/// terminator included.
pub fn null_ansi_size(v: &[u8]) -> usize {
    let chars = v.iter().take_while(|&&a| a != 0).count();
    (chars + 1).min(v.len())
}

/// Decodes a UTF-16 buffer, dropping any trailing null terminators.
pub fn decode_utf16_string(v: &[u8]) -> String {
    let units: Vec<u16> = v
        .chunks_exact(2)
        .map(|a| u16::from_le_bytes([a[0], a[1]]))
        .collect();
    String::from_utf16_lossy(&units)
        .trim_end_matches('\0')
        .to_string()
}

/// Decodes an 8-bit buffer, dropping any trailing null terminators.
pub fn decode_ansi_string(v: &[u8]) -> String {
    let end = v.iter().position(|&b| b == 0).unwrap_or(v.len());
    String::from_utf8_lossy(&v[..end]).to_string()
}
