use std::fmt::Write;

/// Renders `data` as a hex dump, 16 bytes per line.
///
/// Each line starts with a six digit offset, and the two 8-byte halves of a line are separated
/// by an extra space.
///
/// # Examples
///
/// ```
/// use maprace_core::util::hexdump;
///
/// let dump = hexdump(&[0xde, 0xad, 0xbe, 0xef]);
/// assert_eq!(dump, "000000:  de ad be ef\n");
/// ```
pub fn hexdump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() / 16 * 58 + 58);
    for (line, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:06x}: ", (line * 16) & 0xff_ffff);
        for (i, byte) in chunk.iter().enumerate() {
            let gap = if i > 0 && i % 8 == 0 { " " } else { "" };
            let _ = write!(out, " {}{:02x}", gap, byte);
        }
        out.push('\n');
    }
    out
}
