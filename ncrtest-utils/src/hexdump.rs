use std::fmt::Write;

/// Format a buffer as a classic 16-bytes-per-line hex dump, with the listed
/// offsets starting from `start`. Each line carries an ASCII gutter on the
/// right; unprintable bytes show as '.'.
pub fn hexdump(buf: &[u8], start: u32) -> String {
    let mut out = String::with_capacity((buf.len() / 16 + 1) * 78);
    for (line_no, chunk) in buf.chunks(16).enumerate() {
        let offset = start as usize + line_no * 16;
        write!(out, "{:08x}: ", offset).unwrap();
        for i in 0..16 {
            match chunk.get(i) {
                Some(byte) => write!(out, "{:02x} ", byte).unwrap(),
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push('|');
        for byte in chunk {
            out.push(printable(*byte));
        }
        out.push('|');
        out.push('\n');
    }
    out
}

fn printable(byte: u8) -> char {
    match byte {
        0x20..=0x7E => byte.into(),
        _ => '.',
    }
}
