//! The 6-bit text encoding the ISP uses to carry binary data.
//!
//! Each line starts with a length character followed by groups of four
//! characters, each group carrying three bytes. A value of 0 is sent as a
//! backtick (96) instead of a space.

use anyhow::Result;

use crate::constants::isp::LINE_BYTES;

fn encode_bits(c: u8) -> u8 {
    debug_assert!(c <= 63);
    if c == 0 { 96 } else { c + 32 }
}

fn decode_bits(c: u8) -> Result<u8> {
    match c {
        96 => Ok(0),
        33..=95 => Ok(c - 32),
        _ => anyhow::bail!("invalid character 0x{:02x} in encoded line", c),
    }
}

/// Encodes at most 63 bytes into one line, without the line terminator.
pub fn encode_line(src: &[u8]) -> Result<Vec<u8>> {
    anyhow::ensure!(
        src.len() <= 63,
        "an encoded line carries at most 63 bytes, got {}",
        src.len()
    );

    let mut line = Vec::with_capacity(1 + src.len().div_ceil(3) * 4);
    line.push(encode_bits(src.len() as u8));
    for group in src.chunks(3) {
        let b0 = group[0];
        let b1 = group.get(1).copied().unwrap_or(0);
        let b2 = group.get(2).copied().unwrap_or(0);

        line.push(encode_bits(b0 >> 2));
        line.push(encode_bits(((b0 & 0x03) << 4) | (b1 >> 4)));
        line.push(encode_bits(((b1 & 0x0f) << 2) | (b2 >> 6)));
        line.push(encode_bits(b2 & 0x3f));
    }
    Ok(line)
}

/// Encodes a whole payload into 45-byte lines, terminated by an empty line.
pub fn encode(src: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut lines = src
        .chunks(LINE_BYTES)
        .map(encode_line)
        .collect::<Result<Vec<_>>>()?;
    lines.push(encode_line(&[])?);
    Ok(lines)
}

/// Decodes one line, appending to `dest`. Returns the number of bytes added.
///
/// A trailing line terminator is ignored.
pub fn decode_into(dest: &mut Vec<u8>, src: &[u8]) -> Result<usize> {
    let src = src
        .strip_suffix(b"\n")
        .map(|s| s.strip_suffix(b"\r").unwrap_or(s))
        .unwrap_or(src);
    anyhow::ensure!(!src.is_empty(), "empty encoded line");

    let len = decode_bits(src[0])? as usize;
    let body = &src[1..];
    anyhow::ensure!(
        body.len() % 4 == 0,
        "encoded line body is {} characters, not a multiple of 4",
        body.len()
    );
    anyhow::ensure!(
        body.len() / 4 * 3 >= len,
        "encoded line announces {} bytes but carries at most {}",
        len,
        body.len() / 4 * 3
    );

    let start = dest.len();
    for group in body.chunks(4) {
        let remaining = len - (dest.len() - start);
        if remaining == 0 {
            break;
        }
        let a = decode_bits(group[0])?;
        let b = decode_bits(group[1])?;
        let c = decode_bits(group[2])?;
        let d = decode_bits(group[3])?;

        let bytes = [
            (a << 2) | (b >> 4),
            ((b & 0x0f) << 4) | (c >> 2),
            ((c & 0x03) << 6) | d,
        ];
        dest.extend_from_slice(&bytes[..remaining.min(3)]);
    }
    Ok(dest.len() - start)
}

/// Decodes a sequence of lines, stopping at the first empty line.
pub fn decode<L: AsRef<[u8]>>(lines: &[L]) -> Result<Vec<u8>> {
    let mut result = vec![];
    for line in lines {
        if decode_into(&mut result, line.as_ref())? == 0 {
            break;
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_line() {
        assert_eq!(encode_line(b"Cat").unwrap(), b"#0V%T");
        assert_eq!(encode_line(&[0, 0, 0]).unwrap(), b"#````");
    }

    #[test]
    fn length_character() {
        assert_eq!(encode_line(&[]).unwrap()[0], 96);
        assert_eq!(encode_line(&[0u8; 45]).unwrap()[0], b'M');
        assert_eq!(encode_line(&[0u8; 45]).unwrap().len(), 61);
    }

    #[test]
    fn oversized_line_is_rejected() {
        assert_eq!(encode_line(&[0u8; 63]).unwrap()[0], b'_');
        assert!(encode_line(&[0u8; 64]).is_err());
    }

    #[test]
    fn partial_group_slack_is_dropped() {
        let mut out = vec![];
        let n = decode_into(&mut out, b"\"_^``\r\n").unwrap();
        assert_eq!(n, 2);
        assert_eq!(out, [0xff, 0xe0]);
    }

    #[test]
    fn payload_across_lines() {
        let data: Vec<u8> = (0..=255u8).cycle().take(100).collect();
        let lines = encode(&data).unwrap();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines.last().unwrap(), b"`");
        assert_eq!(decode(&lines).unwrap(), data);
    }

    #[test]
    fn rejects_garbage() {
        let mut out = vec![];
        assert!(decode_into(&mut out, b"#ab").is_err());
        assert!(decode_into(&mut out, b"#\x01\x01\x01\x01").is_err());
        assert!(decode_into(&mut out, b"M````").is_err());
    }
}
