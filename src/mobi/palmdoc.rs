//! Pure-Rust PalmDOC compression/decompression.
//!
//! PalmDOC uses a simple LZ77-style scheme: a 2047-byte sliding window,
//! matches of 3..=10 bytes encoded as two-byte back references, a one-byte
//! encoding for a space followed by a printable ASCII character, and
//! escaped runs of up to 8 bytes for anything that fits no other rule.

use std::io;

const MAX_DISTANCE: usize = 2047;
const MAX_MATCH: usize = 10;
const MIN_MATCH: usize = 3;

/// Compress data using PalmDOC compression.
pub fn compress(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    let mut pos = 0;

    while pos < input.len() {
        let (match_len, distance) = longest_match(input, pos);
        if match_len >= MIN_MATCH {
            output.push(0x80 | (distance >> 5) as u8);
            output.push((((distance & 0x1F) << 3) | (match_len - 3)) as u8);
            pos += match_len;
            continue;
        }

        let byte = input[pos];
        if byte == 0x20 && pos + 1 < input.len() && (0x40..=0x7F).contains(&input[pos + 1]) {
            // Space + printable ASCII folds into one byte
            output.push(input[pos + 1] ^ 0x80);
            pos += 2;
            continue;
        }
        if is_literal(byte) {
            output.push(byte);
            pos += 1;
            continue;
        }

        // Escaped run: bytes that are not literals, do not start a
        // space pair, and do not start a match
        let run_start = output.len();
        output.push(0); // count placeholder
        while pos < input.len() && output.len() - run_start <= 8 {
            let b = input[pos];
            if is_literal(b) || longest_match(input, pos).0 >= MIN_MATCH {
                break;
            }
            output.push(b);
            pos += 1;
            if output.len() - run_start == 9 {
                break;
            }
        }
        let count = output.len() - run_start - 1;
        output[run_start] = count as u8;
    }

    output
}

/// Longest window match of `input[pos..]`, up to [`MAX_MATCH`] bytes.
/// Returns `(length, distance)`; length is 0 when below [`MIN_MATCH`].
fn longest_match(input: &[u8], pos: usize) -> (usize, usize) {
    if pos + MIN_MATCH > input.len() || pos == 0 {
        return (0, 0);
    }
    let window_start = pos.saturating_sub(MAX_DISTANCE);
    let max_len = (input.len() - pos).min(MAX_MATCH);
    let mut best_len = 0;
    let mut best_dist = 0;

    for candidate in memchr::memchr_iter(input[pos], &input[window_start..pos]) {
        let start = window_start + candidate;
        let mut len = 1;
        while len < max_len && input[start + len] == input[pos + len] {
            len += 1;
        }
        if len > best_len {
            best_len = len;
            best_dist = pos - start;
            if len == max_len {
                break;
            }
        }
    }

    if best_len >= MIN_MATCH {
        (best_len, best_dist)
    } else {
        (0, 0)
    }
}

fn is_literal(byte: u8) -> bool {
    byte == 0x00 || (0x09..=0x7F).contains(&byte)
}

/// Decompress PalmDOC data.
pub fn decompress(input: &[u8]) -> io::Result<Vec<u8>> {
    let mut output = Vec::with_capacity(input.len() * 2);
    let mut i = 0;

    while i < input.len() {
        let byte = input[i];
        i += 1;

        match byte {
            // Literal byte
            0x00 | 0x09..=0x7F => output.push(byte),
            // Copy next 1-8 bytes literally
            0x01..=0x08 => {
                let count = byte as usize;
                if i + count > input.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "PalmDoc: unexpected end of input",
                    ));
                }
                output.extend_from_slice(&input[i..i + count]);
                i += count;
            }
            // Back-reference into the sliding window
            0x80..=0xBF => {
                if i >= input.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "PalmDoc: unexpected end of input",
                    ));
                }
                let next = input[i] as usize;
                i += 1;

                let distance = (((byte as usize) & 0x3F) << 5) | (next >> 3);
                let length = (next & 0x07) + 3;

                if distance == 0 || distance > output.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("PalmDoc: invalid back-reference distance {}", distance),
                    ));
                }

                let start = output.len() - distance;
                for j in 0..length {
                    output.push(output[start + (j % distance)]);
                }
            }
            // Space + character
            0xC0..=0xFF => {
                output.push(b' ');
                output.push(byte ^ 0x80);
            }
        }
    }

    Ok(output)
}
