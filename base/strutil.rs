// This file is part of Moonfire NVR, a security camera digital video recorder.
// Copyright (C) 2016 Scott Lamb <slamb@slamb.org>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// In addition, as a special exception, the copyright holders give
// permission to link the code of portions of this program with the
// OpenSSL library under certain conditions as described in each
// individual source file, and distribute linked combinations including
// the two.
//
// You must obey the GNU General Public License in all respects for all
// of the code used other than OpenSSL. If you modify file(s) with this
// exception, you may extend this exception to your version of the
// file(s), but you are not obligated to do so. If you do not wish to do
// so, delete this exception statement from your version. If you delete
// this exception statement from all source files in the program, then
// also delete it here.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Small string helpers shared by the command surface and status output.

use std::fmt::Write as _;

static MULTIPLIERS: [(char, u64); 4] = [
    // (suffix character, power of 2)
    ('T', 40),
    ('G', 30),
    ('M', 20),
    ('K', 10),
];

/// Encodes a byte count into human-readable form, e.g. `segment_length_bytes`
/// in `status` output.
pub fn encode_size(mut raw: i64) -> String {
    let mut encoded = String::new();
    for &(c, n) in &MULTIPLIERS {
        if raw >= 1i64 << n {
            write!(&mut encoded, "{}{} ", raw >> n, c).unwrap();
            raw &= (1i64 << n) - 1;
        }
    }
    if raw > 0 || encoded.is_empty() {
        write!(&mut encoded, "{}", raw).unwrap();
    } else {
        encoded.pop(); // remove trailing space.
    }
    encoded
}

/// Decodes a human-readable size as accepted by the `length=` command
/// argument, e.g. `16M`, `512K`, or a bare byte count.
pub fn decode_size(encoded: &str) -> Result<i64, ()> {
    let encoded = encoded.trim();
    if encoded.is_empty() {
        return Err(());
    }
    let bytes = encoded.as_bytes();
    let (digits, suffix) = match bytes[bytes.len() - 1] {
        b'T' | b'G' | b'M' | b'K' => (&encoded[..encoded.len() - 1], Some(bytes[bytes.len() - 1] as char)),
        b'0'..=b'9' => (encoded, None),
        _ => return Err(()),
    };
    let mut value: i64 = digits.parse().map_err(|_| ())?;
    if let Some(suffix) = suffix {
        let (_, n) = MULTIPLIERS.iter().find(|&&(c, _)| c == suffix).ok_or(())?;
        value = value.checked_shl(*n as u32).ok_or(())?;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_plain() {
        assert_eq!(decode_size("4096").unwrap(), 4096);
    }

    #[test]
    fn decode_suffixed() {
        assert_eq!(decode_size("100M").unwrap(), 100i64 << 20);
        assert_eq!(decode_size("16K").unwrap(), 16i64 << 10);
    }

    #[test]
    fn decode_rejects_garbage() {
        decode_size("").unwrap_err();
        decode_size("4Q").unwrap_err();
    }

    #[test]
    fn encode_round_trips_common_sizes() {
        assert_eq!(encode_size(100 << 20), "100M");
        assert_eq!(encode_size((100 << 20) + 5), "100M 5");
    }
}
