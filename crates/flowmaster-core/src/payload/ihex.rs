//! Intel HEX reader and validator.
//!
//! Only the two record types the controller's toolchain emits are accepted:
//! DATA (`00`) and EOF (`01`). Records are read and checked one line at a
//! time; nothing beyond the current line is buffered.
//!
//! ```text
//! :LLAAAATT<data>CC
//! ```
//!
//! `CC` is the two's complement of the byte sum of `LL`, both address bytes,
//! `TT` and the data bytes.

use std::io::{self, BufRead};

use thiserror::Error;

use crate::protocol::constants::{
    HEX_RECORD_DATA, HEX_RECORD_EOF, HEX_RECORD_START, MAX_RECORD_DATA,
};

/// Characters in a record without any data: `:LLAAAATTCC`.
const RECORD_OVERHEAD: usize = 11;

#[derive(Error, Debug)]
pub enum HexError {
    #[error("Line {line}: record does not start with ':'")]
    MissingSentinel { line: usize },
    #[error("Line {line}: invalid hex digit at column {column}")]
    InvalidDigit { line: usize, column: usize },
    #[error("Line {line}: expected {expected} characters, found {actual}")]
    LineLength {
        line: usize,
        expected: usize,
        actual: usize,
    },
    #[error("Line {line}: {len} data bytes exceed the {max} byte record limit")]
    RecordTooLong { line: usize, len: usize, max: usize },
    #[error("Line {line}: unsupported record type 0x{record_type:02X}")]
    UnsupportedRecordType { line: usize, record_type: u8 },
    #[error("Line {line}: checksum mismatch, computed 0x{expected:02X}, file has 0x{actual:02X}")]
    ChecksumMismatch { line: usize, expected: u8, actual: u8 },
    #[error("Image ends without an EOF record")]
    MissingEof,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One parsed and checked record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    pub address: u16,
    pub record_type: u8,
    pub data: Vec<u8>,
    pub checksum: u8,
}

impl HexRecord {
    /// Two's complement checksum over length, address, type and data.
    pub fn compute_checksum(address: u16, record_type: u8, data: &[u8]) -> u8 {
        let [hi, lo] = address.to_be_bytes();
        let sum = data
            .iter()
            .fold((data.len() as u8).wrapping_add(hi).wrapping_add(lo).wrapping_add(record_type), |acc, &b| {
                acc.wrapping_add(b)
            });
        (!sum).wrapping_add(1)
    }

    /// Parse and check one record. `line` is used for error reporting only.
    pub fn parse(text: &str, line: usize) -> Result<Self, HexError> {
        let bytes = text.trim_end().as_bytes();
        if bytes.first() != Some(&HEX_RECORD_START) {
            return Err(HexError::MissingSentinel { line });
        }
        if bytes.len() < RECORD_OVERHEAD {
            return Err(HexError::LineLength {
                line,
                expected: RECORD_OVERHEAD,
                actual: bytes.len(),
            });
        }

        let len = hex_byte(bytes, 1, line)? as usize;
        let address = u16::from_be_bytes([hex_byte(bytes, 3, line)?, hex_byte(bytes, 5, line)?]);
        let record_type = hex_byte(bytes, 7, line)?;

        if record_type != HEX_RECORD_DATA && record_type != HEX_RECORD_EOF {
            return Err(HexError::UnsupportedRecordType { line, record_type });
        }
        if len > MAX_RECORD_DATA {
            return Err(HexError::RecordTooLong {
                line,
                len,
                max: MAX_RECORD_DATA,
            });
        }
        let expected = RECORD_OVERHEAD + 2 * len;
        if bytes.len() != expected {
            return Err(HexError::LineLength {
                line,
                expected,
                actual: bytes.len(),
            });
        }

        let data = (0..len)
            .map(|i| hex_byte(bytes, 9 + 2 * i, line))
            .collect::<Result<Vec<u8>, HexError>>()?;
        let checksum = hex_byte(bytes, 9 + 2 * len, line)?;

        let computed = Self::compute_checksum(address, record_type, &data);
        if computed != checksum {
            return Err(HexError::ChecksumMismatch {
                line,
                expected: computed,
                actual: checksum,
            });
        }

        Ok(Self {
            address,
            record_type,
            data,
            checksum,
        })
    }

    /// Whether a single line is a well-formed record with a correct checksum.
    pub fn verify_line(text: &str) -> bool {
        Self::parse(text, 1).is_ok()
    }

    pub fn is_eof(&self) -> bool {
        self.record_type == HEX_RECORD_EOF
    }
}

fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

fn hex_byte(bytes: &[u8], at: usize, line: usize) -> Result<u8, HexError> {
    let digit = |i: usize| {
        bytes
            .get(i)
            .copied()
            .and_then(nibble)
            .ok_or(HexError::InvalidDigit { line, column: i + 1 })
    };
    Ok((digit(at)? << 4) | digit(at + 1)?)
}

/// Lazily yields the DATA records of an image.
///
/// Ends after the EOF record. A stream that ends without one yields
/// [`HexError::MissingEof`]. After any error the reader is exhausted.
pub struct HexReader<R> {
    reader: R,
    line: String,
    line_no: usize,
    done: bool,
}

impl<R: BufRead> HexReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            line_no: 0,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for HexReader<R> {
    type Item = Result<HexRecord, HexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        self.line.clear();
        match self.reader.read_line(&mut self.line) {
            Ok(0) => {
                self.done = true;
                return Some(Err(HexError::MissingEof));
            }
            Ok(_) => self.line_no += 1,
            Err(e) => {
                self.done = true;
                return Some(Err(e.into()));
            }
        }

        match HexRecord::parse(&self.line, self.line_no) {
            Ok(record) if record.is_eof() => {
                self.done = true;
                None
            }
            Ok(record) => Some(Ok(record)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Run a whole image through the reader. Returns the number of DATA records.
pub fn validate_image<R: BufRead>(reader: R) -> Result<usize, HexError> {
    let mut count = 0;
    for record in HexReader::new(reader) {
        record?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const IMAGE: &str = ":100000000C9434000C9446000C9446000C9446006A\n\
                         :0300300002337A1E\n\
                         :00000001FF\n";

    fn record_line(address: u16, data: &[u8]) -> String {
        let mut line = format!(":{:02X}{:04X}00", data.len(), address);
        for b in data {
            line.push_str(&format!("{:02X}", b));
        }
        line.push_str(&format!(
            "{:02X}",
            HexRecord::compute_checksum(address, HEX_RECORD_DATA, data)
        ));
        line
    }

    #[test]
    fn test_known_record() {
        let record = HexRecord::parse(":0300300002337A1E", 1).unwrap();
        assert_eq!(record.address, 0x0030);
        assert_eq!(record.record_type, HEX_RECORD_DATA);
        assert_eq!(record.data, vec![0x02, 0x33, 0x7A]);
        assert_eq!(record.checksum, 0x1E);
        assert!(HexRecord::verify_line(":0300300002337A1E"));
    }

    #[test]
    fn test_lowercase_and_crlf() {
        assert!(HexRecord::verify_line(":0300300002337a1e\r\n"));
    }

    #[test]
    fn test_reader_yields_data_records() {
        let records: Vec<_> = HexReader::new(IMAGE.as_bytes())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data.len(), 16);
        assert_eq!(records[1].address, 0x0030);
        assert_eq!(validate_image(IMAGE.as_bytes()).unwrap(), 2);
    }

    #[test]
    fn test_stops_at_eof() {
        let image = format!("{}garbage after eof\n", IMAGE);
        assert_eq!(validate_image(image.as_bytes()).unwrap(), 2);
    }

    #[test]
    fn test_missing_eof() {
        let image = ":0300300002337A1E\n";
        assert!(matches!(
            validate_image(image.as_bytes()),
            Err(HexError::MissingEof)
        ));
    }

    #[test]
    fn test_missing_sentinel() {
        let image = "0300300002337A1E\n:00000001FF\n";
        assert!(matches!(
            validate_image(image.as_bytes()),
            Err(HexError::MissingSentinel { line: 1 })
        ));
    }

    #[test]
    fn test_unsupported_record_type() {
        // Extended linear address record.
        let image = ":020000040000FA\n:00000001FF\n";
        assert!(matches!(
            validate_image(image.as_bytes()),
            Err(HexError::UnsupportedRecordType {
                line: 1,
                record_type: 0x04
            })
        ));
    }

    #[test]
    fn test_bad_checksum_and_digit() {
        assert!(matches!(
            HexRecord::parse(":0300300002337A1F", 3),
            Err(HexError::ChecksumMismatch {
                line: 3,
                expected: 0x1E,
                actual: 0x1F
            })
        ));
        assert!(matches!(
            HexRecord::parse(":03003000023G7A1E", 1),
            Err(HexError::InvalidDigit { line: 1, column: 13 })
        ));
    }

    #[test]
    fn test_length_field_must_match_line() {
        assert!(matches!(
            HexRecord::parse(":0400300002337A1E", 1),
            Err(HexError::LineLength { .. })
        ));
        assert!(matches!(
            HexRecord::parse(":0300300002337A1E00", 1),
            Err(HexError::LineLength { .. })
        ));
    }

    #[test]
    fn test_record_too_long() {
        let line = record_line(0, &[0u8; MAX_RECORD_DATA + 1]);
        assert!(matches!(
            HexRecord::parse(&line, 1),
            Err(HexError::RecordTooLong { .. })
        ));
    }

    #[test]
    fn test_error_is_final() {
        let image = ":0300300002337A1F\n:0300300002337A1E\n:00000001FF\n";
        let mut reader = HexReader::new(image.as_bytes());
        assert!(matches!(reader.next(), Some(Err(_))));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_non_monotonic_addresses_accepted() {
        let image = format!(
            "{}\n{}\n{}\n:00000001FF\n",
            record_line(0x0100, &[1, 2]),
            record_line(0x0000, &[3, 4]),
            record_line(0x0100, &[5, 6]),
        );
        assert_eq!(validate_image(image.as_bytes()).unwrap(), 3);
    }

    proptest! {
        #[test]
        fn prop_valid_records_verify(
            address in any::<u16>(),
            data in prop::collection::vec(any::<u8>(), 0..=MAX_RECORD_DATA),
        ) {
            prop_assert!(HexRecord::verify_line(&record_line(address, &data)));
        }

        #[test]
        fn prop_single_digit_mutation_fails(
            address in any::<u16>(),
            data in prop::collection::vec(any::<u8>(), 0..=MAX_RECORD_DATA),
            index in any::<prop::sample::Index>(),
            delta in 1u8..16,
        ) {
            let line = record_line(address, &data);
            let mut bytes = line.into_bytes();
            // Any hex digit after the ':' sentinel.
            let i = 1 + index.index(bytes.len() - 1);
            let value = nibble(bytes[i]).unwrap();
            let mutated = (value + delta) % 16;
            bytes[i] = b"0123456789ABCDEF"[mutated as usize];
            let mutated_line = String::from_utf8(bytes).unwrap();
            prop_assert!(!HexRecord::verify_line(&mutated_line), "{}", mutated_line);
        }
    }
}
