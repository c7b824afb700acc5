//! Line framing for the echo protocol.

use bytes::BytesMut;

/// Prefix written in front of every echoed line.
pub const RESPONSE_PREFIX: &[u8] = b"Message received: ";

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// A full line is buffered; the value is its length including `\n`.
    Complete(usize),
    /// No terminator yet.
    Incomplete,
    /// The line exceeds the configured limit.
    TooLong,
}

/// Find the first complete line in `input`.
///
/// The first `scanned` bytes are already known to hold no `\n`, so the
/// search resumes after them. Pass the buffer length after an `Incomplete`
/// and zero after consuming a line.
///
/// `max_line_length` bounds the line payload, terminator (`\n` or `\r\n`)
/// excluded. Zero disables the limit.
pub fn parse(input: &[u8], scanned: usize, max_line_length: usize) -> ParseResult {
    let from = scanned.min(input.len());
    let too_long = |payload: &[u8]| max_line_length > 0 && payload_len(payload) > max_line_length;

    match find_lf(&input[from..]) {
        Some(offset) => {
            let pos = from + offset;
            if too_long(&input[..pos]) {
                ParseResult::TooLong
            } else {
                ParseResult::Complete(pos + 1)
            }
        }
        // A trailing `\r` may still turn out to be half of a CRLF
        None if too_long(input) => ParseResult::TooLong,
        None => ParseResult::Incomplete,
    }
}

fn payload_len(line: &[u8]) -> usize {
    line.strip_suffix(b"\r").unwrap_or(line).len()
}

/// Append the echo response for `line` to `output`.
pub fn response(line: &[u8], output: &mut BytesMut) {
    output.reserve(RESPONSE_PREFIX.len() + line.len());
    output.extend_from_slice(RESPONSE_PREFIX);
    output.extend_from_slice(line);
}

fn find_lf(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert_eq!(parse(b"ping\n", 0, 0), ParseResult::Complete(5));
        assert_eq!(parse(b"ping\nmore", 0, 0), ParseResult::Complete(5));
        assert_eq!(parse(b"\n", 0, 0), ParseResult::Complete(1));
    }

    #[test]
    fn test_crlf_is_part_of_the_line() {
        assert_eq!(parse(b"ping\r\n", 0, 0), ParseResult::Complete(6));
    }

    #[test]
    fn test_incomplete() {
        assert_eq!(parse(b"", 0, 0), ParseResult::Incomplete);
        assert_eq!(parse(b"ping", 0, 0), ParseResult::Incomplete);
    }

    #[test]
    fn test_resume_after_scanned_prefix() {
        assert_eq!(parse(b"hello wo", 5, 0), ParseResult::Incomplete);
        assert_eq!(parse(b"hello world\n", 8, 0), ParseResult::Complete(12));
        // A scan offset past the end is clamped
        assert_eq!(parse(b"ab", 10, 0), ParseResult::Incomplete);
    }

    #[test]
    fn test_line_limit() {
        assert_eq!(parse(b"abcd\n", 0, 4), ParseResult::Complete(5));
        assert_eq!(parse(b"abcde\n", 0, 4), ParseResult::TooLong);
        assert_eq!(parse(b"abcd", 0, 4), ParseResult::Incomplete);
        assert_eq!(parse(b"abcde", 0, 4), ParseResult::TooLong);
    }

    #[test]
    fn test_line_limit_excludes_crlf() {
        assert_eq!(parse(b"abcd\r\n", 0, 4), ParseResult::Complete(6));
        assert_eq!(parse(b"abcd\r", 0, 4), ParseResult::Incomplete);
        assert_eq!(parse(b"abcde\r\n", 0, 4), ParseResult::TooLong);
        assert_eq!(parse(b"abcd\rx", 0, 4), ParseResult::TooLong);
    }

    #[test]
    fn test_response() {
        let mut out = BytesMut::new();
        response(b"ping\n", &mut out);
        assert_eq!(&out[..], b"Message received: ping\n");

        out.clear();
        response(b"caf\xc3\xa9\r\n", &mut out);
        assert_eq!(&out[..], b"Message received: caf\xc3\xa9\r\n");
    }
}
