//! Provides a parser and wrapper for handling incoming RESP command frames.
//!
//! A RESP command frame is quite simple. It starts with a "*" followed by the number of
//! elements. Each element is a bulk string: a "$" followed by the number of bytes in the
//! string, a CRLF (\r\n), the string data and yet another CRLF.
//!
//! Therefore a simple command might look like:
//! * "PING" => `*1\r\n$4\r\nPING\r\n`
//! * "GET test" => `*2\r\n$3\r\nGET\r\n$4\r\ntest\r\n`
//!
//! As these frames arrive via a network interface which might deliver partial data, the
//! parser distinguishes three outcomes: a malformed frame (**Err**), a partial frame
//! (`Ok(None)` - the caller keeps reading) and a complete frame (`Ok(Some(Request))`).
//! Bytes trailing a complete frame are left untouched; [Request::len] reports how many
//! bytes the frame occupied so that the caller can consume exactly those.
//!
//! The first element of a frame is the command name. It is canonicalized to upper case
//! during parsing, so that `get`, `Get` and `GET` all address the same handler. All other
//! elements are kept as received - internally only byte offsets into the input buffer
//! are recorded, so no argument data is copied during parsing.
//!
//! # Examples
//!
//! Parsing a simple command:
//! ```
//! # use bytes::BytesMut;
//! # use ganymede::request::Request;
//! let bytes = BytesMut::from("*2\r\n$3\r\nget\r\n$4\r\ntest\r\n");
//! let request = Request::parse(&bytes).unwrap().unwrap();
//!
//! assert_eq!(request.command(), "GET");
//! assert_eq!(request.parameter_count(), 1);
//! assert_eq!(request.str_parameter(0).unwrap(), "test");
//! ```
//!
//! Parsing a partial frame:
//! ```
//! # use bytes::BytesMut;
//! # use ganymede::request::Request;
//! let bytes = BytesMut::from("*2\r\n$3\r\nGET\r\n$7\r\nsome");
//! let request = Request::parse(&bytes).unwrap();
//!
//! assert_eq!(request.is_none(), true);
//! ```
//!
//! Parsing a malformed frame:
//! ```
//! # use bytes::BytesMut;
//! # use ganymede::request::Request;
//! let bytes = BytesMut::from("$4\r\nPING\r\n");
//! let request = Request::parse(&bytes);
//!
//! assert_eq!(request.is_err(), true);
//! ```
use anyhow::{anyhow, Context, Result};
use bytes::{Bytes, BytesMut};

/// Records the location of an argument within the underlying byte buffer.
///
/// The range is half open (**end** is exclusive), so that empty bulk strings are
/// representable without special cases.
#[derive(Copy, Clone, Debug)]
struct Range {
    start: usize,
    end: usize,
}

impl Range {
    /// Computes the start of the subsequent element by skipping over the trailing CRLF.
    fn next_offset(&self) -> usize {
        self.end + 2
    }
}

/// Represents a parsed RESP command frame.
///
/// Note that we treat the 1st element as "command" and re-number all other elements
/// accordingly. Therefore "GET test" has "GET" as command and "test" as first
/// parameter (index: 0).
pub struct Request {
    len: usize,
    data: Bytes,
    command: String,
    arguments: Vec<Range>,
}

impl Request {
    const DOLLAR: u8 = b'$';
    const ASTERISK: u8 = b'*';
    const CR: u8 = b'\r';
    const ZERO_DIGIT: u8 = b'0';
    const NINE_DIGIT: u8 = b'9';

    /// Tries to parse a RESP command frame from the given byte buffer.
    ///
    /// If malformed data is detected, we return an **Err**. Otherwise we either return an
    /// empty optional in case only a partial frame is present, or a full request in the
    /// form `Ok(Some(Request))`.
    pub fn parse(data: &BytesMut) -> Result<Option<Request>> {
        if data.is_empty() {
            return Ok(None);
        }
        if data[0] != Request::ASTERISK {
            return Err(anyhow!("A command frame must be an array of bulk strings!"));
        }

        // Parse the number of elements. The frame must announce at least the command
        // itself - a "*0" array cannot be dispatched anywhere.
        let (count, range) = match Request::read_int(data, 1)? {
            Some((count, range)) => (count, range),
            _ => return Ok(None),
        };
        if count == 0 {
            return Err(anyhow!("A command frame must announce at least one element!"));
        }

        // Parse the first element as command...
        let mut offset = range.next_offset();
        let command = match Request::read_bulk_string(data, offset)? {
            Some(range) => range,
            _ => return Ok(None),
        };
        offset = command.next_offset();

        // ...and all remaining elements as arguments.
        let mut arguments = Vec::with_capacity((count - 1) as usize);
        while arguments.len() < (count - 1) as usize {
            match Request::read_bulk_string(data, offset)? {
                Some(range) => {
                    arguments.push(range);
                    offset = range.next_offset();
                }
                _ => return Ok(None),
            }
        }

        let command = String::from_utf8_lossy(&data[command.start..command.end]).to_ascii_uppercase();

        Ok(Some(Request {
            len: offset,
            data: data.clone().freeze(),
            command,
            arguments,
        }))
    }

    /// Provides a helper function to create an example request in test environments.
    ///
    /// # Example
    /// ```
    /// # use ganymede::request::Request;
    /// let request = Request::example(vec!["PING"]);
    /// assert_eq!(request.command(), "PING");
    /// ```
    pub fn example(data: Vec<&str>) -> Request {
        let mut input = String::new();
        input.push_str(&format!("*{}\r\n", data.len()));
        for element in data {
            input.push_str(&format!("${}\r\n{}\r\n", element.len(), element));
        }

        Request::parse(&BytesMut::from(input.as_str()))
            .unwrap()
            .unwrap()
    }

    /// Tries to parse a number.
    ///
    /// This is either the number of elements or the length of a bulk string. The return
    /// type covers the happy path (a valid number terminated by a CR), the error case
    /// (a non-digit was found) and the partial case (the buffer ended before the CR).
    fn read_int(buffer: &BytesMut, offset: usize) -> Result<Option<(i64, Range)>> {
        let mut value: i64 = 0;
        let mut index = offset;
        while index < buffer.len() {
            let digit = buffer[index];
            if digit == Request::CR {
                return Ok(Some((
                    value,
                    Range {
                        start: offset,
                        end: index,
                    },
                )));
            }
            if !(Request::ZERO_DIGIT..=Request::NINE_DIGIT).contains(&digit) {
                return Err(anyhow!("Malformed integer at position {}", index));
            }

            value = value * 10 + (digit - Request::ZERO_DIGIT) as i64;
            index += 1;
        }

        Ok(None)
    }

    /// Tries to read a bulk string starting at the given offset.
    ///
    /// Returns the range of the string data, **None** if the buffer ends within the
    /// element or an **Err** if the element is not a well-formed bulk string.
    fn read_bulk_string(buffer: &BytesMut, offset: usize) -> Result<Option<Range>> {
        if offset >= buffer.len() {
            return Ok(None);
        }
        if buffer[offset] != Request::DOLLAR {
            return Err(anyhow!("Expected a bulk string at position {}", offset));
        }

        if let Some((length, range)) = Request::read_int(buffer, offset + 1)? {
            let start = range.next_offset();
            let end = start + length as usize;
            if buffer.len() >= end + 2 {
                return Ok(Some(Range { start, end }));
            }
        }

        Ok(None)
    }

    /// Returns the command of this frame, canonicalized to upper case.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Returns the number of parameters (not counting the command itself).
    pub fn parameter_count(&self) -> usize {
        self.arguments.len()
    }

    /// Returns the n-th parameter (not including the command) as raw bytes.
    ///
    /// Returns an **Err** if the requested index is outside of the range of detected
    /// parameters.
    pub fn parameter(&self, index: usize) -> Result<Bytes> {
        match self.arguments.get(index) {
            Some(range) => Ok(self.data.slice(range.start..range.end)),
            _ => Err(anyhow!(
                "Invalid parameter index {} (only {} are present)",
                index,
                self.arguments.len()
            )),
        }
    }

    /// Returns the n-th parameter as UTF-8 string.
    ///
    /// Returns an **Err** if either the requested index is out of range or if the
    /// parameter data isn't a valid UTF-8 sequence.
    pub fn str_parameter(&self, index: usize) -> Result<&str> {
        match self.arguments.get(index) {
            Some(range) => std::str::from_utf8(&self.data[range.start..range.end])
                .with_context(|| format!("Failed to read parameter {} as UTF-8 string!", index)),
            _ => Err(anyhow!(
                "Invalid parameter index {} (only {} are present)",
                index,
                self.arguments.len()
            )),
        }
    }

    /// Returns the total length in bytes of this frame within the input buffer.
    ///
    /// Bytes beyond this length belong to the next frame and must be preserved by the
    /// caller.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Determines whether the frame occupies any bytes at all (it always does; this
    /// accompanies [Request::len] for completeness).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
