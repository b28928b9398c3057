//! Represents a memory backed RESP reply.
//!
//! We use an internal buffer here so that a complete reply can be built without blocking
//! and then pushed onto the wire with a single sys-call.
//!
//! The proxy only ever answers with a single element per command (a bulk string, the nil
//! marker, a number or an error), so in contrast to a full RESP server no array nesting
//! is required. The response still guards against producing no reply or more than one,
//! as either would desynchronize the client.
//!
//! A peculiarity worth noting is [Response::raw]: a cache hit replays bytes which were
//! already encoded when the entry was stored, so the hot path performs no re-encoding at
//! all.
//!
//! # Example
//!
//! ```
//! # use ganymede::response::{OutputResult, Response};
//! # fn main() -> OutputResult {
//! let mut response = Response::new();
//! response.bulk("PONG")?;
//! assert_eq!(response.complete_string()?, "$4\r\nPONG\r\n");
//! # Ok(())
//! # }
//! ```
use std::error::Error;
use std::fmt::{Display, Formatter, Write};

use anyhow::anyhow;
use bytes::BytesMut;

/// Enumerates the possible errors when creating a reply.
#[derive(Debug)]
pub enum OutputError {
    /// Represents a formatting error while generating the reply.
    IOError(std::fmt::Error),

    /// Represents a protocol error, which most probably indicates that a handler
    /// produced no reply or attempted to produce several.
    ProtocolError(anyhow::Error),
}

impl From<std::fmt::Error> for OutputError {
    fn from(error: std::fmt::Error) -> OutputError {
        OutputError::IOError(error)
    }
}

impl From<anyhow::Error> for OutputError {
    fn from(error: anyhow::Error) -> OutputError {
        OutputError::ProtocolError(error)
    }
}

impl Display for OutputError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            OutputError::IOError(error) => write!(f, "IO error: {:?}", error),
            OutputError::ProtocolError(error) => write!(f, "Protocol error: {:?}", error),
        }
    }
}

impl Error for OutputError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match *self {
            OutputError::IOError(ref error) => Some(error),
            OutputError::ProtocolError(_) => None,
        }
    }
}

/// Represents the result type for all output operations.
///
/// The operations themselves don't produce a value but might emit an **OutputError**.
pub type OutputResult = std::result::Result<(), OutputError>;

/// Represents a RESP reply being built.
///
/// Exactly one of the emitting methods has to be invoked before
/// [complete](Response::complete) is called.
pub struct Response {
    buffer: BytesMut,
    pending: bool,
}

impl Default for Response {
    fn default() -> Self {
        Response::new()
    }
}

impl Response {
    /// Creates a new response.
    ///
    /// Internally this allocates a buffer of 8 kB which is grown on demand (e.g. for a
    /// large bulk string fetched from the upstream).
    pub fn new() -> Self {
        Response {
            buffer: BytesMut::with_capacity(8192),
            pending: true,
        }
    }

    fn check_reply(&mut self) -> OutputResult {
        if !self.pending {
            return Err(OutputError::ProtocolError(anyhow!(
                "A reply has already been produced for this response!"
            )));
        }

        self.pending = false;
        Ok(())
    }

    #[inline]
    fn reserve(&mut self, required_length: usize) {
        let remaining = self.buffer.capacity() - self.buffer.len();
        if remaining < required_length {
            self.buffer.reserve(required_length);
        }
    }

    /// Completes the reply and returns the serialized bytes.
    ///
    /// Returns an error if no reply has been produced, as sending nothing would leave
    /// the client waiting forever.
    ///
    /// As this consumes **self**, this is the final operation to be performed on a
    /// response.
    pub fn complete(self) -> Result<BytesMut, OutputError> {
        if self.pending {
            return Err(OutputError::ProtocolError(anyhow!(
                "No reply has been produced for this response!"
            )));
        }

        Ok(self.buffer)
    }

    /// Provides a helper method which directly transforms the reply into its string
    /// representation.
    ///
    /// This is only intended to be used in test environments to verify that a generated
    /// reply has the expected size and shape. Note that this does not support replies
    /// containing non UTF-8 data (which are generally supported by RESP).
    pub fn complete_string(self) -> Result<String, OutputError> {
        let buffer = self.complete()?;
        match std::str::from_utf8(&buffer[..]) {
            Ok(string) => Ok(string.to_owned()),
            Err(_) => Err(OutputError::ProtocolError(anyhow!("Non UTF-8 data found"))),
        }
    }

    /// Emits "OK" as simple string.
    ///
    /// # Example
    ///
    /// ```
    /// # use ganymede::response::{OutputResult, Response};
    /// # fn main() -> OutputResult {
    /// let mut response = Response::new();
    /// response.ok()?;
    /// assert_eq!(response.complete_string()?, "+OK\r\n");
    /// # Ok(())
    /// # }
    /// ```
    pub fn ok(&mut self) -> OutputResult {
        self.check_reply()?;
        self.reserve(5);
        self.buffer.write_str("+OK\r\n")?;
        Ok(())
    }

    /// Emits the given string as **simple string**.
    ///
    /// A simple string is encoded as "+STRING_VALUE". This requires that the given
    /// string does not contain any line breaks (CR or LF), which isn't enforced by this
    /// method. When in doubt, use [Response::bulk](Response::bulk).
    pub fn simple(&mut self, string: impl AsRef<str>) -> OutputResult {
        self.check_reply()?;
        self.reserve(3 + string.as_ref().len());
        self.buffer.write_char('+')?;
        self.buffer.write_str(string.as_ref())?;
        self.buffer.write_str("\r\n")?;

        Ok(())
    }

    /// Emits the given bytes as bulk string.
    ///
    /// RESP doesn't put any requirements on bulk strings, they may contain line breaks
    /// and arbitrary non UTF-8 bytes.
    ///
    /// # Example
    ///
    /// ```
    /// # use ganymede::response::{OutputResult, Response};
    /// # fn main() -> OutputResult {
    /// let mut response = Response::new();
    /// response.bulk("Hello\nWorld")?;
    /// assert_eq!(response.complete_string()?, "$11\r\nHello\nWorld\r\n");
    /// # Ok(())
    /// # }
    /// ```
    pub fn bulk(&mut self, data: impl AsRef<[u8]>) -> OutputResult {
        let data = data.as_ref();

        self.check_reply()?;
        self.reserve(16 + data.len());
        self.buffer.write_char('$')?;
        write!(self.buffer, "{}\r\n", data.len())?;
        self.buffer.extend_from_slice(data);
        self.buffer.write_str("\r\n")?;

        Ok(())
    }

    /// Emits the nil marker which represents an absent value.
    ///
    /// # Example
    ///
    /// ```
    /// # use ganymede::response::{OutputResult, Response};
    /// # fn main() -> OutputResult {
    /// let mut response = Response::new();
    /// response.nil()?;
    /// assert_eq!(response.complete_string()?, "$-1\r\n");
    /// # Ok(())
    /// # }
    /// ```
    pub fn nil(&mut self) -> OutputResult {
        self.check_reply()?;
        self.reserve(5);
        self.buffer.write_str("$-1\r\n")?;

        Ok(())
    }

    /// Emits the given number.
    ///
    /// # Example
    ///
    /// ```
    /// # use ganymede::response::{OutputResult, Response};
    /// # fn main() -> OutputResult {
    /// let mut response = Response::new();
    /// response.number(42)?;
    /// assert_eq!(response.complete_string()?, ":42\r\n");
    /// # Ok(())
    /// # }
    /// ```
    pub fn number(&mut self, number: i64) -> OutputResult {
        self.check_reply()?;
        self.reserve(32);
        self.buffer.write_char(':')?;
        write!(self.buffer, "{}\r\n", number)?;

        Ok(())
    }

    /// Emits an error message.
    ///
    /// Errors are encoded as "-ERROR MESSAGE" and must therefore not contain line
    /// breaks. This method automatically transforms CR and LF to " " so that we do not
    /// double fail (crash when reporting an error).
    ///
    /// # Example
    ///
    /// ```
    /// # use ganymede::response::{OutputResult, Response};
    /// # fn main() -> OutputResult {
    /// let mut response = Response::new();
    /// response.error("Good bye,\ncruel World")?;
    /// assert_eq!(response.complete_string()?, "-Good bye, cruel World\r\n");
    /// # Ok(())
    /// # }
    /// ```
    pub fn error(&mut self, string: impl AsRef<str>) -> OutputResult {
        self.check_reply()?;
        self.reserve(3 + string.as_ref().len());
        self.buffer.write_char('-')?;
        self.buffer
            .write_str(string.as_ref().replace(['\r', '\n'], " ").as_str())?;
        self.buffer.write_str("\r\n")?;

        Ok(())
    }

    /// Emits bytes which already are a fully encoded RESP reply.
    ///
    /// This is the cache hit path: entries store the encoded reply, therefore it can be
    /// spliced into the response verbatim. The caller has to guarantee that the bytes
    /// form exactly one valid reply element.
    pub fn raw(&mut self, data: &[u8]) -> OutputResult {
        self.check_reply()?;
        self.reserve(data.len());
        self.buffer.extend_from_slice(data);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::request::Request;
    use crate::response::Response;

    #[test]
    fn a_bulk_reply_can_be_read_back_as_frame() {
        let mut response = Response::new();
        response.bulk("PONG").unwrap();

        // A single bulk string is not a full command frame, therefore we wrap it into
        // an announcing array header...
        let mut buffer = bytes::BytesMut::from("*1\r\n");
        buffer.extend_from_slice(&response.complete().unwrap());

        let request = Request::parse(&buffer).unwrap().unwrap();
        assert_eq!(request.command(), "PONG");
        assert_eq!(request.parameter_count(), 0);
    }

    #[test]
    fn bulk_strings_support_arbitrary_bytes() {
        let mut response = Response::new();
        response.bulk([0u8, 159, 146, 150].as_slice()).unwrap();

        let buffer = response.complete().unwrap();
        assert_eq!(&buffer[..], b"$4\r\n\x00\x9f\x92\x96\r\n");
    }

    #[test]
    fn nil_is_encoded_as_negative_length() {
        let mut response = Response::new();
        response.nil().unwrap();
        assert_eq!(response.complete_string().unwrap(), "$-1\r\n");
    }

    #[test]
    fn raw_bytes_are_spliced_verbatim() {
        let mut response = Response::new();
        response.raw(b"$3\r\n123\r\n").unwrap();
        assert_eq!(response.complete_string().unwrap(), "$3\r\n123\r\n");
    }

    #[test]
    fn errors_are_sanitized() {
        let mut response = Response::new();
        response.error("Error\nProblem").unwrap();

        assert_eq!(response.complete_string().unwrap(), "-Error Problem\r\n");
    }

    #[test]
    fn a_missing_reply_is_detected() {
        let response = Response::new();
        assert_eq!(response.complete().is_err(), true);
    }

    #[test]
    fn a_double_reply_is_detected() {
        let mut response = Response::new();
        response.ok().unwrap();
        assert_eq!(response.ok().is_err(), true);
    }

    #[test]
    fn large_replies_grow_the_buffer() {
        let many_x = "X".repeat(16_000);

        let mut response = Response::new();
        response.bulk(many_x.as_str()).unwrap();

        assert_eq!(
            response.complete_string().unwrap(),
            format!("$16000\r\n{}\r\n", many_x)
        );
    }
}
