// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP/1.1 Request

use core::str::from_utf8_unchecked;

use super::tokens::{is_header_name_token, is_header_value_token, is_request_target_token};
use super::{discard_whitespace, take_after_newline, ParseError};
use crate::parser::raw_request::RawRequest;
use crate::parser::{Method, Version};

// TODO: I don't think we can hold onto &str, as we may receive requests over multiple TCP packets.
// This would require such a mashup of lifetimes that would be impossible to reason about. How do
// we avoid the need to allocate a ton of strings? Would cost two heap allocations per header...
// Can we potentially just keep a buffer for the entire request received over multiple packets, and
// indexes into the important parts, deferring parsing until it's actually needed/used? Would mean
// one heap allocation per packet rather than tons

/// A single parsed header field, borrowed from the request's read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header<'buf> {
    /// Field name, as received (not lowercased).
    pub name: &'buf str,
    /// Field value, with leading/trailing optional whitespace stripped.
    pub value: &'buf str,
}

impl<'buf> Header<'buf> {
    /// True if `name` matches this header's name, case-insensitively, as
    /// required for HTTP field names.
    pub fn name_eq_ignore_ascii_case(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Parsed H1 Request
/// IETF RFC 9112
#[derive(Debug, Default)]
pub struct H1Request<'buf> {
    /// method
    pub method: Option<Method>,
    /// target
    pub target: Option<&'buf str>,
    /// version
    pub version: Option<Version>,
    /// headers, in the order they appeared on the wire
    pub headers: Option<Vec<Header<'buf>>>,
}

impl<'b> H1Request<'b> {
    /// Creates a new HTTP/1.1 request
    pub fn new() -> Self {
        H1Request {
            method: None,
            target: None,
            version: None,
            headers: None,
        }
    }

    /// Parses the request line and headers out of `buf`. Returns whatever
    /// of `buf` is left unconsumed past the blank line terminating the
    /// header section -- the start of the message body, if any.
    ///
    /// # Example
    /// ```
    /// # use taskio::parser::{Method, Version};
    /// # use taskio::parser::h1::ParseError;
    /// # use taskio::parser::h1::request::H1Request;
    /// # fn main() -> Result<(), ParseError> {
    /// let mut req = H1Request::new();
    /// let body = req.parse(b"GET / HTTP/1.1\r\n\r\n")?;
    /// assert_eq!(Some(Method::Get), req.method);
    /// assert_eq!(Some("/"), req.target);
    /// assert_eq!(Some(Version::H1_1), req.version);
    /// assert!(body.is_empty());
    /// # Ok(())
    /// # }
    /// ```
    pub fn parse(&mut self, buf: &'b [u8]) -> Result<&'b [u8], ParseError> {
        let mut req = RawRequest::new(buf);
        self.set_method(&mut req)?;
        self.set_target(&mut req)?;
        self.set_version(&mut req)?;
        take_after_newline(&mut req)?;
        self.set_headers(&mut req)?;

        Ok(req.as_ref())
    }

    /// The value of the `Content-Length` header, if present and a valid
    /// non-negative integer. Used to size the body read after headers
    /// complete.
    pub fn content_length(&self) -> Option<usize> {
        self.headers
            .as_ref()?
            .iter()
            .find(|h| h.name_eq_ignore_ascii_case("Content-Length"))
            .and_then(|h| h.value.trim().parse().ok())
    }

    /// Whether the connection should be kept open after this request's
    /// response is sent, per the `Connection` header and the request's HTTP
    /// version: HTTP/1.1 defaults to keep-alive unless `Connection: close`
    /// is present; HTTP/1.0 defaults to close unless `Connection:
    /// keep-alive` is present.
    pub fn keep_alive(&self) -> bool {
        let connection = self
            .headers
            .as_ref()
            .and_then(|headers| headers.iter().find(|h| h.name_eq_ignore_ascii_case("Connection")));

        match self.version {
            Some(Version::H1_0) => connection.is_some_and(|h| h.value.eq_ignore_ascii_case("keep-alive")),
            _ => !connection.is_some_and(|h| h.value.eq_ignore_ascii_case("close")),
        }
    }

    // TODO: This may have way too many branches. Control flow looks insane https://godbolt.org/z/jhx8Ga4d3
    fn set_method(&mut self, buf: &mut RawRequest<'b>) -> Result<(), ParseError> {
        if buf.any(|&b| !b.is_ascii_uppercase()) {
            if let Ok(slice) = buf.slice_skip(1) {
                let res = match slice {
                    b"GET" => Ok(Method::Get),
                    b"HEAD" => Ok(Method::Head),
                    b"POST" => Ok(Method::Post),
                    b"PUT" => Ok(Method::Put),
                    b"DELETE" => Ok(Method::Delete),
                    b"CONNECT" => Ok(Method::Connect),
                    b"OPTIONS" => Ok(Method::Options),
                    b"TRACE" => Ok(Method::Trace),
                    _ => Err(ParseError::Method),
                }?;

                self.method = Some(res);
                return Ok(());
            }
        }

        Err(ParseError::Method)
    }

    fn set_target(&mut self, buf: &mut RawRequest<'b>) -> Result<(), ParseError> {
        for &b in &mut *buf {
            if b == b' ' {
                if let Ok(slice) = buf.slice_skip(1) {
                    // SAFETY: slice has been checked for valid ASCII in this range, which makes this valid utf8
                    self.target = Some(unsafe { from_utf8_unchecked(slice) });
                    return Ok(());
                }

                break;
            } else if !is_request_target_token(b) {
                break;
            }
        }

        Err(ParseError::Target)
    }

    fn set_version(&mut self, buf: &mut RawRequest<'b>) -> Result<(), ParseError> {
        let result = if !buf.take(5).eq(b"HTTP/".iter()) {
            Err(ParseError::Version)
        } else {
            match buf.next() {
                Some(b'1') => {
                    if buf.next() == Some(&b'.') {
                        match buf.next() {
                            Some(b'0') => Ok(Version::H1_0),
                            Some(b'1') => Ok(Version::H1_1),
                            _ => Err(ParseError::Version),
                        }
                    } else {
                        Err(ParseError::Version)
                    }
                }
                Some(b'2') => Ok(Version::H2),
                Some(b'3') => Ok(Version::H3),
                _ => Err(ParseError::Version),
            }
        };

        buf.slice();

        match result {
            Ok(version) => {
                self.version = Some(version);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Parses zero or more `Name: value` header fields up to and including
    /// the blank line terminating the header section.
    fn set_headers(&mut self, buf: &mut RawRequest<'b>) -> Result<(), ParseError> {
        let mut headers = Vec::new();

        loop {
            match buf.peek() {
                None => return Err(ParseError::NewLine),
                Some(b'\r') => {
                    take_after_newline(buf)?;
                    break;
                }
                _ => {}
            }

            let name_bytes = buf
                .take_until(|b| b == b':')
                .ok_or(ParseError::HeaderName)?;
            if name_bytes.is_empty() || !name_bytes.iter().all(|&b| is_header_name_token(b)) {
                return Err(ParseError::HeaderName);
            }
            // consume the ':'
            buf.next();
            buf.slice();

            discard_whitespace(buf);

            let value_bytes = buf
                .take_until(|b| b == b'\r')
                .unwrap_or_default();
            if !value_bytes.iter().all(|&b| is_header_value_token(b)) {
                return Err(ParseError::HeaderValue);
            }

            take_after_newline(buf)?;

            // SAFETY: both slices were validated against ASCII token sets above.
            let name = unsafe { from_utf8_unchecked(name_bytes) };
            let value = unsafe { from_utf8_unchecked(value_bytes) };
            headers.push(Header {
                name,
                value: value.trim_end_matches([' ', '\t']),
            });
        }

        if !headers.is_empty() {
            self.headers = Some(headers);
        }

        Ok(())
    }
}
