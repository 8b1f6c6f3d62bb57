//! Response model

use std::fmt::Write as _;

use crate::parser::{status::Status, Version};

use super::request::Header;

/// An HTTP/1.1 response being assembled by a handler. `Router::dispatch`
/// hands one of these, initialized to `200 OK` with no body, to every
/// matching handler in turn; handlers mutate it in place.
#[derive(Debug)]
pub struct Response {
    version: Version,
    status: Status,
    headers: Option<Vec<Header<'static>>>,
    body: String,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    /// Creates a `200 OK` HTTP/1.1 response with no body and no headers.
    pub fn new() -> Self {
        Self::new_with_status_line(Version::H1_1, Status::r#Ok)
    }

    /// Creates a response with the given version and status line, no body
    /// and no headers.
    pub fn new_with_status_line(version: Version, status: Status) -> Self {
        Response {
            version,
            status,
            headers: None,
            body: String::new(),
        }
    }

    /// The response's status code.
    pub fn status_code(&self) -> Status {
        self.status
    }

    /// Overwrites the response's status code.
    pub fn set_status_code(&mut self, status: Status) {
        self.status = status;
    }

    /// The HTTP version on the response's status line.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Appends a header field. Does not deduplicate against an existing
    /// field of the same name -- callers that need "set" semantics should
    /// remove an existing value first.
    pub fn add_header(&mut self, name: &'static str, value: &'static str) {
        self.headers
            .get_or_insert_with(Vec::new)
            .push(Header { name, value });
    }

    /// The response body, as built so far.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Replaces the response body in its entirety.
    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }

    /// Appends `text` to the response body.
    pub fn write_body(&mut self, text: &str) {
        self.body.push_str(text);
    }

    /// Serializes the status line and headers (plus a `Content-Length`
    /// computed from the body) up to and including the blank line that
    /// terminates the header section. Kept separate from the body so a
    /// caller can hand both to a vectored write without copying the body
    /// into the same buffer.
    pub fn serialized_head(&self) -> String {
        let mut out = String::with_capacity(64);
        let _ = write!(
            out,
            "{} {} {}\r\n",
            self.version,
            self.status as u16,
            status_reason(self.status)
        );

        if let Some(headers) = &self.headers {
            for header in headers {
                let _ = write!(out, "{}: {}\r\n", header.name, header.value);
            }
        }
        let _ = write!(out, "Content-Length: {}\r\n", self.body.len());
        out.push_str("\r\n");
        out
    }

    /// Serializes the response to its wire form: status line, headers
    /// (plus a `Content-Length` computed from the body), a blank line, then
    /// the body.
    pub fn get_serialized(&self) -> String {
        let mut out = self.serialized_head();
        out.push_str(&self.body);
        out
    }
}

/// The standard reason phrase for a status code, used on the response's
/// status line.
fn status_reason(status: Status) -> &'static str {
    match status {
        Status::Continue => "Continue",
        Status::SwitchingProtocols => "Switching Protocols",
        Status::r#Ok => "OK",
        Status::Created => "Created",
        Status::Accepted => "Accepted",
        Status::NonAuthoritativeInformation => "Non-Authoritative Information",
        Status::NoContent => "No Content",
        Status::ResetContent => "Reset Content",
        Status::PartialContent => "Partial Content",
        Status::MultipleChoices => "Multiple Choices",
        Status::MovedPermanently => "Moved Permanently",
        Status::Found => "Found",
        Status::SeeOther => "See Other",
        Status::NotModified => "Not Modified",
        Status::UseProxy => "Use Proxy",
        Status::TemporaryRedirect => "Temporary Redirect",
        Status::PermanentRedirect => "Permanent Redirect",
        Status::BadRequest => "Bad Request",
        Status::Unauthorized => "Unauthorized",
        Status::PaymentRequired => "Payment Required",
        Status::Forbidden => "Forbidden",
        Status::NotFound => "Not Found",
        Status::MethodNotAllowed => "Method Not Allowed",
        Status::NotAcceptable => "Not Acceptable",
        Status::ProxyAuthenticationRequired => "Proxy Authentication Required",
        Status::RequestTimeout => "Request Timeout",
        Status::Conflict => "Conflict",
        Status::Gone => "Gone",
        Status::LengthRequired => "Length Required",
        Status::PreconditionFailed => "Precondition Failed",
        Status::ContentTooLarge => "Content Too Large",
        Status::UriTooLong => "URI Too Long",
        Status::UnsupportedMediaType => "Unsupported Media Type",
        Status::RangeNotSatisfiable => "Range Not Satisfiable",
        Status::ExpectationFailed => "Expectation Failed",
        Status::MisdirectedRequest => "Misdirected Request",
        Status::UnprocessableContent => "Unprocessable Content",
        Status::UpgradeRequired => "Upgrade Required",
        Status::InternalServerError => "Internal Server Error",
        Status::NotImplemented => "Not Implemented",
        Status::BadGateway => "Bad Gateway",
        Status::ServiceUnavailable => "Service Unavailable",
        Status::GatewayTimeout => "Gateway Timeout",
        Status::HTTPVersionNotSupported => "HTTP Version Not Supported",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_response_defaults_to_200() {
        let resp = Response::new();
        assert!(matches!(resp.status_code(), Status::r#Ok));
        assert_eq!("", resp.body());
    }

    #[test]
    fn serialized_response_includes_status_line_and_content_length() {
        let mut resp = Response::new();
        resp.set_body("hello");
        let wire = resp.get_serialized();
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.contains("Content-Length: 5\r\n"));
        assert!(wire.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn set_status_code_changes_status_line() {
        let mut resp = Response::new();
        resp.set_status_code(Status::NotFound);
        let wire = resp.get_serialized();
        assert!(wire.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }
}
