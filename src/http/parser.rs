//! Incremental HTTP/1.x request parser.
//!
//! Consumes bytes from a connection's input buffer across any number of
//! reads. One parser instance lives in the connection's context slot and is
//! reused for every request on that connection via `reset`.

use crate::buffer::Buffer;

use super::request::{HttpRequest, Method, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    ExpectRequestLine,
    ExpectHeaders,
    ExpectBody,
    GotAll,
}

pub struct HttpParser {
    state: ParseState,
    request: HttpRequest,
    content_length: usize,
}

impl Default for HttpParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpParser {
    pub fn new() -> HttpParser {
        HttpParser {
            state: ParseState::ExpectRequestLine,
            request: HttpRequest::new(),
            content_length: 0,
        }
    }

    /// Prepare for the next request on the same connection.
    pub fn reset(&mut self) {
        self.state = ParseState::ExpectRequestLine;
        self.request.reset();
        self.content_length = 0;
    }

    pub fn got_all(&self) -> bool {
        self.state == ParseState::GotAll
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    /// Drive the state machine as far as the buffered bytes allow,
    /// consuming what was parsed. Returns false on a malformed request;
    /// incomplete input is not an error.
    pub fn parse(&mut self, buf: &mut Buffer) -> bool {
        loop {
            match self.state {
                ParseState::ExpectRequestLine => {
                    let crlf = match buf.find_crlf() {
                        Some(crlf) => crlf,
                        None => return true,
                    };
                    if !self.parse_request_line(&buf.peek()[..crlf]) {
                        return false;
                    }
                    buf.retrieve_until(crlf + 2);
                    self.state = ParseState::ExpectHeaders;
                }
                ParseState::ExpectHeaders => {
                    let crlf = match buf.find_crlf() {
                        Some(crlf) => crlf,
                        None => return true,
                    };
                    let line = &buf.peek()[..crlf];
                    match line.iter().position(|&b| b == b':') {
                        Some(colon) => {
                            let field = String::from_utf8_lossy(&line[..colon]).into_owned();
                            let value =
                                String::from_utf8_lossy(&line[colon + 1..]).trim().to_string();
                            if field == "Content-Length" {
                                match value.parse::<usize>() {
                                    Ok(n) => self.content_length = n,
                                    Err(_) => return false,
                                }
                            }
                            self.request.add_header(field, value);
                            buf.retrieve_until(crlf + 2);
                        }
                        None => {
                            // Empty line: header section is over.
                            buf.retrieve_until(crlf + 2);
                            if self.content_length > 0 {
                                self.state = ParseState::ExpectBody;
                            } else {
                                self.state = ParseState::GotAll;
                                return true;
                            }
                        }
                    }
                }
                ParseState::ExpectBody => {
                    if buf.readable_bytes() < self.content_length {
                        return true;
                    }
                    self.request
                        .set_body(buf.retrieve_as_string(self.content_length));
                    self.state = ParseState::GotAll;
                    return true;
                }
                ParseState::GotAll => return true,
            }
        }
    }

    /// `METHOD SP PATH SP "HTTP/1." ('0'|'1')`.
    fn parse_request_line(&mut self, line: &[u8]) -> bool {
        let mut parts = line.splitn(3, |&b| b == b' ');

        let method = match parts.next().and_then(Method::from_bytes) {
            Some(method) => method,
            None => return false,
        };
        let path = match parts.next() {
            Some(path) if !path.is_empty() => path,
            _ => return false,
        };
        let version = match parts.next() {
            Some(version) => version,
            None => return false,
        };
        if version.len() != 8 || &version[..7] != b"HTTP/1." {
            return false;
        }
        let version = match version[7] {
            b'0' => Version::Http10,
            b'1' => Version::Http11,
            _ => return false,
        };

        self.request.set_method(method);
        self.request.set_path(String::from_utf8_lossy(path).into_owned());
        self.request.set_version(version);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(bytes: &[u8]) -> Buffer {
        let mut buf = Buffer::new();
        buf.append(bytes);
        buf
    }

    #[test]
    fn parses_request_without_body() {
        let mut parser = HttpParser::new();
        let mut buf = buffer_with(b"GET / HTTP/1.1\r\n\r\n");

        assert!(parser.parse(&mut buf));
        assert!(parser.got_all());
        let request = parser.request();
        assert_eq!(request.method(), Some(Method::Get));
        assert_eq!(request.path(), "/");
        assert_eq!(request.version(), Version::Http11);
        assert_eq!(request.body(), "");
    }

    #[test]
    fn parses_post_with_body() {
        let mut parser = HttpParser::new();
        let mut buf = buffer_with(b"POST /x HTTP/1.0\r\nContent-Length: 5\r\n\r\nhello");

        assert!(parser.parse(&mut buf));
        assert!(parser.got_all());
        let request = parser.request();
        assert_eq!(request.method(), Some(Method::Post));
        assert_eq!(request.path(), "/x");
        assert_eq!(request.version(), Version::Http10);
        assert_eq!(request.body(), "hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_unknown_version() {
        let mut parser = HttpParser::new();
        let mut buf = buffer_with(b"GET / HTTP/2.0\r\n\r\n");
        assert!(!parser.parse(&mut buf));
    }

    #[test]
    fn rejects_unknown_method() {
        let mut parser = HttpParser::new();
        let mut buf = buffer_with(b"BREW /pot HTTP/1.1\r\n\r\n");
        assert!(!parser.parse(&mut buf));
    }

    #[test]
    fn rejects_bad_content_length() {
        let mut parser = HttpParser::new();
        let mut buf = buffer_with(b"POST / HTTP/1.1\r\nContent-Length: soon\r\n\r\n");
        assert!(!parser.parse(&mut buf));
    }

    #[test]
    fn resumes_across_partial_header() {
        let mut parser = HttpParser::new();
        let mut buf = buffer_with(b"GET / HTTP/1.1\r\nHost: a");

        assert!(parser.parse(&mut buf));
        assert!(!parser.got_all());

        buf.append(b".b\r\n\r\n");
        assert!(parser.parse(&mut buf));
        assert!(parser.got_all());
        assert_eq!(parser.request().header("Host"), Some("a.b"));
    }

    #[test]
    fn waits_for_full_body() {
        let mut parser = HttpParser::new();
        let mut buf = buffer_with(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nhel");

        assert!(parser.parse(&mut buf));
        assert!(!parser.got_all());

        buf.append(b"lo world");
        assert!(parser.parse(&mut buf));
        assert!(parser.got_all());
        assert_eq!(parser.request().body(), "hello worl");
        // The byte beyond Content-Length stays in the buffer.
        assert_eq!(buf.peek(), b"d");
    }

    #[test]
    fn header_values_are_trimmed() {
        let mut parser = HttpParser::new();
        let mut buf = buffer_with(b"GET / HTTP/1.1\r\nUser-Agent:   probe/1.0  \r\n\r\n");

        assert!(parser.parse(&mut buf));
        assert!(parser.got_all());
        assert_eq!(parser.request().header("User-Agent"), Some("probe/1.0"));
    }

    #[test]
    fn reset_supports_pipelined_requests() {
        let mut parser = HttpParser::new();
        let mut buf = buffer_with(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");

        assert!(parser.parse(&mut buf));
        assert!(parser.got_all());
        assert_eq!(parser.request().path(), "/a");

        parser.reset();
        assert!(parser.parse(&mut buf));
        assert!(parser.got_all());
        assert_eq!(parser.request().path(), "/b");
        assert!(buf.is_empty());
    }

    #[test]
    fn round_trips_a_serialized_request() {
        // parse(serialize(R)) == R for a request assembled by hand.
        let mut expected = HttpRequest::new();
        expected.set_method(Method::Post);
        expected.set_path("/submit".to_string());
        expected.set_version(Version::Http11);
        expected.add_header("Host".to_string(), "example".to_string());
        expected.add_header("Content-Length".to_string(), "4".to_string());
        expected.set_body("data".to_string());

        let mut buf = buffer_with(
            b"POST /submit HTTP/1.1\r\nHost: example\r\nContent-Length: 4\r\n\r\ndata",
        );
        let mut parser = HttpParser::new();
        assert!(parser.parse(&mut buf));
        assert!(parser.got_all());
        assert_eq!(parser.request(), &expected);
    }
}
