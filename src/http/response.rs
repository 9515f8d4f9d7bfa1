//! HTTP response serializer.

use std::collections::HashMap;

use bytes::Bytes;

use crate::buffer::Buffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusCode {
    #[default]
    Unknown,
    Ok,
    MovedPermanently,
    BadRequest,
    Forbidden,
    NotFound,
    InternalServerError,
}

impl StatusCode {
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Unknown => 0,
            StatusCode::Ok => 200,
            StatusCode::MovedPermanently => 301,
            StatusCode::BadRequest => 400,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::InternalServerError => 500,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    status_code: StatusCode,
    status_message: String,
    headers: HashMap<String, String>,
    body: Bytes,
    close_connection: bool,
}

impl HttpResponse {
    pub fn new() -> HttpResponse {
        HttpResponse::default()
    }

    pub fn set_status_code(&mut self, code: StatusCode) {
        self.status_code = code;
    }

    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.status_message = message.into();
    }

    pub fn set_close_connection(&mut self, on: bool) {
        self.close_connection = on;
    }

    pub fn close_connection(&self) -> bool {
        self.close_connection
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.add_header("Content-Type", content_type);
    }

    pub fn add_header(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(field.into(), value.into());
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    /// Serialize into `output`: status line, connection framing headers,
    /// user headers, blank line, body.
    pub fn append_to(&self, output: &mut Buffer) {
        output.append(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status_code.code(),
                self.status_message
            )
            .as_bytes(),
        );

        if self.close_connection {
            output.append(b"Connection: close\r\n");
        } else {
            output.append(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
            output.append(b"Connection: Keep-Alive\r\n");
        }

        for (field, value) in &self.headers {
            output.append(format!("{}: {}\r\n", field, value).as_bytes());
        }

        output.append(b"\r\n");
        output.append(&self.body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serialize(response: &HttpResponse) -> String {
        let mut out = Buffer::new();
        response.append_to(&mut out);
        out.retrieve_all_as_string()
    }

    #[test]
    fn keep_alive_response_carries_content_length() {
        let mut response = HttpResponse::new();
        response.set_status_code(StatusCode::Ok);
        response.set_status_message("OK");
        response.set_content_type("text/plain");
        response.set_body("hello");

        let wire = serialize(&response);
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.contains("Content-Length: 5\r\n"));
        assert!(wire.contains("Connection: Keep-Alive\r\n"));
        assert!(wire.contains("Content-Type: text/plain\r\n"));
        assert!(wire.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn close_response_omits_content_length() {
        let mut response = HttpResponse::new();
        response.set_status_code(StatusCode::BadRequest);
        response.set_status_message("Bad Request");
        response.set_close_connection(true);

        let wire = serialize(&response);
        assert!(wire.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(wire.contains("Connection: close\r\n"));
        assert!(!wire.contains("Content-Length"));
    }

    #[test]
    fn status_codes_map_to_numbers() {
        assert_eq!(StatusCode::Ok.code(), 200);
        assert_eq!(StatusCode::MovedPermanently.code(), 301);
        assert_eq!(StatusCode::BadRequest.code(), 400);
        assert_eq!(StatusCode::Forbidden.code(), 403);
        assert_eq!(StatusCode::NotFound.code(), 404);
        assert_eq!(StatusCode::InternalServerError.code(), 500);
    }
}
