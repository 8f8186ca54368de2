// src/http.rs
use std::io::Write;
use std::path::Path;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
}

impl Method {
    /// Case-insensitive method match; anything but GET is unsupported.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.eq_ignore_ascii_case(b"GET") {
            Some(Method::Get)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http11,
}

impl Version {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.eq_ignore_ascii_case(b"HTTP/1.1") {
            Some(Version::Http11)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::InternalError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::InternalError => "Internal Error",
        }
    }

    /// Canned body sent with an error status. Empty for 200.
    pub fn canned_body(self) -> &'static [u8] {
        match self {
            StatusCode::Ok => b"",
            StatusCode::BadRequest => {
                b"Your request has bad syntax or is inherently impossible to satisfy.\n"
            }
            StatusCode::Forbidden => b"You do not have permission to get file from this server.\n",
            StatusCode::NotFound => b"The requested file was not found on this server.\n",
            StatusCode::InternalError => {
                b"There was an unusual problem serving the requested file.\n"
            }
        }
    }

    fn status_line(self) -> &'static [u8] {
        match self {
            StatusCode::Ok => b"HTTP/1.1 200 OK\r\n",
            StatusCode::BadRequest => b"HTTP/1.1 400 Bad Request\r\n",
            StatusCode::Forbidden => b"HTTP/1.1 403 Forbidden\r\n",
            StatusCode::NotFound => b"HTTP/1.1 404 Not Found\r\n",
            StatusCode::InternalError => b"HTTP/1.1 500 Internal Error\r\n",
        }
    }
}

pub const CANNED_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Best-effort Content-Type from a file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or(FALLBACK_CONTENT_TYPE)
}

/// Serialize a response head (status line, headers, blank line) into `out`.
///
/// `out` is cleared first so the connection can reuse its allocation.
pub fn write_head(
    out: &mut Vec<u8>,
    status: StatusCode,
    content_length: usize,
    content_type: &str,
    keep_alive: bool,
) {
    out.clear();
    out.extend_from_slice(status.status_line());
    out.extend_from_slice(b"Date: ");
    out.extend_from_slice(httpdate::fmt_http_date(SystemTime::now()).as_bytes());
    out.extend_from_slice(b"\r\nServer: kiln\r\n");
    // Writing into a Vec cannot fail.
    let _ = write!(out, "Content-Length: {}\r\n", content_length);
    out.extend_from_slice(b"Content-Type: ");
    out.extend_from_slice(content_type.as_bytes());
    out.extend_from_slice(b"\r\n");
    if keep_alive {
        out.extend_from_slice(b"Connection: keep-alive\r\n");
    } else {
        out.extend_from_slice(b"Connection: close\r\n");
    }
    out.extend_from_slice(b"\r\n");
}
