//! Minimal HTTP client for the container runtime's local UNIX socket.
//!
//! The runtime API only needs request-line `GET`s, so this client speaks
//! just enough HTTP/1.1 to send one and frame the answer: status-line
//! classification, `Content-Length` and chunked bodies, and keep-alive
//! reuse of the socket for the lifetime of the owning source. Only the
//! lookup worker thread ever touches the connection, so everything here is
//! plain blocking I/O.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Well-known socket path of the Docker daemon.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/docker.sock";

const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Classified outcome of a runtime API request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerResponse {
    /// 2xx; carries the raw response body.
    Ok(String),
    /// 4xx; the caller may retry once without the API-version prefix.
    BadRequest,
    /// Any other status, or a transport failure.
    Error,
}

/// The seam between the metadata resolver and the wire.
///
/// Production uses [`UnixHttpClient`]; tests substitute a fake with canned
/// responses.
pub trait DockerTransport: Send {
    fn request(&mut self, path: &str) -> DockerResponse;
}

/// Blocking HTTP/1.1 client over a UNIX domain socket.
pub struct UnixHttpClient {
    socket_path: PathBuf,
    stream: Option<BufReader<UnixStream>>,
}

impl UnixHttpClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            stream: None,
        }
    }

    fn connect(path: &Path) -> io::Result<BufReader<UnixStream>> {
        let stream = UnixStream::connect(path)?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;
        Ok(BufReader::new(stream))
    }

    fn roundtrip(&mut self, path: &str) -> io::Result<(u16, String)> {
        let reused = self.stream.is_some();
        if self.stream.is_none() {
            self.stream = Some(Self::connect(&self.socket_path)?);
        }
        let stream = self.stream.as_mut().expect("stream just connected");

        let request = format!("GET {path} HTTP/1.1\r\nHost: docker\r\n\r\n");
        let written = stream.get_ref().write_all(request.as_bytes());
        let outcome = written.and_then(|_| read_response(stream));

        match outcome {
            Ok((status, body, close)) => {
                if close {
                    self.stream = None;
                }
                Ok((status, body))
            }
            Err(err) if reused => {
                // the daemon closed the kept-alive connection; retry once
                log::debug!("stale runtime connection ({err}), reconnecting");
                self.stream = None;
                self.roundtrip(path)
            }
            Err(err) => {
                self.stream = None;
                Err(err)
            }
        }
    }
}

impl DockerTransport for UnixHttpClient {
    fn request(&mut self, path: &str) -> DockerResponse {
        match self.roundtrip(path) {
            Ok((status, body)) => match status {
                200..=299 => DockerResponse::Ok(body),
                400..=499 => DockerResponse::BadRequest,
                _ => {
                    log::debug!("runtime API returned status {status} for `{path}`");
                    DockerResponse::Error
                }
            },
            Err(err) => {
                log::debug!(
                    "runtime API request `{}` failed on `{}`: {}",
                    path,
                    self.socket_path.display(),
                    err
                );
                DockerResponse::Error
            }
        }
    }
}

/// Reads one HTTP response: status code, body, and whether the server asked
/// to close the connection.
fn read_response<R: BufRead>(reader: &mut R) -> io::Result<(u16, String, bool)> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before status line",
        ));
    }
    let status = parse_status_line(&line)?;

    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    let mut close = false;
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside headers",
            ));
        }
        let header = line.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse().ok();
            } else if name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = value.eq_ignore_ascii_case("chunked");
            } else if name.eq_ignore_ascii_case("connection") {
                close = value.eq_ignore_ascii_case("close");
            }
        }
    }

    let body = if chunked {
        read_chunked_body(reader)?
    } else if let Some(len) = content_length {
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf)?;
        String::from_utf8_lossy(&buf).into_owned()
    } else {
        // no framing: the server must close the connection to end the body
        close = true;
        let mut body = String::new();
        reader.read_to_string(&mut body)?;
        body
    };

    Ok((status, body, close))
}

fn parse_status_line(line: &str) -> io::Result<u16> {
    line.split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed status line: {}", line.trim_end()),
            )
        })
}

fn read_chunked_body<R: BufRead>(reader: &mut R) -> io::Result<String> {
    let mut body = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        reader.read_line(&mut line)?;
        let size_field = line.trim().split(';').next().unwrap_or("");
        let size = usize::from_str_radix(size_field, 16).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid chunk size: {size_field}"),
            )
        })?;
        if size == 0 {
            // consume any trailers up to the final empty line
            loop {
                line.clear();
                let n = reader.read_line(&mut line)?;
                if n == 0 || line.trim_end_matches(['\r', '\n']).is_empty() {
                    break;
                }
            }
            break;
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..])?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_response_with_content_length() {
        let raw = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 7\r\n\r\n{\"a\":1}";
        let (status, body, close) = read_response(&mut Cursor::new(raw)).unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, "{\"a\":1}");
        assert!(!close);
    }

    #[test]
    fn test_read_response_chunked() {
        let raw = "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let (status, body, _) = read_response(&mut Cursor::new(raw)).unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, "Wikipedia");
    }

    #[test]
    fn test_read_response_until_eof() {
        let raw = "HTTP/1.0 500 Internal Server Error\r\n\r\noops";
        let (status, body, close) = read_response(&mut Cursor::new(raw)).unwrap();
        assert_eq!(status, 500);
        assert_eq!(body, "oops");
        assert!(close);
    }

    #[test]
    fn test_malformed_status_line_is_an_error() {
        let raw = "garbage\r\n\r\n";
        let err = read_response(&mut Cursor::new(raw)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_unix_client_roundtrip_and_classification() {
        use std::os::unix::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("docker.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut seen = Vec::new();
            // two requests on the same kept-alive connection
            for response in [
                "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi",
                "HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n",
            ] {
                let mut request = Vec::new();
                let mut byte = [0u8; 1];
                while !request.ends_with(b"\r\n\r\n") {
                    stream.read_exact(&mut byte).unwrap();
                    request.push(byte[0]);
                }
                seen.push(String::from_utf8(request).unwrap());
                stream.write_all(response.as_bytes()).unwrap();
            }
            seen
        });

        let mut client = UnixHttpClient::new(&socket_path);
        assert_eq!(
            client.request("/v1.24/containers/abc/json"),
            DockerResponse::Ok("hi".to_owned())
        );
        assert_eq!(
            client.request("/containers/abc/json"),
            DockerResponse::BadRequest
        );

        let seen = server.join().unwrap();
        assert_eq!(
            seen[0],
            "GET /v1.24/containers/abc/json HTTP/1.1\r\nHost: docker\r\n\r\n"
        );
        assert_eq!(seen[1], "GET /containers/abc/json HTTP/1.1\r\nHost: docker\r\n\r\n");
    }

    #[test]
    fn test_connect_failure_is_classified_as_error() {
        let mut client = UnixHttpClient::new("/definitely/not/a/socket");
        assert_eq!(client.request("/containers/abc/json"), DockerResponse::Error);
    }
}
