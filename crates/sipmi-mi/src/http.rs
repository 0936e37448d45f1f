//! HTTP connector: POSTs the command to the server's MI endpoint.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::OnceLock;

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;
use url::Url;

use crate::config::{ConnectorKind, HttpConfig};
use crate::connector::{Connector, Validation};
use crate::error::{MiResult, TransportError};

/// Connector posting JSON-RPC bodies over HTTP(S).
#[derive(Debug)]
pub struct HttpConnector {
    config: HttpConfig,
    url: Url,
    client: OnceLock<Client>,
}

impl HttpConnector {
    /// Checks the URL up front so each exchange can assume it is sound.
    pub fn new(config: HttpConfig) -> MiResult<Self> {
        let url = config.validate()?;
        Ok(Self {
            config,
            url,
            client: OnceLock::new(),
        })
    }

    // A blocking client must not be built on an async worker, so it is
    // built by the first exchange and pooled from then on.
    fn client(&self) -> Result<&Client, TransportError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let mut builder = Client::builder().timeout(self.config.timeout);
        if self.url.scheme() == "https" {
            // Servers commonly run with self-signed certificates.
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build()?;
        Ok(self.client.get_or_init(|| client))
    }
}

impl Connector for HttpConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Http
    }

    fn exchange(&self, request: &str) -> Result<String, TransportError> {
        let response = self
            .client()?
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(request.to_string())
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::timeout(format!("request to {}", self.url))
                } else {
                    TransportError::Http(e)
                }
            })?
            .error_for_status()?;

        debug!(url = %self.url, status = %response.status(), "MI reply received");
        Ok(response.text()?)
    }

    /// Opens and closes a TCP connection to the URL's host and port.
    fn valid(&self) -> Validation {
        match probe(&self.url, &self.config) {
            Ok(()) => Validation::valid(),
            Err(e) => Validation::invalid(vec![
                format!("Could not connect to {} ({})", self.url, e),
                "Is the server running?".to_string(),
            ]),
        }
    }
}

fn probe(url: &Url, config: &HttpConfig) -> std::io::Result<()> {
    let host = url.host_str().unwrap_or_default();
    let port = url.port_or_known_default().unwrap_or(80);
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, config.timeout) {
            Ok(_) => return Ok(()),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::AddrNotAvailable)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    fn read_request(reader: &mut impl BufRead) -> String {
        let mut content_length = 0;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            if line == "\r\n" || line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap();
                }
            }
        }
        let mut request = vec![0u8; content_length];
        reader.read_exact(&mut request).unwrap();
        String::from_utf8(request).unwrap()
    }

    /// Answers one request with `status` and `body`; returns the request body.
    fn spawn_responder(status: &'static str, body: &'static str) -> (u16, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let request = read_request(&mut reader);

            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            )
            .unwrap();
            request
        });
        (port, handle)
    }

    /// Accepts a single connection and answers `count` requests on it.
    fn spawn_keepalive_responder(count: usize, body: &'static str) -> (u16, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            (0..count)
                .map(|_| {
                    let request = read_request(&mut reader);
                    write!(
                        stream,
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    )
                    .unwrap();
                    request
                })
                .collect()
        });
        (port, handle)
    }

    #[test]
    fn posts_command_and_returns_body() {
        let (port, server) = spawn_responder("200 OK", r#"{"jsonrpc":"2.0","result":"OK","id":"1"}"#);
        let connector = HttpConnector::new(HttpConfig::for_host("127.0.0.1", port)).unwrap();

        let reply = connector.exchange(r#"{"method":"uptime"}"#).unwrap();
        assert_eq!(reply, r#"{"jsonrpc":"2.0","result":"OK","id":"1"}"#);
        assert_eq!(server.join().unwrap(), r#"{"method":"uptime"}"#);
    }

    #[test]
    fn exchanges_share_one_connection() {
        let (port, server) = spawn_keepalive_responder(2, r#"{"jsonrpc":"2.0","result":"OK","id":"1"}"#);
        let connector = HttpConnector::new(
            HttpConfig::for_host("127.0.0.1", port).with_timeout(Duration::from_secs(2)),
        )
        .unwrap();

        connector.exchange(r#"{"method":"uptime"}"#).unwrap();
        connector.exchange(r#"{"method":"version"}"#).unwrap();
        assert_eq!(
            server.join().unwrap(),
            vec![r#"{"method":"uptime"}"#, r#"{"method":"version"}"#]
        );
    }

    #[test]
    fn http_error_status_fails() {
        let (port, server) = spawn_responder("500 Internal Server Error", "{}");
        let connector = HttpConnector::new(HttpConfig::for_host("127.0.0.1", port)).unwrap();

        let err = connector.exchange("{}").unwrap_err();
        assert!(matches!(err, TransportError::Http(_)));
        server.join().unwrap();
    }

    #[test]
    fn probe_reports_closed_port() {
        // Grab a free port, then release it.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let connector = HttpConnector::new(
            HttpConfig::for_host("127.0.0.1", port).with_timeout(Duration::from_millis(200)),
        )
        .unwrap();

        let validation = connector.valid();
        assert!(!validation.is_ok());
        assert!(validation.diagnostics()[0].starts_with("Could not connect to http://127.0.0.1:"));
    }

    #[test]
    fn probe_accepts_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let connector = HttpConnector::new(HttpConfig::for_host("127.0.0.1", port)).unwrap();
        assert!(connector.valid().is_ok());
    }

    #[test]
    fn rejects_invalid_url() {
        assert!(HttpConnector::new(HttpConfig::new("ftp://host/mi")).is_err());
    }
}
