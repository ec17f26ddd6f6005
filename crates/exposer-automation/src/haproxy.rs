//! HAProxy runtime API client and configuration generation.
//!
//! Domain mappings are applied twice: live through the runtime API socket
//! (no reload needed) and persisted to the map file HAProxy loads on
//! restart. The generated configuration file routes on the map and gets
//! one backend block per exposed port; reloading HAProxy after a config
//! rewrite is the operator's call, not ours.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

/// Per-command deadline on the runtime API socket.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the bare reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Header block written whenever the map file is fully rewritten.
const MAP_HEADER: &str = "# Domain to backend mapping\n\
                          # Format: <fqdn> <backend>\n\
                          # Managed by exposer; manual edits may be overwritten\n\n";

/// HAProxy client errors.
#[derive(Debug, Error)]
pub enum HaproxyError {
    #[error("cannot connect to haproxy socket {path}: {source}")]
    SocketUnreachable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out talking to haproxy socket {0}")]
    SocketTimeout(PathBuf),

    #[error("map file error: {0}")]
    MapFile(#[source] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFile(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Client for the HAProxy runtime API and its domain map file.
pub struct HaproxyClient {
    socket_path: PathBuf,
    map_file: PathBuf,
}

impl HaproxyClient {
    pub fn new(socket_path: impl Into<PathBuf>, map_file: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            map_file: map_file.into(),
        }
    }

    /// Check that the runtime API socket answers.
    pub async fn validate(&self) -> Result<(), HaproxyError> {
        let connect = UnixStream::connect(&self.socket_path);
        match timeout(PROBE_TIMEOUT, connect).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(source)) => Err(HaproxyError::SocketUnreachable {
                path: self.socket_path.clone(),
                source,
            }),
            Err(_) => Err(HaproxyError::SocketTimeout(self.socket_path.clone())),
        }
    }

    /// Current domain-to-backend mappings from the map file. A missing
    /// file is an empty map, not an error.
    pub async fn current_mappings(&self) -> Result<HashMap<String, String>, HaproxyError> {
        let text = match tokio::fs::read_to_string(&self.map_file).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(HaproxyError::MapFile(e)),
        };
        Ok(parse_mappings(&text))
    }

    /// Add a mapping: live via the runtime API, then persisted by
    /// appending to the map file.
    pub async fn add_mapping(&self, domain: &str, backend: &str) -> Result<(), HaproxyError> {
        let command = format!("add map {} {} {}", self.map_file.display(), domain, backend);
        self.run_command(&command).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.map_file)
            .await
            .map_err(HaproxyError::MapFile)?;
        file.write_all(format!("{domain} {backend}\n").as_bytes())
            .await
            .map_err(HaproxyError::MapFile)?;

        Ok(())
    }

    /// Remove a mapping: live via the runtime API, then rewrite the map
    /// file without it (header included).
    pub async fn remove_mapping(&self, domain: &str) -> Result<(), HaproxyError> {
        let command = format!("del map {} {}", self.map_file.display(), domain);
        self.run_command(&command).await?;

        let mut mappings = self.current_mappings().await?;
        mappings.remove(domain);

        let mut contents = String::from(MAP_HEADER);
        for (domain, backend) in &mappings {
            contents.push_str(&format!("{domain} {backend}\n"));
        }
        tokio::fs::write(&self.map_file, contents)
            .await
            .map_err(HaproxyError::MapFile)?;

        Ok(())
    }

    /// Issue one newline-terminated command and read the response until
    /// EOF or the deadline.
    async fn run_command(&self, command: &str) -> Result<String, HaproxyError> {
        let mut stream = match timeout(COMMAND_TIMEOUT, UnixStream::connect(&self.socket_path)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(HaproxyError::SocketUnreachable {
                    path: self.socket_path.clone(),
                    source,
                })
            }
            Err(_) => return Err(HaproxyError::SocketTimeout(self.socket_path.clone())),
        };

        debug!(command, "issuing haproxy command");
        stream.write_all(format!("{command}\n").as_bytes()).await?;

        let mut response = String::new();
        // HAProxy closes the stream after answering; on a slow socket we
        // settle for whatever arrived before the deadline.
        let _ = timeout(COMMAND_TIMEOUT, stream.read_to_string(&mut response)).await;
        Ok(response)
    }
}

/// Parse a domain-map file: one `domain backend` pair per line, `#`
/// comments and blank lines ignored.
pub fn parse_mappings(text: &str) -> HashMap<String, String> {
    let mut mappings = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        if let (Some(domain), Some(backend)) = (fields.next(), fields.next()) {
            mappings.insert(domain.to_string(), backend.to_string());
        }
    }
    mappings
}

/// One generated backend: the exposed service's name and external port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub name: String,
    pub port: u16,
}

/// Generates the HAProxy configuration file.
pub struct ConfigGenerator {
    map_file: PathBuf,
    cert_dir: PathBuf,
}

impl ConfigGenerator {
    pub fn new(map_file: impl Into<PathBuf>, cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            map_file: map_file.into(),
            cert_dir: cert_dir.into(),
        }
    }

    /// Render the config for the given backends and write it to `output`.
    /// The TLS frontend is emitted only when at least one certificate
    /// exists in the configured directory.
    pub async fn generate(
        &self,
        backends: &[BackendConfig],
        output: &Path,
    ) -> Result<(), HaproxyError> {
        let has_tls = self.has_certificates().await;
        let contents = self.render(backends, has_tls);
        tokio::fs::write(output, contents)
            .await
            .map_err(HaproxyError::ConfigFile)
    }

    /// Whether any `.pem` file exists in the certificate directory.
    async fn has_certificates(&self) -> bool {
        let Ok(mut entries) = tokio::fs::read_dir(&self.cert_dir).await else {
            return false;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "pem") {
                return true;
            }
        }
        false
    }

    fn render(&self, backends: &[BackendConfig], has_tls: bool) -> String {
        let map_file = self.map_file.display();
        let cert_dir = self.cert_dir.display();

        let mut cfg = format!(
            r#"# Auto-generated by exposer - DO NOT EDIT MANUALLY

global
    log /dev/log local0
    log /dev/log local1 notice
    stats socket /var/run/haproxy.sock mode 660 level admin expose-fd listeners
    stats timeout 30s
    user haproxy
    group haproxy
    daemon
    maxconn 10000

defaults
    log     global
    mode    http
    option  httplog
    option  dontlognull
    timeout connect 5000
    timeout client  3600000
    timeout server  3600000

frontend http_front
    bind *:80
    acl is_acme_challenge path_beg /.well-known/acme-challenge/
    use_backend backend_acme if is_acme_challenge
    http-request redirect scheme https code 301 if !is_acme_challenge
    use_backend %[req.hdr(host),lower,map({map_file},backend_default)]

backend backend_acme
    mode http
    server acme localhost:8888
"#
        );

        if has_tls {
            cfg.push_str(&format!(
                r#"
frontend https_front
    bind *:443 ssl crt {cert_dir}/ alpn h2,http/1.1
    mode http
    use_backend %[ssl_fc_sni,lower,map({map_file},backend_default)]
"#
            ));
        }

        cfg.push_str(
            r#"
backend backend_default
    mode http
    http-request return status 404 content-type text/plain string "service not configured"
"#,
        );

        for backend in backends {
            cfg.push_str(&format!(
                r#"
# Backend for {name} (port {port})
backend backend_{port}
    mode http
    server {name} 127.0.0.1:{port}
"#,
                name = backend.name,
                port = backend.port,
            ));
        }

        cfg
    }
}
