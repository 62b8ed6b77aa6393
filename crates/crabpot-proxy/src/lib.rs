//! Threaded HTTP/1.1 forward proxy: one accepted connection per thread,
//! `CONNECT` tunnelling for HTTPS, absolute-form forwarding with secret
//! scanning for plaintext HTTP. Every request is gated through a
//! [`PolicyEngine`] and, for undecided domains, an [`ActionGate`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

use crabpot_core::{ActionGate, AlertBus, CrabpotError, Decision, PolicyEngine, Severity};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TUNNEL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const BUFFER_SIZE: usize = 65536;
const MAX_HEADER_LINES: usize = 256;

/// Manages the egress proxy listener lifecycle.
pub struct EgressProxy {
    policy: Arc<PolicyEngine>,
    gate: Option<Arc<ActionGate>>,
    bus: Arc<AlertBus>,
    host: String,
    port: u16,
    stop: Arc<AtomicBool>,
    thread: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl EgressProxy {
    /// Construct a proxy bound to `127.0.0.1:<port>` once started. `gate`
    /// may be omitted, in which case PENDING domains are denied outright.
    #[must_use]
    pub fn new(policy: Arc<PolicyEngine>, gate: Option<Arc<ActionGate>>, bus: Arc<AlertBus>, port: u16) -> Self {
        Self {
            policy,
            gate,
            bus,
            host: "127.0.0.1".to_string(),
            port,
            stop: Arc::new(AtomicBool::new(false)),
            thread: std::sync::Mutex::new(None),
        }
    }

    /// Bind the listener and spawn the accept loop on a dedicated thread.
    pub fn start(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port))?;
        let stop = Arc::clone(&self.stop);
        let policy = Arc::clone(&self.policy);
        let gate = self.gate.clone();
        let bus = Arc::clone(&self.bus);
        stop.store(false, Ordering::SeqCst);

        let handle = std::thread::Builder::new()
            .name("egress-proxy".into())
            .spawn(move || {
                for incoming in listener.incoming() {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let Ok(stream) = incoming else { continue };
                    let policy = Arc::clone(&policy);
                    let gate = gate.clone();
                    let bus = Arc::clone(&bus);
                    std::thread::spawn(move || {
                        if let Err(e) = handle_connection(stream, &policy, gate.as_deref(), &bus) {
                            tracing::debug!("proxy connection error: {e}");
                        }
                    });
                }
            })?;
        *self.thread.lock().expect("proxy thread lock poisoned") = Some(handle);
        tracing::info!("egress proxy listening on {}:{}", self.host, self.port);
        Ok(())
    }

    /// Signal shutdown, unblock `accept()` with a local connection, and
    /// join with a 5s grace period.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = TcpStream::connect((self.host.as_str(), self.port));
        if let Some(handle) = self.thread.lock().expect("proxy thread lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

fn handle_connection(
    stream: TcpStream,
    policy: &PolicyEngine,
    gate: Option<&ActionGate>,
    bus: &AlertBus,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line)? == 0 {
        return Ok(());
    }
    let request_line = request_line.trim_end();
    let mut parts = request_line.splitn(3, ' ');
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    for _ in 0..MAX_HEADER_LINES {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end().to_string();
        if line.is_empty() {
            break;
        }
        headers.push(line);
    }

    if method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(stream, &target, policy, gate)
    } else {
        handle_http(stream, reader, &method, &target, &headers, policy, gate, bus)
    }
}

fn handle_connect(
    mut stream: TcpStream,
    target: &str,
    policy: &PolicyEngine,
    gate: Option<&ActionGate>,
) -> std::io::Result<()> {
    let Some((host, port_str)) = target.rsplit_once(':') else {
        return send_status_line(&mut stream, 400, "Bad CONNECT target");
    };
    let Ok(port) = port_str.parse::<u16>() else {
        return send_status_line(&mut stream, 400, "Bad CONNECT target");
    };

    let decision = enforce(host, port, "CONNECT", policy, gate);
    if decision != Decision::Allow {
        return send_status_line(&mut stream, 403, &format!("Blocked by CrabPot egress policy: {host}"));
    }

    let remote = match resolve_one(host, port)
        .and_then(|addr| TcpStream::connect_timeout(&addr, UPSTREAM_CONNECT_TIMEOUT))
    {
        Ok(sock) => sock,
        Err(_) => return send_status_line(&mut stream, 502, &format!("Cannot reach {host}:{port}")),
    };

    stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")?;
    tunnel(stream, remote)
}

fn resolve_one(host: &str, port: u16) -> std::io::Result<std::net::SocketAddr> {
    use std::net::ToSocketAddrs;
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::other("no addresses resolved"))
}

fn tunnel(client: TcpStream, remote: TcpStream) -> std::io::Result<()> {
    client.set_read_timeout(Some(TUNNEL_IDLE_TIMEOUT))?;
    remote.set_read_timeout(Some(TUNNEL_IDLE_TIMEOUT))?;

    let mut client_to_remote = client.try_clone()?;
    let mut remote_for_write = remote.try_clone()?;
    let relay = std::thread::spawn(move || {
        let mut buf = [0u8; BUFFER_SIZE];
        loop {
            match client_to_remote.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if remote_for_write.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
        let _ = remote_for_write.shutdown(std::net::Shutdown::Write);
    });

    let mut remote_to_client = remote;
    let mut client_for_write = client;
    let mut buf = [0u8; BUFFER_SIZE];
    loop {
        match remote_to_client.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if client_for_write.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    }
    let _ = client_for_write.shutdown(std::net::Shutdown::Write);
    let _ = relay.join();
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn handle_http(
    mut stream: TcpStream,
    mut reader: BufReader<TcpStream>,
    method: &str,
    target: &str,
    headers: &[String],
    policy: &PolicyEngine,
    gate: Option<&ActionGate>,
    bus: &AlertBus,
) -> std::io::Result<()> {
    if !target.starts_with("http://") && !target.starts_with("https://") {
        return send_status_line(&mut stream, 400, "Absolute URL required for proxy requests");
    }
    let Some((host, port, path)) = split_absolute_url(target) else {
        return send_status_line(&mut stream, 400, "Cannot parse URL");
    };

    let decision = enforce(&host, port, method, policy, gate);
    if decision != Decision::Allow {
        return send_status_line(&mut stream, 403, &format!("Blocked by CrabPot egress policy: {host}"));
    }

    let content_length: usize = headers
        .iter()
        .find_map(|h| h.split_once(':').filter(|(k, _)| k.trim().eq_ignore_ascii_case("content-length")))
        .and_then(|(_, v)| v.trim().parse().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body)?;
    }

    let body_text = String::from_utf8_lossy(&body);
    let scan_content = format!("{target} {body_text}");
    let findings = PolicyEngine::scan_for_secrets(&scan_content);
    if !findings.is_empty() {
        policy.log_attempt(&host, port, method, "blocked_secrets");
        bus.fire(Severity::Critical, "egress", &format!("blocked: secret pattern detected in request to {host}"));
        return send_status_line(&mut stream, 403, "Request blocked: potential secret exfiltration detected");
    }

    match forward_request(method, &host, port, &path, headers, &body) {
        Ok((status, status_text, resp_headers, resp_body)) => {
            write!(stream, "HTTP/1.1 {status} {status_text}\r\n")?;
            for (k, v) in &resp_headers {
                if !k.eq_ignore_ascii_case("transfer-encoding") {
                    write!(stream, "{k}: {v}\r\n")?;
                }
            }
            write!(stream, "\r\n")?;
            stream.write_all(&resp_body)?;
            Ok(())
        }
        Err(e) => {
            tracing::warn!(error = %e, host = %host, "upstream forward failed");
            send_status_line(&mut stream, 502, "Upstream error")
        }
    }
}

fn enforce(host: &str, port: u16, method: &str, policy: &PolicyEngine, gate: Option<&ActionGate>) -> Decision {
    let decision = policy.check_domain(host);
    policy.log_attempt(host, port, method, &decision.to_string());

    if decision == Decision::Pending {
        if let Some(gate) = gate {
            let approved = gate.request_approval(host, port);
            let final_decision = if approved { Decision::Allow } else { Decision::Deny };
            policy.log_attempt(
                host,
                port,
                method,
                &format!("{}_after_review", final_decision),
            );
            return final_decision;
        }
        return Decision::Deny;
    }
    decision
}

fn split_absolute_url(url: &str) -> Option<(String, u16, String)> {
    let rest = url.split_once("://")?.1;
    let (authority, path) = rest.split_once('/').map_or((rest, "/"), |(a, p)| (a, p));
    let path = format!("/{path}");
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().ok()?),
        None => (authority.to_string(), if url.starts_with("https") { 443 } else { 80 }),
    };
    Some((host, port, path))
}

fn forward_request(
    method: &str,
    host: &str,
    port: u16,
    path: &str,
    headers: &[String],
    body: &[u8],
) -> Result<(u16, String, Vec<(String, String)>, Vec<u8>), CrabpotError> {
    let mut upstream = TcpStream::connect((host, port))
        .map_err(|e| CrabpotError::Upstream(format!("connect to {host}:{port} failed: {e}")))?;
    upstream.set_read_timeout(Some(Duration::from_secs(30)))?;

    write!(upstream, "{method} {path} HTTP/1.1\r\n")?;
    write!(upstream, "Host: {host}\r\n")?;
    for header in headers {
        let Some((key, _)) = header.split_once(':') else { continue };
        let key_lower = key.trim().to_ascii_lowercase();
        if matches!(
            key_lower.as_str(),
            "proxy-connection" | "proxy-authorization" | "host" | "content-length" | "transfer-encoding"
        ) {
            continue;
        }
        write!(upstream, "{header}\r\n")?;
    }
    write!(upstream, "Content-Length: {}\r\n\r\n", body.len())?;
    upstream.write_all(body)?;

    let mut reader = BufReader::new(upstream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line)?;
    let mut parts = status_line.trim_end().splitn(3, ' ');
    let _http_version = parts.next();
    let status: u16 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(502);
    let status_text = parts.next().unwrap_or("").to_string();

    let mut resp_headers = Vec::new();
    let mut resp_content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            if k.trim().eq_ignore_ascii_case("content-length") {
                resp_content_length = v.trim().parse().unwrap_or(0);
            }
            resp_headers.push((k.trim().to_string(), v.trim().to_string()));
        }
    }

    let mut resp_body = vec![0u8; resp_content_length];
    if resp_content_length > 0 {
        reader.read_exact(&mut resp_body)?;
    }
    Ok((status, status_text, resp_headers, resp_body))
}

fn send_status_line(stream: &mut TcpStream, code: u16, message: &str) -> std::io::Result<()> {
    let body = format!("{code} {message}");
    write!(
        stream,
        "HTTP/1.1 {code} {message}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crabpot_core::CrabpotPaths;
    use std::io::Read as _;

    fn paths() -> CrabpotPaths {
        let tmp = tempfile::tempdir().unwrap();
        CrabpotPaths::at(tmp.into_path())
    }

    #[test]
    fn split_absolute_url_extracts_host_port_path() {
        assert_eq!(
            split_absolute_url("http://api.example.com/v1/chat").unwrap(),
            ("api.example.com".to_string(), 80, "/v1/chat".to_string())
        );
        assert_eq!(
            split_absolute_url("https://api.example.com:8443/x").unwrap(),
            ("api.example.com".to_string(), 8443, "/x".to_string())
        );
    }

    #[test]
    fn enforce_denies_pending_without_gate() {
        let policy = PolicyEngine::new(&paths());
        let decision = enforce("unknown.example.com", 443, "CONNECT", &policy, None);
        assert_eq!(decision, Decision::Deny);
    }

    #[test]
    fn enforce_denies_blocklisted_domain() {
        let policy = PolicyEngine::new(&paths());
        let decision = enforce("pastebin.com", 443, "CONNECT", &policy, None);
        assert_eq!(decision, Decision::Deny);
    }

    #[test]
    fn connect_to_blocked_host_returns_403() {
        let policy = Arc::new(PolicyEngine::new(&paths()));
        let bus = Arc::new(AlertBus::new(&paths()));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let policy2 = Arc::clone(&policy);
        let bus2 = Arc::clone(&bus);
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let _ = handle_connection(stream, &policy2, None, &bus2);
        });

        let mut client = TcpStream::connect(addr).unwrap();
        write!(client, "CONNECT pastebin.com:443 HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).ok();
        assert!(response.starts_with("HTTP/1.1 403"));
    }
}
