// Copyright 2025 Lablup Inc. and Jeongkyu Shin
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

//! Client side of the SOCKS4, SOCKS4A, SOCKS5 and HTTP CONNECT proxy protocols.
//!
//! SOCKS negotiation is done by `tokio-socks`; HTTP CONNECT is spoken here.

use crate::config::{ProxyConfig, ProxyType};
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tokio_socks::TargetAddr;
use tracing::debug;

/// Upper bound on the size of an HTTP proxy response header.
const MAX_HTTP_HEADER: usize = 8192;

fn proxy_error(message: impl Into<String>) -> Error {
    Error::ConnectFailure(message.into())
}

fn io_error(context: &str, err: std::io::Error) -> Error {
    Error::ConnectFailure(format!("{context}: {err}"))
}

fn socks_error(kind: ProxyType, err: tokio_socks::Error) -> Error {
    Error::ConnectFailure(format!("{kind:?} proxy: {err}"))
}

/// Connect to the proxy and tunnel through it to `host:port`.
pub async fn open_tunnel(proxy: &ProxyConfig, host: &str, port: u16) -> Result<TcpStream> {
    let proxy_host = proxy
        .host
        .as_deref()
        .ok_or_else(|| proxy_error("proxy host is not configured"))?;
    let proxy_port = proxy.effective_port();

    debug!(
        proxy = %format!("{proxy_host}:{proxy_port}"),
        kind = ?proxy.kind,
        target = %format!("{host}:{port}"),
        "Connecting through proxy"
    );

    let stream = TcpStream::connect((proxy_host, proxy_port))
        .await
        .map_err(|e| io_error(&format!("proxy {proxy_host}:{proxy_port}"), e))?;
    let _ = stream.set_nodelay(true);

    handshake(stream, proxy, host, port).await
}

/// Run the proxy negotiation over an already connected stream and hand the
/// stream back, positioned at the first byte from the target.
pub async fn handshake<S>(stream: S, proxy: &ProxyConfig, host: &str, port: u16) -> Result<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match proxy.kind {
        ProxyType::None => Ok(stream),
        ProxyType::Socks4 => {
            let ip = resolve_ipv4(host, port).await?;
            let target = SocketAddr::new(IpAddr::V4(ip), port);
            socks4(stream, TargetAddr::Ip(target), proxy).await
        }
        ProxyType::Socks4a => socks4(stream, target_addr(host, port), proxy).await,
        ProxyType::Socks5 => {
            let target = target_addr(host, port);
            let connected = match proxy.username.as_deref() {
                Some(user) => {
                    let password = proxy.password.as_deref().unwrap_or("");
                    Socks5Stream::connect_with_password_and_socket(stream, target, user, password)
                        .await
                }
                None => Socks5Stream::connect_with_socket(stream, target).await,
            };
            connected
                .map(Socks5Stream::into_inner)
                .map_err(|e| socks_error(proxy.kind, e))
        }
        ProxyType::Http => {
            let mut stream = stream;
            http_connect(&mut stream, proxy, host, port).await?;
            Ok(stream)
        }
    }
}

/// IP literals go out as addresses, everything else as a name for the proxy
/// to resolve.
fn target_addr(host: &str, port: u16) -> TargetAddr<'static> {
    match host.parse::<IpAddr>() {
        Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
        Err(_) => TargetAddr::Domain(host.to_string().into(), port),
    }
}

async fn socks4<S>(stream: S, target: TargetAddr<'static>, proxy: &ProxyConfig) -> Result<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connected = match proxy.username.as_deref() {
        Some(user) => Socks4Stream::connect_with_userid_and_socket(stream, target, user).await,
        None => Socks4Stream::connect_with_socket(stream, target).await,
    };
    connected
        .map(Socks4Stream::into_inner)
        .map_err(|e| socks_error(proxy.kind, e))
}

async fn resolve_ipv4(host: &str, port: u16) -> Result<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| io_error(&format!("resolve {host}"), e))?;
    addrs
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| proxy_error(format!("{host} has no IPv4 address (required by SOCKS4)")))
}

async fn http_connect<S>(stream: &mut S, proxy: &ProxyConfig, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };

    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(user) = &proxy.username {
        let token = BASE64.encode(format!(
            "{}:{}",
            user,
            proxy.password.as_deref().unwrap_or("")
        ));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| io_error("http proxy request", e))?;

    // Read byte by byte so nothing past the header is consumed
    let mut header = Vec::with_capacity(256);
    while !header.ends_with(b"\r\n\r\n") {
        if header.len() >= MAX_HTTP_HEADER {
            return Err(proxy_error("HTTP proxy response header too large"));
        }
        let mut byte = [0u8; 1];
        stream
            .read_exact(&mut byte)
            .await
            .map_err(|e| io_error("http proxy response", e))?;
        header.push(byte[0]);
    }

    let text = String::from_utf8_lossy(&header);
    let status_line = text.lines().next().unwrap_or("");
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or("");
    let status = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/1.") {
        return Err(proxy_error(format!(
            "malformed HTTP proxy response: {status_line}"
        )));
    }
    if status != "200" {
        return Err(proxy_error(format!("HTTP proxy refused CONNECT: {status_line}")));
    }
    Ok(())
}
