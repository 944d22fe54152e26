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

//! The SSH transport contract.
//!
//! A [`Transport`] performs key exchange, encryption, packet framing and the
//! SFTP wire protocol. The session engine drives it from a single task and
//! never shares it, so implementations take `&mut self` everywhere and need
//! no internal locking. [`RusshTransport`] is the production implementation.

pub mod proxy;
mod russh_transport;

pub use russh_transport::RusshTransport;

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::keys::KeyPair;
use crate::session::AuthMethods;
use async_trait::async_trait;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Transport-level identifier of an open channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportChannel(pub u32);

impl fmt::Display for TransportChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of an open SFTP directory handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SftpHandle(pub u64);

/// Where and how to reach the SSH server.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub proxy: ProxyConfig,
    pub proxy_command: Option<String>,
}

/// Host key presented by the server during key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    /// Key algorithm, e.g. `ssh-ed25519`.
    pub algorithm: String,
    /// `SHA256:` fingerprint.
    pub fingerprint: String,
    /// Public key in OpenSSH `authorized_keys` format.
    pub openssh: String,
}

/// Banners exchanged once the host key is accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Banners {
    pub client: String,
    pub server: Option<String>,
}

/// Result of one authentication request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Success,
    Failure {
        methods: AuthMethods,
        partial_success: bool,
    },
}

/// One prompt of a keyboard-interactive round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptItem {
    pub text: String,
    pub echo: bool,
}

/// A keyboard-interactive info request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InteractivePrompt {
    pub name: String,
    pub instruction: String,
    pub prompts: Vec<PromptItem>,
}

/// Server reply inside a keyboard-interactive exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractiveStep {
    Success,
    Failure { methods: AuthMethods },
    Prompt(InteractivePrompt),
}

/// Pseudo-terminal parameters for a shell channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub terminal_type: String,
    pub columns: u32,
    pub rows: u32,
}

/// Kind of channel to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenRequest {
    /// `direct-tcpip` to a destination reachable from the server.
    DirectTcpip {
        host: String,
        port: u16,
        originator_address: String,
        originator_port: u16,
    },
    /// Session channel with a PTY and a shell.
    Shell(PtyRequest),
    /// Session channel running the `sftp` subsystem.
    Sftp,
}

/// SFTP attributes as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SftpAttributes {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub permissions: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

/// One directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpEntry {
    pub name: String,
    pub attributes: SftpAttributes,
}

/// Asynchronous events surfaced by [`Transport::next_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Data {
        channel: TransportChannel,
        data: Vec<u8>,
    },
    Eof {
        channel: TransportChannel,
    },
    /// The channel is gone; `error` is set when a local write or close on
    /// it failed.
    Closed {
        channel: TransportChannel,
        error: Option<Error>,
    },
    /// More outbound window is available on the channel.
    WindowAdjusted {
        channel: TransportChannel,
    },
    /// The server opened a channel for a previously bound remote forward.
    ForwardAccepted {
        channel: TransportChannel,
        connected_address: String,
        connected_port: u16,
        originator_address: String,
        originator_port: u16,
    },
    Disconnected {
        reason: String,
    },
}

/// Contract between the session engine and an SSH transport library.
///
/// Methods are called in order: `connect`, `handshake`, `confirm_host_key`,
/// authentication, then channel traffic. `poll_events` must be cancel-safe:
/// the session drops it whenever a command arrives first.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Establish the byte stream (direct, through a proxy or a proxy command).
    async fn connect(&mut self, target: &ConnectTarget) -> Result<IpAddr>;

    /// Run key exchange up to the point where the host key is known.
    async fn handshake(&mut self) -> Result<HostKey>;

    /// Resume or abort the handshake after the host key decision.
    async fn confirm_host_key(&mut self, accepted: bool) -> Result<Banners>;

    async fn auth_none(&mut self, username: &str) -> Result<AuthOutcome>;

    /// Take the pre-authentication banner the server sent, if any.
    fn take_issue_banner(&mut self) -> Option<String> {
        None
    }

    async fn auth_password(&mut self, username: &str, password: &str) -> Result<AuthOutcome>;

    async fn auth_public_key(&mut self, username: &str, key: &KeyPair) -> Result<AuthOutcome>;

    async fn auth_interactive_start(
        &mut self,
        username: &str,
        submethods: Option<&str>,
    ) -> Result<InteractiveStep>;

    async fn auth_interactive_respond(&mut self, answers: Vec<String>) -> Result<InteractiveStep>;

    async fn channel_open(&mut self, request: &OpenRequest) -> Result<TransportChannel>;

    /// Bytes that `channel_write` would accept right now.
    fn channel_window(&self, channel: TransportChannel) -> usize;

    /// Hand bytes to the transport, returning how many were accepted.
    async fn channel_write(&mut self, channel: TransportChannel, data: &[u8]) -> Result<usize>;

    async fn channel_eof(&mut self, channel: TransportChannel) -> Result<()>;

    async fn channel_close(&mut self, channel: TransportChannel) -> Result<()>;

    async fn pty_resize(&mut self, channel: TransportChannel, columns: u32, rows: u32)
        -> Result<()>;

    /// Ask the server to listen on `address:port`; returns the bound port.
    async fn request_remote_forward(&mut self, address: &str, port: u16) -> Result<u16>;

    async fn sftp_stat(&mut self, channel: TransportChannel, path: &str)
        -> Result<SftpAttributes>;

    async fn sftp_open_dir(&mut self, channel: TransportChannel, path: &str)
        -> Result<SftpHandle>;

    /// Next entry of an open directory, `None` at end of directory.
    async fn sftp_read_dir(
        &mut self,
        channel: TransportChannel,
        handle: SftpHandle,
    ) -> Result<Option<SftpEntry>>;

    async fn sftp_close_dir(&mut self, channel: TransportChannel, handle: SftpHandle)
        -> Result<()>;

    /// Wait up to `timeout` for events. Returns whether any are pending.
    async fn poll_events(&mut self, timeout: Duration) -> Result<bool>;

    /// Pop one pending event without waiting.
    fn next_event(&mut self) -> Option<TransportEvent>;

    async fn keepalive(&mut self) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;
}
