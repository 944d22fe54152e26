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

//! [`Transport`] implemented on top of `russh` and `russh-sftp`.
//!
//! russh runs its own connection task. Every channel is split: a small pump
//! task owns the read half and applies queued writes, while requests that
//! must not wait behind data (PTY resizes) use the shared write half directly.
//! The pumps report back over one internal queue that
//! [`Transport::poll_events`] drains.

use super::{
    proxy, AuthOutcome, Banners, ConnectTarget, HostKey, InteractivePrompt, InteractiveStep,
    OpenRequest, PromptItem, SftpAttributes, SftpEntry, SftpHandle, Transport, TransportChannel,
    TransportEvent,
};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::keys::KeyPair;
use crate::session::AuthMethods;
use async_trait::async_trait;
use russh::client::{self, AuthResult, KeyboardInteractiveAuthResponse, Msg};
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{
    Channel, ChannelMsg, ChannelReadHalf, ChannelWriteHalf, Disconnect, MethodKind, MethodSet,
    Preferred,
};
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::RawSftpSession;
use russh_sftp::protocol::{File, FileAttributes, StatusCode};
use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStdout, Command as ProcessCommand};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;

/// Bytes handed to a pump that it has not yet written to russh.
const CHANNEL_WINDOW: usize = 2 * 1024 * 1024;

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for S {}

type BoxedStream = Box<dyn AsyncStream>;

type HostKeyOffer = (PublicKey, oneshot::Sender<bool>);

/// Messages from pumps and the russh handler.
enum Internal {
    Event(TransportEvent),
    Written {
        channel: TransportChannel,
        count: usize,
    },
    Forwarded {
        channel: Channel<Msg>,
        connected_address: String,
        connected_port: u32,
        originator_address: String,
        originator_port: u32,
    },
}

enum PumpOp {
    Data(Vec<u8>),
    Eof,
    Close,
}

struct Pump {
    ops: mpsc::UnboundedSender<PumpOp>,
    control: Arc<ChannelWriteHalf<Msg>>,
    in_flight: usize,
}

struct SftpChannel {
    session: RawSftpSession,
    directories: HashMap<SftpHandle, RemoteDirectory>,
    next_handle: u64,
}

/// An open server-side directory handle, read one `READDIR` batch at a time.
struct RemoteDirectory {
    handle: String,
    pending: VecDeque<SftpEntry>,
    exhausted: bool,
}

impl RemoteDirectory {
    fn new(handle: String) -> Self {
        Self {
            handle,
            pending: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Queue one batch; `None` marks the end of the listing.
    fn absorb(&mut self, batch: Option<Vec<File>>) {
        match batch {
            Some(files) => self.pending.extend(files.into_iter().map(entry_of)),
            None => self.exhausted = true,
        }
    }
}

struct PendingHandshake {
    decision: oneshot::Sender<bool>,
    task: JoinHandle<std::result::Result<client::Handle<ClientHandler>, russh::Error>>,
}

/// russh callbacks. Decisions are made by the session, so the handler only
/// relays what it sees.
struct ClientHandler {
    host_key: Option<oneshot::Sender<HostKeyOffer>>,
    accepted_key: Option<PublicKey>,
    issue_banner: Arc<Mutex<Option<String>>>,
    events: mpsc::UnboundedSender<Internal>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // Re-keying presents the key again; it must not change
        if let Some(accepted) = &self.accepted_key {
            return Ok(accepted == server_public_key);
        }
        let Some(offer) = self.host_key.take() else {
            return Ok(false);
        };
        let (decision_tx, decision_rx) = oneshot::channel();
        if offer.send((server_public_key.clone(), decision_tx)).is_err() {
            return Ok(false);
        }
        let accepted = decision_rx.await.unwrap_or(false);
        if accepted {
            self.accepted_key = Some(server_public_key.clone());
        }
        Ok(accepted)
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        if let Ok(mut slot) = self.issue_banner.lock() {
            *slot = Some(banner.to_string());
        }
        Ok(())
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let _ = self.events.send(Internal::Forwarded {
            channel,
            connected_address: connected_address.to_string(),
            connected_port,
            originator_address: originator_address.to_string(),
            originator_port,
        });
        Ok(())
    }
}

/// Production transport.
pub struct RusshTransport {
    config: Arc<client::Config>,
    client_id: String,
    stream: Option<BoxedStream>,
    pending: Option<PendingHandshake>,
    handle: Option<client::Handle<ClientHandler>>,
    server_banner: Arc<Mutex<Option<String>>>,
    issue_banner: Arc<Mutex<Option<String>>>,
    events_tx: mpsc::UnboundedSender<Internal>,
    events_rx: mpsc::UnboundedReceiver<Internal>,
    ready: VecDeque<TransportEvent>,
    pumps: HashMap<TransportChannel, Pump>,
    sftp: HashMap<TransportChannel, SftpChannel>,
    next_channel: u32,
    peer: Option<IpAddr>,
    disconnect_reported: bool,
}

impl RusshTransport {
    pub fn new(config: &SessionConfig) -> Self {
        let russh_config = client::Config {
            client_id: russh::SshId::Standard(config.client_id.clone()),
            keepalive_interval: config.keepalive(),
            keepalive_max: config.keepalive_max,
            preferred: preferred_algorithms(config.compression),
            ..Default::default()
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config: Arc::new(russh_config),
            client_id: config.client_id.clone(),
            stream: None,
            pending: None,
            handle: None,
            server_banner: Arc::new(Mutex::new(None)),
            issue_banner: Arc::new(Mutex::new(None)),
            events_tx,
            events_rx,
            ready: VecDeque::new(),
            pumps: HashMap::new(),
            sftp: HashMap::new(),
            next_channel: 0,
            peer: None,
            disconnect_reported: false,
        }
    }

    /// Use an already connected socket; `connect` then only reports its peer.
    pub fn from_std_stream(config: &SessionConfig, stream: std::net::TcpStream) -> Result<Self> {
        let peer = stream
            .peer_addr()
            .map_err(|e| Error::ConnectFailure(format!("socket is not connected: {e}")))?;
        stream
            .set_nonblocking(true)
            .map_err(|e| Error::ConnectFailure(format!("failed to prepare socket: {e}")))?;
        let stream = TcpStream::from_std(stream)
            .map_err(|e| Error::ConnectFailure(format!("failed to adopt socket: {e}")))?;
        let mut transport = Self::new(config);
        transport.stream = Some(Box::new(stream));
        transport.peer = Some(peer.ip());
        Ok(transport)
    }

    fn handle(&mut self) -> Result<&mut client::Handle<ClientHandler>> {
        self.handle
            .as_mut()
            .ok_or_else(|| Error::fatal("SSH connection is not established"))
    }

    fn allocate_channel(&mut self) -> TransportChannel {
        self.next_channel += 1;
        TransportChannel(self.next_channel)
    }

    fn spawn_pump(&mut self, id: TransportChannel, channel: Channel<Msg>) {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (reader, writer) = channel.split();
        let writer = Arc::new(writer);
        tokio::spawn(pump(
            id,
            reader,
            Arc::clone(&writer),
            ops_rx,
            self.events_tx.clone(),
        ));
        self.pumps.insert(
            id,
            Pump {
                ops: ops_tx,
                control: writer,
                in_flight: 0,
            },
        );
    }

    fn send_op(&self, channel: TransportChannel, op: PumpOp) -> Result<()> {
        let pump = self
            .pumps
            .get(&channel)
            .ok_or_else(|| Error::ChannelFailure(format!("channel {channel} is not open")))?;
        pump.ops
            .send(op)
            .map_err(|_| Error::ChannelFailure(format!("channel {channel} is closed")))
    }

    fn sftp_channel(&mut self, channel: TransportChannel) -> Result<&mut SftpChannel> {
        self.sftp
            .get_mut(&channel)
            .ok_or_else(|| Error::ChannelFailure(format!("channel {channel} is not an SFTP channel")))
    }

    fn absorb(&mut self, message: Internal) {
        match message {
            Internal::Event(event) => {
                if let TransportEvent::Closed { channel, .. } = &event {
                    self.pumps.remove(channel);
                }
                self.ready.push_back(event);
            }
            Internal::Written { channel, count } => {
                if let Some(pump) = self.pumps.get_mut(&channel) {
                    pump.in_flight = pump.in_flight.saturating_sub(count);
                    self.ready
                        .push_back(TransportEvent::WindowAdjusted { channel });
                }
            }
            Internal::Forwarded {
                channel,
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => {
                let id = self.allocate_channel();
                self.spawn_pump(id, channel);
                self.ready.push_back(TransportEvent::ForwardAccepted {
                    channel: id,
                    connected_address,
                    connected_port: port_u16(connected_port),
                    originator_address,
                    originator_port: port_u16(originator_port),
                });
            }
        }
    }

    fn check_connection(&mut self) {
        if self.disconnect_reported || !self.ready.is_empty() {
            return;
        }
        if self.handle.as_ref().is_some_and(|handle| handle.is_closed()) {
            self.disconnect_reported = true;
            self.ready.push_back(TransportEvent::Disconnected {
                reason: "connection closed by remote host".to_string(),
            });
        }
    }
}

#[async_trait]
impl Transport for RusshTransport {
    async fn connect(&mut self, target: &ConnectTarget) -> Result<IpAddr> {
        if self.stream.is_some() {
            return Ok(self.peer.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
        }

        if let Some(command) = &target.proxy_command {
            let stream = ProcessStream::spawn(command, &target.host, target.port)?;
            self.stream = Some(Box::new(stream));
            return Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        }

        if !target.proxy.is_direct() {
            let stream = proxy::open_tunnel(&target.proxy, &target.host, target.port).await?;
            let address = stream
                .peer_addr()
                .map(|addr| addr.ip())
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            self.stream = Some(Box::new(stream));
            return Ok(address);
        }

        let addresses = tokio::net::lookup_host((target.host.as_str(), target.port))
            .await
            .map_err(|e| Error::ConnectFailure(format!("failed to resolve {}: {e}", target.host)))?;

        let mut last_error = Error::ConnectFailure(format!(
            "{} did not resolve to any address",
            target.host
        ));
        for address in addresses {
            tracing::debug!("Trying {address}");
            match TcpStream::connect(address).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    self.stream = Some(Box::new(stream));
                    return Ok(address.ip());
                }
                Err(e) => {
                    last_error = Error::ConnectFailure(format!("failed to connect to {address}: {e}"));
                }
            }
        }
        Err(last_error)
    }

    async fn handshake(&mut self) -> Result<HostKey> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| Error::ConnectFailure("no connection to run the handshake on".to_string()))?;

        let (offer_tx, offer_rx) = oneshot::channel();
        let handler = ClientHandler {
            host_key: Some(offer_tx),
            accepted_key: None,
            issue_banner: Arc::clone(&self.issue_banner),
            events: self.events_tx.clone(),
        };
        let stream = BannerSniffer::new(stream, Arc::clone(&self.server_banner));
        let task = tokio::spawn(client::connect_stream(
            Arc::clone(&self.config),
            stream,
            handler,
        ));

        match offer_rx.await {
            Ok((key, decision)) => {
                self.pending = Some(PendingHandshake { decision, task });
                Ok(host_key_of(&key))
            }
            // The handler was dropped before seeing a key: the handshake failed
            Err(_) => match task.await {
                Ok(Err(err)) => Err(Error::from(err)),
                Ok(Ok(_)) => Err(Error::fatal("key exchange finished without a host key")),
                Err(err) => Err(Error::fatal(format!("handshake task failed: {err}"))),
            },
        }
    }

    async fn confirm_host_key(&mut self, accepted: bool) -> Result<Banners> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| Error::fatal("no handshake is waiting for a host key decision"))?;
        let _ = pending.decision.send(accepted);
        let joined = pending
            .task
            .await
            .map_err(|err| Error::fatal(format!("handshake task failed: {err}")))?;

        match (joined, accepted) {
            (Ok(handle), true) => {
                self.handle = Some(handle);
                let server = self.server_banner.lock().ok().and_then(|slot| slot.clone());
                Ok(Banners {
                    client: self.client_id.clone(),
                    server,
                })
            }
            (Ok(handle), false) => {
                let _ = handle
                    .disconnect(Disconnect::HostKeyNotVerifiable, "host key rejected", "en")
                    .await;
                Ok(Banners::default())
            }
            (Err(_), false) => Ok(Banners::default()),
            (Err(err), true) => Err(Error::from(err)),
        }
    }

    async fn auth_none(&mut self, username: &str) -> Result<AuthOutcome> {
        let result = self.handle()?.authenticate_none(username).await?;
        Ok(auth_outcome(result))
    }

    fn take_issue_banner(&mut self) -> Option<String> {
        self.issue_banner.lock().ok().and_then(|mut slot| slot.take())
    }

    async fn auth_password(&mut self, username: &str, password: &str) -> Result<AuthOutcome> {
        let result = self
            .handle()?
            .authenticate_password(username, password)
            .await?;
        Ok(auth_outcome(result))
    }

    async fn auth_public_key(&mut self, username: &str, key: &KeyPair) -> Result<AuthOutcome> {
        let handle = self.handle()?;
        let hash_alg: Option<HashAlg> = handle.best_supported_rsa_hash().await?.flatten();
        let result = handle
            .authenticate_publickey(
                username,
                PrivateKeyWithHashAlg::new(key.shared_key(), hash_alg),
            )
            .await?;
        Ok(auth_outcome(result))
    }

    async fn auth_interactive_start(
        &mut self,
        username: &str,
        submethods: Option<&str>,
    ) -> Result<InteractiveStep> {
        let response = self
            .handle()?
            .authenticate_keyboard_interactive_start(username, submethods.map(str::to_string))
            .await?;
        Ok(interactive_step(response))
    }

    async fn auth_interactive_respond(&mut self, answers: Vec<String>) -> Result<InteractiveStep> {
        let response = self
            .handle()?
            .authenticate_keyboard_interactive_respond(answers)
            .await?;
        Ok(interactive_step(response))
    }

    async fn channel_open(&mut self, request: &OpenRequest) -> Result<TransportChannel> {
        let handle = self.handle()?;
        match request {
            OpenRequest::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            } => {
                let channel = handle
                    .channel_open_direct_tcpip(
                        host.clone(),
                        u32::from(*port),
                        originator_address.clone(),
                        u32::from(*originator_port),
                    )
                    .await?;
                let id = self.allocate_channel();
                self.spawn_pump(id, channel);
                Ok(id)
            }
            OpenRequest::Shell(pty) => {
                let channel = handle.channel_open_session().await?;
                channel
                    .request_pty(
                        false,
                        &pty.terminal_type,
                        pty.columns,
                        pty.rows,
                        0,
                        0,
                        &[],
                    )
                    .await?;
                channel.request_shell(false).await?;
                let id = self.allocate_channel();
                self.spawn_pump(id, channel);
                Ok(id)
            }
            OpenRequest::Sftp => {
                let channel = handle.channel_open_session().await?;
                channel.request_subsystem(true, "sftp").await?;
                let session = RawSftpSession::new(channel.into_stream());
                session.init().await?;
                let id = self.allocate_channel();
                self.sftp.insert(
                    id,
                    SftpChannel {
                        session,
                        directories: HashMap::new(),
                        next_handle: 0,
                    },
                );
                Ok(id)
            }
        }
    }

    fn channel_window(&self, channel: TransportChannel) -> usize {
        self.pumps
            .get(&channel)
            .map(|pump| CHANNEL_WINDOW.saturating_sub(pump.in_flight))
            .unwrap_or(0)
    }

    async fn channel_write(&mut self, channel: TransportChannel, data: &[u8]) -> Result<usize> {
        let window = self.channel_window(channel);
        let count = data.len().min(window);
        if count == 0 {
            return Ok(0);
        }
        self.send_op(channel, PumpOp::Data(data[..count].to_vec()))?;
        if let Some(pump) = self.pumps.get_mut(&channel) {
            pump.in_flight += count;
        }
        Ok(count)
    }

    async fn channel_eof(&mut self, channel: TransportChannel) -> Result<()> {
        if self.sftp.contains_key(&channel) {
            return Ok(());
        }
        self.send_op(channel, PumpOp::Eof)
    }

    async fn channel_close(&mut self, channel: TransportChannel) -> Result<()> {
        if let Some(sftp) = self.sftp.remove(&channel) {
            for directory in sftp.directories.into_values() {
                if let Err(err) = sftp.session.close(directory.handle).await {
                    tracing::debug!("SFTP directory close on {channel}: {err}");
                }
            }
            if let Err(err) = sftp.session.close_session() {
                tracing::debug!("SFTP session close on {channel}: {err}");
            }
            self.ready.push_back(TransportEvent::Closed {
                channel,
                error: None,
            });
            return Ok(());
        }
        self.send_op(channel, PumpOp::Close)
    }

    async fn pty_resize(&mut self, channel: TransportChannel, columns: u32, rows: u32) -> Result<()> {
        // Not queued on the pump: a write stalled on the remote window must
        // not hold the resize back
        let control = self
            .pumps
            .get(&channel)
            .map(|pump| Arc::clone(&pump.control))
            .ok_or_else(|| Error::ChannelFailure(format!("channel {channel} is not open")))?;
        control
            .window_change(columns, rows, 0, 0)
            .await
            .map_err(Error::from)
    }

    async fn request_remote_forward(&mut self, address: &str, port: u16) -> Result<u16> {
        let bound = self
            .handle()?
            .tcpip_forward(address, u32::from(port))
            .await?;
        if port != 0 {
            return Ok(port);
        }
        u16::try_from(bound)
            .map_err(|_| Error::request_denied(format!("server bound an invalid port {bound}")))
    }

    async fn sftp_stat(&mut self, channel: TransportChannel, path: &str) -> Result<SftpAttributes> {
        let sftp = self.sftp_channel(channel)?;
        let reply = sftp.session.stat(path).await?;
        Ok(attributes_of(&reply.attrs))
    }

    async fn sftp_open_dir(&mut self, channel: TransportChannel, path: &str) -> Result<SftpHandle> {
        let sftp = self.sftp_channel(channel)?;
        let remote = sftp.session.opendir(path).await?;
        sftp.next_handle += 1;
        let handle = SftpHandle(sftp.next_handle);
        sftp.directories
            .insert(handle, RemoteDirectory::new(remote.handle));
        Ok(handle)
    }

    async fn sftp_read_dir(
        &mut self,
        channel: TransportChannel,
        handle: SftpHandle,
    ) -> Result<Option<SftpEntry>> {
        let sftp = self.sftp_channel(channel)?;
        let directory = sftp
            .directories
            .get_mut(&handle)
            .ok_or_else(|| Error::ChannelFailure("directory handle is not open".to_string()))?;
        // A READDIR reply may carry no names without ending the listing
        while directory.pending.is_empty() && !directory.exhausted {
            let batch = match sftp.session.readdir(directory.handle.as_str()).await {
                Ok(name) => Some(name.files),
                Err(err) if is_end_of_listing(&err) => None,
                Err(err) => return Err(err.into()),
            };
            directory.absorb(batch);
        }
        Ok(directory.pending.pop_front())
    }

    async fn sftp_close_dir(&mut self, channel: TransportChannel, handle: SftpHandle) -> Result<()> {
        let sftp = self.sftp_channel(channel)?;
        let directory = sftp
            .directories
            .remove(&handle)
            .ok_or_else(|| Error::ChannelFailure("directory handle is not open".to_string()))?;
        sftp.session.close(directory.handle).await?;
        Ok(())
    }

    async fn poll_events(&mut self, timeout: Duration) -> Result<bool> {
        while let Ok(message) = self.events_rx.try_recv() {
            self.absorb(message);
        }
        if self.ready.is_empty() {
            if let Ok(Some(message)) = time::timeout(timeout, self.events_rx.recv()).await {
                self.absorb(message);
                while let Ok(message) = self.events_rx.try_recv() {
                    self.absorb(message);
                }
            }
        }
        self.check_connection();
        Ok(!self.ready.is_empty())
    }

    fn next_event(&mut self) -> Option<TransportEvent> {
        self.ready.pop_front()
    }

    async fn keepalive(&mut self) -> Result<()> {
        // russh sends the keepalive packets itself; this only notices the result
        match &self.handle {
            Some(handle) if handle.is_closed() => Err(Error::fatal("keepalive: connection lost")),
            _ => Ok(()),
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.pumps.clear();
        self.sftp.clear();
        self.pending = None;
        self.stream = None;
        if let Some(handle) = self.handle.take() {
            if !handle.is_closed() {
                handle
                    .disconnect(Disconnect::ByApplication, "", "en")
                    .await?;
            }
        }
        Ok(())
    }
}

/// Shuttle one russh channel: inbound messages become events, queued
/// operations are applied in order.
async fn pump(
    id: TransportChannel,
    mut reader: ChannelReadHalf,
    writer: Arc<ChannelWriteHalf<Msg>>,
    mut ops: mpsc::UnboundedReceiver<PumpOp>,
    events: mpsc::UnboundedSender<Internal>,
) {
    let emit = |event: TransportEvent| {
        let _ = events.send(Internal::Event(event));
    };
    let mut failure = None;

    loop {
        tokio::select! {
            message = reader.wait() => match message {
                Some(ChannelMsg::Data { data }) => emit(TransportEvent::Data {
                    channel: id,
                    data: data.to_vec(),
                }),
                Some(ChannelMsg::ExtendedData { data, .. }) => emit(TransportEvent::Data {
                    channel: id,
                    data: data.to_vec(),
                }),
                Some(ChannelMsg::Eof) => emit(TransportEvent::Eof { channel: id }),
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
            op = ops.recv() => match op {
                Some(PumpOp::Data(bytes)) => {
                    if let Err(err) = writer.data(&bytes[..]).await {
                        tracing::debug!("Write on channel {id} failed: {err}");
                        failure = Some(Error::ChannelFailure(format!(
                            "write on channel {id} failed: {err}"
                        )));
                        break;
                    }
                    let _ = events.send(Internal::Written {
                        channel: id,
                        count: bytes.len(),
                    });
                }
                Some(PumpOp::Eof) => {
                    if let Err(err) = writer.eof().await {
                        tracing::debug!("EOF on channel {id} failed: {err}");
                    }
                }
                Some(PumpOp::Close) => {
                    if let Err(err) = writer.close().await {
                        tracing::debug!("Close on channel {id} failed: {err}");
                        failure = Some(Error::ChannelFailure(format!(
                            "close on channel {id} failed: {err}"
                        )));
                        break;
                    }
                }
                None => {
                    let _ = writer.close().await;
                    break;
                }
            },
        }
    }

    emit(TransportEvent::Closed {
        channel: id,
        error: failure,
    });
    tracing::trace!("Pump for channel {id} finished");
}

/// russh's algorithm defaults with the compression list taken from config.
fn preferred_algorithms(compression: bool) -> Preferred {
    let order: &'static [russh::compression::Name] = if compression {
        &[
            russh::compression::ZLIB_LEGACY,
            russh::compression::ZLIB,
            russh::compression::NONE,
        ]
    } else {
        &[russh::compression::NONE]
    };
    Preferred {
        compression: Cow::Borrowed(order),
        ..Preferred::default()
    }
}

fn port_u16(port: u32) -> u16 {
    u16::try_from(port).unwrap_or(0)
}

fn host_key_of(key: &PublicKey) -> HostKey {
    HostKey {
        algorithm: key.algorithm().as_str().to_string(),
        fingerprint: key.fingerprint(HashAlg::Sha256).to_string(),
        openssh: key.to_openssh().unwrap_or_default(),
    }
}

fn methods_of(set: &MethodSet) -> AuthMethods {
    let mut methods = AuthMethods::UNKNOWN;
    for kind in set.iter() {
        #[allow(unreachable_patterns)]
        match kind {
            MethodKind::None => methods |= AuthMethods::NONE,
            MethodKind::Password => methods |= AuthMethods::PASSWORD,
            MethodKind::PublicKey => methods |= AuthMethods::PUBLIC_KEY,
            MethodKind::HostBased => methods |= AuthMethods::HOST_BASED,
            MethodKind::KeyboardInteractive => methods |= AuthMethods::INTERACTIVE,
            _ => {}
        }
    }
    methods
}

fn auth_outcome(result: AuthResult) -> AuthOutcome {
    match result {
        AuthResult::Success => AuthOutcome::Success,
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } => AuthOutcome::Failure {
            methods: methods_of(&remaining_methods),
            partial_success,
        },
    }
}

fn interactive_step(response: KeyboardInteractiveAuthResponse) -> InteractiveStep {
    match response {
        KeyboardInteractiveAuthResponse::Success => InteractiveStep::Success,
        KeyboardInteractiveAuthResponse::Failure {
            remaining_methods, ..
        } => InteractiveStep::Failure {
            methods: methods_of(&remaining_methods),
        },
        KeyboardInteractiveAuthResponse::InfoRequest {
            name,
            instructions,
            prompts,
        } => InteractiveStep::Prompt(InteractivePrompt {
            name,
            instruction: instructions,
            prompts: prompts
                .into_iter()
                .map(|prompt| PromptItem {
                    text: prompt.prompt,
                    echo: prompt.echo,
                })
                .collect(),
        }),
    }
}

fn entry_of(file: File) -> SftpEntry {
    SftpEntry {
        attributes: attributes_of(&file.attrs),
        name: file.filename,
    }
}

fn is_end_of_listing(err: &SftpError) -> bool {
    matches!(err, SftpError::Status(status) if status.status_code == StatusCode::Eof)
}

fn attributes_of(metadata: &FileAttributes) -> SftpAttributes {
    SftpAttributes {
        size: metadata.size,
        uid: metadata.uid,
        gid: metadata.gid,
        permissions: metadata.permissions,
        atime: metadata.atime,
        mtime: metadata.mtime,
    }
}

/// Records the server identification line as it streams past.
struct BannerSniffer<S> {
    inner: S,
    line: Vec<u8>,
    banner: Arc<Mutex<Option<String>>>,
    done: bool,
}

impl<S> BannerSniffer<S> {
    fn new(inner: S, banner: Arc<Mutex<Option<String>>>) -> Self {
        Self {
            inner,
            line: Vec::new(),
            banner,
            done: false,
        }
    }

    fn observe(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if byte != b'\n' {
                // RFC 4253 caps the identification line at 255 bytes
                if self.line.len() < 255 {
                    self.line.push(byte);
                }
                continue;
            }
            let line = String::from_utf8_lossy(&self.line)
                .trim_end_matches('\r')
                .to_string();
            self.line.clear();
            if line.starts_with("SSH-") {
                if let Ok(mut slot) = self.banner.lock() {
                    *slot = Some(line);
                }
                self.done = true;
                return;
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BannerSniffer<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if !this.done {
            if let Poll::Ready(Ok(())) = &poll {
                this.observe(&buf.filled()[before..]);
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BannerSniffer<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// A `ProxyCommand` child process used as the connection.
struct ProcessStream {
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl ProcessStream {
    /// Run `command` through `sh -c` with `%h` and `%p` substituted.
    fn spawn(command: &str, host: &str, port: u16) -> Result<Self> {
        let command = command
            .replace("%h", host)
            .replace("%p", &port.to_string());
        tracing::debug!("Starting proxy command: {command}");

        let mut child = ProcessCommand::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ConnectFailure(format!("failed to run proxy command: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::ConnectFailure("proxy command has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ConnectFailure("proxy command has no stdout".to_string()))?;
        Ok(Self {
            _child: child,
            stdin,
            stdout,
        })
    }
}

impl AsyncRead for ProcessStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProcessStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stdin).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banner_sniffer_skips_preamble() {
        let slot = Arc::new(Mutex::new(None));
        let mut sniffer = BannerSniffer::new(tokio::io::empty(), Arc::clone(&slot));
        sniffer.observe(b"Welcome to the bastion\r\nSSH-2.0-Open");
        assert!(slot.lock().unwrap().is_none());
        sniffer.observe(b"SSH_9.6\r\n\x00\x00binary");
        assert_eq!(slot.lock().unwrap().as_deref(), Some("SSH-2.0-OpenSSH_9.6"));
        assert!(sniffer.done);
    }

    #[test]
    fn test_remote_directory_batches() {
        let file = |name: &str, size: u64| File {
            filename: name.to_string(),
            longname: String::new(),
            attrs: FileAttributes {
                size: Some(size),
                ..Default::default()
            },
        };
        let mut directory = RemoteDirectory::new("h1".to_string());
        directory.absorb(Some(vec![file("a.log", 10), file("b.log", 20)]));
        assert!(!directory.exhausted);
        let first = directory.pending.pop_front().unwrap();
        assert_eq!(first.name, "a.log");
        assert_eq!(first.attributes.size, Some(10));

        directory.absorb(Some(Vec::new()));
        assert_eq!(directory.pending.len(), 1);
        directory.absorb(None);
        assert!(directory.exhausted);
        assert_eq!(directory.handle, "h1");
    }

    #[test]
    fn test_end_of_listing_status() {
        let status = |status_code| {
            SftpError::Status(russh_sftp::protocol::Status {
                id: 3,
                status_code,
                error_message: String::new(),
                language_tag: "en".to_string(),
            })
        };
        assert!(is_end_of_listing(&status(StatusCode::Eof)));
        assert!(!is_end_of_listing(&status(StatusCode::PermissionDenied)));
        assert!(!is_end_of_listing(&SftpError::Timeout));
    }

    #[test]
    fn test_compression_preference() {
        let names = |preferred: Preferred| {
            preferred
                .compression
                .iter()
                .map(|name| name.as_ref().to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(preferred_algorithms(false)), vec!["none"]);
        assert_eq!(
            names(preferred_algorithms(true)),
            vec!["zlib@openssh.com", "zlib", "none"]
        );
        assert_eq!(
            preferred_algorithms(true).cipher.len(),
            Preferred::default().cipher.len(),
            "only compression changes"
        );
    }

    #[test]
    fn test_port_conversion() {
        assert_eq!(port_u16(2222), 2222);
        assert_eq!(port_u16(70000), 0);
    }

    #[tokio::test]
    async fn test_new_transport_has_no_events() {
        let mut transport = RusshTransport::new(&SessionConfig::default());
        assert!(!transport
            .poll_events(Duration::from_millis(10))
            .await
            .unwrap());
        assert!(transport.next_event().is_none());
        assert_eq!(transport.channel_window(TransportChannel(1)), 0);
    }

    #[tokio::test]
    async fn test_resize_unknown_channel_fails_fast() {
        let mut transport = RusshTransport::new(&SessionConfig::default());
        let err = time::timeout(
            Duration::from_secs(1),
            transport.pty_resize(TransportChannel(7), 120, 40),
        )
        .await
        .expect("resize must not wait on a pump")
        .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ChannelFailure);
    }

    #[tokio::test]
    async fn test_auth_requires_connection() {
        let mut transport = RusshTransport::new(&SessionConfig::default());
        let err = transport.auth_none("alice").await.unwrap_err();
        assert!(err.is_fatal(), "unexpected error: {err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_proxy_command_substitution() {
        use tokio::io::AsyncReadExt;

        let mut stream = ProcessStream::spawn("echo %h:%p", "db.internal", 2222).unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out.trim(), "db.internal:2222");
    }
}
