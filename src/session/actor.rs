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

//! The session task.
//!
//! `SessionActor` owns the transport and every channel entry. It is the only
//! place where session or channel state changes. Each loop iteration handles
//! one command, one batch of transport events or one keepalive tick, then
//! flushes any write buffers the transport now has room for.

use super::auth::{InteractiveHandler, InteractiveState, PasswordHandler};
use super::command::{
    stopped, Command, DelegateRef, ForwardCompletion, InteractiveSource, Reply,
};
use super::notify::{ChannelEvent, Notification, Notifier};
use super::{SessionInfo, SessionStage, WeakSession};
use crate::channel::state::{ChannelState, ShutdownAction};
use crate::channel::{
    Channel, ChannelId, ChannelKind, ChannelStage, ForwardChannel, PtySize, ShellChannel,
};
use crate::config::SessionConfig;
use crate::delegate::ShellChannelDelegate;
use crate::error::{Error, Result};
use crate::keys::{KeyPair, PassphraseHandler};
use crate::transport::{
    AuthOutcome, ConnectTarget, OpenRequest, SftpHandle, Transport, TransportChannel,
    TransportEvent,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Everything the session task tracks for one channel.
struct ChannelEntry {
    channel: Channel,
    state: ChannelState,
    transport: Option<TransportChannel>,
    delegate: DelegateRef,
    stage_tx: watch::Sender<ChannelStage>,
    pty_tx: Option<watch::Sender<PtySize>>,
    eof_delivered: bool,
    sftp_dirs: HashSet<SftpHandle>,
}

impl ChannelEntry {
    fn advance(&mut self, stage: ChannelStage) -> bool {
        if self.state.advance(stage) {
            self.stage_tx.send_replace(stage);
            true
        } else {
            false
        }
    }
}

pub(crate) struct SessionActor<T: Transport> {
    transport: T,
    config: SessionConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    session: WeakSession,
    notifier: Notifier,
    info: watch::Sender<SessionInfo>,
    stage: SessionStage,
    username: String,
    channels: BTreeMap<ChannelId, ChannelEntry>,
    by_transport: HashMap<TransportChannel, ChannelId>,
    next_channel_id: u64,
    finished: bool,
}

impl<T: Transport> SessionActor<T> {
    pub(crate) fn new(
        transport: T,
        config: SessionConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        session: WeakSession,
        notifier: Notifier,
        info: watch::Sender<SessionInfo>,
    ) -> Self {
        Self {
            transport,
            config,
            commands,
            session,
            notifier,
            info,
            stage: SessionStage::Initial,
            username: String::new(),
            channels: BTreeMap::new(),
            by_transport: HashMap::new(),
            next_channel_id: 1,
            finished: false,
        }
    }

    pub(crate) async fn run(mut self) {
        let poll_interval = self.config.poll_interval();
        let mut keepalive = self.config.keepalive().map(|period| {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        while !self.finished {
            let ready = self.stage == SessionStage::Ready;
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        tracing::debug!("All session handles dropped, shutting down");
                        self.teardown(None, true).await;
                    }
                },
                polled = self.transport.poll_events(poll_interval), if ready => match polled {
                    Ok(true) => self.drain_events().await,
                    Ok(false) => {}
                    Err(err) => self.teardown(Some(err), true).await,
                },
                _ = next_tick(&mut keepalive), if ready => {
                    if let Err(err) = self.transport.keepalive().await {
                        tracing::warn!("Keepalive failed: {err}");
                        self.teardown(Some(err), true).await;
                    }
                }
            }

            if !self.finished && self.stage == SessionStage::Ready {
                self.flush_all().await;
            }
        }

        // Commands queued behind the teardown still owe their callers an answer
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            self.reject(command).await;
        }
        self.notifier.flush().await;
        tracing::trace!("Session task finished");
    }

    /// Answer a command that arrived after the session ended. Dropping a
    /// reply sender fails the waiting call with `Stop`.
    async fn reject(&mut self, command: Command) {
        match command {
            Command::ResizePty {
                shell,
                delegate,
                columns,
                rows,
            } => {
                self.notifier
                    .notify(Notification::PtyResized {
                        channel: shell,
                        delegate,
                        columns,
                        rows,
                        error: Some(stopped()),
                    })
                    .await;
            }
            Command::BindRemote { completion, .. } => {
                self.notifier
                    .notify(Notification::ForwardBound {
                        completion,
                        result: Err(stopped()),
                    })
                    .await;
            }
            Command::Disconnect { done: Some(done) } => {
                let _ = done.send(());
            }
            _ => {}
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                host,
                port,
                username,
                timeout,
                reply,
            } => {
                let result = self.connect(host, port, username, timeout).await;
                let _ = reply.send(result);
            }
            Command::AuthPassword { handler, reply } => {
                let result = self.auth_password(handler).await;
                let _ = reply.send(result);
            }
            Command::AuthPrivateKey {
                path,
                passphrase,
                reply,
            } => {
                let result = self.auth_private_key(path, passphrase).await;
                let _ = reply.send(result);
            }
            Command::AuthKeyPair { key, reply } => {
                let result = self.auth_key_pair(&key).await;
                let _ = reply.send(result);
            }
            Command::AuthInteractive { source, reply } => {
                let result = self.auth_interactive(source).await;
                let _ = reply.send(result);
            }
            Command::OpenChannel {
                request,
                delegate,
                reply,
                opened,
            } => self.open_channel(request, delegate, reply, opened).await,
            Command::BindRemote {
                address,
                port,
                completion,
            } => self.bind_remote(address, port, completion).await,
            Command::SetDelegate { id, delegate } => {
                if let Some(entry) = self.channels.get_mut(&id) {
                    entry.delegate = delegate;
                    self.deliver_inbound(id).await;
                }
            }
            Command::Write { id, data, reply } => {
                let result = match self.channels.get_mut(&id) {
                    Some(entry) => {
                        let window = entry
                            .transport
                            .map_or(0, |handle| self.transport.channel_window(handle));
                        entry.state.enqueue_write(&data, window)
                    }
                    None => Err(Error::ChannelFailure(format!("channel {id} is closed"))),
                };
                let accepted = result.is_ok();
                let _ = reply.send(result);
                if accepted {
                    self.flush_channel(id).await;
                }
            }
            Command::Eof { id } => self.request_eof(id).await,
            Command::Close { id } => self.request_close(id).await,
            Command::ResizePty {
                shell,
                delegate,
                columns,
                rows,
            } => self.resize_pty(shell, delegate, columns, rows).await,
            Command::SftpStat { id, path, reply } => {
                let result = match self.sftp_channel(id) {
                    Ok(handle) => self.transport.sftp_stat(handle, &path).await,
                    Err(err) => Err(err),
                };
                let _ = reply.send(result);
            }
            Command::SftpOpenDir { id, path, reply } => {
                let result = self.sftp_open_dir(id, &path).await;
                let _ = reply.send(result);
            }
            Command::SftpReadDir { id, handle, reply } => {
                let result = match self.sftp_directory(id, handle) {
                    Ok(channel) => self.transport.sftp_read_dir(channel, handle).await,
                    Err(err) => Err(err),
                };
                let _ = reply.send(result);
            }
            Command::SftpCloseDir { id, handle, reply } => {
                let result = self.sftp_close_dir(id, handle).await;
                let _ = reply.send(result);
            }
            Command::Dispatch(f) => f(),
            Command::Disconnect { done } => {
                self.teardown(None, true).await;
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
        }
    }

    // Session state

    fn set_stage(&mut self, next: SessionStage) -> bool {
        if !self.stage.can_advance_to(next) {
            return false;
        }
        tracing::debug!("Session stage {:?} -> {:?}", self.stage, next);
        self.stage = next;
        self.info.send_modify(|info| info.stage = next);
        true
    }

    fn record_error(&self, err: &Error) {
        let err = err.clone();
        self.info.send_modify(|info| info.last_error = Some(err));
    }

    fn publish_channels(&self) {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        self.info.send_modify(|info| info.channels = ids);
    }

    fn take_issue_banner(&mut self) {
        if let Some(banner) = self.transport.take_issue_banner() {
            self.info.send_modify(|info| info.issue_banner = Some(banner));
        }
    }

    async fn connect(
        &mut self,
        host: String,
        port: u16,
        username: String,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if self.stage != SessionStage::Initial {
            return Err(Error::ConnectFailure(format!(
                "connect is only valid on a new session (stage is {:?})",
                self.stage
            )));
        }

        self.set_stage(SessionStage::Connecting);
        self.username = username.clone();
        self.info.send_modify(|info| {
            info.host = Some(host.clone());
            info.port = port;
            info.username = Some(username);
        });

        tracing::info!("Connecting to {host}:{port}");
        let target = ConnectTarget {
            host: host.clone(),
            port,
            proxy: self.config.proxy.clone(),
            proxy_command: self.config.proxy_command.clone(),
        };

        let established = match timeout {
            Some(limit) => match time::timeout(limit, self.establish(&target)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!(
                    "connection to {host}:{port} was not established within {limit:?}"
                ))),
            },
            None => self.establish(&target).await,
        };
        if let Err(err) = established {
            tracing::warn!("Connection to {host}:{port} failed: {err}");
            self.teardown(Some(err.clone()), false).await;
            return Err(err);
        }

        self.notifier
            .notify(Notification::Connected {
                host: host.clone(),
                port,
            })
            .await;
        self.set_stage(SessionStage::Authenticating);

        // Probe with "none" to learn which methods the server offers
        let probe = self.transport.auth_none(&self.username).await;
        self.take_issue_banner();
        match probe {
            Ok(AuthOutcome::Success) => {
                tracing::info!("Server accepted {} without credentials", self.username);
                self.set_stage(SessionStage::Ready);
            }
            Ok(AuthOutcome::Failure { methods, .. }) => {
                tracing::debug!("Server offers authentication methods: {methods}");
                self.info.send_modify(|info| info.auth_methods = methods);
                self.need_authenticate().await;
            }
            Err(err) if err.is_fatal() => {
                self.teardown(Some(err.clone()), false).await;
                return Err(err);
            }
            Err(err) => {
                tracing::debug!("'none' authentication probe failed: {err}");
                self.need_authenticate().await;
            }
        }
        Ok(())
    }

    async fn establish(&mut self, target: &ConnectTarget) -> Result<()> {
        let address = self.transport.connect(target).await?;
        self.info.send_modify(|info| info.host_ip = Some(address));

        let key = self.transport.handshake().await?;
        tracing::debug!("Server host key {} {}", key.algorithm, key.fingerprint);

        if !self.notifier.ask_host_key(key).await {
            let _ = self.transport.confirm_host_key(false).await;
            return Err(Error::HostKeyMismatch {
                host: target.host.clone(),
            });
        }

        let banners = self.transport.confirm_host_key(true).await?;
        self.info.send_modify(|info| {
            info.client_banner = Some(banners.client);
            info.server_banner = banners.server;
        });
        Ok(())
    }

    async fn need_authenticate(&mut self) {
        let username = self.username.clone();
        self.notifier
            .notify(Notification::NeedAuthenticate { username })
            .await;
    }

    // Authentication

    /// `Ok(false)` when the session is already authorized.
    fn check_authenticating(&self) -> Result<bool> {
        match self.stage {
            SessionStage::Authenticating => Ok(true),
            SessionStage::Ready => Ok(false),
            stage => Err(Error::AuthFailure(format!(
                "cannot authenticate in stage {stage:?}"
            ))),
        }
    }

    async fn auth_password(&mut self, handler: PasswordHandler) -> Result<()> {
        if !self.check_authenticating()? {
            return Ok(());
        }
        let password = run_blocking(handler).await?.ok_or_else(|| {
            Error::AuthFailure("no password was supplied".to_string())
        })?;
        let outcome = self
            .transport
            .auth_password(&self.username, password.as_str())
            .await;
        self.finish_auth("password", outcome).await
    }

    async fn auth_private_key(
        &mut self,
        path: PathBuf,
        passphrase: PassphraseHandler,
    ) -> Result<()> {
        if !self.check_authenticating()? {
            return Ok(());
        }
        self.info
            .send_modify(|info| info.private_key_path = Some(path.clone()));

        let key = match run_blocking(move || KeyPair::from_file_with_handler(&path, passphrase))
            .await
            .and_then(|loaded| loaded)
        {
            Ok(key) => key,
            Err(err) => {
                self.record_error(&err);
                return Err(err);
            }
        };
        tracing::debug!("Loaded {} key {}", key.key_type(), key.fingerprint());
        let outcome = self.transport.auth_public_key(&self.username, &key).await;
        self.finish_auth("publickey", outcome).await
    }

    async fn auth_key_pair(&mut self, key: &KeyPair) -> Result<()> {
        if !self.check_authenticating()? {
            return Ok(());
        }
        let outcome = self.transport.auth_public_key(&self.username, key).await;
        self.finish_auth("publickey", outcome).await
    }

    async fn finish_auth(&mut self, method: &str, outcome: Result<AuthOutcome>) -> Result<()> {
        self.take_issue_banner();
        match outcome {
            Ok(AuthOutcome::Success) => {
                tracing::info!("Authenticated {} with {method}", self.username);
                self.set_stage(SessionStage::Ready);
                Ok(())
            }
            Ok(AuthOutcome::Failure {
                methods,
                partial_success,
            }) => {
                if partial_success {
                    self.info.send_modify(|info| info.auth_methods = methods);
                }
                let err = Error::AuthFailure(format!("{method} authentication was rejected"));
                self.record_error(&err);
                Err(err)
            }
            Err(err) => {
                if err.is_fatal() {
                    self.teardown(Some(err.clone()), false).await;
                } else {
                    self.record_error(&err);
                }
                Err(err)
            }
        }
    }

    async fn auth_interactive(&mut self, source: InteractiveSource) -> Result<()> {
        if !self.check_authenticating()? {
            return Ok(());
        }
        let mut handler: Option<InteractiveHandler> = match source {
            InteractiveSource::Handler(handler) => Some(handler),
            InteractiveSource::Delegate => None,
        };
        let use_delegate = handler.is_none();

        let mut state = InteractiveState::start();
        let mut step = self
            .transport
            .auth_interactive_start(&self.username, None)
            .await;

        loop {
            let reply = match step {
                Ok(reply) => reply,
                Err(err) => return self.finish_auth("keyboard-interactive", Err(err)).await,
            };
            state = state.on_step(reply);
            let (round, prompt) = match &state {
                InteractiveState::AwaitingAnswers { round, prompt } => (*round, prompt.clone()),
                _ => break,
            };
            tracing::debug!(
                "Keyboard-interactive round {round} with {} prompts",
                prompt.prompts.len()
            );

            let answers = if use_delegate {
                let mut answers = Vec::with_capacity(prompt.prompts.len());
                for item in &prompt.prompts {
                    let Some(answer) = self.notifier.ask_interactive(item.text.clone()).await
                    else {
                        let err = Error::AuthFailure(
                            "no session delegate answers keyboard-interactive prompts".to_string(),
                        );
                        return self.finish_auth("keyboard-interactive", Err(err)).await;
                    };
                    answers.push(answer);
                }
                answers
            } else {
                let mut callback = handler.take().ok_or_else(|| {
                    Error::AuthFailure("interactive handler is unavailable".to_string())
                })?;
                let (callback, answers) = run_blocking(move || {
                    let answers = callback(round, &prompt);
                    (callback, answers)
                })
                .await?;
                handler = Some(callback);
                answers
            };

            let (next, forwarded) = state.on_answers(answers);
            state = next;
            match forwarded {
                Some(answers) => {
                    step = self.transport.auth_interactive_respond(answers).await;
                }
                None => break,
            }
        }

        self.take_issue_banner();
        match state.finish() {
            Some(Ok(())) => {
                tracing::info!("Authenticated {} with keyboard-interactive", self.username);
                self.set_stage(SessionStage::Ready);
                Ok(())
            }
            Some(Err(err)) => {
                self.record_error(&err);
                Err(err)
            }
            None => Err(Error::AuthFailure(
                "keyboard-interactive exchange ended unexpectedly".to_string(),
            )),
        }
    }

    // Channels

    fn allocate_id(&mut self) -> ChannelId {
        let id = ChannelId(self.next_channel_id);
        self.next_channel_id += 1;
        id
    }

    fn new_entry(
        &mut self,
        kind: ChannelKind,
        pty: Option<PtySize>,
        delegate: DelegateRef,
    ) -> ChannelId {
        let id = self.allocate_id();
        let (stage_tx, stage_rx) = watch::channel(ChannelStage::Initial);
        let (pty_tx, pty_rx) = match pty {
            Some(size) => {
                let (tx, rx) = watch::channel(size);
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };
        let shell_delegate = match &delegate {
            DelegateRef::Shell(delegate) => Some(delegate.clone()),
            _ => None,
        };
        let channel = Channel::new(
            id,
            kind,
            self.session.clone(),
            stage_rx,
            pty_rx,
            shell_delegate,
        );
        let mut entry = ChannelEntry {
            channel,
            state: ChannelState::new(self.config.write_buffer_limit),
            transport: None,
            delegate,
            stage_tx,
            pty_tx,
            eof_delivered: false,
            sftp_dirs: HashSet::new(),
        };
        entry.advance(ChannelStage::Opening);
        self.channels.insert(id, entry);
        self.publish_channels();
        id
    }

    async fn open_channel(
        &mut self,
        request: OpenRequest,
        delegate: DelegateRef,
        reply: Reply<Channel>,
        opened: Option<Reply<()>>,
    ) {
        if self.stage != SessionStage::Ready {
            let _ = reply.send(Err(Error::ChannelFailure(format!(
                "cannot open a channel in session stage {:?}",
                self.stage
            ))));
            return;
        }

        let (kind, pty) = match &request {
            OpenRequest::DirectTcpip { host, port, .. } => (
                ChannelKind::Direct {
                    host: host.clone(),
                    port: *port,
                },
                None,
            ),
            OpenRequest::Shell(pty) => (
                ChannelKind::Shell {
                    terminal_type: pty.terminal_type.clone(),
                },
                Some(PtySize {
                    columns: pty.columns,
                    rows: pty.rows,
                }),
            ),
            OpenRequest::Sftp => (ChannelKind::Sftp, None),
        };
        let id = self.new_entry(kind, pty, delegate);
        if let Some(entry) = self.channels.get(&id) {
            let _ = reply.send(Ok(entry.channel.clone()));
        }

        tracing::debug!("Opening channel {id}: {request:?}");
        match self.transport.channel_open(&request).await {
            Ok(handle) => {
                self.by_transport.insert(handle, id);
                if let Some(entry) = self.channels.get_mut(&id) {
                    entry.transport = Some(handle);
                    entry.advance(ChannelStage::Ready);
                    self.notifier
                        .channel(&entry.channel, &entry.delegate, ChannelEvent::Opened)
                        .await;
                }
                if let Some(opened) = opened {
                    let _ = opened.send(Ok(()));
                }
            }
            Err(err) => {
                tracing::warn!("Failed to open channel {id}: {err}");
                if let Some(mut entry) = self.channels.remove(&id) {
                    entry.state.finish();
                    entry.stage_tx.send_replace(ChannelStage::Closed);
                    self.publish_channels();
                    self.notifier
                        .channel(
                            &entry.channel,
                            &entry.delegate,
                            ChannelEvent::OpenFailed(err.clone()),
                        )
                        .await;
                }
                if let Some(opened) = opened {
                    let _ = opened.send(Err(err));
                }
            }
        }
    }

    async fn bind_remote(&mut self, address: String, port: u16, completion: ForwardCompletion) {
        let result = if self.stage == SessionStage::Ready {
            tracing::debug!("Requesting remote forward on {address}:{port}");
            self.transport.request_remote_forward(&address, port).await
        } else {
            Err(Error::ChannelFailure(format!(
                "cannot bind a remote forward in session stage {:?}",
                self.stage
            )))
        };
        if let Err(err) = &result {
            tracing::warn!("Remote forward on {address}:{port} failed: {err}");
        }
        self.notifier
            .notify(Notification::ForwardBound { completion, result })
            .await;
    }

    async fn accept_forward(
        &mut self,
        handle: TransportChannel,
        connected_address: String,
        connected_port: u16,
        originator_address: String,
        originator_port: u16,
    ) {
        tracing::debug!(
            "Forwarded connection from {originator_address}:{originator_port} \
             to {connected_address}:{connected_port}"
        );
        let kind = ChannelKind::Forward {
            connected_address,
            connected_port,
            originator_address,
            originator_port,
        };
        let id = self.new_entry(kind, None, DelegateRef::None);
        self.by_transport.insert(handle, id);
        let channel = match self.channels.get_mut(&id) {
            Some(entry) => {
                entry.transport = Some(handle);
                entry.advance(ChannelStage::Ready);
                entry.channel.clone()
            }
            None => return,
        };
        self.notifier
            .notify(Notification::ForwardAccepted(ForwardChannel::new(channel)))
            .await;
    }

    async fn flush_all(&mut self) {
        let pending: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, entry)| entry.state.pending_write() > 0)
            .map(|(id, _)| *id)
            .collect();
        for id in pending {
            self.flush_channel(id).await;
        }
    }

    /// Send as much buffered data as the transport accepts, then any EOF or
    /// close that was waiting for the buffer to drain.
    async fn flush_channel(&mut self, id: ChannelId) {
        let mut failure = None;
        {
            let Some(entry) = self.channels.get_mut(&id) else {
                return;
            };
            let Some(handle) = entry.transport else {
                return;
            };

            loop {
                let window = self.transport.channel_window(handle);
                let Some(segment) = entry.state.peek_segment(window) else {
                    break;
                };
                match self.transport.channel_write(handle, &segment).await {
                    Ok(0) => break,
                    Ok(written) => {
                        entry.state.consume(written);
                        self.notifier
                            .channel(&entry.channel, &entry.delegate, ChannelEvent::Wrote(written))
                            .await;
                    }
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }

            if failure.is_none() && entry.state.take_deferred_eof() {
                if let Err(err) = self.transport.channel_eof(handle).await {
                    failure = Some(err);
                }
            }
            if failure.is_none() && entry.state.take_deferred_close() {
                if let Err(err) = self.transport.channel_close(handle).await {
                    failure = Some(err);
                }
            }
        }

        match failure {
            Some(err) => {
                tracing::warn!("Channel {id} write failed: {err}");
                self.force_close(id, Some(err)).await;
            }
            None => self.close_if_both_ended(id).await,
        }
    }

    async fn request_eof(&mut self, id: ChannelId) {
        let Some(entry) = self.channels.get_mut(&id) else {
            return;
        };
        let Some(handle) = entry.transport else {
            return;
        };
        if entry.state.request_eof() != ShutdownAction::SendNow {
            return;
        }
        entry.state.mark_eof_sent();
        if let Err(err) = self.transport.channel_eof(handle).await {
            self.force_close(id, Some(err)).await;
            return;
        }
        self.close_if_both_ended(id).await;
    }

    async fn request_close(&mut self, id: ChannelId) {
        let Some(entry) = self.channels.get_mut(&id) else {
            return;
        };
        let Some(handle) = entry.transport else {
            return;
        };
        if entry.state.request_close() != ShutdownAction::SendNow {
            return;
        }
        entry.state.mark_close_sent();
        tracing::debug!("Closing channel {id}");
        if let Err(err) = self.transport.channel_close(handle).await {
            self.force_close(id, Some(err)).await;
        }
    }

    async fn close_if_both_ended(&mut self, id: ChannelId) {
        let Some(entry) = self.channels.get_mut(&id) else {
            return;
        };
        let Some(handle) = entry.transport else {
            return;
        };
        if !entry.state.should_close_after_eof() {
            return;
        }
        entry.state.mark_close_sent();
        if let Err(err) = self.transport.channel_close(handle).await {
            self.force_close(id, Some(err)).await;
        }
    }

    /// Close without waiting for the peer and report `error` to the delegate.
    async fn force_close(&mut self, id: ChannelId, error: Option<Error>) {
        if let Some(handle) = self.channels.get(&id).and_then(|entry| entry.transport) {
            if let Err(err) = self.transport.channel_close(handle).await {
                tracing::trace!("Ignoring close failure on channel {id}: {err}");
            }
        }
        self.finish_channel(id, error).await;
    }

    /// Move a channel to `Closed`, drop it from the session and notify its
    /// delegate exactly once.
    async fn finish_channel(&mut self, id: ChannelId, error: Option<Error>) {
        let Some(mut entry) = self.channels.remove(&id) else {
            return;
        };
        if let Some(handle) = entry.transport {
            self.by_transport.remove(&handle);
        }
        let Some(dropped) = entry.state.finish() else {
            return;
        };
        entry.stage_tx.send_replace(ChannelStage::Closed);
        self.publish_channels();

        let error = error.or_else(|| {
            (dropped > 0).then(|| {
                Error::ChannelFailure(format!(
                    "channel closed with {dropped} unsent bytes discarded"
                ))
            })
        });
        tracing::debug!("Channel {id} closed");
        self.notifier
            .channel(&entry.channel, &entry.delegate, ChannelEvent::Closed(error))
            .await;
    }

    async fn deliver_inbound(&mut self, id: ChannelId) {
        let Some(entry) = self.channels.get_mut(&id) else {
            return;
        };
        if !entry.delegate.is_set() {
            if entry.state.pending_read() > self.config.write_buffer_limit {
                let err = Error::ChannelFailure(format!(
                    "{} unread bytes buffered with no delegate attached",
                    entry.state.pending_read()
                ));
                self.force_close(id, Some(err)).await;
            }
            return;
        }
        while let Some(chunk) = entry.state.take_inbound() {
            self.notifier
                .channel(&entry.channel, &entry.delegate, ChannelEvent::Data(chunk))
                .await;
        }
        if entry.state.remote_eof() && !entry.eof_delivered {
            entry.eof_delivered = true;
            self.notifier
                .channel(&entry.channel, &entry.delegate, ChannelEvent::Eof)
                .await;
        }
    }

    /// Resize the PTY and report the outcome to `delegate`, whatever it is.
    async fn resize_pty(
        &mut self,
        shell: ShellChannel,
        delegate: Weak<dyn ShellChannelDelegate>,
        columns: u32,
        rows: u32,
    ) {
        let id = shell.id();
        let target = self
            .channels
            .get(&id)
            .map(|entry| (entry.transport, entry.state.stage()));
        let result = match target {
            Some((Some(handle), ChannelStage::Ready)) => {
                self.transport.pty_resize(handle, columns, rows).await
            }
            Some((_, stage)) => Err(Error::ChannelFailure(format!(
                "cannot resize the PTY of a channel in stage {stage:?}"
            ))),
            None => Err(Error::ChannelFailure(format!(
                "channel {id} closed before the PTY resize was sent"
            ))),
        };

        match &result {
            Ok(()) => {
                if let Some(pty) = self.channels.get(&id).and_then(|e| e.pty_tx.as_ref()) {
                    pty.send_replace(PtySize { columns, rows });
                }
            }
            Err(err) => tracing::debug!("PTY resize on channel {id} failed: {err}"),
        }

        self.notifier
            .notify(Notification::PtyResized {
                channel: shell,
                delegate,
                columns,
                rows,
                error: result.err(),
            })
            .await;
    }

    // SFTP

    fn sftp_channel(&self, id: ChannelId) -> Result<TransportChannel> {
        let entry = self
            .channels
            .get(&id)
            .ok_or_else(|| Error::ChannelFailure(format!("SFTP channel {id} is closed")))?;
        match (&entry.channel.kind(), entry.transport, entry.state.stage()) {
            (ChannelKind::Sftp, Some(handle), ChannelStage::Ready) => Ok(handle),
            (ChannelKind::Sftp, _, stage) => Err(Error::ChannelFailure(format!(
                "SFTP channel {id} is not ready (stage {stage:?})"
            ))),
            _ => Err(Error::ChannelFailure(format!(
                "channel {id} is not an SFTP channel"
            ))),
        }
    }

    fn sftp_directory(&self, id: ChannelId, handle: SftpHandle) -> Result<TransportChannel> {
        let channel = self.sftp_channel(id)?;
        let open = self
            .channels
            .get(&id)
            .is_some_and(|entry| entry.sftp_dirs.contains(&handle));
        if open {
            Ok(channel)
        } else {
            Err(Error::ChannelFailure(
                "directory handle is not open".to_string(),
            ))
        }
    }

    async fn sftp_open_dir(&mut self, id: ChannelId, path: &str) -> Result<SftpHandle> {
        let channel = self.sftp_channel(id)?;
        let handle = self.transport.sftp_open_dir(channel, path).await?;
        if let Some(entry) = self.channels.get_mut(&id) {
            entry.sftp_dirs.insert(handle);
        }
        Ok(handle)
    }

    async fn sftp_close_dir(&mut self, id: ChannelId, handle: SftpHandle) -> Result<()> {
        let released = self
            .channels
            .get_mut(&id)
            .is_some_and(|entry| entry.sftp_dirs.remove(&handle));
        if !released {
            return Ok(());
        }
        let channel = self.sftp_channel(id)?;
        self.transport.sftp_close_dir(channel, handle).await
    }

    // Transport events

    async fn drain_events(&mut self) {
        while let Some(event) = self.transport.next_event() {
            self.handle_event(event).await;
            if self.finished {
                break;
            }
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        tracing::trace!("Transport event: {event:?}");
        match event {
            TransportEvent::Data { channel, data } => {
                if let Some(&id) = self.by_transport.get(&channel) {
                    if let Some(entry) = self.channels.get_mut(&id) {
                        entry.state.push_inbound(&data);
                    }
                    self.deliver_inbound(id).await;
                }
            }
            TransportEvent::Eof { channel } => {
                if let Some(&id) = self.by_transport.get(&channel) {
                    let first = self
                        .channels
                        .get_mut(&id)
                        .is_some_and(|entry| entry.state.on_remote_eof());
                    if first {
                        self.deliver_inbound(id).await;
                        self.close_if_both_ended(id).await;
                    }
                }
            }
            TransportEvent::Closed { channel, error } => {
                if let Some(&id) = self.by_transport.get(&channel) {
                    self.deliver_inbound(id).await;
                    self.finish_channel(id, error).await;
                }
            }
            TransportEvent::WindowAdjusted { channel } => {
                if let Some(&id) = self.by_transport.get(&channel) {
                    self.flush_channel(id).await;
                }
            }
            TransportEvent::ForwardAccepted {
                channel,
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => {
                self.accept_forward(
                    channel,
                    connected_address,
                    connected_port,
                    originator_address,
                    originator_port,
                )
                .await;
            }
            TransportEvent::Disconnected { reason } => {
                tracing::warn!("Transport disconnected: {reason}");
                self.teardown(Some(Error::fatal(reason)), true).await;
            }
        }
    }

    /// Close every channel, shut the transport down and stop the task.
    ///
    /// With `error` the session ends `Failed`, otherwise `Disconnected`.
    /// `announce` controls whether the session delegate hears about it.
    async fn teardown(&mut self, error: Option<Error>, announce: bool) {
        if self.finished {
            return;
        }
        self.finished = true;

        let channel_error = error.clone();
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            self.force_close(id, channel_error.clone()).await;
        }

        let was_live = self.stage > SessionStage::Initial && !self.stage.is_terminal();
        if let Err(err) = self.transport.disconnect().await {
            tracing::debug!("Transport disconnect reported: {err}");
        }

        match &error {
            Some(err) => {
                self.record_error(err);
                self.set_stage(SessionStage::Failed);
            }
            None => {
                self.set_stage(SessionStage::Disconnected);
            }
        }

        if announce && was_live {
            self.notifier
                .notify(Notification::Disconnected { error })
                .await;
        }
        self.notifier.flush().await;
        tracing::info!("Session ended in stage {:?}", self.stage);
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Run a user callback off the session task.
async fn run_blocking<F, R>(f: F) -> Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| Error::Stop(format!("credential callback failed: {err}")))
}
