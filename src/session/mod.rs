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

//! SSH sessions.
//!
//! A [`Session`] is a handle to a task that owns the transport and every
//! channel opened over it. All state changes happen on that task; handles
//! send it commands and read a published [`SessionInfo`] snapshot.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use sshkit::{HostKey, Session, SessionDelegate};
//! struct TrustAll;
//!
//! impl SessionDelegate for TrustAll {
//!     fn should_connect_with_host_key(&self, _: &Session, _: &HostKey) -> bool {
//!         true
//!     }
//! }
//!
//! # async fn demo() -> sshkit::Result<()> {
//! let delegate = Arc::new(TrustAll);
//! let session = Session::builder().delegate(&delegate).build();
//! session.connect("example.com", 22, "alice", None).await?;
//! session.authenticate_by_password(|| Some("secret".to_string())).await?;
//! # Ok(())
//! # }
//! ```

mod actor;
pub(crate) mod auth;
pub(crate) mod command;
mod notify;

pub use auth::{AuthMethods, InteractiveHandler, PasswordHandler};
pub use command::ForwardCompletion;

use crate::channel::{Channel, ChannelId, DirectChannel, ShellChannel};
use crate::config::{ProxyConfig, SessionConfig};
use crate::delegate::{ChannelDelegate, SessionDelegate, ShellChannelDelegate};
use crate::error::{Error, Result};
use crate::keys::KeyPair;
use crate::sftp::Sftp;
use crate::transport::{InteractivePrompt, OpenRequest, PtyRequest, RusshTransport, Transport};
use actor::SessionActor;
use command::{Command, DelegateRef, InteractiveSource};
use notify::Notifier;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use zeroize::Zeroizing;

/// Session lifecycle.
///
/// Stages only move forward. `Failed` is entered from any live stage on an
/// unrecoverable error and is never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SessionStage {
    #[default]
    Initial,
    Connecting,
    Authenticating,
    Ready,
    Disconnected,
    Failed,
}

impl SessionStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStage::Disconnected | SessionStage::Failed)
    }

    pub(crate) fn can_advance_to(&self, next: SessionStage) -> bool {
        !self.is_terminal() && next > *self
    }
}

/// Snapshot of session state, safe to read from any thread.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub stage: SessionStage,
    pub host: Option<String>,
    pub host_ip: Option<IpAddr>,
    pub port: u16,
    pub username: Option<String>,
    /// Key file of the most recent public key attempt.
    pub private_key_path: Option<PathBuf>,
    pub auth_methods: AuthMethods,
    pub client_banner: Option<String>,
    pub server_banner: Option<String>,
    /// Pre-authentication message sent by the server.
    pub issue_banner: Option<String>,
    pub proxy: ProxyConfig,
    pub last_error: Option<Error>,
    /// Open channels in creation order.
    pub channels: Vec<ChannelId>,
}

impl SessionInfo {
    /// The transport is up (authenticated or not).
    pub fn is_connected(&self) -> bool {
        matches!(
            self.stage,
            SessionStage::Authenticating | SessionStage::Ready
        )
    }

    pub fn is_authorized(&self) -> bool {
        self.stage == SessionStage::Ready
    }

    /// SSH protocol major version taken from the server banner.
    pub fn protocol_version(&self) -> Option<u32> {
        let banner = self.server_banner.as_deref()?;
        let version = banner.strip_prefix("SSH-")?.split('-').next()?;
        match version {
            "2.0" | "1.99" => Some(2),
            v if v.starts_with("1.") => Some(1),
            _ => None,
        }
    }
}

/// Handle to a session task. Clones share the same session.
///
/// The session is torn down when the last handle is dropped.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
    info: watch::Receiver<SessionInfo>,
}

/// Non-owning reference to a session.
#[derive(Clone)]
pub struct WeakSession {
    commands: mpsc::WeakUnboundedSender<Command>,
    info: watch::Receiver<SessionInfo>,
}

impl WeakSession {
    pub fn upgrade(&self) -> Option<Session> {
        Some(Session {
            commands: self.commands.upgrade()?,
            info: self.info.clone(),
        })
    }

    /// A handle whose operations all fail with `Stop` but whose snapshot
    /// still shows the final session state.
    pub(crate) fn detached(&self) -> Session {
        let (commands, _) = mpsc::unbounded_channel();
        Session {
            commands,
            info: self.info.clone(),
        }
    }

    pub(crate) fn commands(&self) -> &mpsc::WeakUnboundedSender<Command> {
        &self.commands
    }
}

/// Builder for [`Session`].
#[derive(Default)]
pub struct SessionBuilder {
    config: SessionConfig,
    delegate: Option<Weak<dyn SessionDelegate>>,
    runtime: Option<Handle>,
}

impl SessionBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Delegate for session events. Only a weak reference is kept.
    pub fn delegate<D: SessionDelegate>(mut self, delegate: &Arc<D>) -> Self {
        let delegate = Arc::downgrade(delegate);
        let delegate: Weak<dyn SessionDelegate> = delegate;
        self.delegate = Some(delegate);
        self
    }

    /// Runtime on which delegate callbacks run. Defaults to the current one.
    pub fn notification_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Start a session backed by [`RusshTransport`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Session {
        let transport = RusshTransport::new(&self.config);
        self.build_with_transport(transport)
    }

    /// Start a session over a custom transport.
    pub fn build_with_transport<T: Transport>(self, transport: T) -> Session {
        let SessionBuilder {
            config,
            delegate,
            runtime,
        } = self;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let info = SessionInfo {
            proxy: config.proxy.clone(),
            ..Default::default()
        };
        let (info_tx, info_rx) = watch::channel(info);

        let weak = WeakSession {
            commands: commands_tx.downgrade(),
            info: info_rx.clone(),
        };
        let runtime = runtime.unwrap_or_else(Handle::current);
        let notifier = Notifier::spawn(
            &runtime,
            delegate,
            weak.clone(),
            config.notification_capacity,
        );

        let actor = SessionActor::new(transport, config, commands_rx, weak, notifier, info_tx);
        tokio::spawn(actor.run());

        Session {
            commands: commands_tx,
            info: info_rx,
        }
    }
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Session with default configuration over [`RusshTransport`].
    pub fn new<D: SessionDelegate>(delegate: &Arc<D>) -> Self {
        Self::builder().delegate(delegate).build()
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            commands: self.commands.downgrade(),
            info: self.info.clone(),
        }
    }

    pub fn info(&self) -> SessionInfo {
        self.info.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionInfo> {
        self.info.clone()
    }

    pub fn stage(&self) -> SessionStage {
        self.info.borrow().stage
    }

    pub fn auth_methods(&self) -> AuthMethods {
        self.info.borrow().auth_methods
    }

    pub fn last_error(&self) -> Option<Error> {
        self.info.borrow().last_error.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.info.borrow().is_connected()
    }

    pub fn is_authorized(&self) -> bool {
        self.info.borrow().is_authorized()
    }

    /// Wait until the session reaches `stage` or a terminal stage.
    pub async fn wait_for(&self, stage: SessionStage) -> SessionStage {
        let mut rx = self.info.clone();
        loop {
            let current = rx.borrow_and_update().stage;
            if current >= stage || current.is_terminal() {
                return current;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().stage;
            }
        }
    }

    /// Connect and verify the host key. Valid once, from `Initial`.
    ///
    /// On success the session is `Authenticating`, or `Ready` if the server
    /// accepts the `none` method.
    pub async fn connect(
        &self,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let host = host.into();
        let username = username.into();
        command::request(&self.commands, |reply| Command::Connect {
            host,
            port,
            username,
            timeout,
            reply,
        })
        .await
    }

    /// Authenticate with a password obtained from `handler`.
    ///
    /// The handler runs on a blocking thread; returning `None` abandons the
    /// attempt.
    pub async fn authenticate_by_password<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce() -> Option<String> + Send + 'static,
    {
        let handler: PasswordHandler = Box::new(move || handler().map(Zeroizing::new));
        command::request(&self.commands, |reply| Command::AuthPassword { handler, reply }).await
    }

    /// Authenticate with a private key file. `passphrase` is asked at most
    /// once, and only if the key is encrypted.
    pub async fn authenticate_by_private_key<F>(
        &self,
        path: impl Into<PathBuf>,
        passphrase: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Option<String> + Send + 'static,
    {
        let path = path.into();
        let passphrase = Box::new(move || passphrase().map(Zeroizing::new));
        command::request(&self.commands, |reply| Command::AuthPrivateKey {
            path,
            passphrase,
            reply,
        })
        .await
    }

    pub async fn authenticate_by_key_pair(&self, key: &KeyPair) -> Result<()> {
        let key = key.clone();
        command::request(&self.commands, |reply| Command::AuthKeyPair { key, reply }).await
    }

    /// Keyboard-interactive authentication answered by `handler`, called once
    /// per prompt round with the round index.
    pub async fn authenticate_by_interactive<F>(&self, handler: F) -> Result<()>
    where
        F: FnMut(usize, &InteractivePrompt) -> Vec<String> + Send + 'static,
    {
        let source = InteractiveSource::Handler(Box::new(handler));
        command::request(&self.commands, |reply| Command::AuthInteractive { source, reply })
            .await
    }

    /// Keyboard-interactive authentication answered prompt by prompt through
    /// [`SessionDelegate::keyboard_interactive_request`].
    pub async fn authenticate_by_interactive_delegate(&self) -> Result<()> {
        command::request(&self.commands, |reply| Command::AuthInteractive {
            source: InteractiveSource::Delegate,
            reply,
        })
        .await
    }

    /// Open a tunnel to `host:port` as seen from the server.
    ///
    /// The channel is returned right away; whether the open succeeded is
    /// reported through the delegate.
    pub async fn open_direct_channel<D: ChannelDelegate>(
        &self,
        host: impl Into<String>,
        port: u16,
        delegate: &Arc<D>,
    ) -> Result<DirectChannel> {
        let delegate = Arc::downgrade(delegate);
        let delegate: Weak<dyn ChannelDelegate> = delegate;
        let request = OpenRequest::DirectTcpip {
            host: host.into(),
            port,
            originator_address: "127.0.0.1".to_string(),
            originator_port: 0,
        };
        let channel = self
            .open_channel(request, DelegateRef::Channel(delegate), None)
            .await?;
        Ok(DirectChannel::new(channel))
    }

    /// Open an interactive shell on a pseudo-terminal.
    pub async fn open_shell_channel<D: ShellChannelDelegate>(
        &self,
        terminal_type: impl Into<String>,
        columns: u32,
        rows: u32,
        delegate: &Arc<D>,
    ) -> Result<ShellChannel> {
        let delegate = Arc::downgrade(delegate);
        let delegate: Weak<dyn ShellChannelDelegate> = delegate;
        let request = OpenRequest::Shell(PtyRequest {
            terminal_type: terminal_type.into(),
            columns,
            rows,
        });
        let channel = self
            .open_channel(request, DelegateRef::Shell(delegate), None)
            .await?;
        ShellChannel::from_channel(channel).ok_or_else(|| {
            Error::ChannelFailure("session returned a non-shell channel".to_string())
        })
    }

    /// Open the SFTP subsystem. Resolves once the channel is ready.
    pub async fn open_sftp(&self) -> Result<Sftp> {
        let (opened_tx, opened_rx) = oneshot::channel();
        let channel = self
            .open_channel(OpenRequest::Sftp, DelegateRef::None, Some(opened_tx))
            .await?;
        opened_rx.await.map_err(|_| command::stopped())??;
        Ok(Sftp::new(channel))
    }

    async fn open_channel(
        &self,
        request: OpenRequest,
        delegate: DelegateRef,
        opened: Option<command::Reply<()>>,
    ) -> Result<Channel> {
        command::request(&self.commands, |reply| Command::OpenChannel {
            request,
            delegate,
            reply,
            opened,
        })
        .await
    }

    /// Ask the server to listen on `address:port` and forward connections
    /// back as [`ForwardChannel`](crate::ForwardChannel)s. Port 0 lets the
    /// server choose.
    ///
    /// `completion` runs once on the notification task with the bound port.
    /// If the session is already gone the error is returned here instead.
    pub fn request_bind_to_address<F>(
        &self,
        address: impl Into<String>,
        port: u16,
        completion: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<u16>) + Send + 'static,
    {
        command::post(
            &self.commands,
            Command::BindRemote {
                address: address.into(),
                port,
                completion: Box::new(completion),
            },
        )
    }

    /// Run `f` on the session task, after every command sent before it.
    pub async fn dispatch<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        command::post(
            &self.commands,
            Command::Dispatch(Box::new(move || {
                let _ = tx.send(f());
            })),
        )?;
        rx.await.map_err(|_| command::stopped())
    }

    /// Like [`dispatch`](Self::dispatch) without waiting for the result.
    pub fn dispatch_detached<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        command::post(&self.commands, Command::Dispatch(Box::new(f)))
    }

    /// Close every channel, disconnect, and wait until the resulting
    /// notifications have been delivered. Calling it again does nothing.
    pub async fn disconnect(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if command::post(&self.commands, Command::Disconnect { done: Some(done_tx) }).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Start disconnecting without waiting.
    pub fn disconnect_async(&self) {
        let _ = command::post(&self.commands, Command::Disconnect { done: None });
    }

    /// Channels currently owned by the session, in creation order.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.info.borrow().channels.clone()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.info.borrow();
        f.debug_struct("Session")
            .field("host", &info.host)
            .field("port", &info.port)
            .field("stage", &info.stage)
            .finish()
    }
}
