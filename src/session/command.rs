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

//! Messages from public handles to the session actor.

use super::auth::{InteractiveHandler, PasswordHandler};
use crate::channel::{Channel, ChannelId, ShellChannel};
use crate::delegate::{ChannelDelegate, ShellChannelDelegate};
use crate::error::{Error, Result};
use crate::keys::{KeyPair, PassphraseHandler};
use crate::transport::{OpenRequest, SftpAttributes, SftpEntry, SftpHandle};
use std::path::PathBuf;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Completion of a remote forward request.
pub type ForwardCompletion = Box<dyn FnOnce(Result<u16>) + Send + 'static>;

/// Weak reference to whichever delegate a channel reports to.
#[derive(Clone, Default)]
pub(crate) enum DelegateRef {
    #[default]
    None,
    Channel(Weak<dyn ChannelDelegate>),
    Shell(Weak<dyn ShellChannelDelegate>),
}

impl DelegateRef {
    pub(crate) fn is_set(&self) -> bool {
        !matches!(self, DelegateRef::None)
    }
}

/// Where keyboard-interactive answers come from.
pub(crate) enum InteractiveSource {
    Handler(InteractiveHandler),
    Delegate,
}

pub(crate) enum Command {
    Connect {
        host: String,
        port: u16,
        username: String,
        timeout: Option<Duration>,
        reply: Reply<()>,
    },
    AuthPassword {
        handler: PasswordHandler,
        reply: Reply<()>,
    },
    AuthPrivateKey {
        path: PathBuf,
        passphrase: PassphraseHandler,
        reply: Reply<()>,
    },
    AuthKeyPair {
        key: KeyPair,
        reply: Reply<()>,
    },
    AuthInteractive {
        source: InteractiveSource,
        reply: Reply<()>,
    },
    OpenChannel {
        request: OpenRequest,
        delegate: DelegateRef,
        reply: Reply<Channel>,
        /// Resolved once the open handshake finishes.
        opened: Option<Reply<()>>,
    },
    BindRemote {
        address: String,
        port: u16,
        completion: ForwardCompletion,
    },
    SetDelegate {
        id: ChannelId,
        delegate: DelegateRef,
    },
    Write {
        id: ChannelId,
        data: Vec<u8>,
        reply: Reply<usize>,
    },
    Eof {
        id: ChannelId,
    },
    Close {
        id: ChannelId,
    },
    ResizePty {
        shell: ShellChannel,
        delegate: Weak<dyn ShellChannelDelegate>,
        columns: u32,
        rows: u32,
    },
    SftpStat {
        id: ChannelId,
        path: String,
        reply: Reply<SftpAttributes>,
    },
    SftpOpenDir {
        id: ChannelId,
        path: String,
        reply: Reply<SftpHandle>,
    },
    SftpReadDir {
        id: ChannelId,
        handle: SftpHandle,
        reply: Reply<Option<SftpEntry>>,
    },
    SftpCloseDir {
        id: ChannelId,
        handle: SftpHandle,
        reply: Reply<()>,
    },
    Dispatch(Box<dyn FnOnce() + Send + 'static>),
    Disconnect {
        done: Option<oneshot::Sender<()>>,
    },
}

pub(crate) fn stopped() -> Error {
    Error::Stop("session is no longer running".to_string())
}

/// Send a fire-and-forget command.
pub(crate) fn post(commands: &mpsc::UnboundedSender<Command>, command: Command) -> Result<()> {
    commands.send(command).map_err(|_| stopped())
}

/// Send a command through a weak sender.
pub(crate) fn post_weak(
    commands: &mpsc::WeakUnboundedSender<Command>,
    command: Command,
) -> Result<()> {
    let commands = commands.upgrade().ok_or_else(stopped)?;
    post(&commands, command)
}

/// Send a command and wait for its reply.
pub(crate) async fn request<T>(
    commands: &mpsc::UnboundedSender<Command>,
    make: impl FnOnce(Reply<T>) -> Command,
) -> Result<T> {
    let (tx, rx) = oneshot::channel();
    post(commands, make(tx))?;
    rx.await.map_err(|_| stopped())?
}

pub(crate) async fn request_weak<T>(
    commands: &mpsc::WeakUnboundedSender<Command>,
    make: impl FnOnce(Reply<T>) -> Command,
) -> Result<T> {
    let commands = commands.upgrade().ok_or_else(stopped)?;
    request(&commands, make).await
}
