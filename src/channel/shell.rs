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

use super::{Channel, ChannelKind, ChannelStage};
use crate::delegate::ShellChannelDelegate;
use crate::error::{Error, Result};
use crate::session::command::{self, Command, DelegateRef};
use std::ops::Deref;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PtySize {
    pub columns: u32,
    pub rows: u32,
}

/// Interactive shell running on a pseudo-terminal.
#[derive(Clone, Debug)]
pub struct ShellChannel {
    channel: Channel,
    pty: watch::Receiver<PtySize>,
}

impl ShellChannel {
    pub(crate) fn new(channel: Channel, pty: watch::Receiver<PtySize>) -> Self {
        Self { channel, pty }
    }

    /// Shell view of a channel opened with a PTY.
    pub(crate) fn from_channel(channel: Channel) -> Option<Self> {
        let pty = channel.pty_receiver()?;
        Some(Self::new(channel, pty))
    }

    pub fn terminal_type(&self) -> &str {
        match self.channel.kind() {
            ChannelKind::Shell { terminal_type } => terminal_type,
            _ => "",
        }
    }

    /// Last size acknowledged by the server.
    pub fn pty_size(&self) -> PtySize {
        *self.pty.borrow()
    }

    pub fn columns(&self) -> u32 {
        self.pty_size().columns
    }

    pub fn rows(&self) -> u32 {
        self.pty_size().rows
    }

    /// Ask the server to resize the terminal.
    ///
    /// The outcome is reported once through
    /// [`ShellChannelDelegate::did_change_pty_size`]; the size returned by
    /// [`pty_size`](Self::pty_size) changes only after the server accepts.
    pub fn change_pty_size(&self, columns: u32, rows: u32) -> Result<()> {
        if self.channel.stage() == ChannelStage::Closed {
            return Err(Error::ChannelFailure(format!(
                "cannot resize the PTY of closed channel {}",
                self.channel.id()
            )));
        }
        let delegate = self.channel.shell_delegate().ok_or_else(|| {
            Error::ChannelFailure(format!(
                "channel {} has no shell delegate",
                self.channel.id()
            ))
        })?;
        command::post_weak(
            self.channel.weak_session().commands(),
            Command::ResizePty {
                shell: self.clone(),
                delegate,
                columns,
                rows,
            },
        )
    }

    /// Replace the delegate receiving this shell's events.
    pub fn set_shell_delegate<D: ShellChannelDelegate>(&self, delegate: &Arc<D>) -> Result<()> {
        let delegate = Arc::downgrade(delegate);
        let delegate: Weak<dyn ShellChannelDelegate> = delegate;
        self.channel.replace_shell_delegate(delegate.clone());
        self.channel.set_delegate_ref(DelegateRef::Shell(delegate))
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

impl PartialEq for ShellChannel {
    fn eq(&self, other: &Self) -> bool {
        self.channel == other.channel
    }
}

impl Eq for ShellChannel {}

impl Deref for ShellChannel {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}
