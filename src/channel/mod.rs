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

//! Logical channels multiplexed over a session.
//!
//! Channel handles are cheap to clone and can be used from any thread. Every
//! operation is forwarded to the owning session's task; a handle only keeps a
//! weak reference to that session.

mod direct;
mod forward;
mod shell;
pub(crate) mod state;

pub use direct::DirectChannel;
pub use forward::ForwardChannel;
pub use shell::{PtySize, ShellChannel};

use crate::delegate::{ChannelDelegate, ShellChannelDelegate};
use crate::error::{Error, Result};
use crate::session::command::{self, Command, DelegateRef};
use crate::session::{Session, WeakSession};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;

/// Largest chunk handed to the transport or to a delegate in one call.
pub const MAX_PAYLOAD: usize = 16384;

/// Session-unique channel identifier, assigned in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) u64);

impl ChannelId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel lifecycle. Stages only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ChannelStage {
    #[default]
    Initial,
    Opening,
    Ready,
    Closed,
}

/// What a channel carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Direct {
        host: String,
        port: u16,
    },
    Forward {
        connected_address: String,
        connected_port: u16,
        originator_address: String,
        originator_port: u16,
    },
    Shell {
        terminal_type: String,
    },
    Sftp,
}

struct ChannelShared {
    id: ChannelId,
    kind: ChannelKind,
    session: WeakSession,
    stage: watch::Receiver<ChannelStage>,
    pty: Option<watch::Receiver<PtySize>>,
    /// Shell channels only; PTY resize outcomes go here even after close.
    shell_delegate: Mutex<Option<Weak<dyn ShellChannelDelegate>>>,
}

/// Handle to one channel of a session.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        kind: ChannelKind,
        session: WeakSession,
        stage: watch::Receiver<ChannelStage>,
        pty: Option<watch::Receiver<PtySize>>,
        shell_delegate: Option<Weak<dyn ShellChannelDelegate>>,
    ) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                id,
                kind,
                session,
                stage,
                pty,
                shell_delegate: Mutex::new(shell_delegate),
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn kind(&self) -> &ChannelKind {
        &self.shared.kind
    }

    pub fn stage(&self) -> ChannelStage {
        *self.shared.stage.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.stage() == ChannelStage::Ready
    }

    /// The owning session, if it is still alive.
    pub fn session(&self) -> Option<Session> {
        self.shared.session.upgrade()
    }

    /// Queue `data` for sending. Returns the number of bytes accepted.
    ///
    /// Bytes beyond the peer's window are buffered up to the configured
    /// limit; a write that does not fit is rejected with `ChannelFailure`.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let id = self.id();
        let data = data.to_vec();
        command::request_weak(self.shared.session.commands(), |reply| Command::Write {
            id,
            data,
            reply,
        })
        .await
    }

    /// Send EOF once buffered data has been flushed. Reading continues.
    pub fn request_eof(&self) -> Result<()> {
        if self.stage() == ChannelStage::Closed {
            return Ok(());
        }
        command::post_weak(
            self.shared.session.commands(),
            Command::Eof { id: self.id() },
        )
    }

    /// Start closing the channel. Calling it again, or on a closed channel,
    /// does nothing.
    pub fn close(&self) -> Result<()> {
        if self.stage() == ChannelStage::Closed {
            return Ok(());
        }
        command::post_weak(
            self.shared.session.commands(),
            Command::Close { id: self.id() },
        )
    }

    /// Replace the delegate receiving this channel's events.
    ///
    /// Shell channels only take a [`ShellChannelDelegate`], through
    /// [`ShellChannel::set_shell_delegate`].
    pub fn set_delegate<D: ChannelDelegate>(&self, delegate: &Arc<D>) -> Result<()> {
        if matches!(self.kind(), ChannelKind::Shell { .. }) {
            return Err(Error::ChannelFailure(format!(
                "channel {} is a shell; use set_shell_delegate",
                self.id()
            )));
        }
        let delegate = Arc::downgrade(delegate);
        self.set_delegate_ref(DelegateRef::Channel(delegate))
    }

    pub(crate) fn set_delegate_ref(&self, delegate: DelegateRef) -> Result<()> {
        command::post_weak(
            self.shared.session.commands(),
            Command::SetDelegate {
                id: self.id(),
                delegate,
            },
        )
    }

    /// Wait until the channel reaches at least `stage`.
    pub async fn wait_for(&self, stage: ChannelStage) -> ChannelStage {
        let mut rx = self.shared.stage.clone();
        loop {
            let current = *rx.borrow_and_update();
            if current >= stage {
                return current;
            }
            if rx.changed().await.is_err() {
                // Session task is gone; its last published stage is final
                return *rx.borrow();
            }
        }
    }

    pub async fn closed(&self) {
        self.wait_for(ChannelStage::Closed).await;
    }

    pub(crate) fn pty_receiver(&self) -> Option<watch::Receiver<PtySize>> {
        self.shared.pty.clone()
    }

    pub(crate) fn shell_delegate(&self) -> Option<Weak<dyn ShellChannelDelegate>> {
        self.shared
            .shell_delegate
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
    }

    pub(crate) fn replace_shell_delegate(&self, delegate: Weak<dyn ShellChannelDelegate>) {
        if let Ok(mut slot) = self.shared.shell_delegate.lock() {
            *slot = Some(delegate);
        }
    }

    pub(crate) fn weak_session(&self) -> &WeakSession {
        &self.shared.session
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id() && Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("kind", self.kind())
            .field("stage", &self.stage())
            .finish()
    }
}
