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

//! Delivery of delegate callbacks.
//!
//! The session task never calls a delegate directly. It queues a
//! [`Notification`] and a separate worker task invokes the callbacks in
//! queue order, so slow delegates only delay other callbacks.

use super::command::{DelegateRef, ForwardCompletion};
use super::{Session, WeakSession};
use crate::channel::{Channel, ForwardChannel, ShellChannel};
use crate::delegate::{ChannelDelegate, SessionDelegate, ShellChannelDelegate};
use crate::error::{Error, Result};
use crate::transport::HostKey;
use std::sync::Weak;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Channel events in delivery order.
#[derive(Debug, Clone)]
pub(crate) enum ChannelEvent {
    Opened,
    OpenFailed(Error),
    Data(Vec<u8>),
    Wrote(usize),
    Eof,
    Closed(Option<Error>),
}

pub(crate) enum Notification {
    Connected {
        host: String,
        port: u16,
    },
    Disconnected {
        error: Option<Error>,
    },
    NeedAuthenticate {
        username: String,
    },
    HostKey {
        key: HostKey,
        reply: oneshot::Sender<bool>,
    },
    InteractiveRequest {
        prompt: String,
        reply: oneshot::Sender<String>,
    },
    ForwardAccepted(ForwardChannel),
    ForwardBound {
        completion: ForwardCompletion,
        result: Result<u16>,
    },
    Channel {
        channel: Channel,
        delegate: DelegateRef,
        event: ChannelEvent,
    },
    PtyResized {
        channel: ShellChannel,
        delegate: Weak<dyn ShellChannelDelegate>,
        columns: u32,
        rows: u32,
        error: Option<Error>,
    },
    /// Acknowledged once everything queued before it has been delivered.
    Barrier(oneshot::Sender<()>),
}

/// Sending side of the notification queue, owned by the session task.
pub(crate) struct Notifier {
    tx: mpsc::Sender<Notification>,
}

impl Notifier {
    pub(crate) fn spawn(
        runtime: &Handle,
        delegate: Option<Weak<dyn SessionDelegate>>,
        session: WeakSession,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = NotificationWorker {
            delegate,
            session,
            rx,
        };
        runtime.spawn(worker.run());
        Self { tx }
    }

    pub(crate) async fn notify(&self, notification: Notification) {
        if self.tx.send(notification).await.is_err() {
            debug!("Notification worker has stopped; dropping notification");
        }
    }

    pub(crate) async fn channel(&self, channel: &Channel, delegate: &DelegateRef, event: ChannelEvent) {
        if !delegate.is_set() {
            return;
        }
        self.notify(Notification::Channel {
            channel: channel.clone(),
            delegate: delegate.clone(),
            event,
        })
        .await;
    }

    /// Ask the delegate about a host key. No delegate means rejection.
    pub(crate) async fn ask_host_key(&self, key: HostKey) -> bool {
        let (reply, rx) = oneshot::channel();
        self.notify(Notification::HostKey { key, reply }).await;
        rx.await.unwrap_or(false)
    }

    pub(crate) async fn ask_interactive(&self, prompt: String) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        self.notify(Notification::InteractiveRequest { prompt, reply })
            .await;
        rx.await.ok()
    }

    /// Wait until every notification queued so far has been delivered.
    pub(crate) async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.notify(Notification::Barrier(tx)).await;
        let _ = rx.await;
    }
}

struct NotificationWorker {
    delegate: Option<Weak<dyn SessionDelegate>>,
    session: WeakSession,
    rx: mpsc::Receiver<Notification>,
}

impl NotificationWorker {
    async fn run(mut self) {
        while let Some(notification) = self.rx.recv().await {
            self.deliver(notification);
        }
        trace!("Notification worker finished");
    }

    fn session(&self) -> Session {
        self.session
            .upgrade()
            .unwrap_or_else(|| self.session.detached())
    }

    fn delegate(&self) -> Option<std::sync::Arc<dyn SessionDelegate>> {
        self.delegate.as_ref().and_then(Weak::upgrade)
    }

    fn deliver(&self, notification: Notification) {
        match notification {
            Notification::Connected { host, port } => {
                if let Some(delegate) = self.delegate() {
                    delegate.did_connect(&self.session(), &host, port);
                }
            }
            Notification::Disconnected { error } => {
                if let Some(delegate) = self.delegate() {
                    delegate.did_disconnect(&self.session(), error.as_ref());
                }
            }
            Notification::NeedAuthenticate { username } => {
                if let Some(delegate) = self.delegate() {
                    delegate.need_authenticate_user(&self.session(), &username);
                }
            }
            Notification::HostKey { key, reply } => {
                let accepted = match self.delegate() {
                    Some(delegate) => delegate.should_connect_with_host_key(&self.session(), &key),
                    None => {
                        debug!("No session delegate to verify the host key; rejecting");
                        false
                    }
                };
                let _ = reply.send(accepted);
            }
            Notification::InteractiveRequest { prompt, reply } => match self.delegate() {
                Some(delegate) => {
                    let answer = delegate.keyboard_interactive_request(&self.session(), &prompt);
                    let _ = reply.send(answer);
                }
                // Dropping the reply leaves the prompt unanswered
                None => debug!("No session delegate to answer a keyboard-interactive prompt"),
            },
            Notification::ForwardAccepted(channel) => match self.delegate() {
                Some(delegate) => delegate.did_accept_forward_channel(&self.session(), channel),
                None => {
                    debug!(channel = %channel.id(), "No delegate for accepted forward; closing it");
                    let _ = channel.close();
                }
            },
            Notification::ForwardBound { completion, result } => completion(result),
            Notification::Channel {
                channel,
                delegate,
                event,
            } => match &delegate {
                DelegateRef::None => {}
                DelegateRef::Channel(weak) => {
                    if let Some(delegate) = weak.upgrade() {
                        deliver_channel_event(&*delegate, &channel, event);
                    }
                }
                DelegateRef::Shell(weak) => {
                    if let Some(delegate) = weak.upgrade() {
                        deliver_channel_event(&*delegate, &channel, event);
                    }
                }
            },
            Notification::PtyResized {
                channel,
                delegate,
                columns,
                rows,
                error,
            } => {
                if let Some(delegate) = delegate.upgrade() {
                    delegate.did_change_pty_size(&channel, columns, rows, error.as_ref());
                }
            }
            Notification::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}

fn deliver_channel_event<D>(delegate: &D, channel: &Channel, event: ChannelEvent)
where
    D: ChannelDelegate + ?Sized,
{
    match event {
        ChannelEvent::Opened => delegate.did_open(channel),
        ChannelEvent::OpenFailed(error) => delegate.did_open_with_error(channel, &error),
        ChannelEvent::Data(data) => delegate.did_read_data(channel, &data),
        ChannelEvent::Wrote(count) => delegate.did_write_data(channel, count),
        ChannelEvent::Eof => delegate.did_receive_eof(channel),
        ChannelEvent::Closed(error) => delegate.did_close(channel, error.as_ref()),
    }
}
