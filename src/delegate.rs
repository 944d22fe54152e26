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

//! Observer traits for session and channel events.
//!
//! All callbacks run on the session's notification task, one at a time and in
//! the order the events happened. Sessions and channels only keep weak
//! references to their delegates; a delegate that has been dropped simply
//! stops receiving events.
//!
//! Callbacks may call back into the public API. Fire-and-forget operations
//! (`close`, `request_eof`, `set_delegate`, `change_pty_size`, ...) can be
//! called directly; awaiting a request/response operation from inside a
//! callback must be done on a spawned task.

use crate::channel::{Channel, ForwardChannel, ShellChannel};
use crate::error::Error;
use crate::session::Session;
use crate::transport::HostKey;

/// Session-level events.
pub trait SessionDelegate: Send + Sync + 'static {
    /// Decide whether to trust the server's host key. Called once per
    /// connection attempt; the handshake waits for the answer.
    fn should_connect_with_host_key(&self, session: &Session, host_key: &HostKey) -> bool;

    fn did_connect(&self, _session: &Session, _host: &str, _port: u16) {}

    /// The session ended. `error` is set when the transport failed while the
    /// session was running.
    fn did_disconnect(&self, _session: &Session, _error: Option<&Error>) {}

    /// The transport is up and the server wants the user authenticated.
    fn need_authenticate_user(&self, _session: &Session, _username: &str) {}

    /// The server opened a channel for a remote forward bound earlier.
    fn did_accept_forward_channel(&self, _session: &Session, _channel: ForwardChannel) {}

    /// Answer one keyboard-interactive prompt.
    fn keyboard_interactive_request(&self, _session: &Session, _prompt: &str) -> String {
        String::new()
    }
}

/// Channel-level events.
pub trait ChannelDelegate: Send + Sync + 'static {
    fn did_open(&self, _channel: &Channel) {}

    fn did_open_with_error(&self, _channel: &Channel, _error: &Error) {}

    fn did_read_data(&self, _channel: &Channel, _data: &[u8]) {}

    /// `written` bytes were handed to the transport.
    fn did_write_data(&self, _channel: &Channel, _written: usize) {}

    fn did_receive_eof(&self, _channel: &Channel) {}

    /// The channel reached `Closed`. `error` is set when the close was forced
    /// by a failure or dropped buffered data.
    fn did_close(&self, _channel: &Channel, _error: Option<&Error>) {}
}

/// Shell channel events.
pub trait ShellChannelDelegate: ChannelDelegate {
    /// Outcome of one `change_pty_size` call.
    fn did_change_pty_size(
        &self,
        _channel: &ShellChannel,
        _columns: u32,
        _rows: u32,
        _error: Option<&Error>,
    ) {
    }
}
