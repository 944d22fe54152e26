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

//! Per-channel lifecycle and buffering.
//!
//! `ChannelState` holds no I/O. The session actor feeds it transport events
//! and asks it what to send next, which keeps the lifecycle rules testable
//! without a connection.

use super::{ChannelStage, MAX_PAYLOAD};
use crate::error::{Error, Result};
use std::collections::VecDeque;

/// What to do after a local EOF or close request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShutdownAction {
    /// Nothing to send (already sent, or channel not open).
    None,
    /// Send now; the write buffer is empty.
    SendNow,
    /// Send once buffered bytes have been flushed.
    Deferred,
}

#[derive(Debug)]
pub(crate) struct ChannelState {
    stage: ChannelStage,
    outbound: VecDeque<u8>,
    outbound_limit: usize,
    inbound: VecDeque<u8>,
    eof_requested: bool,
    eof_sent: bool,
    remote_eof: bool,
    close_requested: bool,
    close_sent: bool,
}

impl ChannelState {
    pub(crate) fn new(outbound_limit: usize) -> Self {
        Self {
            stage: ChannelStage::Initial,
            outbound: VecDeque::new(),
            outbound_limit,
            inbound: VecDeque::new(),
            eof_requested: false,
            eof_sent: false,
            remote_eof: false,
            close_requested: false,
            close_sent: false,
        }
    }

    pub(crate) fn stage(&self) -> ChannelStage {
        self.stage
    }

    /// Move forward to `next`. Backward or repeated transitions are refused.
    pub(crate) fn advance(&mut self, next: ChannelStage) -> bool {
        if next > self.stage {
            self.stage = next;
            true
        } else {
            false
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.stage == ChannelStage::Closed
    }

    /// Queue outbound bytes, or reject them without queueing anything.
    ///
    /// `window` is what the transport can take right away. Only the part that
    /// would remain buffered after that counts against the buffer limit.
    pub(crate) fn enqueue_write(&mut self, data: &[u8], window: usize) -> Result<usize> {
        if self.stage != ChannelStage::Ready {
            return Err(Error::ChannelFailure(format!(
                "cannot write to a channel in stage {:?}",
                self.stage
            )));
        }
        if self.eof_requested || self.close_requested {
            return Err(Error::ChannelFailure(
                "cannot write after EOF or close was requested".to_string(),
            ));
        }
        if self.outbound.len() + data.len() > self.outbound_limit.saturating_add(window) {
            return Err(Error::ChannelFailure(format!(
                "write buffer full ({} of {} bytes pending)",
                self.outbound.len(),
                self.outbound_limit
            )));
        }
        self.outbound.extend(data);
        Ok(data.len())
    }

    pub(crate) fn pending_write(&self) -> usize {
        self.outbound.len()
    }

    /// Next segment to hand to the transport, bounded by `window` and `MAX_PAYLOAD`.
    pub(crate) fn peek_segment(&self, window: usize) -> Option<Vec<u8>> {
        let len = self.outbound.len().min(window).min(MAX_PAYLOAD);
        if len == 0 || self.stage != ChannelStage::Ready {
            return None;
        }
        Some(self.outbound.iter().take(len).copied().collect())
    }

    /// Drop `count` bytes the transport accepted.
    pub(crate) fn consume(&mut self, count: usize) {
        let count = count.min(self.outbound.len());
        self.outbound.drain(..count);
    }

    pub(crate) fn request_eof(&mut self) -> ShutdownAction {
        if self.stage != ChannelStage::Ready || self.eof_requested {
            return ShutdownAction::None;
        }
        self.eof_requested = true;
        if self.outbound.is_empty() {
            ShutdownAction::SendNow
        } else {
            ShutdownAction::Deferred
        }
    }

    pub(crate) fn request_close(&mut self) -> ShutdownAction {
        if self.stage != ChannelStage::Ready || self.close_requested {
            return ShutdownAction::None;
        }
        self.close_requested = true;
        if self.outbound.is_empty() {
            ShutdownAction::SendNow
        } else {
            ShutdownAction::Deferred
        }
    }

    /// A deferred EOF whose buffered bytes have now been flushed.
    pub(crate) fn take_deferred_eof(&mut self) -> bool {
        if self.eof_requested && !self.eof_sent && self.outbound.is_empty() {
            self.eof_sent = true;
            true
        } else {
            false
        }
    }

    /// A deferred close whose buffered bytes have now been flushed.
    pub(crate) fn take_deferred_close(&mut self) -> bool {
        if self.close_requested && !self.close_sent && self.outbound.is_empty() {
            self.close_sent = true;
            true
        } else {
            false
        }
    }

    pub(crate) fn mark_eof_sent(&mut self) {
        self.eof_requested = true;
        self.eof_sent = true;
    }

    pub(crate) fn mark_close_sent(&mut self) {
        self.close_requested = true;
        self.close_sent = true;
    }

    /// Record the peer's EOF. Returns true the first time.
    pub(crate) fn on_remote_eof(&mut self) -> bool {
        !std::mem::replace(&mut self.remote_eof, true)
    }

    pub(crate) fn remote_eof(&self) -> bool {
        self.remote_eof
    }

    /// Both directions have ended and no close has been requested yet.
    pub(crate) fn should_close_after_eof(&self) -> bool {
        self.eof_sent && self.remote_eof && !self.close_requested
    }

    pub(crate) fn push_inbound(&mut self, data: &[u8]) {
        self.inbound.extend(data);
    }

    pub(crate) fn pending_read(&self) -> usize {
        self.inbound.len()
    }

    /// Next chunk of inbound data, at most `MAX_PAYLOAD` bytes.
    pub(crate) fn take_inbound(&mut self) -> Option<Vec<u8>> {
        if self.inbound.is_empty() {
            return None;
        }
        let len = self.inbound.len().min(MAX_PAYLOAD);
        Some(self.inbound.drain(..len).collect())
    }

    /// Enter `Closed`, returning how many buffered outbound bytes were dropped.
    ///
    /// Returns `None` if the channel was already closed.
    pub(crate) fn finish(&mut self) -> Option<usize> {
        if self.is_closed() {
            return None;
        }
        self.stage = ChannelStage::Closed;
        let dropped = self.outbound.len();
        self.outbound.clear();
        Some(dropped)
    }
}
