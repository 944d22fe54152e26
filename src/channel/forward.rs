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

use super::{Channel, ChannelKind};
use std::ops::Deref;

/// Server-initiated channel carrying one connection to a remotely bound port.
///
/// Forward channels are handed out by
/// [`SessionDelegate::did_accept_forward_channel`](crate::SessionDelegate::did_accept_forward_channel)
/// already open. Data that arrives before a delegate is attached with
/// [`Channel::set_delegate`] is held and delivered once one is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardChannel {
    channel: Channel,
}

impl ForwardChannel {
    pub(crate) fn new(channel: Channel) -> Self {
        Self { channel }
    }

    fn fields(&self) -> (&str, u16, &str, u16) {
        match self.channel.kind() {
            ChannelKind::Forward {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => (
                connected_address,
                *connected_port,
                originator_address,
                *originator_port,
            ),
            _ => ("", 0, "", 0),
        }
    }

    /// Address the server accepted the connection on.
    pub fn connected_address(&self) -> &str {
        self.fields().0
    }

    pub fn connected_port(&self) -> u16 {
        self.fields().1
    }

    /// Address of the remote peer that connected.
    pub fn originator_address(&self) -> &str {
        self.fields().2
    }

    pub fn originator_port(&self) -> u16 {
        self.fields().3
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

impl Deref for ForwardChannel {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}
