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

/// Client-initiated tunnel to a host reachable from the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectChannel {
    channel: Channel,
}

impl DirectChannel {
    pub(crate) fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Destination host as requested.
    pub fn host(&self) -> &str {
        match self.channel.kind() {
            ChannelKind::Direct { host, .. } => host,
            _ => "",
        }
    }

    pub fn port(&self) -> u16 {
        match self.channel.kind() {
            ChannelKind::Direct { port, .. } => *port,
            _ => 0,
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

impl Deref for DirectChannel {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}
