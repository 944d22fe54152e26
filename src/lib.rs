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

//! Asynchronous SSH client sessions.
//!
//! A [`Session`] connects to a server, verifies its host key through a
//! [`SessionDelegate`], authenticates, and multiplexes channels: TCP tunnels
//! ([`DirectChannel`]), server-initiated forwards ([`ForwardChannel`]),
//! interactive shells ([`ShellChannel`]) and the SFTP subsystem ([`Sftp`]).
//! Channel events are reported through [`ChannelDelegate`] callbacks, in
//! order, on a dedicated notification task.

pub mod channel;
pub mod cli;
pub mod config;
pub mod delegate;
pub mod error;
pub mod keys;
pub mod session;
pub mod sftp;
pub mod transport;
pub mod utils;

pub use channel::{
    Channel, ChannelId, ChannelKind, ChannelStage, DirectChannel, ForwardChannel, PtySize,
    ShellChannel, MAX_PAYLOAD,
};
pub use config::{ProxyConfig, ProxyType, SessionConfig};
pub use delegate::{ChannelDelegate, SessionDelegate, ShellChannelDelegate};
pub use error::{Error, ErrorCode, ErrorDomain, Result};
pub use keys::{KeyPair, KeyType};
pub use session::{
    AuthMethods, Session, SessionBuilder, SessionInfo, SessionStage, WeakSession,
};
pub use sftp::{Sftp, SftpFile};
pub use transport::{HostKey, InteractivePrompt};
