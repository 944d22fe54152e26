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

//! SFTP subsystem.
//!
//! [`Sftp`] is a channel running the `sftp` subsystem. Files and directories
//! are represented by [`SftpFile`] snapshots; a directory opened with
//! [`Sftp::open_directory`] also carries a server-side handle that yields its
//! entries one at a time.
//!
//! ```no_run
//! # async fn demo(session: sshkit::Session) -> sshkit::Result<()> {
//! let sftp = session.open_sftp().await?;
//! let mut dir = sftp.open_directory("/var/log").await?;
//! while let Some(entry) = dir.read_directory().await? {
//!     println!("{} {:>10} {}", entry.permissions(), entry.file_size(), entry.filename());
//! }
//! dir.close_directory().await?;
//! # Ok(())
//! # }
//! ```

mod file;

pub use file::{SftpFile, ATTR_ACMODTIME, ATTR_PERMISSIONS, ATTR_SIZE, ATTR_UIDGID};

use crate::channel::Channel;
use crate::error::Result;
use crate::session::command::{self, Command};
use crate::transport::SftpHandle;
use std::ops::Deref;

/// Channel running the SFTP subsystem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sftp {
    channel: Channel,
}

impl Sftp {
    pub(crate) fn new(channel: Channel) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Attributes of `path`, following symlinks.
    pub async fn stat(&self, path: &str) -> Result<SftpFile> {
        let id = self.channel.id();
        let owned = path.to_string();
        let attributes = command::request_weak(
            self.channel.weak_session().commands(),
            |reply| Command::SftpStat {
                id,
                path: owned,
                reply,
            },
        )
        .await?;
        Ok(SftpFile::from_attributes(
            self.clone(),
            file::file_name(path),
            path.to_string(),
            attributes,
        ))
    }

    /// Open a directory for listing.
    pub async fn open_directory(&self, path: &str) -> Result<SftpFile> {
        let mut directory = self.stat(path).await?;
        let id = self.channel.id();
        let owned = path.to_string();
        let handle = command::request_weak(
            self.channel.weak_session().commands(),
            |reply| Command::SftpOpenDir {
                id,
                path: owned,
                reply,
            },
        )
        .await?;
        directory.attach_directory(handle);
        Ok(directory)
    }

    pub(crate) async fn read_dir(
        &self,
        handle: SftpHandle,
    ) -> Result<Option<crate::transport::SftpEntry>> {
        let id = self.channel.id();
        command::request_weak(self.channel.weak_session().commands(), |reply| {
            Command::SftpReadDir { id, handle, reply }
        })
        .await
    }

    pub(crate) async fn close_dir(&self, handle: SftpHandle) -> Result<()> {
        let id = self.channel.id();
        command::request_weak(self.channel.weak_session().commands(), |reply| {
            Command::SftpCloseDir { id, handle, reply }
        })
        .await
    }

    /// Release a handle without waiting for the server.
    pub(crate) fn release_dir(&self, handle: SftpHandle) {
        let (reply, _) = tokio::sync::oneshot::channel();
        let _ = command::post_weak(
            self.channel.weak_session().commands(),
            Command::SftpCloseDir {
                id: self.channel.id(),
                handle,
                reply,
            },
        );
    }
}

impl Deref for Sftp {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}
