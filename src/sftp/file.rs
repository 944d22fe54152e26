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

use super::Sftp;
use crate::error::{Error, Result};
use crate::transport::{SftpAttributes, SftpHandle};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// SFTP attribute flags (draft-ietf-secsh-filexfer-02).
pub const ATTR_SIZE: u32 = 0x0000_0001;
pub const ATTR_UIDGID: u32 = 0x0000_0002;
pub const ATTR_PERMISSIONS: u32 = 0x0000_0004;
pub const ATTR_ACMODTIME: u32 = 0x0000_0008;

const S_IFMT: u32 = 0o170000;
const S_IFSOCK: u32 = 0o140000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;
const S_IFBLK: u32 = 0o060000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;

/// A remote file or directory.
///
/// Attributes are a snapshot taken when the entity was created. Directories
/// returned by [`Sftp::open_directory`] also hold an open handle; entries are
/// read forward-only with [`read_directory`](Self::read_directory).
pub struct SftpFile {
    sftp: Sftp,
    filename: String,
    full_path: String,
    attributes: SftpAttributes,
    handle: Option<SftpHandle>,
    directory_eof: bool,
}

impl SftpFile {
    pub(crate) fn from_attributes(
        sftp: Sftp,
        filename: String,
        full_path: String,
        attributes: SftpAttributes,
    ) -> Self {
        Self {
            sftp,
            filename,
            full_path,
            attributes,
            handle: None,
            directory_eof: false,
        }
    }

    pub(crate) fn attach_directory(&mut self, handle: SftpHandle) {
        self.handle = Some(handle);
        self.directory_eof = false;
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn full_path(&self) -> &str {
        &self.full_path
    }

    pub fn is_directory(&self) -> bool {
        match self.attributes.permissions {
            Some(mode) => mode & S_IFMT == S_IFDIR,
            None => self.handle.is_some(),
        }
    }

    pub fn file_size(&self) -> u64 {
        self.attributes.size.unwrap_or(0)
    }

    pub fn owner_uid(&self) -> Option<u32> {
        self.attributes.uid
    }

    pub fn owner_gid(&self) -> Option<u32> {
        self.attributes.gid
    }

    /// Raw mode bits, including the file type.
    pub fn permission_bits(&self) -> Option<u32> {
        self.attributes.permissions
    }

    pub fn modification_date(&self) -> Option<SystemTime> {
        self.attributes.mtime.map(unix_time)
    }

    pub fn last_access(&self) -> Option<SystemTime> {
        self.attributes.atime.map(unix_time)
    }

    /// Which attributes the server reported, as `ATTR_*` flags.
    pub fn flags(&self) -> u32 {
        let attrs = &self.attributes;
        let mut flags = 0;
        if attrs.size.is_some() {
            flags |= ATTR_SIZE;
        }
        if attrs.uid.is_some() || attrs.gid.is_some() {
            flags |= ATTR_UIDGID;
        }
        if attrs.permissions.is_some() {
            flags |= ATTR_PERMISSIONS;
        }
        if attrs.atime.is_some() || attrs.mtime.is_some() {
            flags |= ATTR_ACMODTIME;
        }
        flags
    }

    /// `ls -l` style type letter: `d`, `-`, `l`, `c`, `b`, `p`, `s` or `?`.
    pub fn file_type_letter(&self) -> char {
        match self.attributes.permissions {
            Some(mode) => type_letter(mode),
            None if self.is_directory() => 'd',
            None => '?',
        }
    }

    /// `ls -l` style permission string such as `drwxr-xr-x`.
    pub fn permissions(&self) -> String {
        match self.attributes.permissions {
            Some(mode) => permission_string(mode),
            None => format!("{}?????????", self.file_type_letter()),
        }
    }

    /// The SFTP channel this entity belongs to.
    pub fn sftp(&self) -> &Sftp {
        &self.sftp
    }

    /// True once the listing has been read to the end.
    pub fn directory_eof(&self) -> bool {
        self.directory_eof
    }

    /// Whether a directory handle is held.
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Next directory entry, or `None` once the end has been reached.
    ///
    /// The listing cannot be restarted; after the end every call returns
    /// `Ok(None)`.
    pub async fn read_directory(&mut self) -> Result<Option<SftpFile>> {
        if self.directory_eof {
            return Ok(None);
        }
        let handle = match self.handle {
            Some(handle) => handle,
            None if self.is_directory() => {
                return Err(Error::ChannelFailure(format!(
                    "directory {} is not open",
                    self.full_path
                )))
            }
            None => {
                return Err(Error::ChannelFailure(format!(
                    "{} is not a directory",
                    self.full_path
                )))
            }
        };

        match self.sftp.read_dir(handle).await? {
            Some(entry) => {
                let full_path = join_path(&self.full_path, &entry.name);
                Ok(Some(SftpFile::from_attributes(
                    self.sftp.clone(),
                    entry.name,
                    full_path,
                    entry.attributes,
                )))
            }
            None => {
                self.directory_eof = true;
                Ok(None)
            }
        }
    }

    /// Release the directory handle. Does nothing if it is not open.
    pub async fn close_directory(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self.sftp.close_dir(handle).await,
            None => Ok(()),
        }
    }
}

impl Drop for SftpFile {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.sftp.release_dir(handle);
        }
    }
}

impl fmt::Debug for SftpFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpFile")
            .field("full_path", &self.full_path)
            .field("permissions", &self.permissions())
            .field("size", &self.attributes.size)
            .field("open", &self.handle.is_some())
            .field("directory_eof", &self.directory_eof)
            .finish()
    }
}

fn unix_time(seconds: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(u64::from(seconds))
}

pub(crate) fn file_name(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return if path.is_empty() { String::new() } else { "/".to_string() };
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed).to_string()
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn type_letter(mode: u32) -> char {
    match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFREG => '-',
        S_IFLNK => 'l',
        S_IFCHR => 'c',
        S_IFBLK => 'b',
        S_IFIFO => 'p',
        S_IFSOCK => 's',
        _ => '?',
    }
}

fn permission_string(mode: u32) -> String {
    let mut out = String::with_capacity(10);
    out.push(type_letter(mode));

    // (read, write, execute, special bit, special letter)
    let triplets = [
        (0o400, 0o200, 0o100, 0o4000, 's'),
        (0o040, 0o020, 0o010, 0o2000, 's'),
        (0o004, 0o002, 0o001, 0o1000, 't'),
    ];
    for (read, write, exec, special, letter) in triplets {
        out.push(if mode & read != 0 { 'r' } else { '-' });
        out.push(if mode & write != 0 { 'w' } else { '-' });
        out.push(match (mode & exec != 0, mode & special != 0) {
            (true, true) => letter,
            (false, true) => letter.to_ascii_uppercase(),
            (true, false) => 'x',
            (false, false) => '-',
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_string() {
        assert_eq!(permission_string(0o040755), "drwxr-xr-x");
        assert_eq!(permission_string(0o100644), "-rw-r--r--");
        assert_eq!(permission_string(0o120777), "lrwxrwxrwx");
        assert_eq!(permission_string(0o104755), "-rwsr-xr-x");
        assert_eq!(permission_string(0o102644), "-rw-r-Sr--");
        assert_eq!(permission_string(0o041777), "drwxrwxrwt");
        assert_eq!(permission_string(0o041776), "drwxrwxrwT");
        assert_eq!(permission_string(0o000000), "?---------");
    }

    #[test]
    fn test_type_letters() {
        assert_eq!(type_letter(0o020620), 'c');
        assert_eq!(type_letter(0o060660), 'b');
        assert_eq!(type_letter(0o010600), 'p');
        assert_eq!(type_letter(0o140755), 's');
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("/var/log/syslog"), "syslog");
        assert_eq!(file_name("/var/log/"), "log");
        assert_eq!(file_name("/"), "/");
        assert_eq!(file_name("relative"), "relative");
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/var", "log"), "/var/log");
        assert_eq!(join_path("/", "etc"), "/etc");
        assert_eq!(join_path("", "x"), "x");
    }
}
