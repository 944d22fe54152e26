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

mod common;

use common::{ready_session, wait_until, MockHandle};
use sshkit::sftp::ATTR_SIZE;
use sshkit::transport::{SftpAttributes, SftpEntry};
use sshkit::{ChannelKind, Error, ErrorCode, Session};
use std::time::{Duration, UNIX_EPOCH};

fn file_attrs(size: u64) -> SftpAttributes {
    SftpAttributes {
        size: Some(size),
        uid: Some(1000),
        gid: Some(100),
        permissions: Some(0o100644),
        atime: Some(1_700_000_100),
        mtime: Some(1_700_000_000),
    }
}

fn dir_attrs() -> SftpAttributes {
    SftpAttributes {
        size: Some(4096),
        uid: Some(0),
        gid: Some(0),
        permissions: Some(0o040755),
        atime: None,
        mtime: None,
    }
}

async fn sftp_session() -> (Session, MockHandle) {
    let (session, _delegate, mock) = ready_session().await;
    mock.with(|state| {
        state.files.insert("/data".to_string(), dir_attrs());
        state
            .files
            .insert("/data/report.csv".to_string(), file_attrs(2048));
        state.directories.insert(
            "/data".to_string(),
            vec![
                SftpEntry {
                    name: "report.csv".to_string(),
                    attributes: file_attrs(2048),
                },
                SftpEntry {
                    name: "logs".to_string(),
                    attributes: dir_attrs(),
                },
            ],
        );
    });
    (session, mock)
}

#[tokio::test]
async fn test_stat_file() {
    let (session, _mock) = sftp_session().await;
    let sftp = session.open_sftp().await.unwrap();
    assert_eq!(sftp.kind(), &ChannelKind::Sftp);

    let file = sftp.stat("/data/report.csv").await.unwrap();
    assert_eq!(file.filename(), "report.csv");
    assert_eq!(file.full_path(), "/data/report.csv");
    assert!(!file.is_directory());
    assert_eq!(file.file_size(), 2048);
    assert_eq!(file.owner_uid(), Some(1000));
    assert_eq!(file.owner_gid(), Some(100));
    assert_eq!(file.permissions(), "-rw-r--r--");
    assert_eq!(file.file_type_letter(), '-');
    assert_ne!(file.flags() & ATTR_SIZE, 0);
    assert_eq!(
        file.modification_date(),
        Some(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    );
    assert!(!file.is_open());
}

#[tokio::test]
async fn test_stat_missing_path() {
    let (session, _mock) = sftp_session().await;
    let sftp = session.open_sftp().await.unwrap();

    let err = sftp.stat("/nope").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ChannelFailure);
    assert!(sftp.is_open(), "a failed request leaves the subsystem usable");
}

#[tokio::test]
async fn test_read_directory_to_end() {
    let (session, mock) = sftp_session().await;
    let sftp = session.open_sftp().await.unwrap();

    let mut dir = sftp.open_directory("/data").await.unwrap();
    assert!(dir.is_directory());
    assert!(dir.is_open());
    assert_eq!(dir.permissions(), "drwxr-xr-x");

    let first = dir.read_directory().await.unwrap().unwrap();
    assert_eq!(first.filename(), "report.csv");
    assert_eq!(first.full_path(), "/data/report.csv");
    assert_eq!(first.file_size(), 2048);

    let second = dir.read_directory().await.unwrap().unwrap();
    assert_eq!(second.filename(), "logs");
    assert!(second.is_directory());
    assert_eq!(second.file_type_letter(), 'd');

    assert!(dir.read_directory().await.unwrap().is_none());
    assert!(dir.directory_eof());
    assert!(
        dir.read_directory().await.unwrap().is_none(),
        "the end of a listing is sticky"
    );
    assert_eq!(mock.called("sftp_read_dir"), 3);

    dir.close_directory().await.unwrap();
    dir.close_directory().await.unwrap();
    assert!(!dir.is_open());
    assert_eq!(mock.called("sftp_close_dir"), 1);
}

#[tokio::test]
async fn test_read_directory_on_plain_file() {
    let (session, _mock) = sftp_session().await;
    let sftp = session.open_sftp().await.unwrap();

    let mut file = sftp.stat("/data/report.csv").await.unwrap();
    let err = file.read_directory().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ChannelFailure);
}

#[tokio::test]
async fn test_read_after_close_fails() {
    let (session, _mock) = sftp_session().await;
    let sftp = session.open_sftp().await.unwrap();

    let mut dir = sftp.open_directory("/data").await.unwrap();
    dir.close_directory().await.unwrap();
    assert!(dir.read_directory().await.is_err());
}

#[tokio::test]
async fn test_dropping_open_directory_releases_handle() {
    let (session, mock) = sftp_session().await;
    let sftp = session.open_sftp().await.unwrap();

    let dir = sftp.open_directory("/data").await.unwrap();
    drop(dir);
    wait_until("handle released", || mock.called("sftp_close_dir") == 1).await;
}

#[tokio::test]
async fn test_open_sftp_refused() {
    let (session, mock) = sftp_session().await;
    mock.with(|state| state.open_error = Some(Error::request_denied("subsystem refused")));

    let err = session.open_sftp().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::RequestDenied);
    assert!(session.channel_ids().is_empty());
}

#[tokio::test]
async fn test_closed_sftp_rejects_requests() {
    let (session, _mock) = sftp_session().await;
    let sftp = session.open_sftp().await.unwrap();

    sftp.close().unwrap();
    sftp.closed().await;
    let err = sftp.stat("/data").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ChannelFailure);
}
