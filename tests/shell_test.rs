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

use common::{ready_session, wait_until, Recorded, RecordingChannel};
use sshkit::transport::TransportEvent;
use sshkit::{ChannelStage, Error, ErrorCode, PtySize};

#[tokio::test]
async fn test_open_shell_with_pty() {
    let (session, _delegate, mock) = ready_session().await;
    let recorder = RecordingChannel::new();

    let shell = session
        .open_shell_channel("xterm-256color", 80, 24, &recorder)
        .await
        .unwrap();
    shell.wait_for(ChannelStage::Ready).await;

    assert_eq!(shell.terminal_type(), "xterm-256color");
    assert_eq!(shell.pty_size(), PtySize { columns: 80, rows: 24 });
    assert_eq!(mock.called("channel_open shell xterm-256color 80x24"), 1);
    wait_until("did_open", || recorder.events() == vec![Recorded::Open]).await;
}

#[tokio::test]
async fn test_resize_updates_size_after_ack() {
    let (session, _delegate, mock) = ready_session().await;
    let recorder = RecordingChannel::new();
    let shell = session
        .open_shell_channel("vt100", 80, 24, &recorder)
        .await
        .unwrap();
    shell.wait_for(ChannelStage::Ready).await;

    shell.change_pty_size(120, 40).unwrap();
    wait_until("did_change_pty_size", || {
        recorder.events().contains(&Recorded::PtySize(120, 40, None))
    })
    .await;
    assert_eq!(shell.columns(), 120);
    assert_eq!(shell.rows(), 40);
    assert_eq!(mock.called("pty_resize"), 1);
}

#[tokio::test]
async fn test_refused_resize_keeps_previous_size() {
    let (session, _delegate, mock) = ready_session().await;
    let recorder = RecordingChannel::new();
    let shell = session
        .open_shell_channel("vt100", 80, 24, &recorder)
        .await
        .unwrap();
    shell.wait_for(ChannelStage::Ready).await;
    mock.with(|state| state.resize_error = Some(Error::request_denied("window-change refused")));

    shell.change_pty_size(100, 30).unwrap();
    wait_until("did_change_pty_size", || {
        recorder
            .events()
            .iter()
            .any(|e| matches!(e, Recorded::PtySize(..)))
    })
    .await;
    assert_eq!(
        recorder.events().last(),
        Some(&Recorded::PtySize(100, 30, Some(ErrorCode::RequestDenied)))
    );
    assert_eq!(shell.pty_size(), PtySize { columns: 80, rows: 24 });
    assert!(shell.is_open(), "a refused resize does not close the shell");
}

#[tokio::test]
async fn test_resize_closed_shell_fails() {
    let (session, _delegate, _mock) = ready_session().await;
    let recorder = RecordingChannel::new();
    let shell = session
        .open_shell_channel("vt100", 80, 24, &recorder)
        .await
        .unwrap();
    shell.wait_for(ChannelStage::Ready).await;

    shell.close().unwrap();
    shell.closed().await;
    let err = shell.change_pty_size(100, 30).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ChannelFailure);
}

#[tokio::test]
async fn test_shell_delegate_can_be_replaced() {
    let (session, _delegate, mock) = ready_session().await;
    let first = RecordingChannel::new();
    let second = RecordingChannel::new();
    let shell = session
        .open_shell_channel("vt100", 80, 24, &first)
        .await
        .unwrap();
    shell.wait_for(ChannelStage::Ready).await;

    shell.set_shell_delegate(&second).unwrap();
    mock.push_event(TransportEvent::Data {
        channel: mock.last_channel(),
        data: b"$ ".to_vec(),
    });
    wait_until("prompt", || !second.received().is_empty()).await;
    shell.change_pty_size(132, 43).unwrap();

    wait_until("second delegate", || second.events().len() == 2).await;
    assert_eq!(
        second.events(),
        vec![
            Recorded::Data(b"$ ".to_vec()),
            Recorded::PtySize(132, 43, None)
        ]
    );
    assert!(first.received().is_empty());
}

#[tokio::test]
async fn test_shell_rejects_plain_channel_delegate() {
    let (session, _delegate, _mock) = ready_session().await;
    let shell_delegate = RecordingChannel::new();
    let other = RecordingChannel::new();
    let shell = session
        .open_shell_channel("vt100", 80, 24, &shell_delegate)
        .await
        .unwrap();
    shell.wait_for(ChannelStage::Ready).await;

    let err = shell.set_delegate(&other).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ChannelFailure);

    shell.change_pty_size(100, 30).unwrap();
    wait_until("did_change_pty_size", || {
        shell_delegate
            .events()
            .contains(&Recorded::PtySize(100, 30, None))
    })
    .await;
    assert_eq!(shell.columns(), 100);
    assert!(other.events().is_empty());
}

fn pty_reports(recorder: &RecordingChannel) -> Vec<Recorded> {
    recorder
        .events()
        .into_iter()
        .filter(|e| matches!(e, Recorded::PtySize(..)))
        .collect()
}

#[tokio::test]
async fn test_resize_reported_when_channel_closes_first() {
    let (session, _delegate, mock) = ready_session().await;
    let recorder = RecordingChannel::new();
    let shell = session
        .open_shell_channel("vt100", 80, 24, &recorder)
        .await
        .unwrap();
    shell.wait_for(ChannelStage::Ready).await;
    mock.with(|state| state.write_error = Some(Error::ChannelFailure("broken pipe".into())));

    // Queue a failing write, then the resize, before the session runs either
    let write = shell.write(b"doomed");
    tokio::pin!(write);
    tokio::select! {
        biased;
        _ = &mut write => panic!("write completed before the session task ran"),
        _ = std::future::ready(()) => {}
    }
    shell.change_pty_size(100, 30).unwrap();
    write.await.unwrap();

    wait_until("did_change_pty_size", || !pty_reports(&recorder).is_empty()).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(
        pty_reports(&recorder),
        vec![Recorded::PtySize(100, 30, Some(ErrorCode::ChannelFailure))]
    );
    assert_eq!(mock.called("pty_resize"), 0);
    assert_eq!(shell.pty_size(), PtySize { columns: 80, rows: 24 });
}

#[tokio::test]
async fn test_resize_queued_behind_disconnect_is_reported() {
    let (session, _delegate, _mock) = ready_session().await;
    let recorder = RecordingChannel::new();
    let shell = session
        .open_shell_channel("vt100", 80, 24, &recorder)
        .await
        .unwrap();
    shell.wait_for(ChannelStage::Ready).await;

    session.disconnect_async();
    shell.change_pty_size(100, 30).unwrap();

    wait_until("did_change_pty_size", || !pty_reports(&recorder).is_empty()).await;
    assert_eq!(
        pty_reports(&recorder),
        vec![Recorded::PtySize(100, 30, Some(ErrorCode::Stop))]
    );
    assert_eq!(recorder.closes(), 1);
}
