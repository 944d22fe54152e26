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

//! Scripted transport and recording delegates for session tests.

#![allow(dead_code)]

use async_trait::async_trait;
use sshkit::transport::{
    AuthOutcome, Banners, ConnectTarget, InteractivePrompt, InteractiveStep, OpenRequest,
    SftpAttributes, SftpEntry, SftpHandle, Transport, TransportChannel, TransportEvent,
};
use sshkit::{
    AuthMethods, Channel, ChannelDelegate, Error, ErrorCode, ForwardChannel, HostKey, KeyPair,
    Result, Session, SessionConfig, SessionDelegate, ShellChannel, ShellChannelDelegate,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const PASSWORD: &str = "secret";
pub const USER: &str = "alice";
pub const SERVER_BANNER: &str = "SSH-2.0-OpenSSH_9.6";

/// Everything the scripted server does and everything the engine asked of it.
pub struct MockState {
    pub calls: Vec<String>,
    pub events: VecDeque<TransportEvent>,

    pub connect_error: Option<Error>,
    pub connect_delay: Option<Duration>,
    pub host_key: HostKey,
    pub issue_banner: Option<String>,

    pub none_outcome: AuthOutcome,
    pub password: String,
    pub password_error: Option<Error>,
    pub password_partial: Option<AuthMethods>,
    pub accepted_key: Option<String>,
    pub interactive_rounds: VecDeque<InteractivePrompt>,
    pub interactive_answers: Vec<Vec<String>>,
    pub expected_answers: Option<Vec<String>>,

    pub open_error: Option<Error>,
    pub window: usize,
    pub write_error: Option<Error>,
    pub written: HashMap<TransportChannel, Vec<u8>>,
    pub eofs: Vec<TransportChannel>,
    pub closes: Vec<TransportChannel>,
    pub closed: HashSet<TransportChannel>,
    pub resize_error: Option<Error>,
    pub resizes: Vec<(TransportChannel, u32, u32)>,

    pub forward_port: u16,
    pub forward_error: Option<Error>,

    pub files: HashMap<String, SftpAttributes>,
    pub directories: HashMap<String, Vec<SftpEntry>>,
    pub open_dirs: HashMap<SftpHandle, VecDeque<SftpEntry>>,
    pub closed_dirs: Vec<SftpHandle>,

    pub next_channel: u32,
    pub next_handle: u64,
    pub disconnects: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            events: VecDeque::new(),
            connect_error: None,
            connect_delay: None,
            host_key: HostKey {
                algorithm: "ssh-ed25519".to_string(),
                fingerprint: "SHA256:mock".to_string(),
                openssh: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAImock".to_string(),
            },
            issue_banner: None,
            none_outcome: AuthOutcome::Failure {
                methods: AuthMethods::PASSWORD | AuthMethods::PUBLIC_KEY,
                partial_success: false,
            },
            password: PASSWORD.to_string(),
            password_error: None,
            password_partial: None,
            accepted_key: None,
            interactive_rounds: VecDeque::new(),
            interactive_answers: Vec::new(),
            expected_answers: None,
            open_error: None,
            window: usize::MAX,
            write_error: None,
            written: HashMap::new(),
            eofs: Vec::new(),
            closes: Vec::new(),
            closed: HashSet::new(),
            resize_error: None,
            resizes: Vec::new(),
            forward_port: 0,
            forward_error: None,
            files: HashMap::new(),
            directories: HashMap::new(),
            open_dirs: HashMap::new(),
            closed_dirs: Vec::new(),
            next_channel: 100,
            next_handle: 1,
            disconnects: 0,
        }
    }
}

/// Test-side handle onto a [`MockTransport`].
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
    wake: Arc<Notify>,
}

impl MockHandle {
    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Deliver an event as if the server had sent it.
    pub fn push_event(&self, event: TransportEvent) {
        self.with(|state| state.events.push_back(event));
        self.wake.notify_one();
    }

    /// Grow the send window of every channel and tell the engine.
    pub fn open_window(&self, channel: TransportChannel, window: usize) {
        self.with(|state| state.window = window);
        self.push_event(TransportEvent::WindowAdjusted { channel });
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|state| state.calls.clone())
    }

    pub fn called(&self, prefix: &str) -> usize {
        self.with(|state| state.calls.iter().filter(|c| c.starts_with(prefix)).count())
    }

    pub fn written(&self, channel: TransportChannel) -> Vec<u8> {
        self.with(|state| state.written.get(&channel).cloned().unwrap_or_default())
    }

    /// Transport id of the most recently opened channel.
    pub fn last_channel(&self) -> TransportChannel {
        self.with(|state| TransportChannel(state.next_channel - 1))
    }
}

pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    wake: Arc<Notify>,
}

impl MockTransport {
    pub fn new() -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let wake = Arc::new(Notify::new());
        let handle = MockHandle {
            state: state.clone(),
            wake: wake.clone(),
        };
        (Self { state, wake }, handle)
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    fn record(&self, call: String) {
        self.with(|state| state.calls.push(call));
    }

    fn push_event(&self, event: TransportEvent) {
        self.with(|state| state.events.push_back(event));
        self.wake.notify_one();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, target: &ConnectTarget) -> Result<IpAddr> {
        self.record(format!("connect {}:{}", target.host, target.port));
        if let Some(delay) = self.with(|state| state.connect_delay) {
            tokio::time::sleep(delay).await;
        }
        match self.with(|state| state.connect_error.take()) {
            Some(err) => Err(err),
            None => Ok(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10))),
        }
    }

    async fn handshake(&mut self) -> Result<HostKey> {
        self.record("handshake".to_string());
        Ok(self.with(|state| state.host_key.clone()))
    }

    async fn confirm_host_key(&mut self, accepted: bool) -> Result<Banners> {
        self.record(format!("confirm_host_key {accepted}"));
        if !accepted {
            return Err(Error::fatal("host key rejected"));
        }
        Ok(Banners {
            client: "SSH-2.0-sshkit_test".to_string(),
            server: Some(SERVER_BANNER.to_string()),
        })
    }

    async fn auth_none(&mut self, username: &str) -> Result<AuthOutcome> {
        self.record(format!("auth_none {username}"));
        Ok(self.with(|state| state.none_outcome.clone()))
    }

    fn take_issue_banner(&mut self) -> Option<String> {
        self.with(|state| state.issue_banner.take())
    }

    async fn auth_password(&mut self, username: &str, password: &str) -> Result<AuthOutcome> {
        self.record(format!("auth_password {username}"));
        self.with(|state| {
            if let Some(err) = state.password_error.take() {
                return Err(err);
            }
            if password == state.password {
                return Ok(AuthOutcome::Success);
            }
            Ok(match state.password_partial.take() {
                Some(methods) => AuthOutcome::Failure {
                    methods,
                    partial_success: true,
                },
                None => AuthOutcome::Failure {
                    methods: AuthMethods::PUBLIC_KEY,
                    partial_success: false,
                },
            })
        })
    }

    async fn auth_public_key(&mut self, username: &str, key: &KeyPair) -> Result<AuthOutcome> {
        self.record(format!("auth_public_key {username}"));
        let fingerprint = key.fingerprint();
        self.with(|state| {
            if state.accepted_key.as_deref() == Some(fingerprint.as_str()) {
                Ok(AuthOutcome::Success)
            } else {
                Ok(AuthOutcome::Failure {
                    methods: AuthMethods::PASSWORD,
                    partial_success: false,
                })
            }
        })
    }

    async fn auth_interactive_start(
        &mut self,
        username: &str,
        _submethods: Option<&str>,
    ) -> Result<InteractiveStep> {
        self.record(format!("auth_interactive_start {username}"));
        Ok(self.with(|state| match state.interactive_rounds.pop_front() {
            Some(prompt) => InteractiveStep::Prompt(prompt),
            None => InteractiveStep::Failure {
                methods: AuthMethods::PASSWORD,
            },
        }))
    }

    async fn auth_interactive_respond(&mut self, answers: Vec<String>) -> Result<InteractiveStep> {
        self.record("auth_interactive_respond".to_string());
        Ok(self.with(|state| {
            state.interactive_answers.push(answers.clone());
            if let Some(prompt) = state.interactive_rounds.pop_front() {
                return InteractiveStep::Prompt(prompt);
            }
            match &state.expected_answers {
                Some(expected) if *expected != answers => InteractiveStep::Failure {
                    methods: AuthMethods::INTERACTIVE,
                },
                _ => InteractiveStep::Success,
            }
        }))
    }

    async fn channel_open(&mut self, request: &OpenRequest) -> Result<TransportChannel> {
        let kind = match request {
            OpenRequest::DirectTcpip { host, port, .. } => format!("direct {host}:{port}"),
            OpenRequest::Shell(pty) => {
                format!("shell {} {}x{}", pty.terminal_type, pty.columns, pty.rows)
            }
            OpenRequest::Sftp => "sftp".to_string(),
        };
        self.record(format!("channel_open {kind}"));
        self.with(|state| {
            if let Some(err) = state.open_error.take() {
                return Err(err);
            }
            let channel = TransportChannel(state.next_channel);
            state.next_channel += 1;
            Ok(channel)
        })
    }

    fn channel_window(&self, _channel: TransportChannel) -> usize {
        self.with(|state| state.window)
    }

    async fn channel_write(&mut self, channel: TransportChannel, data: &[u8]) -> Result<usize> {
        self.with(|state| {
            if let Some(err) = state.write_error.take() {
                return Err(err);
            }
            let accepted = data.len().min(state.window);
            state.window -= accepted;
            state
                .written
                .entry(channel)
                .or_default()
                .extend_from_slice(&data[..accepted]);
            state.calls.push(format!("channel_write {} {accepted}", channel.0));
            Ok(accepted)
        })
    }

    async fn channel_eof(&mut self, channel: TransportChannel) -> Result<()> {
        self.record(format!("channel_eof {}", channel.0));
        self.with(|state| state.eofs.push(channel));
        Ok(())
    }

    async fn channel_close(&mut self, channel: TransportChannel) -> Result<()> {
        self.record(format!("channel_close {}", channel.0));
        let first = self.with(|state| {
            state.closes.push(channel);
            state.closed.insert(channel)
        });
        if first {
            // The server answers with its own close
            self.push_event(TransportEvent::Closed {
                channel,
                error: None,
            });
        }
        Ok(())
    }

    async fn pty_resize(&mut self, channel: TransportChannel, columns: u32, rows: u32) -> Result<()> {
        self.record(format!("pty_resize {} {columns}x{rows}", channel.0));
        self.with(|state| match state.resize_error.take() {
            Some(err) => Err(err),
            None => {
                state.resizes.push((channel, columns, rows));
                Ok(())
            }
        })
    }

    async fn request_remote_forward(&mut self, address: &str, port: u16) -> Result<u16> {
        self.record(format!("request_remote_forward {address}:{port}"));
        self.with(|state| match state.forward_error.take() {
            Some(err) => Err(err),
            None if port == 0 => Ok(state.forward_port),
            None => Ok(port),
        })
    }

    async fn sftp_stat(&mut self, _channel: TransportChannel, path: &str) -> Result<SftpAttributes> {
        self.record(format!("sftp_stat {path}"));
        self.with(|state| {
            state
                .files
                .get(path)
                .cloned()
                .ok_or_else(|| Error::ChannelFailure(format!("sftp: no such file {path}")))
        })
    }

    async fn sftp_open_dir(&mut self, _channel: TransportChannel, path: &str) -> Result<SftpHandle> {
        self.record(format!("sftp_open_dir {path}"));
        self.with(|state| {
            let entries = state
                .directories
                .get(path)
                .cloned()
                .ok_or_else(|| Error::ChannelFailure(format!("sftp: cannot open {path}")))?;
            let handle = SftpHandle(state.next_handle);
            state.next_handle += 1;
            state.open_dirs.insert(handle, entries.into());
            Ok(handle)
        })
    }

    async fn sftp_read_dir(
        &mut self,
        _channel: TransportChannel,
        handle: SftpHandle,
    ) -> Result<Option<SftpEntry>> {
        self.record("sftp_read_dir".to_string());
        self.with(|state| match state.open_dirs.get_mut(&handle) {
            Some(entries) => Ok(entries.pop_front()),
            None => Err(Error::ChannelFailure("sftp: bad handle".to_string())),
        })
    }

    async fn sftp_close_dir(&mut self, _channel: TransportChannel, handle: SftpHandle) -> Result<()> {
        self.record("sftp_close_dir".to_string());
        self.with(|state| {
            state.open_dirs.remove(&handle);
            state.closed_dirs.push(handle);
        });
        Ok(())
    }

    async fn poll_events(&mut self, timeout: Duration) -> Result<bool> {
        if self.with(|state| !state.events.is_empty()) {
            return Ok(true);
        }
        let _ = tokio::time::timeout(timeout, self.wake.notified()).await;
        Ok(self.with(|state| !state.events.is_empty()))
    }

    fn next_event(&mut self) -> Option<TransportEvent> {
        self.with(|state| state.events.pop_front())
    }

    async fn keepalive(&mut self) -> Result<()> {
        self.record("keepalive".to_string());
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.record("disconnect".to_string());
        self.with(|state| {
            state.disconnects += 1;
            state.events.clear();
        });
        Ok(())
    }
}

/// Session delegate that records every callback as a short string.
pub struct RecordingSession {
    pub accept_host_key: bool,
    pub events: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<Option<ErrorCode>>>,
    pub forwards: Mutex<Vec<ForwardChannel>>,
    pub answers: Mutex<VecDeque<String>>,
    pub prompts: Mutex<Vec<String>>,
}

impl RecordingSession {
    pub fn new(accept_host_key: bool) -> Arc<Self> {
        Arc::new(Self {
            accept_host_key,
            events: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            forwards: Mutex::new(Vec::new()),
            answers: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.as_str() == name).count()
    }

    fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

impl SessionDelegate for RecordingSession {
    fn should_connect_with_host_key(&self, _session: &Session, host_key: &HostKey) -> bool {
        self.push(format!("host_key {}", host_key.fingerprint));
        self.accept_host_key
    }

    fn did_connect(&self, _session: &Session, host: &str, port: u16) {
        self.push(format!("connect {host}:{port}"));
    }

    fn did_disconnect(&self, _session: &Session, error: Option<&Error>) {
        self.push("disconnect");
        self.errors.lock().unwrap().push(error.map(Error::code));
    }

    fn need_authenticate_user(&self, _session: &Session, username: &str) {
        self.push(format!("need_auth {username}"));
    }

    fn did_accept_forward_channel(&self, _session: &Session, channel: ForwardChannel) {
        self.push("forward");
        self.forwards.lock().unwrap().push(channel);
    }

    fn keyboard_interactive_request(&self, _session: &Session, prompt: &str) -> String {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.answers.lock().unwrap().pop_front().unwrap_or_default()
    }
}

/// One observed channel callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Open,
    OpenError(ErrorCode),
    Data(Vec<u8>),
    Wrote(usize),
    Eof,
    Close(Option<ErrorCode>),
    PtySize(u32, u32, Option<ErrorCode>),
}

#[derive(Default)]
pub struct RecordingChannel {
    pub events: Mutex<Vec<Recorded>>,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Recorded::Close(_)))
            .count()
    }

    /// All data received, concatenated.
    pub fn received(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Data(data) => Some(data),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn written(&self) -> usize {
        self.events()
            .iter()
            .map(|e| match e {
                Recorded::Wrote(n) => *n,
                _ => 0,
            })
            .sum()
    }

    fn push(&self, event: Recorded) {
        self.events.lock().unwrap().push(event);
    }
}

impl ChannelDelegate for RecordingChannel {
    fn did_open(&self, _channel: &Channel) {
        self.push(Recorded::Open);
    }

    fn did_open_with_error(&self, _channel: &Channel, error: &Error) {
        self.push(Recorded::OpenError(error.code()));
    }

    fn did_read_data(&self, _channel: &Channel, data: &[u8]) {
        self.push(Recorded::Data(data.to_vec()));
    }

    fn did_write_data(&self, _channel: &Channel, written: usize) {
        self.push(Recorded::Wrote(written));
    }

    fn did_receive_eof(&self, _channel: &Channel) {
        self.push(Recorded::Eof);
    }

    fn did_close(&self, _channel: &Channel, error: Option<&Error>) {
        self.push(Recorded::Close(error.map(Error::code)));
    }
}

impl ShellChannelDelegate for RecordingChannel {
    fn did_change_pty_size(
        &self,
        _channel: &ShellChannel,
        columns: u32,
        rows: u32,
        error: Option<&Error>,
    ) {
        self.push(Recorded::PtySize(columns, rows, error.map(Error::code)));
    }
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        poll_interval_ms: 10,
        keepalive_interval: 0,
        write_buffer_limit: 64,
        ..SessionConfig::default()
    }
}

/// Session over a fresh mock, with a recording delegate that trusts the host.
pub fn new_session() -> (Session, Arc<RecordingSession>, MockHandle) {
    let (transport, mock) = MockTransport::new();
    let delegate = RecordingSession::new(true);
    let session = Session::builder()
        .config(test_config())
        .delegate(&delegate)
        .build_with_transport(transport);
    (session, delegate, mock)
}

/// Session that is connected and authenticated with the mock password.
pub async fn ready_session() -> (Session, Arc<RecordingSession>, MockHandle) {
    let (session, delegate, mock) = new_session();
    session
        .connect("server.test", 22, USER, None)
        .await
        .expect("connect should succeed");
    session
        .authenticate_by_password(|| Some(PASSWORD.to_string()))
        .await
        .expect("password should be accepted");
    (session, delegate, mock)
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
