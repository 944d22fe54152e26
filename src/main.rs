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

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sshkit::{
    cli::{Cli, Commands, Destination},
    config::{default_config_path, expand_tilde},
    utils::init_logging,
    AuthMethods, HostKey, KeyPair, Session, SessionConfig, SessionDelegate, SessionStage,
};

/// Default identities tried when no `-i` is given, in preference order.
const DEFAULT_IDENTITIES: &[&str] = &["~/.ssh/id_ed25519", "~/.ssh/id_ecdsa", "~/.ssh/id_rsa"];

/// Terminal-backed session delegate.
struct TerminalDelegate {
    accept_host_key: bool,
}

impl SessionDelegate for TerminalDelegate {
    fn should_connect_with_host_key(&self, _session: &Session, host_key: &HostKey) -> bool {
        eprintln!(
            "Server host key is {} {}",
            host_key.algorithm, host_key.fingerprint
        );
        if self.accept_host_key {
            return true;
        }
        tokio::task::block_in_place(|| {
            eprint!("Are you sure you want to continue connecting (yes/no)? ");
            let _ = std::io::stderr().flush();
            let mut answer = String::new();
            match std::io::stdin().lock().read_line(&mut answer) {
                Ok(_) => matches!(answer.trim(), "yes" | "y"),
                Err(_) => false,
            }
        })
    }

    fn did_disconnect(&self, _session: &Session, error: Option<&sshkit::Error>) {
        if let Some(err) = error {
            eprintln!("Connection lost: {err}");
        }
    }

    fn need_authenticate_user(&self, session: &Session, username: &str) {
        tracing::info!(
            "Server requires authentication for {username} (offered: {})",
            session.auth_methods()
        );
    }

    fn keyboard_interactive_request(&self, _session: &Session, prompt: &str) -> String {
        tokio::task::block_in_place(|| rpassword::prompt_password(prompt).unwrap_or_default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Commands::Keygen {
            key_type,
            bits,
            output,
            comment,
        } => generate_key(
            key_type.key_type(),
            bits.unwrap_or_else(|| key_type.default_bits()),
            output,
            comment.as_deref(),
        ),
        Commands::Info { destination } => {
            let (session, _delegate) = open_session(&cli, destination).await?;
            let result = print_info(&session);
            session.disconnect().await;
            result
        }
        Commands::Ls { destination, path } => {
            let (session, _delegate) = open_session(&cli, destination).await?;
            let result = list_directory(&session, path).await;
            session.disconnect().await;
            result
        }
    }
}

fn generate_key(
    key_type: sshkit::KeyType,
    bits: u32,
    output: &Path,
    comment: Option<&str>,
) -> Result<()> {
    let output = expand_tilde(output);
    if output.exists() {
        bail!("{} already exists", output.display());
    }
    let key = KeyPair::generate(key_type, bits)
        .with_context(|| format!("Failed to generate {key_type} key"))?;
    key.write_to_file(&output, comment)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("Your identification has been saved in {}", output.display());
    println!("Your public key has been saved in {}.pub", output.display());
    println!("The key fingerprint is: {}", key.fingerprint());
    Ok(())
}

async fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match cli.config.as_ref().cloned().or_else(default_config_path) {
        Some(path) => SessionConfig::load(&path).await?,
        None => SessionConfig::default(),
    };
    config.compression |= cli.compression;
    Ok(config)
}

/// Connect and authenticate. The delegate is returned so the caller keeps it
/// alive for as long as the session is used.
async fn open_session(cli: &Cli, destination: &str) -> Result<(Session, Arc<TerminalDelegate>)> {
    let destination = Destination::parse(destination)?;
    let config = load_config(cli).await?;

    let username = cli
        .login
        .clone()
        .or(destination.user.clone())
        .or_else(|| std::env::var("USER").ok())
        .context("No user name given; use user@host or -l")?;
    let port = cli.port.or(destination.port).unwrap_or(22);
    let timeout = (cli.timeout > 0).then(|| Duration::from_secs(cli.timeout));

    let delegate = Arc::new(TerminalDelegate {
        accept_host_key: cli.accept_host_key,
    });
    let session = Session::builder().config(config).delegate(&delegate).build();

    session
        .connect(destination.host.clone(), port, username.clone(), timeout)
        .await
        .with_context(|| format!("Failed to connect to {}:{port}", destination.host))?;

    if !session.is_authorized() {
        authenticate(cli, &session, &destination.host, &username).await?;
    }

    Ok((session, delegate))
}

async fn authenticate(cli: &Cli, session: &Session, host: &str, username: &str) -> Result<()> {
    if let Some(identity) = &cli.identity {
        let path = expand_tilde(identity);
        return session
            .authenticate_by_private_key(path.clone(), passphrase_prompt(path))
            .await
            .context("Public key authentication failed");
    }
    if cli.password {
        return session
            .authenticate_by_password(password_prompt(host, username))
            .await
            .context("Password authentication failed");
    }
    if cli.interactive {
        return session
            .authenticate_by_interactive_delegate()
            .await
            .context("Keyboard-interactive authentication failed");
    }

    let methods = session.auth_methods();
    if methods.is_empty() || methods.contains(AuthMethods::PUBLIC_KEY) {
        for candidate in DEFAULT_IDENTITIES {
            let path = expand_tilde(Path::new(candidate));
            if !path.exists() {
                continue;
            }
            tracing::debug!("Trying identity {}", path.display());
            match session
                .authenticate_by_private_key(path.clone(), passphrase_prompt(path.clone()))
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::debug!("Identity {} rejected: {err}", path.display());
                    if session.stage().is_terminal() {
                        return Err(err).context("Session closed during authentication");
                    }
                }
            }
        }
    }

    let methods = session.auth_methods();
    if methods.contains(AuthMethods::PASSWORD) {
        session
            .authenticate_by_password(password_prompt(host, username))
            .await
            .context("Password authentication failed")
    } else if methods.contains(AuthMethods::INTERACTIVE) {
        session
            .authenticate_by_interactive_delegate()
            .await
            .context("Keyboard-interactive authentication failed")
    } else {
        bail!("No usable authentication method (server offers: {methods})")
    }
}

fn passphrase_prompt(path: PathBuf) -> impl FnOnce() -> Option<String> + Send + 'static {
    move || rpassword::prompt_password(format!("Enter passphrase for key '{}': ", path.display())).ok()
}

fn password_prompt(host: &str, username: &str) -> impl FnOnce() -> Option<String> + Send + 'static {
    let prompt = format!("{username}@{host}'s password: ");
    move || rpassword::prompt_password(prompt).ok()
}

fn print_info(session: &Session) -> Result<()> {
    let info = session.info();
    if info.stage != SessionStage::Ready {
        bail!("Session is not ready (stage {:?})", info.stage);
    }

    println!("host:           {}", info.host.as_deref().unwrap_or("-"));
    if let Some(ip) = info.host_ip {
        println!("address:        {ip}");
    }
    println!("port:           {}", info.port);
    println!("user:           {}", info.username.as_deref().unwrap_or("-"));
    println!("client banner:  {}", info.client_banner.as_deref().unwrap_or("-"));
    println!("server banner:  {}", info.server_banner.as_deref().unwrap_or("-"));
    if let Some(version) = info.protocol_version() {
        println!("protocol:       {version}");
    }
    println!("auth methods:   {}", info.auth_methods);
    if let Some(path) = &info.private_key_path {
        println!("identity:       {}", path.display());
    }
    if let Some(banner) = &info.issue_banner {
        println!();
        println!("{}", banner.trim_end());
    }
    Ok(())
}

async fn list_directory(session: &Session, path: &str) -> Result<()> {
    let sftp = session.open_sftp().await.context("Failed to start SFTP")?;
    let mut directory = sftp
        .open_directory(path)
        .await
        .with_context(|| format!("Failed to open {path}"))?;

    let mut entries = Vec::new();
    while let Some(entry) = directory.read_directory().await? {
        entries.push(entry);
    }
    directory.close_directory().await?;
    entries.sort_by(|a, b| a.filename().cmp(b.filename()));

    for entry in &entries {
        println!(
            "{} {:>6} {:>6} {:>12} {}",
            entry.permissions(),
            entry.owner_uid().map(|v| v.to_string()).unwrap_or_default(),
            entry.owner_gid().map(|v| v.to_string()).unwrap_or_default(),
            entry.file_size(),
            entry.filename()
        );
    }
    sftp.close()?;
    Ok(())
}
