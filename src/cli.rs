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

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::keys::KeyType;

#[derive(Parser, Debug)]
#[command(
    name = "sshkit",
    version,
    about = "Inspect SSH servers, list remote directories and manage keys",
    long_about = "sshkit drives the sshkit session engine from the command line.\nIt connects to a server, verifies its host key, authenticates with a key,\na password or keyboard-interactive prompts, and then runs one operation.",
    after_help = "EXAMPLES:\n  Show server details:        sshkit info admin@db1.example.com\n  List a remote directory:    sshkit -i ~/.ssh/id_ed25519 ls admin@db1:2222 /var/log\n  Generate an Ed25519 key:    sshkit keygen -t ed25519 -f ~/.ssh/id_sshkit"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(
        long,
        global = true,
        help = "Configuration file path [default: ~/.config/sshkit/config.yaml]"
    )]
    pub config: Option<PathBuf>,

    #[arg(short = 'l', long, global = true, help = "Login name (overrides user@ in the destination)")]
    pub login: Option<String>,

    #[arg(short = 'p', long, global = true, help = "Port to connect to (default 22)")]
    pub port: Option<u16>,

    #[arg(
        short = 'i',
        long,
        global = true,
        help = "Private key file (prompts for the passphrase if encrypted)"
    )]
    pub identity: Option<PathBuf>,

    #[arg(
        short = 'P',
        long,
        global = true,
        help = "Use password authentication (will prompt for password)"
    )]
    pub password: bool,

    #[arg(
        long,
        global = true,
        help = "Use keyboard-interactive authentication, answering prompts on the terminal"
    )]
    pub interactive: bool,

    #[arg(
        long,
        global = true,
        env = "SSHKIT_ACCEPT_HOST_KEY",
        help = "Trust the server's host key without asking"
    )]
    pub accept_host_key: bool,

    #[arg(long, global = true, help = "Request zlib compression of the connection")]
    pub compression: bool,

    #[arg(
        long,
        global = true,
        default_value = "30",
        help = "Connection timeout in seconds (0 disables)"
    )]
    pub timeout: u64,

    #[arg(
        short = 'v',
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Connect, authenticate and print session details")]
    Info {
        #[arg(help = "Destination in [user@]host[:port] format")]
        destination: String,
    },

    #[command(about = "List a remote directory over SFTP")]
    Ls {
        #[arg(help = "Destination in [user@]host[:port] format")]
        destination: String,

        #[arg(default_value = ".", help = "Remote directory to list")]
        path: String,
    },

    #[command(about = "Generate a new key pair")]
    Keygen {
        #[arg(short = 't', long = "type", value_enum, default_value = "ed25519")]
        key_type: KeyKind,

        #[arg(
            short = 'b',
            long,
            help = "RSA modulus size, or ECDSA curve size (256, 384, 521)"
        )]
        bits: Option<u32>,

        #[arg(short = 'f', long, help = "Output file for the private key")]
        output: PathBuf,

        #[arg(short = 'C', long, help = "Comment for the public key")]
        comment: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KeyKind {
    Rsa,
    Ecdsa,
    Ed25519,
}

impl KeyKind {
    pub fn key_type(&self) -> KeyType {
        match self {
            KeyKind::Rsa => KeyType::Rsa,
            KeyKind::Ecdsa => KeyType::Ecdsa,
            KeyKind::Ed25519 => KeyType::Ed25519,
        }
    }

    pub fn default_bits(&self) -> u32 {
        match self {
            KeyKind::Rsa => 3072,
            KeyKind::Ecdsa => 256,
            KeyKind::Ed25519 => 256,
        }
    }
}

/// A parsed `[user@]host[:port]` destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl Destination {
    pub fn parse(input: &str) -> anyhow::Result<Self> {
        let (user, rest) = match input.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => anyhow::bail!("empty user name in destination '{input}'"),
            None => (None, input),
        };

        // [v6::addr]:port or bare v6 address
        let (host, port) = if let Some(stripped) = rest.strip_prefix('[') {
            let (host, tail) = stripped
                .split_once(']')
                .ok_or_else(|| anyhow::anyhow!("unterminated '[' in destination '{input}'"))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => Some(port.parse::<u16>()?),
                None if tail.is_empty() => None,
                None => anyhow::bail!("unexpected text after ']' in destination '{input}'"),
            };
            (host.to_string(), port)
        } else if rest.matches(':').count() == 1 {
            let (host, port) = rest.split_once(':').unwrap_or((rest, ""));
            let port = port
                .parse::<u16>()
                .map_err(|e| anyhow::anyhow!("invalid port '{port}': {e}"))?;
            (host.to_string(), Some(port))
        } else {
            (rest.to_string(), None)
        };

        if host.is_empty() {
            anyhow::bail!("missing host in destination '{input}'");
        }
        Ok(Self { user, host, port })
    }
}
