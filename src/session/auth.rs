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

//! Authentication methods and credential callbacks.

use crate::error::{Error, Result};
use crate::transport::{InteractivePrompt, InteractiveStep};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use zeroize::Zeroizing;

/// Set of authentication methods advertised by the server.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AuthMethods(u32);

impl AuthMethods {
    pub const UNKNOWN: AuthMethods = AuthMethods(0);
    pub const NONE: AuthMethods = AuthMethods(0x0001);
    pub const PASSWORD: AuthMethods = AuthMethods(0x0002);
    pub const PUBLIC_KEY: AuthMethods = AuthMethods(0x0004);
    pub const HOST_BASED: AuthMethods = AuthMethods(0x0008);
    pub const INTERACTIVE: AuthMethods = AuthMethods(0x0010);
    pub const GSSAPI_MIC: AuthMethods = AuthMethods(0x0020);

    pub const fn from_bits(bits: u32) -> Self {
        AuthMethods(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn contains(&self, other: AuthMethods) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: AuthMethods) {
        self.0 |= other.0;
    }

    /// Method names in the order servers usually advertise them.
    pub fn names(&self) -> Vec<&'static str> {
        [
            (AuthMethods::NONE, "none"),
            (AuthMethods::PUBLIC_KEY, "publickey"),
            (AuthMethods::PASSWORD, "password"),
            (AuthMethods::INTERACTIVE, "keyboard-interactive"),
            (AuthMethods::HOST_BASED, "hostbased"),
            (AuthMethods::GSSAPI_MIC, "gssapi-with-mic"),
        ]
        .into_iter()
        .filter(|(method, _)| self.contains(*method))
        .map(|(_, name)| name)
        .collect()
    }
}

impl BitOr for AuthMethods {
    type Output = AuthMethods;

    fn bitor(self, rhs: AuthMethods) -> AuthMethods {
        AuthMethods(self.0 | rhs.0)
    }
}

impl BitOrAssign for AuthMethods {
    fn bitor_assign(&mut self, rhs: AuthMethods) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for AuthMethods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthMethods({})", self.names().join("|"))
    }
}

impl fmt::Display for AuthMethods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(","))
    }
}

/// Supplies a password when authentication needs one. `None` aborts the attempt.
pub type PasswordHandler = Box<dyn FnOnce() -> Option<Zeroizing<String>> + Send + 'static>;

/// Answers one keyboard-interactive round: `(round, prompt) -> answers`.
pub type InteractiveHandler =
    Box<dyn FnMut(usize, &InteractivePrompt) -> Vec<String> + Send + 'static>;

/// Position of a keyboard-interactive exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InteractiveState {
    /// Waiting for the next server message.
    Exchanging { round: usize },
    /// A prompt arrived and needs answers before the exchange can continue.
    AwaitingAnswers {
        round: usize,
        prompt: InteractivePrompt,
    },
    Succeeded,
    Failed(Error),
}

impl InteractiveState {
    pub(crate) fn start() -> Self {
        InteractiveState::Exchanging { round: 0 }
    }

    /// Advance on a server reply.
    pub(crate) fn on_step(self, step: InteractiveStep) -> Self {
        let round = match self {
            InteractiveState::Exchanging { round } => round,
            other => return other,
        };
        match step {
            InteractiveStep::Success => InteractiveState::Succeeded,
            InteractiveStep::Failure { .. } => InteractiveState::Failed(Error::AuthFailure(
                "keyboard-interactive authentication rejected".to_string(),
            )),
            InteractiveStep::Prompt(prompt) => InteractiveState::AwaitingAnswers { round, prompt },
        }
    }

    /// Check the handler's answers for the pending prompt.
    ///
    /// Returns the answers to forward and the state to resume in, or the
    /// failure state when the answer count does not match the prompt count.
    pub(crate) fn on_answers(self, answers: Vec<String>) -> (Self, Option<Vec<String>>) {
        match self {
            InteractiveState::AwaitingAnswers { round, prompt } => {
                if answers.len() != prompt.prompts.len() {
                    let err = Error::AuthFailure(format!(
                        "interactive handler returned {} answers for {} prompts",
                        answers.len(),
                        prompt.prompts.len()
                    ));
                    (InteractiveState::Failed(err), None)
                } else {
                    (
                        InteractiveState::Exchanging { round: round + 1 },
                        Some(answers),
                    )
                }
            }
            other => (other, None),
        }
    }

    pub(crate) fn finish(self) -> Option<Result<()>> {
        match self {
            InteractiveState::Succeeded => Some(Ok(())),
            InteractiveState::Failed(err) => Some(Err(err)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PromptItem;

    fn prompt(count: usize) -> InteractivePrompt {
        InteractivePrompt {
            name: "otp".to_string(),
            instruction: String::new(),
            prompts: (0..count)
                .map(|i| PromptItem {
                    text: format!("Code {i}: "),
                    echo: false,
                })
                .collect(),
        }
    }

    #[test]
    fn test_auth_methods_bits() {
        let methods = AuthMethods::PASSWORD | AuthMethods::PUBLIC_KEY;
        assert!(methods.contains(AuthMethods::PASSWORD));
        assert!(!methods.contains(AuthMethods::INTERACTIVE));
        assert!(!methods.contains(AuthMethods::UNKNOWN));
        assert_eq!(methods.bits(), 0x0006);
        assert_eq!(methods.to_string(), "publickey,password");
        assert!(AuthMethods::default().is_empty());
    }

    #[test]
    fn test_interactive_round_trip() {
        let state = InteractiveState::start().on_step(InteractiveStep::Prompt(prompt(2)));
        assert!(matches!(
            state,
            InteractiveState::AwaitingAnswers { round: 0, .. }
        ));

        let (state, forwarded) = state.on_answers(vec!["a".into(), "b".into()]);
        assert_eq!(forwarded, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(state, InteractiveState::Exchanging { round: 1 });

        let state = state.on_step(InteractiveStep::Success);
        assert_eq!(state.finish(), Some(Ok(())));
    }

    #[test]
    fn test_answer_count_mismatch_is_local_failure() {
        let state = InteractiveState::start().on_step(InteractiveStep::Prompt(prompt(2)));
        let (state, forwarded) = state.on_answers(vec!["only one".into()]);
        assert!(forwarded.is_none(), "mismatched answers must not be sent");
        match state.finish() {
            Some(Err(Error::AuthFailure(msg))) => assert!(msg.contains("1 answers for 2")),
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[test]
    fn test_server_rejection() {
        let state = InteractiveState::start().on_step(InteractiveStep::Failure {
            methods: AuthMethods::PASSWORD,
        });
        assert!(matches!(state.finish(), Some(Err(Error::AuthFailure(_)))));
    }
}
