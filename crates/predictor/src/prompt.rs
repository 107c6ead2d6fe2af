//! Chat prompt formatting
//!
//! Turns chat messages into the flat role-tagged prompt the model was tuned
//! on: one `USER:` or `ASSISTANT:` line per turn, followed by an open
//! `ASSISTANT:` line for the model to complete.

use lmshim_proto::{ChatMessage, Role};
use tracing::debug;

const USER_TAG: &str = "USER:";
const ASSISTANT_TAG: &str = "ASSISTANT:";

/// Format chat messages into a single prompt string
///
/// Roles other than user and assistant are dropped.
pub fn format_prompt(messages: &[ChatMessage]) -> String {
    let mut lines = Vec::with_capacity(messages.len() + 1);

    for message in messages {
        match message.role {
            Role::User => lines.push(format!("{} {}", USER_TAG, message.content)),
            Role::Assistant => lines.push(format!("{} {}", ASSISTANT_TAG, message.content)),
            Role::System | Role::Unknown => {
                debug!("Skipping {:?} message in prompt", message.role);
            }
        }
    }

    lines.push(ASSISTANT_TAG.to_string());
    lines.join("\n")
}
