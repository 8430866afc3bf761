//! Turning a selected reply into a posted chat message.
use thiserror::Error;

use super::selection::SelectedAction;
use crate::core::host::{HostError, QuietRequest, TalkControlHost};
use crate::schema::chat::{Character, ChatMessage, Provenance};
use crate::schema::story::{normalize_name, Story};
use crate::schema::talk_control::ReplyContent;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no roster character for speaker {0:?}")]
    SpeakerNotFound(String),
    #[error("reply produced no text")]
    EmptyReply,
    #[error("reply has no {0} configured")]
    MissingContent(&'static str),
    #[error(transparent)]
    Host(#[from] HostError),
}

/// Find the roster character behind a speaker id: exact name, then story
/// role alias, then a normalised scan of the roster.
pub fn resolve_character(
    host: &dyn TalkControlHost,
    story: &Story,
    speaker_id: &str,
) -> Option<Character> {
    if let Some(character) = host.find_character(speaker_id) {
        return Some(character);
    }
    let alias = story.role_alias(speaker_id);
    if let Some(character) = alias.and_then(|name| host.find_character(name)) {
        return Some(character);
    }
    let wanted: Vec<String> = std::iter::once(speaker_id)
        .chain(alias)
        .map(normalize_name)
        .collect();
    host.roster()
        .into_iter()
        .find(|c| wanted.contains(&normalize_name(&c.name)))
}

/// Trim and cap at `max_chars` characters.
pub fn truncate_reply(text: &str, max_chars: Option<usize>) -> String {
    let text = text.trim();
    match max_chars {
        Some(limit) if text.chars().count() > limit => {
            let cut: String = text.chars().take(limit).collect();
            cut.trim_end().to_string()
        }
        _ => text.to_string(),
    }
}

/// Produce and post the message for `action`. Nothing is recorded here;
/// the caller marks the reply used only when this succeeds.
pub async fn dispatch_action(
    host: &dyn TalkControlHost,
    story: &Story,
    action: &SelectedAction,
    fallback_max_chars: Option<usize>,
) -> Result<ChatMessage, DispatchError> {
    let reply = &action.reply;
    match &reply.content {
        ReplyContent::Static { text } if text.trim().is_empty() => {
            return Err(DispatchError::MissingContent("text"));
        }
        ReplyContent::Llm { instruction } if instruction.trim().is_empty() => {
            return Err(DispatchError::MissingContent("instruction"));
        }
        _ => {}
    }
    let speaker = resolve_character(host, story, &reply.speaker_id)
        .ok_or_else(|| DispatchError::SpeakerNotFound(reply.speaker_id.clone()))?;

    let raw = match &reply.content {
        ReplyContent::Static { text } => host.substitute_macros(text, &speaker),
        ReplyContent::Llm { instruction } => {
            let prompt = host.substitute_macros(instruction, &speaker);
            host.generate_quiet(QuietRequest {
                prompt,
                force_speaker: speaker.name.clone(),
            })
            .await?
        }
    };

    let max_chars = reply
        .max_chars
        .or_else(|| story.talk_control.as_ref().and_then(|c| c.default_max_chars))
        .or(fallback_max_chars);
    let content = truncate_reply(&raw, max_chars);
    if content.is_empty() {
        return Err(DispatchError::EmptyReply);
    }

    let message = ChatMessage::injected(
        &speaker,
        content,
        &Provenance {
            checkpoint_id: action.event.checkpoint_id.clone(),
            reply_index: action.reply_index,
            trigger: action.event.kind.as_str(),
        },
    );
    host.append_message(message.clone()).await?;
    Ok(message)
}
