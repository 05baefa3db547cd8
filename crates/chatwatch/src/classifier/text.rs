//! Display text resolution.

use chatwatch_protocol::bridge::MessageContent;

/// Label for bodies with no textual form.
pub const PLACEHOLDER_OTHER: &str = "[Media/Other]";

/// Resolve the display text of a message body. Never empty.
pub fn display_text(content: &MessageContent) -> String {
    let text = resolve(content);
    if text.is_empty() {
        PLACEHOLDER_OTHER.to_string()
    } else {
        text
    }
}

fn resolve(content: &MessageContent) -> String {
    if let Some(text) = content.conversation.as_deref().filter(|t| !t.is_empty()) {
        return text.to_string();
    }
    if let Some(ext) = &content.extended_text {
        return ext.text.clone();
    }
    if let Some(image) = &content.image {
        return tagged("[Image]", &image.caption);
    }
    if let Some(video) = &content.video {
        return tagged("[Video]", &video.caption);
    }
    if let Some(doc) = &content.document {
        return tagged("[Document]", &doc.file_name);
    }
    if let Some(audio) = &content.audio {
        let label = if audio.ptt { "[Voice Message]" } else { "[Audio]" };
        return label.to_string();
    }
    if content.sticker.is_some() {
        return "[Sticker]".to_string();
    }
    if let Some(card) = &content.contact {
        return tagged("[Contact]", &card.display_name);
    }
    if content.location.is_some() {
        return "[Location]".to_string();
    }
    String::new()
}

fn tagged(tag: &str, detail: &str) -> String {
    if detail.is_empty() {
        tag.to_string()
    } else {
        format!("{tag} {detail}")
    }
}
