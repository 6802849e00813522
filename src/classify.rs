use crate::api::LLMApiProvider;
use crate::config;
use crate::error::ChatResult;
use crate::models::{Category, ClassifiedLogs, Conversation, ConversationArchive, Message, Role, Settings};
use futures::future::join_all;

/// Category used when no keyword matches or the call fails.
pub const DEFAULT_CATEGORY: Category = Category::Chat;

// Checked in order, first hit wins. Matching is case-sensitive.
const CATEGORY_KEYWORDS: [(Category, &[&str]); 3] = [
    (Category::Phone, &["CALL", "전화"]),
    (Category::Message, &["MESSAGE", "문자"]),
    (Category::Chat, &["CHAT", "채팅"]),
];

const CLASSIFY_INSTRUCTION: &str = "You sort snippets of a chat log into the screen of a phone they belong to. \
Answer with exactly one word: CALL if it reads like a voice call, \
MESSAGE if it reads like text messages, CHAT if it reads like a messenger chat.";

pub fn label_from_reply(reply: &str) -> Category {
    CATEGORY_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| reply.contains(k)))
        .map(|(category, _)| *category)
        .unwrap_or(DEFAULT_CATEGORY)
}

async fn classify_one(
    provider: &dyn LLMApiProvider,
    settings: &Settings,
    api_key: &str,
    index: usize,
    conversation: &Conversation,
) -> Category {
    let log_text = match serde_json::to_string_pretty(&conversation.log) {
        Ok(text) => text,
        Err(e) => {
            log::warn!("Conversation {} could not be serialized: {}", index, e);
            return DEFAULT_CATEGORY;
        }
    };
    let prompt = [Message::new(Role::User, log_text)];

    match provider
        .send_chat_request(settings, api_key, CLASSIFY_INSTRUCTION, &prompt)
        .await
    {
        Ok(reply) => {
            let category = label_from_reply(&reply);
            log::debug!("Conversation {} labeled {:?} from reply {:?}", index, category, reply.trim());
            category
        }
        Err(e) => {
            log::warn!(
                "Classification of conversation {} failed, using {:?}: {:#}",
                index,
                DEFAULT_CATEGORY,
                e
            );
            DEFAULT_CATEGORY
        }
    }
}

/// Labels every conversation with one concurrent call each and waits for all
/// of them. Failed calls fall back to the default category, so the output
/// always holds exactly the input conversations.
pub async fn classify(
    provider: &dyn LLMApiProvider,
    settings: &Settings,
    conversations: Vec<Conversation>,
) -> ClassifiedLogs {
    let mut logs = ClassifiedLogs::default();

    let api_key = match config::get_api_key(settings) {
        Ok(key) => key,
        Err(e) => {
            log::error!("Cannot classify without an API key, using {:?} for all: {:#}", DEFAULT_CATEGORY, e);
            for conversation in conversations {
                logs.push(DEFAULT_CATEGORY, conversation);
            }
            return logs;
        }
    };

    log::info!("Classifying {} conversations", conversations.len());
    let labels = join_all(
        conversations
            .iter()
            .enumerate()
            .map(|(index, conversation)| classify_one(provider, settings, &api_key, index, conversation)),
    )
    .await;

    for (category, conversation) in labels.into_iter().zip(conversations) {
        logs.push(category, conversation);
    }
    log::info!(
        "Classified: {} calls, {} messages, {} chats",
        logs.phone_logs.len(),
        logs.message_logs.len(),
        logs.chat_logs.len()
    );
    logs
}

/// Parses a `{ "conversations": [ { "log": [...] } ] }` archive and classifies it.
pub async fn classify_bytes(
    provider: &dyn LLMApiProvider,
    settings: &Settings,
    bytes: &[u8],
) -> ChatResult<ClassifiedLogs> {
    let archive: ConversationArchive = serde_json::from_slice(bytes).map_err(|e| {
        log::error!("Rejected conversation archive: {}", e);
        e
    })?;
    Ok(classify(provider, settings, archive.conversations).await)
}
