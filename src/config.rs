use crate::models::Settings;
use anyhow::{Context, Result};
use keyring::Entry;

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash-latest";
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
pub const DEFAULT_CONTEXT_SIZE: &str = "20";
pub const DEFAULT_SYSTEM_PROMPT: &str = "Stay in character at all times. \
Reply the way the character would in a phone chat: short, casual, one message at a time. \
Never mention that you are an AI.";

// Storage keys, one row each in the settings table
pub const KEY_API_KEY: &str = "gemini_api_key";
pub const KEY_MODEL: &str = "gemini_model";
pub const KEY_API_BASE: &str = "gemini_api_base";
pub const KEY_USER_PERSONA: &str = "user_persona";
pub const KEY_USER_NOTE: &str = "user_note";
pub const KEY_SYSTEM_PROMPT: &str = "system_prompt";
pub const KEY_CONTEXT_SIZE: &str = "context_size";
pub const KEY_SESSION: &str = "session_json";

pub fn default_settings() -> Settings {
    Settings {
        api_key: String::new(),
        model: DEFAULT_MODEL.to_string(),
        api_base: DEFAULT_API_BASE.to_string(),
        user_persona: String::new(),
        user_note: String::new(),
        system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        context_size: DEFAULT_CONTEXT_SIZE.to_string(),
    }
}

/// Field name / storage key / value triples, in a fixed order.
pub fn settings_fields(settings: &Settings) -> [(&'static str, &str); 7] {
    [
        (KEY_API_KEY, settings.api_key.as_str()),
        (KEY_MODEL, settings.model.as_str()),
        (KEY_API_BASE, settings.api_base.as_str()),
        (KEY_USER_PERSONA, settings.user_persona.as_str()),
        (KEY_USER_NOTE, settings.user_note.as_str()),
        (KEY_SYSTEM_PROMPT, settings.system_prompt.as_str()),
        (KEY_CONTEXT_SIZE, settings.context_size.as_str()),
    ]
}

// --- API Key Retrieval ---

const KEYRING_SERVICE: &str = "phonesim_api_key";
const KEYRING_USER: &str = "gemini";

/// Resolves the configured `api_key` setting into the actual key.
/// `env:NAME` reads an environment variable, `keyring` reads the OS keyring,
/// anything else is taken as the key itself.
pub fn get_api_key(settings: &Settings) -> Result<String> {
    let raw = settings.api_key.trim();
    match raw {
        "" => Err(anyhow::anyhow!("API key is not set. Configure it in settings.")),
        r if r.starts_with("env:") => {
            let env_var_name = r.trim_start_matches("env:");
            log::debug!("Retrieving API key from environment variable: {}", env_var_name);
            std::env::var(env_var_name).context(format!(
                "Failed to get API key from environment variable '{}'",
                env_var_name
            ))
        }
        "keyring" => {
            let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)
                .context("Failed to create keyring entry")?;
            log::debug!("Retrieving API key from keyring for service: {}", KEYRING_SERVICE);
            entry
                .get_password()
                .context("Failed to get API key from keyring. Please set it with `phonesim key-set`.")
        }
        literal => Ok(literal.to_string()),
    }
}

/// Stores an API key in the OS keyring. Point the `api_key` setting at
/// `keyring` to use it.
pub fn set_api_key_in_keyring(api_key: &str) -> Result<()> {
    let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)
        .context("Failed to create keyring entry for setting password")?;
    log::info!("Setting API key in keyring for service: {}", KEYRING_SERVICE);
    entry
        .set_password(api_key)
        .context("Failed to set API key in keyring")
}
