use crate::api::GeminiProvider;
use crate::commands::{self, ChatView, SettingsUpdate};
use crate::models::{ClassifiedLogs, Message, RenderedTurn, Role, Settings};
use crate::router;
use crate::session::Exchange;
use crate::state::AppState;
use crate::storage::StorageManager;
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

/// CLI arguments for phonesim
#[derive(Parser)]
#[command(name = "phonesim")]
#[command(about = "AI phone simulator: import a character's chat log and keep the conversation going")]
#[command(version)]
pub struct Cli {
    /// SQLite file holding settings and the chat log
    #[arg(long, env = "PHONESIM_DB", global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show or change settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Store the Gemini API key in the OS keyring
    KeySet { key: String },
    /// Import a chat log JSON file, replacing the current one
    Import { file: PathBuf },
    /// Print the chat screen
    Show {
        /// Print the screen as JSON
        #[arg(long)]
        json: bool,
    },
    /// Send a message and wait for the reply
    Send {
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Replace the text of a message (full ID or unique prefix)
    Edit { id: String, text: String },
    /// Delete a message (full ID or unique prefix)
    Delete {
        id: String,
        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },
    /// Sort a `{"conversations": [...]}` archive into calls, messages and chats
    Classify {
        file: PathBuf,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Interactive mode (default)
    Repl,
}

#[derive(Subcommand)]
pub enum SettingsAction {
    Show,
    Set(SetArgs),
}

#[derive(Args, Default)]
pub struct SetArgs {
    /// Literal key, `env:VAR` or `keyring`
    #[arg(long)]
    pub api_key: Option<String>,
    #[arg(long)]
    pub model: Option<String>,
    #[arg(long)]
    pub api_base: Option<String>,
    #[arg(long)]
    pub persona: Option<String>,
    #[arg(long)]
    pub note: Option<String>,
    #[arg(long)]
    pub system_prompt: Option<String>,
    /// Number of recent messages sent as context, 0 for all
    #[arg(long)]
    pub context_size: Option<String>,
}

impl From<SetArgs> for SettingsUpdate {
    fn from(args: SetArgs) -> Self {
        SettingsUpdate {
            api_key: args.api_key,
            model: args.model,
            api_base: args.api_base,
            user_persona: args.persona,
            user_note: args.note,
            system_prompt: args.system_prompt,
            context_size: args.context_size,
        }
    }
}

pub fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("phonesim"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("phonesim.sqlite")
}

/// Opens storage, restores state and runs the requested command.
pub async fn execute(cli: Cli) -> Result<()> {
    let db_path = cli.db.unwrap_or_else(default_db_path);
    let storage = StorageManager::open(&db_path).await?;
    let state = AppState::new(storage, Arc::new(GeminiProvider::new()));

    commands::load_settings(&state).await.map_err(anyhow::Error::msg)?;
    if let Err(warning) = commands::restore_session(&state).await {
        eprintln!("warning: {}", warning);
    }

    match cli.command.unwrap_or(Commands::Repl) {
        Commands::Settings { action: SettingsAction::Show } => {
            print_settings(&state.settings_snapshot().await);
        }
        Commands::Settings { action: SettingsAction::Set(args) } => {
            let confirmation = commands::save_settings(&state, args.into())
                .await
                .map_err(anyhow::Error::msg)?;
            println!("{}", confirmation);
        }
        Commands::KeySet { key } => {
            println!("{}", commands::store_api_key(&key).map_err(anyhow::Error::msg)?);
        }
        Commands::Import { file } => import(&state, &file).await.map_err(anyhow::Error::msg)?,
        Commands::Show { json } => {
            let view = commands::render_chat(&state).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print_chat(&view);
            }
        }
        Commands::Send { text } => {
            let exchange = commands::send_message(&state, &text.join(" "))
                .await
                .map_err(anyhow::Error::msg)?;
            if let Some(exchange) = exchange {
                print_exchange(&exchange);
            }
        }
        Commands::Edit { id, text } => {
            commands::edit_message(&state, &id, &text)
                .await
                .map_err(anyhow::Error::msg)?;
            println!("Message updated.");
        }
        Commands::Delete { id, yes } => {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            if yes || confirm(&mut lines, "Delete this message?").await? {
                commands::delete_message(&state, &id)
                    .await
                    .map_err(anyhow::Error::msg)?;
                println!("Message deleted.");
            }
        }
        Commands::Classify { file, json } => {
            let logs = commands::classify_file(&state, &file)
                .await
                .map_err(anyhow::Error::msg)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&logs)?);
            } else {
                print_classified(&logs);
            }
        }
        Commands::Repl => repl(&state).await?,
    }
    Ok(())
}

async fn import(state: &AppState, file: &Path) -> Result<(), String> {
    let session = commands::import_chat_log(state, file).await?;
    println!(
        "{} imported: {} with {} messages.",
        file.display(),
        session.character_name,
        session.messages.len()
    );
    Ok(())
}

async fn confirm(lines: &mut Lines<BufReader<Stdin>>, question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    std::io::stdout().flush()?;
    let answer = lines.next_line().await?.unwrap_or_default();
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

const REPL_HELP: &str = "\
Type a message to send it to the character.
  /open <screen>        show a screen (home, settings, phone, messages, chat)
  /home                 back to the home screen
  /show                 print the chat
  /import <file>        load a chat log JSON file
  /edit <id> <text>     replace a message
  /delete <id>          delete a message
  /classify <file>      sort a conversation archive
  /settings             print settings
  /quit";

async fn repl(state: &AppState) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", REPL_HELP);

    loop {
        {
            let router = state.router.lock().await;
            print!("[{}]> ", router.current());
        }
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some(command) = line.strip_prefix('/') else {
            commands::open_screen(state, "chat").await.ok();
            match commands::send_message(state, line).await {
                Ok(Some(exchange)) => print_exchange(&exchange),
                Ok(None) => {}
                Err(e) => eprintln!("{}", e),
            }
            continue;
        };

        let (name, arg) = command
            .split_once(' ')
            .map(|(name, arg)| (name, arg.trim()))
            .unwrap_or((command, ""));
        match name {
            "quit" | "exit" => break,
            "help" => println!("{}", REPL_HELP),
            "home" => {
                commands::go_home(state).await;
            }
            "open" => match commands::open_screen(state, arg).await {
                Ok(screen) => show_screen(state, &screen).await,
                Err(e) => eprintln!("{}", e),
            },
            "show" => print_chat(&commands::render_chat(state).await),
            "settings" => print_settings(&state.settings_snapshot().await),
            "import" => {
                if let Err(e) = import(state, Path::new(arg)).await {
                    eprintln!("{}", e);
                }
            }
            "edit" => {
                let Some((id, text)) = arg.split_once(' ') else {
                    eprintln!("usage: /edit <id> <text>");
                    continue;
                };
                match commands::edit_message(state, id, text.trim()).await {
                    Ok(()) => print_chat(&commands::render_chat(state).await),
                    Err(e) => eprintln!("{}", e),
                }
            }
            "delete" => {
                if !confirm(&mut lines, "Delete this message?").await? {
                    continue;
                }
                match commands::delete_message(state, arg).await {
                    Ok(()) => print_chat(&commands::render_chat(state).await),
                    Err(e) => eprintln!("{}", e),
                }
            }
            "classify" => match commands::classify_file(state, Path::new(arg)).await {
                Ok(logs) => print_classified(&logs),
                Err(e) => eprintln!("{}", e),
            },
            other => eprintln!("Unknown command /{}. Try /help.", other),
        }
    }
    Ok(())
}

async fn show_screen(state: &AppState, screen: &str) {
    match screen {
        "chat" => print_chat(&commands::render_chat(state).await),
        "settings" => print_settings(&state.settings_snapshot().await),
        router::HOME => println!("Apps: {}", router::SCREENS[1..].join(", ")),
        other => println!("-- {} --", other),
    }
}

fn short_id(message: &Message) -> String {
    message.id.to_string()[..8].to_string()
}

fn speaker(role: Role, character_name: Option<&str>) -> String {
    match role {
        Role::User => "you".to_string(),
        Role::Assistant => character_name.unwrap_or("assistant").to_string(),
    }
}

fn print_chat(view: &ChatView) {
    let name = view.character_name.as_deref();
    println!("== {} ==", name.unwrap_or("(no chat log loaded)"));
    for turn in &view.turns {
        match turn {
            RenderedTurn::Message(message) => println!(
                "[{}] {}: {}",
                short_id(message),
                speaker(message.role, name),
                message.content
            ),
            RenderedTurn::Error(error) => println!("[ error  ] {}", error),
            RenderedTurn::Thinking => println!("[  ...   ] {} is typing", speaker(Role::Assistant, name)),
        }
    }
}

fn print_exchange(exchange: &Exchange) {
    println!("[{}] you: {}", short_id(&exchange.user), exchange.user.content);
    match &exchange.reply {
        Ok(reply) => println!("[{}] {}", short_id(reply), reply.content),
        Err(e) => println!("[ error  ] {}", e),
    }
}

fn mask_key(key: &str) -> String {
    if key.is_empty() || key.starts_with("env:") || key == "keyring" {
        return key.to_string();
    }
    // Too short to reveal any of it
    if key.chars().count() < 8 {
        return "********".to_string();
    }
    let tail: String = key.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    format!("****{}", tail)
}

fn print_settings(settings: &Settings) {
    println!("api key:       {}", mask_key(&settings.api_key));
    println!("model:         {}", settings.model);
    println!("api base:      {}", settings.api_base);
    println!("persona:       {}", settings.user_persona);
    println!("note:          {}", settings.user_note);
    println!("context size:  {}", settings.context_size);
    println!("system prompt: {}", settings.system_prompt);
}

fn print_classified(logs: &ClassifiedLogs) {
    let groups = [
        ("Phone", &logs.phone_logs),
        ("Messages", &logs.message_logs),
        ("Chat", &logs.chat_logs),
    ];
    for (title, conversations) in groups {
        println!("== {} ({}) ==", title, conversations.len());
        for conversation in conversations.iter() {
            let preview = serde_json::to_string(&conversation.log).unwrap_or_default();
            let preview: String = preview.chars().take(80).collect();
            println!("  {}", preview);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn send_joins_words() {
        let cli = Cli::try_parse_from(["phonesim", "--db", "x.sqlite", "send", "how", "are", "you?"]).unwrap();
        match cli.command {
            Some(Commands::Send { text }) => assert_eq!(text.join(" "), "how are you?"),
            _ => panic!("expected send"),
        }
        assert_eq!(cli.db.as_deref(), Some(Path::new("x.sqlite")));
    }

    #[test]
    fn settings_set_maps_onto_update() {
        let cli = Cli::try_parse_from(["phonesim", "settings", "set", "--persona", "night owl", "--context-size", "0"])
            .unwrap();
        let Some(Commands::Settings { action: SettingsAction::Set(args) }) = cli.command else {
            panic!("expected settings set");
        };
        let update: SettingsUpdate = args.into();
        assert_eq!(update.user_persona.as_deref(), Some("night owl"));
        assert_eq!(update.context_size.as_deref(), Some("0"));
        assert!(update.api_key.is_none());
    }

    #[test]
    fn keys_are_masked_unless_they_are_references() {
        assert_eq!(mask_key("AIzaSyABCDEF1234"), "****1234");
        assert_eq!(mask_key("env:GEMINI_API_KEY"), "env:GEMINI_API_KEY");
        assert_eq!(mask_key("keyring"), "keyring");
    }

    #[test]
    fn short_keys_are_fully_masked() {
        assert_eq!(mask_key("abcd"), "********");
        assert_eq!(mask_key("abc1234"), "********");
        assert_eq!(mask_key("abcd1234"), "****1234");
    }

    #[test]
    fn show_accepts_json_flag() {
        let cli = Cli::try_parse_from(["phonesim", "show", "--json"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Show { json: true })));
    }
}
