//! Slash-command registry and plan/code mode state
//!
//! Commands are registered with a name, usage, aliases, and a category:
//! `global` commands run in the master only; `agent` commands run in agent
//! context (the master routes them to the focused agent like any other
//! input). Mode state is per-conversation and lives in the store.

use crate::config::Config;
use crate::session::Session;
use crate::store::{ConversationMode, ConversationStore, CostBreakdown};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCategory {
    /// Runs in the master process only
    Global,
    /// Runs in agent context
    Agent,
}

pub type CommandResult = std::result::Result<String, String>;
type Handler = for<'a, 'b> fn(&'a mut CommandContext<'b>, &[&str]) -> CommandResult;

pub struct CommandSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub usage: &'static str,
    pub aliases: &'static [&'static str],
    pub category: CommandCategory,
    handler: Handler,
}

/// Everything a command handler may touch
pub struct CommandContext<'a> {
    pub store: &'a ConversationStore,
    pub session: &'a mut Session,
    pub config: &'a Config,
    pub tool_names: &'a [String],
    pub agent_name: Option<&'a str>,
}

pub struct CommandRegistry {
    commands: Vec<CommandSpec>,
}

impl CommandRegistry {
    pub fn builtin() -> Self {
        Self {
            commands: vec![
                spec("help", "List available commands", "/help", &["h"], CommandCategory::Agent, cmd_help),
                spec("info", "Show session and conversation status", "/info", &[], CommandCategory::Agent, cmd_info),
                spec("context", "Show context size for the current conversation", "/context", &["ctx"], CommandCategory::Agent, cmd_context),
                spec("inspect", "Show detailed conversation metadata", "/inspect", &[], CommandCategory::Agent, cmd_inspect),
                spec("model", "Show or switch the active model", "/model [nickname]", &[], CommandCategory::Agent, cmd_model),
                spec("new", "Start a new conversation", "/new [title]", &[], CommandCategory::Agent, cmd_new),
                spec("conv", "List conversations or switch to one", "/conv [id|all]", &["conversations"], CommandCategory::Agent, cmd_conv),
                spec("plan", "Switch the conversation to plan mode", "/plan", &[], CommandCategory::Agent, cmd_plan),
                spec("code", "Switch the conversation to code mode", "/code", &[], CommandCategory::Agent, cmd_code),
                spec("condense", "Start a condensed continuation of this conversation", "/condense", &[], CommandCategory::Agent, cmd_condense),
                spec("cost", "Show token cost for this conversation and session", "/cost", &[], CommandCategory::Agent, cmd_cost),
                spec("search", "Search conversations by title and content", "/search <query>", &[], CommandCategory::Agent, cmd_search),
                spec("archive", "Archive a conversation", "/archive [id]", &[], CommandCategory::Agent, cmd_archive),
                spec("unarchive", "Restore an archived conversation", "/unarchive <id>", &[], CommandCategory::Agent, cmd_unarchive),
                spec("agents", "List agents currently present on the bus", "/agents", &[], CommandCategory::Global, cmd_master_only),
                spec("quit", "Exit the master", "/quit", &["exit"], CommandCategory::Global, cmd_master_only),
            ],
        }
    }

    pub fn find(&self, name: &str) -> Option<&CommandSpec> {
        let name = name.trim_start_matches('/');
        self.commands
            .iter()
            .find(|c| c.name == name || c.aliases.contains(&name))
    }

    /// Category of the command named in `input`, if it is a known command
    pub fn category_of(&self, input: &str) -> Option<CommandCategory> {
        let trimmed = input.trim();
        if !trimmed.starts_with('/') {
            return None;
        }
        let name = trimmed.split_whitespace().next()?;
        self.find(name).map(|c| c.category)
    }

    /// Execute a slash command. Returns None when `input` is not a known
    /// command, so the caller can fall through to prompt routing.
    pub fn execute(&self, ctx: &mut CommandContext, input: &str) -> Option<CommandResult> {
        let trimmed = input.trim();
        if !trimmed.starts_with('/') {
            return None;
        }
        let mut parts = trimmed.split_whitespace();
        let name = parts.next()?;
        let args: Vec<&str> = parts.collect();
        let command = self.find(name)?;
        Some((command.handler)(ctx, &args))
    }

    pub fn all(&self) -> &[CommandSpec] {
        &self.commands
    }
}

fn spec(
    name: &'static str,
    description: &'static str,
    usage: &'static str,
    aliases: &'static [&'static str],
    category: CommandCategory,
    handler: Handler,
) -> CommandSpec {
    CommandSpec {
        name,
        description,
        usage,
        aliases,
        category,
        handler,
    }
}

// ── Handlers ───────────────────────────────────────────────────────────────

fn cmd_help(ctx: &mut CommandContext, _args: &[&str]) -> CommandResult {
    let registry = CommandRegistry::builtin();
    let mut out = String::from("Commands:\n");
    for command in registry.all() {
        let scope = match command.category {
            CommandCategory::Global => "master",
            CommandCategory::Agent => "agent",
        };
        out.push_str(&format!(
            "  {:<22} {} [{}]\n",
            command.usage, command.description, scope
        ));
    }
    out.push_str(&format!("Tools: {}\n", ctx.tool_names.join(", ")));
    Ok(out)
}

fn cmd_info(ctx: &mut CommandContext, _args: &[&str]) -> CommandResult {
    let mut out = String::new();
    if let Some(agent) = ctx.agent_name {
        out.push_str(&format!("Agent: {}\n", agent));
    }
    out.push_str(&format!("Model: {}\n", ctx.session.model_nickname));
    out.push_str(&format!(
        "Session started: {}\n",
        ctx.session.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    match current_conversation(ctx) {
        Some(conversation) => out.push_str(&format!(
            "Conversation: #{} \"{}\" ({} mode, {} messages)\n",
            conversation.id,
            conversation.title,
            conversation.mode.as_str(),
            conversation.message_count
        )),
        None => out.push_str("Conversation: none\n"),
    }
    Ok(out)
}

fn cmd_context(ctx: &mut CommandContext, _args: &[&str]) -> CommandResult {
    let Some(conversation) = current_conversation(ctx) else {
        return Ok("No active conversation.".to_string());
    };
    let messages = ctx
        .store
        .get_messages(conversation.id)
        .map_err(|e| e.to_string())?;
    let chars: usize = messages.iter().map(|m| m.content.len()).sum();
    Ok(format!(
        "Conversation #{}: {} messages, ~{} tokens",
        conversation.id,
        messages.len(),
        chars / 4
    ))
}

fn cmd_inspect(ctx: &mut CommandContext, _args: &[&str]) -> CommandResult {
    let Some(conversation) = current_conversation(ctx) else {
        return Ok("No active conversation.".to_string());
    };
    let created_files = ctx
        .store
        .created_files(conversation.id)
        .unwrap_or_default();
    let usage_rows = ctx
        .store
        .get_usage_rows(conversation.id)
        .map(|rows| rows.len())
        .unwrap_or(0);
    Ok(format!(
        "Conversation #{}\n  title: {}\n  mode: {}\n  model: {}\n  messages: {}\n  usage rows: {}\n  created: {}\n  last activity: {}\n  plan-mode files: {}\n",
        conversation.id,
        conversation.title,
        conversation.mode.as_str(),
        conversation.model_nickname,
        conversation.message_count,
        usage_rows,
        conversation.created_at.format("%Y-%m-%d %H:%M:%S"),
        conversation.last_activity.format("%Y-%m-%d %H:%M:%S"),
        if created_files.is_empty() {
            "none".to_string()
        } else {
            created_files.join(", ")
        }
    ))
}

fn cmd_model(ctx: &mut CommandContext, args: &[&str]) -> CommandResult {
    match args.first() {
        None => {
            let mut nicknames: Vec<&String> = ctx.config.models.keys().collect();
            nicknames.sort();
            let list: Vec<String> = nicknames
                .iter()
                .map(|n| {
                    if **n == ctx.session.model_nickname {
                        format!("{} (active)", n)
                    } else {
                        n.to_string()
                    }
                })
                .collect();
            Ok(format!("Models: {}", list.join(", ")))
        }
        Some(nickname) => {
            ctx.config.model(nickname).map_err(|e| e.to_string())?;
            ctx.session.model_nickname = nickname.to_string();
            if let Some(id) = ctx.session.conversation_id {
                ctx.store
                    .update_conversation_model(id, nickname)
                    .map_err(|e| e.to_string())?;
            }
            Ok(format!("Switched model to {}", nickname))
        }
    }
}

fn cmd_new(ctx: &mut CommandContext, args: &[&str]) -> CommandResult {
    let title = if args.is_empty() {
        "New conversation".to_string()
    } else {
        args.join(" ")
    };
    let conversation = ctx
        .store
        .create_conversation(&title, ConversationMode::Code, &ctx.session.model_nickname)
        .map_err(|e| e.to_string())?;
    ctx.session.conversation_id = Some(conversation.id);
    Ok(format!(
        "Started conversation #{} \"{}\"",
        conversation.id, conversation.title
    ))
}

fn cmd_conv(ctx: &mut CommandContext, args: &[&str]) -> CommandResult {
    match args.first() {
        None | Some(&"all") => {
            let conversations = if args.first() == Some(&"all") {
                ctx.store.list_all().map_err(|e| e.to_string())?
            } else {
                ctx.store.list_active().map_err(|e| e.to_string())?
            };
            if conversations.is_empty() {
                return Ok("No active conversations.".to_string());
            }
            let mut out = String::from("Conversations:\n");
            for c in conversations {
                let marker = if ctx.session.conversation_id == Some(c.id) {
                    "*"
                } else {
                    " "
                };
                out.push_str(&format!(
                    "{} #{:<4} {} ({}, {} msgs, {})\n",
                    marker,
                    c.id,
                    c.title,
                    c.mode.as_str(),
                    c.message_count,
                    c.last_activity.format("%Y-%m-%d %H:%M")
                ));
            }
            Ok(out)
        }
        Some(raw) => {
            let id: i64 = raw.parse().map_err(|_| format!("not a conversation id: {}", raw))?;
            let conversation = ctx
                .store
                .get_conversation(id)
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("no conversation #{}", id))?;
            ctx.session.conversation_id = Some(conversation.id);
            ctx.session.model_nickname = conversation.model_nickname.clone();
            Ok(format!(
                "Switched to conversation #{} \"{}\" ({} mode)",
                conversation.id,
                conversation.title,
                conversation.mode.as_str()
            ))
        }
    }
}

fn cmd_plan(ctx: &mut CommandContext, _args: &[&str]) -> CommandResult {
    switch_mode(ctx, ConversationMode::Plan)
}

fn cmd_code(ctx: &mut CommandContext, _args: &[&str]) -> CommandResult {
    switch_mode(ctx, ConversationMode::Code)
}

fn switch_mode(ctx: &mut CommandContext, mode: ConversationMode) -> CommandResult {
    let Some(id) = ctx.session.conversation_id else {
        return Err("No active conversation; use /new first".to_string());
    };
    ctx.store
        .update_conversation_mode(id, mode)
        .map_err(|e| e.to_string())?;
    match mode {
        ConversationMode::Plan => {
            let files = ctx.store.created_files(id).unwrap_or_default();
            if files.is_empty() {
                Ok("Switched to plan mode. Only files created in this session can be edited.".to_string())
            } else {
                Ok(format!(
                    "Switched to plan mode. Editable files: {}",
                    files.join(", ")
                ))
            }
        }
        ConversationMode::Code => Ok("Switched to code mode.".to_string()),
    }
}

fn cmd_condense(ctx: &mut CommandContext, _args: &[&str]) -> CommandResult {
    let Some(id) = ctx.session.conversation_id else {
        return Err("No active conversation to condense".to_string());
    };
    let conversation = ctx
        .store
        .get_conversation(id)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("no conversation #{}", id))?;

    let next = ctx
        .store
        .create_conversation(
            &format!("{} (condensed)", conversation.title),
            conversation.mode,
            &conversation.model_nickname,
        )
        .map_err(|e| e.to_string())?;
    ctx.session.conversation_id = Some(next.id);
    Ok(format!(
        "Continuing in conversation #{}; #{} left intact with {} messages",
        next.id, conversation.id, conversation.message_count
    ))
}

fn cmd_cost(ctx: &mut CommandContext, _args: &[&str]) -> CommandResult {
    let mut out = String::new();
    if let Some(id) = ctx.session.conversation_id {
        let breakdown = ctx
            .store
            .get_conversation_cost_detailed(id)
            .map_err(|e| e.to_string())?;
        out.push_str(&format!("Conversation #{}:\n", id));
        out.push_str(&format_cost_table(&breakdown));
    } else {
        out.push_str("No active conversation.\n");
    }
    let session = ctx
        .store
        .get_cost_since(ctx.session.started_at)
        .map_err(|e| e.to_string())?;
    out.push_str("Session:\n");
    out.push_str(&format_cost_table(&session));
    Ok(out)
}

fn cmd_search(ctx: &mut CommandContext, args: &[&str]) -> CommandResult {
    if args.is_empty() {
        return Err("usage: /search <query>".to_string());
    }
    let query = args.join(" ");
    let hits = ctx
        .store
        .search_conversations(&query)
        .map_err(|e| e.to_string())?;
    if hits.is_empty() {
        return Ok(format!("No conversations matching \"{}\"", query));
    }
    let mut out = format!("Matches for \"{}\":\n", query);
    for c in hits {
        out.push_str(&format!(
            "  #{:<4} {} ({})\n",
            c.id,
            c.title,
            c.last_activity.format("%Y-%m-%d %H:%M")
        ));
    }
    Ok(out)
}

fn cmd_archive(ctx: &mut CommandContext, args: &[&str]) -> CommandResult {
    let id = match args.first() {
        Some(raw) => raw
            .parse()
            .map_err(|_| format!("not a conversation id: {}", raw))?,
        None => ctx
            .session
            .conversation_id
            .ok_or_else(|| "No active conversation".to_string())?,
    };
    if !ctx.store.archive(id).map_err(|e| e.to_string())? {
        return Err(format!("no conversation #{}", id));
    }
    if ctx.session.conversation_id == Some(id) {
        ctx.session.conversation_id = None;
    }
    Ok(format!("Archived conversation #{}", id))
}

fn cmd_unarchive(ctx: &mut CommandContext, args: &[&str]) -> CommandResult {
    let raw = args.first().ok_or("usage: /unarchive <id>")?;
    let id: i64 = raw
        .parse()
        .map_err(|_| format!("not a conversation id: {}", raw))?;
    if !ctx.store.unarchive(id).map_err(|e| e.to_string())? {
        return Err(format!("no conversation #{}", id));
    }
    Ok(format!("Restored conversation #{}", id))
}

fn cmd_master_only(_ctx: &mut CommandContext, _args: &[&str]) -> CommandResult {
    Err("This command is only available in master mode".to_string())
}

fn current_conversation(ctx: &CommandContext) -> Option<crate::store::Conversation> {
    let id = ctx.session.conversation_id?;
    ctx.store.get_conversation(id).ok().flatten()
}

/// Render a `/cost` table: one row per model plus a total
pub fn format_cost_table(breakdown: &CostBreakdown) -> String {
    if breakdown.rows.is_empty() {
        return "  (no usage recorded)\n".to_string();
    }
    let mut out = format!(
        "  {:<12} {:>10} {:>10} {:>10} {:>10}\n",
        "model", "input", "output", "reasoning", "cost"
    );
    for row in &breakdown.rows {
        out.push_str(&format!(
            "  {:<12} {:>10} {:>10} {:>10} {:>9.4}$\n",
            row.model_nickname,
            row.input_tokens,
            row.output_tokens,
            row.reasoning_tokens,
            row.total_cost()
        ));
    }
    out.push_str(&format!(
        "  {:<12} {:>10} {:>10} {:>10} {:>9.4}$\n",
        "total",
        breakdown.total.input_tokens,
        breakdown.total.output_tokens,
        breakdown.total.reasoning_tokens,
        breakdown.total.total_cost()
    ));
    out
}

/// Title derived from the first user message when none was given
pub fn derive_title(first_message: &str) -> String {
    let cleaned = first_message.trim().replace('\n', " ");
    if cleaned.len() <= 60 {
        cleaned
    } else {
        let mut cut = 60;
        while !cleaned.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &cleaned[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ChatMessage;
    use pretty_assertions::assert_eq;

    fn setup() -> (ConversationStore, Session, Config) {
        let store = ConversationStore::open_in_memory().unwrap();
        let config = Config::default();
        let session = Session::new(&config);
        (store, session, config)
    }

    fn exec(
        registry: &CommandRegistry,
        store: &ConversationStore,
        session: &mut Session,
        config: &Config,
        input: &str,
    ) -> Option<CommandResult> {
        let tool_names = vec!["read".to_string()];
        let mut ctx = CommandContext {
            store,
            session,
            config,
            tool_names: &tool_names,
            agent_name: Some("coder"),
        };
        registry.execute(&mut ctx, input)
    }

    #[test]
    fn test_unknown_command_falls_through() {
        let registry = CommandRegistry::builtin();
        let (store, mut session, config) = setup();
        assert!(exec(&registry, &store, &mut session, &config, "/frobnicate").is_none());
        assert!(exec(&registry, &store, &mut session, &config, "plain text").is_none());
    }

    #[test]
    fn test_new_then_plan_then_code() {
        let registry = CommandRegistry::builtin();
        let (store, mut session, config) = setup();

        let out = exec(&registry, &store, &mut session, &config, "/new my task")
            .unwrap()
            .unwrap();
        assert!(out.contains("my task"));
        let id = session.conversation_id.unwrap();

        exec(&registry, &store, &mut session, &config, "/plan")
            .unwrap()
            .unwrap();
        assert_eq!(
            store.get_conversation(id).unwrap().unwrap().mode,
            ConversationMode::Plan
        );

        exec(&registry, &store, &mut session, &config, "/code")
            .unwrap()
            .unwrap();
        assert_eq!(
            store.get_conversation(id).unwrap().unwrap().mode,
            ConversationMode::Code
        );
    }

    #[test]
    fn test_mode_switch_without_conversation_fails() {
        let registry = CommandRegistry::builtin();
        let (store, mut session, config) = setup();
        let result = exec(&registry, &store, &mut session, &config, "/plan").unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_model_switch_updates_session_and_conversation() {
        let registry = CommandRegistry::builtin();
        let (store, mut session, config) = setup();
        exec(&registry, &store, &mut session, &config, "/new x")
            .unwrap()
            .unwrap();
        let id = session.conversation_id.unwrap();

        exec(&registry, &store, &mut session, &config, "/model gpt4o-mini")
            .unwrap()
            .unwrap();
        assert_eq!(session.model_nickname, "gpt4o-mini");
        assert_eq!(
            store.get_conversation(id).unwrap().unwrap().model_nickname,
            "gpt4o-mini"
        );

        let result = exec(&registry, &store, &mut session, &config, "/model bogus").unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_conv_switch_and_archive() {
        let registry = CommandRegistry::builtin();
        let (store, mut session, config) = setup();
        exec(&registry, &store, &mut session, &config, "/new first")
            .unwrap()
            .unwrap();
        let first = session.conversation_id.unwrap();
        exec(&registry, &store, &mut session, &config, "/new second")
            .unwrap()
            .unwrap();

        let out = exec(
            &registry,
            &store,
            &mut session,
            &config,
            &format!("/conv {}", first),
        )
        .unwrap()
        .unwrap();
        assert!(out.contains("first"));
        assert_eq!(session.conversation_id, Some(first));

        exec(&registry, &store, &mut session, &config, "/archive")
            .unwrap()
            .unwrap();
        assert_eq!(session.conversation_id, None);
        assert!(!store.get_conversation(first).unwrap().unwrap().is_active);

        exec(
            &registry,
            &store,
            &mut session,
            &config,
            &format!("/unarchive {}", first),
        )
        .unwrap()
        .unwrap();
        assert!(store.get_conversation(first).unwrap().unwrap().is_active);
    }

    #[test]
    fn test_cost_renders_rows() {
        let registry = CommandRegistry::builtin();
        let (store, mut session, config) = setup();
        exec(&registry, &store, &mut session, &config, "/new c")
            .unwrap()
            .unwrap();
        let id = session.conversation_id.unwrap();
        store
            .record_token_usage(
                id,
                None,
                "gpt4o",
                crate::llm::types::UsageData {
                    input_tokens: 3,
                    output_tokens: 2,
                    reasoning_tokens: 0,
                    estimated: false,
                },
                0.1,
                0.2,
                0.0,
            )
            .unwrap();

        let out = exec(&registry, &store, &mut session, &config, "/cost")
            .unwrap()
            .unwrap();
        assert!(out.contains("gpt4o"));
        assert!(out.contains("total"));
    }

    #[test]
    fn test_search_command() {
        let registry = CommandRegistry::builtin();
        let (store, mut session, config) = setup();
        exec(&registry, &store, &mut session, &config, "/new alpha beta")
            .unwrap()
            .unwrap();
        store
            .append_message(
                session.conversation_id.unwrap(),
                &ChatMessage::user("find gamma"),
            )
            .unwrap();

        let out = exec(&registry, &store, &mut session, &config, "/search gamma")
            .unwrap()
            .unwrap();
        assert!(out.contains("alpha beta"));
    }

    #[test]
    fn test_category_of() {
        let registry = CommandRegistry::builtin();
        assert_eq!(
            registry.category_of("/agents"),
            Some(CommandCategory::Global)
        );
        assert_eq!(registry.category_of("/cost"), Some(CommandCategory::Agent));
        assert_eq!(registry.category_of("/nope"), None);
        assert_eq!(registry.category_of("hello"), None);
    }

    #[test]
    fn test_alias_resolution() {
        let registry = CommandRegistry::builtin();
        assert_eq!(registry.find("/ctx").unwrap().name, "context");
        assert_eq!(registry.find("conversations").unwrap().name, "conv");
    }

    #[test]
    fn test_derive_title_truncates() {
        assert_eq!(derive_title("short prompt"), "short prompt");
        let long = "x".repeat(100);
        let title = derive_title(&long);
        assert!(title.chars().count() <= 61);
        assert!(title.ends_with('…'));
    }
}
