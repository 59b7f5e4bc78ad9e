//! Data types shared by the registry, the dispatcher and extensions.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::extensions::handle::ExtensionHandle;

// ── Namespace ─────────────────────────────────────────────────────────────────

/// Scope a trigger is registered in: one team, or every team.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Namespace {
    Global,
    Team(String),
}

impl Namespace {
    /// An empty team id means "all teams".
    pub fn from_team_id(team_id: &str) -> Self {
        if team_id.is_empty() {
            Namespace::Global
        } else {
            Namespace::Team(team_id.to_string())
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Namespace::Global)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Global => write!(f, "global"),
            Namespace::Team(id) => write!(f, "team:{id}"),
        }
    }
}

// ── Source / tier ─────────────────────────────────────────────────────────────

/// Who registered a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CommandSource {
    BuiltIn,
    Plugin(String),
    Product(String),
}

impl CommandSource {
    pub fn tier(&self) -> Tier {
        match self {
            CommandSource::BuiltIn => Tier::BuiltIn,
            CommandSource::Product(_) => Tier::Product,
            CommandSource::Plugin(_) => Tier::Plugin,
        }
    }

    /// Extension id for plugin/product sources.
    pub fn extension_id(&self) -> Option<&str> {
        match self {
            CommandSource::BuiltIn => None,
            CommandSource::Plugin(id) | CommandSource::Product(id) => Some(id),
        }
    }
}

impl fmt::Display for CommandSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandSource::BuiltIn => write!(f, "builtin"),
            CommandSource::Plugin(id) => write!(f, "plugin:{id}"),
            CommandSource::Product(id) => write!(f, "product:{id}"),
        }
    }
}

/// Precedence class. Ordering is significant: higher wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    BuiltIn = 0,
    Product = 1,
    Plugin = 2,
}

// ── Registration ──────────────────────────────────────────────────────────────

/// Opaque id of one registration. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistrationId(pub(crate) u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg-{}", self.0)
    }
}

/// Display and autocomplete data; opaque to the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMetadata {
    pub display_name: String,
    pub auto_complete: bool,
    pub auto_complete_desc: String,
    pub auto_complete_hint: String,
}

/// What an extension asks to register (`RegisterCommand` payload).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Team id; empty registers the trigger for every team.
    pub team_id: String,
    pub trigger: String,
    #[serde(flatten)]
    pub metadata: CommandMetadata,
}

impl Command {
    pub fn new(team_id: impl Into<String>, trigger: impl Into<String>) -> Self {
        Self {
            team_id: team_id.into(),
            trigger: trigger.into(),
            metadata: CommandMetadata::default(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.metadata.display_name = name.into();
        self
    }

    pub fn with_autocomplete(mut self, desc: impl Into<String>) -> Self {
        self.metadata.auto_complete = true;
        self.metadata.auto_complete_desc = desc.into();
        self
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::from_team_id(&self.team_id)
    }
}

/// One entry in the command registry.
///
/// Cheap to clone: the owning handle is shared.
#[derive(Clone)]
pub struct Registration {
    pub id: RegistrationId,
    pub namespace: Namespace,
    /// Lower-cased trigger word, without the leading `/`.
    pub trigger: String,
    pub source: CommandSource,
    pub metadata: CommandMetadata,
    /// Registration order; larger is newer.
    pub(crate) seq: u64,
    pub(crate) owner: Arc<ExtensionHandle>,
}

impl Registration {
    pub fn tier(&self) -> Tier {
        self.source.tier()
    }

    /// Handle of the extension that serves this trigger.
    pub fn owner(&self) -> &Arc<ExtensionHandle> {
        &self.owner
    }

    /// Precedence key: tier first, then recency.
    pub(crate) fn precedence(&self) -> (Tier, u64) {
        (self.tier(), self.seq)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .field("trigger", &self.trigger)
            .field("source", &self.source)
            .field("owner", &self.owner.id())
            .finish()
    }
}

/// Normalise a trigger: strip one leading `/`, lower-case, reject blanks and
/// embedded whitespace.
pub fn normalize_trigger(raw: &str) -> Option<String> {
    let t = raw.trim();
    let t = t.strip_prefix('/').unwrap_or(t);
    if t.is_empty() || t.chars().any(char::is_whitespace) {
        return None;
    }
    Some(t.to_lowercase())
}

// ── Invocation ────────────────────────────────────────────────────────────────

/// One command invocation. Ephemeral — built per dispatch call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationContext {
    /// Team the command was typed in (never `Global`).
    pub namespace: Namespace,
    pub trigger: String,
    /// Everything after the trigger, trimmed.
    pub args: String,
    /// User issuing the command.
    pub actor: String,
    pub channel_id: String,
    /// The full line as typed.
    pub command: String,
}

impl InvocationContext {
    /// Parse `/trigger rest of line` typed by `actor` in `team_id`.
    ///
    /// Returns `None` when the line is not a slash command.
    pub fn parse(team_id: &str, actor: &str, channel_id: &str, line: &str) -> Option<Self> {
        let line = line.trim();
        let body = line.strip_prefix('/')?;
        let (word, args) = match body.split_once(char::is_whitespace) {
            Some((w, rest)) => (w, rest.trim()),
            None => (body, ""),
        };
        let trigger = normalize_trigger(word)?;
        Some(Self {
            namespace: Namespace::from_team_id(team_id),
            trigger,
            args: args.to_string(),
            actor: actor.to_string(),
            channel_id: channel_id.to_string(),
            command: line.to_string(),
        })
    }
}

// ── Response ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    #[default]
    Ephemeral,
    InChannel,
}

/// What a handler returns on success. Forwarded to the caller verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub text: String,
    pub response_type: ResponseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto_location: Option<String>,
}

impl CommandResponse {
    pub fn ephemeral(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            response_type: ResponseType::Ephemeral,
            goto_location: None,
        }
    }

    pub fn in_channel(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            response_type: ResponseType::InChannel,
            goto_location: None,
        }
    }
}

/// Structured error returned by a handler.
///
/// `status_code == 0` means "unset"; the dispatcher normalises it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerError {
    pub message: String,
    pub status_code: u16,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), status_code: 0 }
    }

    pub fn with_status(message: impl Into<String>, status_code: u16) -> Self {
        Self { message: message.into(), status_code }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status {})", self.message, self.status_code)
    }
}

impl std::error::Error for HandlerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_order_plugin_beats_product_beats_builtin() {
        assert!(Tier::Plugin > Tier::Product);
        assert!(Tier::Product > Tier::BuiltIn);
        assert_eq!(CommandSource::Plugin("p".into()).tier(), Tier::Plugin);
        assert_eq!(CommandSource::Product("p".into()).tier(), Tier::Product);
    }

    #[test]
    fn empty_team_is_global() {
        assert!(Namespace::from_team_id("").is_global());
        assert_eq!(Namespace::from_team_id("t1"), Namespace::Team("t1".into()));
    }

    #[test]
    fn normalize_strips_slash_and_lowercases() {
        assert_eq!(normalize_trigger("/Plugin").as_deref(), Some("plugin"));
        assert_eq!(normalize_trigger("away").as_deref(), Some("away"));
        assert!(normalize_trigger("").is_none());
        assert!(normalize_trigger("/").is_none());
        assert!(normalize_trigger("two words").is_none());
    }

    #[test]
    fn parse_splits_trigger_and_args() {
        let ctx = InvocationContext::parse("t1", "u1", "c1", "/Echo  hello   world ").unwrap();
        assert_eq!(ctx.trigger, "echo");
        assert_eq!(ctx.args, "hello   world");
        assert_eq!(ctx.namespace, Namespace::Team("t1".into()));
        assert_eq!(ctx.command, "/Echo  hello   world");
    }

    #[test]
    fn parse_rejects_non_commands() {
        assert!(InvocationContext::parse("t1", "u1", "c1", "hello").is_none());
        assert!(InvocationContext::parse("t1", "u1", "c1", "/").is_none());
        assert!(InvocationContext::parse("t1", "u1", "c1", "   ").is_none());
    }

    #[test]
    fn source_serialises_tagged() {
        let json = serde_json::to_string(&CommandSource::Plugin("p1".into())).unwrap();
        assert_eq!(json, r#"{"kind":"plugin","id":"p1"}"#);
    }
}
