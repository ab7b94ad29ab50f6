//! Line-oriented command surface.
//!
//! Parses operator input and dispatches it against the running
//! ensemble: health snapshots, focus sets, direct and group messages,
//! prompt templates, and broadcast prompts. Rendering is left to the
//! caller; every command produces an outcome event on the main topic
//! and a printable detail string. Unknown commands produce a
//! diagnostic, never a termination.

use crate::agent::AgentHealth;
use crate::bus::{Bus, BusMessage, GLOBAL_TOPIC, agent_topic};
use crate::sched::SchedulerHandle;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Placeholder substituted with the first template argument.
const TOPIC_PLACEHOLDER: &str = "[TOPIC]";
/// Placeholder substituted with the remaining template arguments.
const SITUATION_PLACEHOLDER: &str = "[SITUATION]";

// ─── Parsing ─────────────────────────────────────────────────────────────

/// A parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Health,
    Focus(Vec<String>),
    Unfocus(Vec<String>),
    Dm { to: String, text: String },
    Group { name: String, text: String },
    Groups,
    Template { name: String, args: Vec<String> },
    Templates,
    Help,
    Quit,
    Broadcast(String),
    Empty,
}

/// Parse one input line. Anything that is not a recognized command is
/// a broadcast prompt.
pub fn parse_line(line: &str) -> ConsoleCommand {
    let line = line.trim();
    if line.is_empty() {
        return ConsoleCommand::Empty;
    }

    let mut parts = line.splitn(2, char::is_whitespace);
    let head = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    match head {
        "health" => ConsoleCommand::Health,
        "focus" => ConsoleCommand::Focus(split_ids(rest)),
        "unfocus" => ConsoleCommand::Unfocus(split_ids(rest)),
        "dm" => {
            let mut dm = rest.splitn(2, char::is_whitespace);
            let to = dm.next().unwrap_or("").to_string();
            let text = dm.next().unwrap_or("").trim().to_string();
            ConsoleCommand::Dm { to, text }
        }
        "group" => {
            let mut grp = rest.splitn(2, char::is_whitespace);
            let name = grp.next().unwrap_or("").to_string();
            let text = grp.next().unwrap_or("").trim().to_string();
            ConsoleCommand::Group { name, text }
        }
        "groups" => ConsoleCommand::Groups,
        "template" | "t" => {
            let mut args = split_ids(rest);
            if args.is_empty() {
                ConsoleCommand::Template {
                    name: String::new(),
                    args,
                }
            } else {
                let name = args.remove(0);
                ConsoleCommand::Template { name, args }
            }
        }
        "templates" => ConsoleCommand::Templates,
        "help" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        _ => ConsoleCommand::Broadcast(line.to_string()),
    }
}

fn split_ids(rest: &str) -> Vec<String> {
    rest.split_whitespace().map(String::from).collect()
}

// ─── Dispatch ────────────────────────────────────────────────────────────

/// Where console traffic lands. The live implementation wires the bus
/// and scheduler together; tests supply a fake.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Deliver a prompt. `targets` of `None` means everyone.
    async fn broadcast(&self, targets: Option<&[String]>, text: &str);

    /// Deliver a private message. Returns false for an unknown agent.
    async fn direct(&self, to: &str, text: &str) -> bool;

    /// Roster health snapshot. Must not block.
    fn health(&self) -> Vec<(String, AgentHealth)>;

    /// Known agent ids, for focus validation.
    fn roster_ids(&self) -> Vec<String>;

    /// End the session.
    fn quit(&self);
}

/// Result of dispatching one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub command: String,
    pub detail: String,
    pub quit: bool,
}

impl Outcome {
    fn new(command: &str, detail: impl Into<String>) -> Self {
        Self {
            command: command.to_string(),
            detail: detail.into(),
            quit: false,
        }
    }
}

/// The command dispatcher: holds the focus set, group and template
/// tables, and forwards traffic to the sink.
pub struct Console {
    sink: Arc<dyn CommandSink>,
    bus: Option<Arc<Bus>>,
    groups: HashMap<String, Vec<String>>,
    templates: HashMap<String, String>,
    focus: BTreeSet<String>,
}

impl Console {
    pub fn new(
        sink: Arc<dyn CommandSink>,
        groups: HashMap<String, Vec<String>>,
        templates: HashMap<String, String>,
    ) -> Self {
        Self {
            sink,
            bus: None,
            groups,
            templates,
            focus: BTreeSet::new(),
        }
    }

    /// Publish command outcomes on the main topic.
    pub fn with_bus(mut self, bus: Arc<Bus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn focused(&self) -> Vec<String> {
        self.focus.iter().cloned().collect()
    }

    /// Parse and execute one line.
    pub async fn dispatch_line(&mut self, line: &str) -> Outcome {
        let outcome = self.dispatch(parse_line(line)).await;
        if let Some(bus) = &self.bus {
            bus.publish(
                GLOBAL_TOPIC,
                "console",
                BusMessage::CommandOutcome {
                    command: outcome.command.clone(),
                    detail: outcome.detail.clone(),
                },
            );
        }
        outcome
    }

    async fn dispatch(&mut self, command: ConsoleCommand) -> Outcome {
        match command {
            ConsoleCommand::Empty => Outcome::new("noop", ""),
            ConsoleCommand::Help => Outcome::new("help", HELP_TEXT),
            ConsoleCommand::Quit => {
                self.sink.quit();
                let mut outcome = Outcome::new("quit", "session ending");
                outcome.quit = true;
                outcome
            }
            ConsoleCommand::Health => {
                let lines: Vec<String> = self
                    .sink
                    .health()
                    .into_iter()
                    .map(|(agent, health)| format!("{agent}: {health}"))
                    .collect();
                Outcome::new("health", lines.join("\n"))
            }
            ConsoleCommand::Focus(ids) => {
                if ids.is_empty() {
                    return Outcome::new("focus", "usage: focus <agent1> <agent2> ...");
                }
                let known = self.sink.roster_ids();
                let mut accepted = Vec::new();
                let mut unknown = Vec::new();
                for id in ids {
                    if known.contains(&id) {
                        self.focus.insert(id.clone());
                        accepted.push(id);
                    } else {
                        unknown.push(id);
                    }
                }
                let mut detail = format!("focused: {}", accepted.join(", "));
                if !unknown.is_empty() {
                    detail.push_str(&format!(" (unknown: {})", unknown.join(", ")));
                }
                Outcome::new("focus", detail)
            }
            ConsoleCommand::Unfocus(ids) => {
                if ids.is_empty() {
                    return Outcome::new("unfocus", "usage: unfocus <agent1> ... or 'all'");
                }
                if ids.iter().any(|id| id == "all") {
                    self.focus.clear();
                    return Outcome::new("unfocus", "focus cleared");
                }
                for id in &ids {
                    self.focus.remove(id);
                }
                Outcome::new(
                    "unfocus",
                    format!("{} agents still in focus", self.focus.len()),
                )
            }
            ConsoleCommand::Dm { to, text } => {
                if to.is_empty() || text.is_empty() {
                    return Outcome::new("dm", "usage: dm <agent> <text>");
                }
                if self.sink.direct(&to, &text).await {
                    Outcome::new("dm", format!("sent to {to}"))
                } else {
                    Outcome::new("dm", format!("unknown agent '{to}'"))
                }
            }
            ConsoleCommand::Group { name, text } => {
                if name.is_empty() || text.is_empty() {
                    return Outcome::new("group", "usage: group <name> <text>");
                }
                let Some(members) = self.groups.get(&name).cloned() else {
                    return Outcome::new("group", format!("unknown group '{name}'"));
                };
                self.sink.broadcast(Some(&members), &text).await;
                Outcome::new("group", format!("sent to {} ({} agents)", name, members.len()))
            }
            ConsoleCommand::Groups => {
                if self.groups.is_empty() {
                    return Outcome::new("groups", "no groups configured");
                }
                let mut names: Vec<_> = self
                    .groups
                    .iter()
                    .map(|(name, members)| format!("{name}: {}", members.join(", ")))
                    .collect();
                names.sort();
                Outcome::new("groups", names.join("\n"))
            }
            ConsoleCommand::Template { name, args } => {
                if name.is_empty() {
                    return Outcome::new("template", "usage: template <name> [args]");
                }
                let Some(body) = self.templates.get(&name).cloned() else {
                    return Outcome::new("template", format!("unknown template '{name}'"));
                };
                let expanded = expand_template(&body, &args);
                self.deliver_prompt(&expanded).await;
                Outcome::new("template", format!("sent: {expanded}"))
            }
            ConsoleCommand::Templates => {
                if self.templates.is_empty() {
                    return Outcome::new("templates", "no templates configured");
                }
                let mut names: Vec<_> = self.templates.keys().cloned().collect();
                names.sort();
                Outcome::new("templates", names.join(", "))
            }
            ConsoleCommand::Broadcast(text) => {
                self.deliver_prompt(&text).await;
                if self.focus.is_empty() {
                    Outcome::new("broadcast", "sent to all agents")
                } else {
                    Outcome::new(
                        "broadcast",
                        format!("sent to focused agents: {}", self.focused().join(", ")),
                    )
                }
            }
        }
    }

    /// Broadcast respecting the focus set.
    async fn deliver_prompt(&self, text: &str) {
        if self.focus.is_empty() {
            self.sink.broadcast(None, text).await;
        } else {
            let targets = self.focused();
            self.sink.broadcast(Some(&targets), text).await;
        }
    }
}

/// Substitute `[TOPIC]` with the first argument and `[SITUATION]` with
/// the rest. Missing arguments leave the placeholder in place.
fn expand_template(body: &str, args: &[String]) -> String {
    let mut out = body.to_string();
    if let Some(topic) = args.first() {
        out = out.replace(TOPIC_PLACEHOLDER, topic);
    }
    if args.len() > 1 {
        out = out.replace(SITUATION_PLACEHOLDER, &args[1..].join(" "));
    }
    out
}

const HELP_TEXT: &str = "\
health - roster health snapshot
focus <agent1> <agent2> ... - restrict prompts to specific agents
unfocus <agent1> ... | all - remove focus
dm <agent> <text> - private message to one agent
group <name> <text> - message every member of a group
groups - list configured groups
template <name> [args] - expand and send a prompt template
templates - list configured templates
help - this text
quit - end the session
anything else - broadcast prompt (focused agents only, if focus is set)";

// ─── Live sink ───────────────────────────────────────────────────────────

/// Production sink: prompts go out as bus messages, control verbs go to
/// the scheduler.
pub struct SchedulerSink {
    handle: SchedulerHandle,
    bus: Arc<Bus>,
}

impl SchedulerSink {
    pub fn new(handle: SchedulerHandle, bus: Arc<Bus>) -> Self {
        Self { handle, bus }
    }
}

#[async_trait]
impl CommandSink for SchedulerSink {
    async fn broadcast(&self, targets: Option<&[String]>, text: &str) {
        match targets {
            None => {
                self.bus.publish(
                    GLOBAL_TOPIC,
                    "user",
                    BusMessage::Direct {
                        from: "user".to_string(),
                        to: "*".to_string(),
                        text: text.to_string(),
                    },
                );
            }
            Some(targets) => {
                for to in targets {
                    self.bus.publish(
                        agent_topic(to),
                        "user",
                        BusMessage::Direct {
                            from: "user".to_string(),
                            to: to.clone(),
                            text: text.to_string(),
                        },
                    );
                }
            }
        }
    }

    async fn direct(&self, to: &str, text: &str) -> bool {
        if !self.handle.roster_ids().contains(&to.to_string()) {
            return false;
        }
        self.bus.publish(
            agent_topic(to),
            "user",
            BusMessage::Direct {
                from: "user".to_string(),
                to: to.to_string(),
                text: text.to_string(),
            },
        );
        true
    }

    fn health(&self) -> Vec<(String, AgentHealth)> {
        self.handle.health()
    }

    fn roster_ids(&self) -> Vec<String> {
        self.handle.roster_ids()
    }

    fn quit(&self) {
        self.handle.stop();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeSink {
        broadcasts: Mutex<Vec<(Option<Vec<String>>, String)>>,
        directs: Mutex<Vec<(String, String)>>,
        quit_called: Mutex<bool>,
        roster: Vec<String>,
    }

    impl FakeSink {
        fn with_roster(ids: &[&str]) -> Self {
            Self {
                roster: ids.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl CommandSink for FakeSink {
        async fn broadcast(&self, targets: Option<&[String]>, text: &str) {
            self.broadcasts
                .lock()
                .push((targets.map(|t| t.to_vec()), text.to_string()));
        }

        async fn direct(&self, to: &str, text: &str) -> bool {
            if !self.roster.contains(&to.to_string()) {
                return false;
            }
            self.directs.lock().push((to.to_string(), text.to_string()));
            true
        }

        fn health(&self) -> Vec<(String, AgentHealth)> {
            self.roster
                .iter()
                .map(|id| (id.clone(), AgentHealth::Healthy))
                .collect()
        }

        fn roster_ids(&self) -> Vec<String> {
            self.roster.clone()
        }

        fn quit(&self) {
            *self.quit_called.lock() = true;
        }
    }

    fn console_with(sink: Arc<FakeSink>) -> Console {
        let mut groups = HashMap::new();
        groups.insert("ops".to_string(), vec!["A".to_string(), "B".to_string()]);
        let mut templates = HashMap::new();
        templates.insert(
            "incident".to_string(),
            "Assess [TOPIC] given [SITUATION]".to_string(),
        );
        Console::new(sink, groups, templates)
    }

    #[test]
    fn parser_recognizes_commands_and_broadcasts() {
        assert_eq!(parse_line("health"), ConsoleCommand::Health);
        assert_eq!(
            parse_line("focus A B"),
            ConsoleCommand::Focus(vec!["A".into(), "B".into()])
        );
        assert_eq!(
            parse_line("dm A hello there"),
            ConsoleCommand::Dm {
                to: "A".into(),
                text: "hello there".into()
            }
        );
        assert_eq!(
            parse_line("template incident thermostat overheating badly"),
            ConsoleCommand::Template {
                name: "incident".into(),
                args: vec!["thermostat".into(), "overheating".into(), "badly".into()]
            }
        );
        assert_eq!(parse_line("quit"), ConsoleCommand::Quit);
        assert_eq!(
            parse_line("what is the plan?"),
            ConsoleCommand::Broadcast("what is the plan?".into())
        );
        assert_eq!(parse_line("   "), ConsoleCommand::Empty);
    }

    #[tokio::test]
    async fn broadcast_respects_focus() {
        let sink = Arc::new(FakeSink::with_roster(&["A", "B", "C"]));
        let mut console = console_with(Arc::clone(&sink));

        console.dispatch_line("hello everyone").await;
        console.dispatch_line("focus A C").await;
        console.dispatch_line("hello focused").await;

        let broadcasts = sink.broadcasts.lock();
        assert_eq!(broadcasts[0], (None, "hello everyone".to_string()));
        assert_eq!(
            broadcasts[1],
            (
                Some(vec!["A".to_string(), "C".to_string()]),
                "hello focused".to_string()
            )
        );
    }

    #[tokio::test]
    async fn unfocus_all_clears_focus() {
        let sink = Arc::new(FakeSink::with_roster(&["A", "B"]));
        let mut console = console_with(Arc::clone(&sink));

        console.dispatch_line("focus A B").await;
        assert_eq!(console.focused(), vec!["A", "B"]);
        console.dispatch_line("unfocus all").await;
        assert!(console.focused().is_empty());
    }

    #[tokio::test]
    async fn focus_rejects_unknown_agents() {
        let sink = Arc::new(FakeSink::with_roster(&["A"]));
        let mut console = console_with(Arc::clone(&sink));

        let outcome = console.dispatch_line("focus A Ghost").await;
        assert!(outcome.detail.contains("focused: A"));
        assert!(outcome.detail.contains("unknown: Ghost"));
        assert_eq!(console.focused(), vec!["A"]);
    }

    #[tokio::test]
    async fn dm_reports_unknown_agent() {
        let sink = Arc::new(FakeSink::with_roster(&["A"]));
        let mut console = console_with(Arc::clone(&sink));

        let ok = console.dispatch_line("dm A status?").await;
        assert_eq!(ok.detail, "sent to A");

        let bad = console.dispatch_line("dm Ghost status?").await;
        assert!(bad.detail.contains("unknown agent"));
        assert!(!bad.quit);
    }

    #[tokio::test]
    async fn group_routes_to_members() {
        let sink = Arc::new(FakeSink::with_roster(&["A", "B", "C"]));
        let mut console = console_with(Arc::clone(&sink));

        console.dispatch_line("group ops ship it").await;
        let broadcasts = sink.broadcasts.lock();
        assert_eq!(
            broadcasts[0],
            (
                Some(vec!["A".to_string(), "B".to_string()]),
                "ship it".to_string()
            )
        );
    }

    #[tokio::test]
    async fn template_expands_placeholders() {
        let sink = Arc::new(FakeSink::with_roster(&["A"]));
        let mut console = console_with(Arc::clone(&sink));

        console
            .dispatch_line("template incident thermostat stuck at 90F")
            .await;
        let broadcasts = sink.broadcasts.lock();
        assert_eq!(broadcasts[0].1, "Assess thermostat given stuck at 90F");
    }

    #[tokio::test]
    async fn quit_flags_outcome_and_sink() {
        let sink = Arc::new(FakeSink::with_roster(&[]));
        let mut console = console_with(Arc::clone(&sink));

        let outcome = console.dispatch_line("quit").await;
        assert!(outcome.quit);
        assert!(*sink.quit_called.lock());
    }

    #[tokio::test]
    async fn outcomes_are_published_on_the_main_topic() {
        let bus = Bus::new().into_arc();
        let mut listener = bus.handle("listener");
        let sink = Arc::new(FakeSink::with_roster(&["A"]));
        let mut console = console_with(Arc::clone(&sink)).with_bus(Arc::clone(&bus));

        console.dispatch_line("health").await;
        let env = listener.recv_topic(GLOBAL_TOPIC).await.unwrap();
        match env.message {
            BusMessage::CommandOutcome { command, .. } => assert_eq!(command, "health"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
