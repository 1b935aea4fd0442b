//! Interactive voting session: command parsing, dispatch and rendering.

use std::fmt::Write as _;

use anyhow::{Result, bail};
use battlevote_sdk::items::{ItemCard, ItemClient};
use battlevote_sdk::session::BattleSession;
use battlevote_sdk::types::{BattleState, ItemId};
use battlevote_sdk::{BattleKey, VotingEngine};

pub const HELP: &str = "\
Commands:
  vote <id>          Vote for an item in the current battle
  random             Start a new random battle
  battle <id> <id>…  Switch to a battle between the given items
  items              Show details of the battle's items
  show               Show the current tally
  refresh            Re-read votes cast in other sessions
  connect            Reconnect to the relay
  help               This help
  quit               Exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Vote(ItemId),
    Random,
    Battle(Vec<ItemId>),
    Items,
    Show,
    Refresh,
    Connect,
    Help,
    Quit,
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let verb = verb.trim_start_matches('/').to_ascii_lowercase();
    let args: Vec<&str> = words.collect();

    let cmd = match (verb.as_str(), args.as_slice()) {
        ("vote" | "v", [id]) => Command::Vote(parse_id(id)?),
        ("vote" | "v", _) => bail!("usage: vote <id>"),
        ("random" | "r", []) => Command::Random,
        ("battle" | "b", ids) if !ids.is_empty() => {
            Command::Battle(ids.iter().map(|id| parse_id(id)).collect::<Result<_>>()?)
        }
        ("battle" | "b", _) => bail!("usage: battle <id> <id>…"),
        ("items" | "i", []) => Command::Items,
        ("show" | "s", []) => Command::Show,
        ("refresh", []) => Command::Refresh,
        ("connect", []) => Command::Connect,
        ("help" | "?", _) => Command::Help,
        ("quit" | "exit" | "q", _) => Command::Quit,
        (other, _) => bail!("unknown command: {other} (try `help`)"),
    };
    Ok(Some(cmd))
}

fn parse_id(s: &str) -> Result<ItemId> {
    let s = s.trim_start_matches('#');
    match s.parse::<ItemId>() {
        Ok(id) if id > 0 => Ok(id),
        _ => bail!("not an item id: {s}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct App {
    pub session: BattleSession,
    pub engine: VotingEngine,
    pub items: ItemClient,
}

impl App {
    /// Run one command, printing its outcome. Only I/O failures are errors.
    pub async fn execute(&mut self, cmd: Command) -> Result<Flow> {
        match cmd {
            Command::Vote(id) => {
                if let Err(e) = self.engine.cast_vote(id) {
                    println!("Cannot vote: {e}");
                }
            }
            Command::Random => match self.session.start_random_battle(&mut rand::thread_rng()) {
                Ok(key) => self.enter(key),
                Err(e) => println!("Cannot start a battle: {e}"),
            },
            Command::Battle(ids) => match self.session.set_battle(ids) {
                Ok(key) => self.enter(key),
                Err(e) => println!("Cannot switch battle: {e}"),
            },
            Command::Items => match self.items.fetch_all(self.session.item_ids()).await {
                Ok(cards) => {
                    for card in &cards {
                        println!("{}", render_card(card));
                    }
                }
                Err(e) => println!("Failed to load items: {e}"),
            },
            Command::Show => self.show(),
            Command::Refresh => {
                self.engine.refresh_from_storage();
                self.show();
            }
            Command::Connect => match self.engine.channel().connect().await {
                Ok(()) => println!("Connected."),
                Err(e) => println!("Connection failed: {e}"),
            },
            Command::Help => println!("{HELP}"),
            Command::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    fn enter(&self, key: BattleKey) {
        self.engine.initialize(key);
        self.show();
    }

    pub fn show(&self) {
        let status = if self.engine.channel().is_connected() {
            None
        } else {
            Some(
                self.engine
                    .channel()
                    .connection_error()
                    .unwrap_or_else(|| "not connected".to_string()),
            )
        };
        print!(
            "{}",
            render_state(&self.engine.battle_key(), &self.engine.state(), status.as_deref())
        );
    }
}

const BAR_WIDTH: usize = 24;

/// Tally table for the terminal.
pub fn render_state(key: &BattleKey, state: &BattleState, offline: Option<&str>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Battle {key} ({} votes)", state.total_votes);
    for (id, tally) in &state.vote_stats {
        let filled = (tally.percentage / 100.0 * BAR_WIDTH as f64).round() as usize;
        let bar = format!("{}{}", "█".repeat(filled), "·".repeat(BAR_WIDTH - filled.min(BAR_WIDTH)));
        let mut marks = String::new();
        if state.winners.contains(id) {
            marks.push_str(if state.is_tied() { "  tied" } else { "  leader" });
        }
        if state.user_vote == Some(*id) {
            marks.push_str("  (your vote)");
        }
        let _ = writeln!(
            out,
            "  #{id:<5} {:>5} votes {:>6.1}%  {bar}{marks}",
            tally.votes, tally.percentage
        );
    }
    if state.has_voted {
        let _ = writeln!(out, "  You have voted in this battle.");
    }
    if let Some(reason) = offline {
        let _ = writeln!(out, "  Voting unavailable: {reason}");
    }
    out
}

pub fn render_card(card: &ItemCard) -> String {
    let exp = card
        .base_experience
        .map(|e| format!(", {e} base exp"))
        .unwrap_or_default();
    format!(
        "#{} {}: {}, {}{exp}",
        card.id, card.name, card.height, card.weight
    )
}
