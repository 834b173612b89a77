use std::io::{self, IsTerminal, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::broadcast::Broadcaster;
use crate::constants::COMMAND_HISTORY_CAP;
use crate::dispatch;
use crate::state::{SharedState, CONSOLE_EXECUTOR};
use crate::types::{AdminLevel, ItemKind, WorldPos};

const PROMPT: &str = "cmd> ";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
}

impl CommandResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Whitespace-separated tokens with optional double-quoted spans.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in line.chars() {
        match ch {
            '"' => {
                if in_quotes {
                    tokens.push(std::mem::take(&mut current));
                }
                in_quotes = !in_quotes;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Line-oriented command interpreter. Commands mutate the shared state
/// through the same privileged engine/registry operations the dispatcher
/// uses; every executed line lands in the bounded history.
pub struct Console {
    state: SharedState,
    broadcaster: Arc<Broadcaster>,
    history: Vec<String>,
}

impl Console {
    pub fn new(state: SharedState, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            state,
            broadcaster,
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub async fn execute(&mut self, line: &str, executor: &str) -> CommandResult {
        self.history.push(format!("[{executor}] {line}"));
        if self.history.len() > COMMAND_HISTORY_CAP {
            self.history.remove(0);
        }

        let tokens = tokenize(line);
        let Some(command) = tokens.first() else {
            return CommandResult::fail("Empty command");
        };
        let args = &tokens[1..];

        match command.to_ascii_lowercase().as_str() {
            "give" => self.cmd_give(args, executor).await,
            "tp" => self.cmd_teleport(args, executor).await,
            "kick" => self.cmd_kick(args, executor).await,
            "kill" => self.cmd_kill(args, executor).await,
            "clear" => self.cmd_reset(args, executor, "Game state cleared and reset").await,
            "coin" => self.cmd_coin(args, executor).await,
            "system" => self.cmd_system(args, executor).await,
            "admin" => self.cmd_admin(args, executor).await,
            "players" => self.cmd_players(executor).await,
            "restart" => {
                self.cmd_reset(
                    args,
                    executor,
                    "Game restarted - all players reset to start position",
                )
                .await
            }
            "help" => CommandResult::ok(HELP_TEXT),
            other => CommandResult::fail(format!("Unknown command: {other}")),
        }
    }

    async fn permitted(&self, executor: &str, required: AdminLevel, command: &str) -> Option<CommandResult> {
        let guard = self.state.lock().await;
        if guard.admins.permits(executor, required) {
            None
        } else {
            Some(CommandResult::fail(format!(
                "Insufficient permissions for {command} command"
            )))
        }
    }

    async fn cmd_give(&self, args: &[String], executor: &str) -> CommandResult {
        if let Some(denied) = self.permitted(executor, AdminLevel::Admin, "give").await {
            return denied;
        }
        if args.len() < 2 {
            return CommandResult::fail("Usage: give <player> <item> [count]");
        }
        let player_id = &args[0];
        let Some(kind) = ItemKind::parse(&args[1]) else {
            return CommandResult::fail(format!("Unknown item: {}", args[1]));
        };
        let count: u32 = match args.get(2).map(|raw| raw.parse()).unwrap_or(Ok(1)) {
            Ok(count) => count,
            Err(_) => return CommandResult::fail("Count must be a positive number"),
        };

        let mut guard = self.state.lock().await;
        if !guard.registry.is_online(player_id) {
            return CommandResult::fail(format!("Invalid player: {player_id}"));
        }
        if kind == ItemKind::Coin {
            guard.registry.add_total_coins(player_id, count as i64);
            return CommandResult::ok(format!("Gave {count} coins to player {player_id}"));
        }
        match guard.engine.give_item(player_id, kind, count) {
            Ok(_) => CommandResult::ok(format!(
                "Gave {count} {} to player {player_id}",
                kind.wire_name()
            )),
            Err(error) => CommandResult::fail(format!(
                "Failed to give item to player {player_id}: {error}"
            )),
        }
    }

    async fn cmd_teleport(&self, args: &[String], executor: &str) -> CommandResult {
        if let Some(denied) = self.permitted(executor, AdminLevel::Admin, "tp").await {
            return denied;
        }
        if args.len() < 4 {
            return CommandResult::fail("Usage: tp <player> <x> <y> <z>");
        }
        let player_id = &args[0];
        let coords: Vec<f32> = args[1..4]
            .iter()
            .filter_map(|raw| raw.parse().ok())
            .collect();
        if coords.len() != 3 {
            return CommandResult::fail("Invalid position coordinates");
        }
        let pos = WorldPos::new(coords[0], coords[1], coords[2]);

        let mut guard = self.state.lock().await;
        if !guard.registry.is_online(player_id) {
            return CommandResult::fail(format!("Invalid player: {player_id}"));
        }
        match guard.engine.teleport(player_id, pos) {
            Ok(()) => CommandResult::ok(format!(
                "Teleported player {player_id} to ({}, {}, {})",
                pos.x, pos.y, pos.z
            )),
            Err(_) => CommandResult::fail(format!(
                "Failed to teleport player {player_id} - invalid position"
            )),
        }
    }

    async fn cmd_kick(&self, args: &[String], executor: &str) -> CommandResult {
        if let Some(denied) = self.permitted(executor, AdminLevel::Moderator, "kick").await {
            return denied;
        }
        if args.is_empty() {
            return CommandResult::fail("Usage: kick <player> [reason]");
        }
        let player_id = &args[0];
        let reason = args
            .get(1)
            .cloned()
            .unwrap_or_else(|| "No reason specified".to_string());

        let mut guard = self.state.lock().await;
        if !guard.registry.is_online(player_id) {
            return CommandResult::fail(format!("Invalid player: {player_id}"));
        }
        guard.registry.logout(player_id);
        if let Some(conn_id) = guard.sessions.conn_for_player(player_id) {
            self.broadcaster.close(conn_id, 1000, &reason);
        }
        CommandResult::ok(format!("Kicked player {player_id}: {reason}"))
    }

    async fn cmd_kill(&self, args: &[String], executor: &str) -> CommandResult {
        if let Some(denied) = self.permitted(executor, AdminLevel::Moderator, "kill").await {
            return denied;
        }
        if args.is_empty() {
            return CommandResult::fail("Usage: kill <player>");
        }
        let player_id = &args[0];

        let mut guard = self.state.lock().await;
        if !guard.registry.is_online(player_id) {
            return CommandResult::fail(format!("Invalid player: {player_id}"));
        }
        match guard.engine.kill(player_id) {
            Ok(_respawn) => {
                self.broadcaster
                    .broadcast(&dispatch::game_state_message(&guard), crate::broadcast::QueuePolicy::DropOnFull);
                CommandResult::ok(format!("Killed player {player_id}"))
            }
            Err(error) => {
                CommandResult::fail(format!("Failed to kill player {player_id}: {error}"))
            }
        }
    }

    async fn cmd_reset(
        &self,
        _args: &[String],
        executor: &str,
        success_message: &str,
    ) -> CommandResult {
        if let Some(denied) = self.permitted(executor, AdminLevel::SuperAdmin, "restart").await {
            return denied;
        }
        let mut guard = self.state.lock().await;
        guard.engine.reset();
        self.broadcaster.broadcast(
            &dispatch::maze_data_message(&guard),
            crate::broadcast::QueuePolicy::DisconnectOnFull,
        );
        self.broadcaster.broadcast(
            &dispatch::game_state_message(&guard),
            crate::broadcast::QueuePolicy::DisconnectOnFull,
        );
        CommandResult::ok(success_message)
    }

    async fn cmd_coin(&self, args: &[String], executor: &str) -> CommandResult {
        if let Some(denied) = self.permitted(executor, AdminLevel::Admin, "coin").await {
            return denied;
        }
        if args.len() < 2 {
            return CommandResult::fail("Usage: coin <player> <amount>");
        }
        let player_id = &args[0];
        let amount: i32 = match args[1].parse() {
            Ok(amount) => amount,
            Err(_) => return CommandResult::fail("Amount must be a number"),
        };

        let mut guard = self.state.lock().await;
        if !guard.registry.is_online(player_id) {
            return CommandResult::fail(format!("Invalid player: {player_id}"));
        }
        match guard.engine.set_coins(player_id, amount) {
            Ok(()) => {
                guard.registry.set_total_coins(player_id, amount as i64);
                CommandResult::ok(format!("Set coins to {amount} for player {player_id}"))
            }
            Err(error) => CommandResult::fail(format!(
                "Failed to set coins for player {player_id}: {error}"
            )),
        }
    }

    async fn cmd_system(&self, args: &[String], executor: &str) -> CommandResult {
        if let Some(denied) = self.permitted(executor, AdminLevel::Moderator, "system").await {
            return denied;
        }
        if args.is_empty() {
            return CommandResult::fail("Usage: system <message>");
        }
        let message = args.join(" ");
        dispatch::broadcast_system_message(&self.broadcaster, &message);
        CommandResult::ok(format!("System message sent: {message}"))
    }

    async fn cmd_admin(&self, args: &[String], executor: &str) -> CommandResult {
        if let Some(denied) = self.permitted(executor, AdminLevel::SuperAdmin, "admin").await {
            return denied;
        }
        if args.len() < 2 {
            return CommandResult::fail("Usage: admin <player> <level>");
        }
        let player_id = &args[0];
        let level = match args[1].parse::<i64>().ok().and_then(AdminLevel::from_index) {
            Some(level) => level,
            None => return CommandResult::fail("Admin level must be 0-3"),
        };

        let mut guard = self.state.lock().await;
        guard.admins.set(player_id, level);
        if level == AdminLevel::None {
            CommandResult::ok(format!("Removed admin privileges from {player_id}"))
        } else {
            CommandResult::ok(format!(
                "Set admin level {} for {player_id}",
                args[1]
            ))
        }
    }

    async fn cmd_players(&self, executor: &str) -> CommandResult {
        if let Some(denied) = self.permitted(executor, AdminLevel::Moderator, "players").await {
            return denied;
        }
        let guard = self.state.lock().await;
        let online = guard.registry.online();
        if online.is_empty() {
            return CommandResult::ok("No players online");
        }
        let mut listing = format!("Online players ({}):\n", online.len());
        for player_id in online {
            if let Some(record) = guard.registry.get(player_id) {
                listing.push_str(&format!(
                    "  {player_id} - Coins: {}, Games: {}\n",
                    record.total_coins, record.games_played
                ));
            }
        }
        CommandResult::ok(listing.trim_end().to_string())
    }
}

const HELP_TEXT: &str = "Available commands:\n\
  give <player> <item> [count]    - Give item to player\n\
  tp <player> <x> <y> <z>         - Teleport player\n\
  kick <player> [reason]          - Kick player from game\n\
  kill <player>                   - Kill player\n\
  clear                           - Clear all game data\n\
  coin <player> <amount>          - Set player coins\n\
  system <message>                - Send system message\n\
  admin <player> <level>          - Set admin level\n\
  players                         - List online players\n\
  restart                         - Restart game\n\
  help                            - Show this help";

/// Shared terminal state: while a prompt line is being edited, asynchronous
/// log output is redrawn above it so the prompt survives intact.
pub struct PromptSink {
    inner: Mutex<PromptState>,
}

struct PromptState {
    prompt_active: bool,
    raw_mode: bool,
    buffer: String,
}

impl PromptSink {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PromptState {
                prompt_active: false,
                raw_mode: false,
                buffer: String::new(),
            }),
        }
    }

    fn set_raw(&self, raw: bool) {
        self.inner.lock().expect("prompt lock").raw_mode = raw;
    }

    fn show_prompt(&self, buffer: &str) {
        let mut state = self.inner.lock().expect("prompt lock");
        state.prompt_active = true;
        state.buffer = buffer.to_string();
        let mut stdout = io::stdout().lock();
        let _ = write!(stdout, "\r\x1b[K{PROMPT}{buffer}");
        let _ = stdout.flush();
    }

    fn hide_prompt(&self) {
        let mut state = self.inner.lock().expect("prompt lock");
        state.prompt_active = false;
        state.buffer.clear();
        let mut stdout = io::stdout().lock();
        let _ = write!(stdout, "\r\x1b[K");
        let _ = stdout.flush();
    }

    /// Log line entry point used by the tracing console writer.
    pub fn write_log(&self, bytes: &[u8]) {
        let state = self.inner.lock().expect("prompt lock");
        let mut stdout = io::stdout().lock();
        if state.prompt_active {
            let _ = write!(stdout, "\r\x1b[K");
        }
        if state.raw_mode {
            // raw terminals need explicit carriage returns
            let text = String::from_utf8_lossy(bytes);
            let _ = write!(stdout, "{}", text.replace('\n', "\r\n"));
        } else {
            let _ = stdout.write_all(bytes);
        }
        if state.prompt_active {
            let _ = write!(stdout, "{PROMPT}{}", state.buffer);
        }
        let _ = stdout.flush();
    }

    fn print_result(&self, result: &CommandResult) {
        let tag = if result.success {
            "\x1b[1;32m[ok]\x1b[0m"
        } else {
            "\x1b[1;31m[failed]\x1b[0m"
        };
        self.write_log(format!("{tag} {}\n", result.message).as_bytes());
    }
}

impl Default for PromptSink {
    fn default() -> Self {
        Self::new()
    }
}

/// `tracing-subscriber` writer that routes console log output through the
/// prompt sink.
#[derive(Clone)]
pub struct PromptWriter {
    sink: Arc<PromptSink>,
}

impl PromptWriter {
    pub fn new(sink: Arc<PromptSink>) -> Self {
        Self { sink }
    }
}

impl io::Write for PromptWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink.write_log(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for PromptWriter {
    type Writer = PromptWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Interactive console driver. A blocking thread owns the terminal in
/// non-canonical mode, polling at 50 ms so the shutdown flag interrupts an
/// in-progress read promptly; completed lines are executed on the runtime.
/// `quit`/`exit` ask the supervisor to shut the server down.
pub async fn run_console(
    mut console: Console,
    sink: Arc<PromptSink>,
    shutdown: watch::Receiver<bool>,
    shutdown_request: mpsc::Sender<()>,
) {
    let (line_tx, mut line_rx) = mpsc::channel::<String>(16);

    let input_sink = sink.clone();
    let input_shutdown = shutdown.clone();
    let reader = tokio::task::spawn_blocking(move || {
        if io::stdin().is_terminal() {
            raw_input_loop(input_sink, input_shutdown, line_tx);
        } else {
            piped_input_loop(input_shutdown, line_tx);
        }
    });

    while let Some(line) = line_rx.recv().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "quit" || trimmed == "exit" {
            info!("console requested shutdown");
            let _ = shutdown_request.send(()).await;
            break;
        }
        let result = console.execute(trimmed, CONSOLE_EXECUTOR).await;
        sink.print_result(&result);
    }

    // bounded drain: give the input thread a moment, then detach it
    if tokio::time::timeout(Duration::from_millis(500), reader)
        .await
        .is_err()
    {
        warn!("console input thread detached during shutdown");
    }
}

fn raw_input_loop(
    sink: Arc<PromptSink>,
    shutdown: watch::Receiver<bool>,
    line_tx: mpsc::Sender<String>,
) {
    if terminal::enable_raw_mode().is_err() {
        piped_input_loop(shutdown, line_tx);
        return;
    }
    sink.set_raw(true);
    let mut buffer = String::new();
    sink.show_prompt(&buffer);

    loop {
        if *shutdown.borrow() {
            break;
        }
        match event::poll(Duration::from_millis(50)) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(_) => break,
        }
        let Ok(Event::Key(KeyEvent {
            code, modifiers, ..
        })) = event::read()
        else {
            continue;
        };
        match code {
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
                let _ = line_tx.blocking_send("quit".to_string());
                break;
            }
            KeyCode::Char(c) => {
                buffer.push(c);
                sink.show_prompt(&buffer);
            }
            KeyCode::Backspace => {
                buffer.pop();
                sink.show_prompt(&buffer);
            }
            KeyCode::Enter => {
                sink.hide_prompt();
                sink.write_log(format!("{PROMPT}{buffer}\n").as_bytes());
                let line = std::mem::take(&mut buffer);
                if line_tx.blocking_send(line).is_err() {
                    break;
                }
                sink.show_prompt(&buffer);
            }
            _ => {}
        }
    }

    sink.hide_prompt();
    sink.set_raw(false);
    let _ = terminal::disable_raw_mode();
}

/// Non-tty stdin (service managers, tests): plain line reads, still
/// observing the shutdown flag between lines.
fn piped_input_loop(shutdown: watch::Receiver<bool>, line_tx: mpsc::Sender<String>) {
    use std::io::BufRead;
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        if *shutdown.borrow() {
            break;
        }
        match line {
            Ok(line) => {
                if line_tx.blocking_send(line).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}
