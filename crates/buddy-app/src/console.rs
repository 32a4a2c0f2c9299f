//! Console stand-in for the chat platform.
//!
//! Each line on stdin is a command. Job messages are printed as lines tagged
//! with the message they belong to, so progress edits, prompts and results
//! can be followed per job.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use buddy_bridge::{
    ConfirmationGate, DeliveryError, ImportJob, JobDispatcher, JobHandle, Payload, Respondable,
};
use buddy_core::config::ImportSettings;
use buddy_core::types::{JobKind, RequestId, UserId};
use tracing::{debug, warn};
use uuid::Uuid;

pub const HELP: &str = "\
Commands:
  add_pack <path>                 import a pack folder
  add_song <path>                 import a song folder
  post <channel-id> <file>...     post attachments to a channel
  allow <request-id> [as <user>]  overwrite the existing item
  deny <request-id> [as <user>]   keep the existing item
  pending                         list open overwrite prompts
  status                          show queue depths
  help                            show this text
  quit                            drain the queues and exit";

// =============================================================================
// Output
// =============================================================================

/// Where rendered lines go: stdout, or a buffer in tests.
#[derive(Clone, Default)]
pub struct ConsoleOutput {
    captured: Option<Arc<Mutex<Vec<String>>>>,
}

impl ConsoleOutput {
    pub fn stdout() -> Self {
        Self { captured: None }
    }

    pub fn capture() -> Self {
        Self {
            captured: Some(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    pub fn line(&self, text: impl Into<String>) {
        let text = text.into();
        match &self.captured {
            Some(lines) => lines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(text),
            None => println!("{}", text),
        }
    }

    /// Lines written so far. Always empty for stdout.
    pub fn lines(&self) -> Vec<String> {
        match &self.captured {
            Some(lines) => lines.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            None => Vec::new(),
        }
    }
}

/// One-line rendering of a payload.
pub fn render(payload: &Payload) -> String {
    let title = payload.title();
    match payload {
        Payload::Thinking => title,
        Payload::Cancelled => format!("{} - Keeping original item.", title),
        Payload::Progress { text } => format!("{} {}", title, text.trim()),
        Payload::OverwritePrompt {
            request_id,
            new,
            existing,
            user,
            expires_at,
            ..
        } => format!(
            "{} {} -> {} (only {} may answer `allow {}` / `deny {}` before {})",
            title,
            new.path.display(),
            existing.path.display(),
            user.mention(),
            request_id,
            request_id,
            expires_at.format("%H:%M:%S")
        ),
        Payload::Error { message } => format!("{}: {}", title, message),
        Payload::PackAdded {
            course_count,
            added_by,
            ..
        } => format!(
            "{} ({} courses), added by {}",
            title,
            course_count,
            added_by.mention()
        ),
        Payload::SongAdded { added_by, .. } => {
            format!("{}, added by {}", title, added_by.mention())
        }
    }
}

// =============================================================================
// Respondables
// =============================================================================

/// Reply to a command the user typed. Deletable once the job succeeds.
pub struct ConsoleInteraction {
    label: String,
    user: UserId,
    output: ConsoleOutput,
    deleted: AtomicBool,
}

impl ConsoleInteraction {
    pub fn new(label: impl Into<String>, user: UserId, output: ConsoleOutput) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            user,
            output,
            deleted: AtomicBool::new(false),
        })
    }

    fn post(&self, text: &str) -> Result<(), DeliveryError> {
        if self.deleted.load(Ordering::SeqCst) {
            return Err(DeliveryError::Gone);
        }
        self.output.line(format!("[{}] {}", self.label, text));
        Ok(())
    }
}

#[async_trait]
impl Respondable for ConsoleInteraction {
    fn user(&self) -> &UserId {
        &self.user
    }

    async fn defer(&self) -> Result<(), DeliveryError> {
        self.post(&render(&Payload::Thinking))
    }

    async fn edit(&self, payload: Payload) -> Result<(), DeliveryError> {
        self.post(&render(&payload))
    }

    async fn clear_prompt(&self) -> Result<(), DeliveryError> {
        debug!(label = %self.label, "Prompt controls removed");
        Ok(())
    }

    async fn delete_or_replace(&self) -> Result<(), DeliveryError> {
        self.post("(message deleted)")?;
        self.deleted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_final(&self, payload: Payload) -> Result<(), DeliveryError> {
        // A new message, so it does not care whether the reply was deleted.
        self.output
            .line(format!("[{}] {}", self.label, render(&payload)));
        Ok(())
    }
}

/// The bot's reply to a message posted in a watched channel.
///
/// The reply is created on `defer` and edited in place afterwards; it is
/// blanked rather than deleted.
pub struct ConsoleMessage {
    label: String,
    user: UserId,
    output: ConsoleOutput,
    replied: AtomicBool,
}

impl ConsoleMessage {
    pub fn new(label: impl Into<String>, user: UserId, output: ConsoleOutput) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            user,
            output,
            replied: AtomicBool::new(false),
        })
    }

    fn post(&self, text: &str) -> Result<(), DeliveryError> {
        if !self.replied.load(Ordering::SeqCst) {
            return Err(DeliveryError::Platform(
                "no reply to edit; defer was not called".to_string(),
            ));
        }
        self.output.line(format!("[{}] {}", self.label, text));
        Ok(())
    }
}

#[async_trait]
impl Respondable for ConsoleMessage {
    fn user(&self) -> &UserId {
        &self.user
    }

    async fn defer(&self) -> Result<(), DeliveryError> {
        self.replied.store(true, Ordering::SeqCst);
        self.post(&render(&Payload::Thinking))
    }

    async fn edit(&self, payload: Payload) -> Result<(), DeliveryError> {
        self.post(&render(&payload))
    }

    async fn clear_prompt(&self) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn delete_or_replace(&self) -> Result<(), DeliveryError> {
        self.post("")
    }

    async fn send_final(&self, payload: Payload) -> Result<(), DeliveryError> {
        self.post(&render(&payload))
    }
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AddPack(String),
    AddSong(String),
    Post { channel: u64, attachments: Vec<String> },
    Allow { request: RequestId, actor: Option<UserId> },
    Deny { request: RequestId, actor: Option<UserId> },
    Pending,
    Status,
    Help,
    Quit,
}

/// Parse one input line. Blank lines parse to `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word {
        "add_pack" | "add_song" => {
            if rest.is_empty() {
                return Err(format!("Usage: {} <path>", word));
            }
            if word == "add_pack" {
                Command::AddPack(rest.to_string())
            } else {
                Command::AddSong(rest.to_string())
            }
        }
        "post" => {
            let mut parts = rest.split_whitespace();
            let channel = parts
                .next()
                .ok_or("Usage: post <channel-id> <file>...")?
                .parse::<u64>()
                .map_err(|_| "Channel id must be a number".to_string())?;
            Command::Post {
                channel,
                attachments: parts.map(str::to_string).collect(),
            }
        }
        "allow" | "deny" => {
            let (request, actor) = parse_answer(rest)?;
            if word == "allow" {
                Command::Allow { request, actor }
            } else {
                Command::Deny { request, actor }
            }
        }
        "pending" => Command::Pending,
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("Unknown command: {} (try `help`)", other)),
    };
    Ok(Some(command))
}

/// `<request-id> [as <user>]`
fn parse_answer(rest: &str) -> Result<(RequestId, Option<UserId>), String> {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let (id, actor) = match parts.as_slice() {
        [id] => (*id, None),
        [id, "as", user] => (*id, Some(UserId::new(*user))),
        _ => return Err("Usage: allow|deny <request-id> [as <user>]".to_string()),
    };
    let uuid = Uuid::parse_str(id).map_err(|_| format!("Not a request id: {}", id))?;
    Ok((RequestId(uuid), actor))
}

// =============================================================================
// Session
// =============================================================================

/// What the input loop should do after a command.
pub enum Flow {
    Continue,
    Submitted(Vec<JobHandle>),
    Quit,
}

/// Command handling for one console user.
pub struct Session {
    dispatcher: Option<JobDispatcher>,
    settings: Option<ImportSettings>,
    gate: Arc<ConfirmationGate>,
    user: UserId,
    output: ConsoleOutput,
    next_label: AtomicUsize,
}

impl Session {
    /// `dispatcher` and `settings` are `None` when the import subsystem is
    /// disabled; every other command keeps working.
    pub fn new(
        dispatcher: Option<JobDispatcher>,
        settings: Option<ImportSettings>,
        gate: Arc<ConfirmationGate>,
        user: UserId,
        output: ConsoleOutput,
    ) -> Self {
        Self {
            dispatcher,
            settings,
            gate,
            user,
            output,
            next_label: AtomicUsize::new(1),
        }
    }

    /// Give back the dispatcher so the caller can drain it.
    pub fn into_dispatcher(self) -> Option<JobDispatcher> {
        self.dispatcher
    }

    fn label(&self) -> String {
        format!("#{}", self.next_label.fetch_add(1, Ordering::SeqCst))
    }

    pub async fn handle_line(&self, line: &str) -> Flow {
        match parse_command(line) {
            Ok(Some(command)) => self.execute(command).await,
            Ok(None) => Flow::Continue,
            Err(message) => {
                self.output.line(message);
                Flow::Continue
            }
        }
    }

    pub async fn execute(&self, command: Command) -> Flow {
        match command {
            Command::AddPack(source) => self.add(JobKind::Pack, source).await,
            Command::AddSong(source) => self.add(JobKind::Song, source).await,
            Command::Post {
                channel,
                attachments,
            } => self.post(channel, attachments).await,
            Command::Allow { request, actor } => {
                self.answer(request, actor, true);
                Flow::Continue
            }
            Command::Deny { request, actor } => {
                self.answer(request, actor, false);
                Flow::Continue
            }
            Command::Pending => {
                let ids = self.gate.pending_ids();
                if ids.is_empty() {
                    self.output.line("No open overwrite prompts");
                }
                for id in ids {
                    if let Some(request) = self.gate.get(id) {
                        self.output.line(format!(
                            "{} {} {} for {}",
                            id,
                            request.kind,
                            request.new.name,
                            request.user.mention()
                        ));
                    }
                }
                Flow::Continue
            }
            Command::Status => {
                match &self.dispatcher {
                    Some(dispatcher) => {
                        for kind in JobKind::ALL {
                            self.output.line(format!(
                                "{}: {} waiting, {} in flight",
                                kind,
                                dispatcher.queue_len(kind),
                                dispatcher.in_flight(kind)
                            ));
                        }
                    }
                    None => self.output.line("Import is disabled"),
                }
                Flow::Continue
            }
            Command::Help => {
                self.output.line(HELP);
                Flow::Continue
            }
            Command::Quit => Flow::Quit,
        }
    }

    /// Command form: reply with an interaction, defer, then submit.
    async fn add(&self, kind: JobKind, source: String) -> Flow {
        let (Some(dispatcher), Some(settings)) = (&self.dispatcher, &self.settings) else {
            self.output
                .line("Import is disabled; check the [import] settings");
            return Flow::Continue;
        };
        let respondable = ConsoleInteraction::new(self.label(), self.user.clone(), self.output.clone());
        if let Err(e) = respondable.defer().await {
            warn!(error = %e, "Failed to acknowledge command");
        }
        let job = build_job(kind, source, settings, respondable.clone());
        match submit(dispatcher, job, respondable.as_ref()).await {
            Some(handle) => Flow::Submitted(vec![handle]),
            None => Flow::Continue,
        }
    }

    /// Passive form: every `.zip` attachment in the watched channel becomes a
    /// song job with its own reply message.
    async fn post(&self, channel: u64, attachments: Vec<String>) -> Flow {
        let (Some(dispatcher), Some(settings)) = (&self.dispatcher, &self.settings) else {
            return Flow::Continue;
        };
        if settings.add_song_channel_id != Some(channel) {
            debug!(channel, "Message outside the add-song channel ignored");
            return Flow::Continue;
        }

        let mut handles = Vec::new();
        for attachment in attachments.into_iter().filter(|a| is_zip(a)) {
            let respondable =
                ConsoleMessage::new(self.label(), self.user.clone(), self.output.clone());
            if let Err(e) = respondable.defer().await {
                warn!(error = %e, "Failed to reply to message");
            }
            let job = build_job(JobKind::Song, attachment, settings, respondable.clone());
            if let Some(handle) = submit(dispatcher, job, respondable.as_ref()).await {
                handles.push(handle);
            }
        }
        Flow::Submitted(handles)
    }

    fn answer(&self, request: RequestId, actor: Option<UserId>, allow: bool) {
        let actor = actor.unwrap_or_else(|| self.user.clone());
        let result = if allow {
            self.gate.approve(request, &actor)
        } else {
            self.gate.deny(request, &actor)
        };
        match result {
            Ok(outcome) => self.output.line(format!("{}: {}", request, outcome)),
            Err(e) => self.output.line(e.to_string()),
        }
    }
}

fn is_zip(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".zip")
}

fn build_job(
    kind: JobKind,
    source: String,
    settings: &ImportSettings,
    respondable: Arc<dyn Respondable>,
) -> ImportJob {
    match kind {
        JobKind::Pack => ImportJob::pack(
            source,
            settings.packs.clone(),
            settings.courses.clone(),
            respondable,
        ),
        JobKind::Song => ImportJob::song(
            source,
            settings.singles.clone(),
            settings.cache.clone(),
            respondable,
        ),
    }
}

async fn submit(
    dispatcher: &JobDispatcher,
    job: ImportJob,
    respondable: &dyn Respondable,
) -> Option<JobHandle> {
    match dispatcher.submit(job) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Job rejected");
            let payload = Payload::Error {
                message: e.to_string(),
            };
            if let Err(e) = respondable.edit(payload).await {
                warn!(error = %e, "Failed to report rejected job");
            }
            None
        }
    }
}
