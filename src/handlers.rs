use crate::{
    config::Config,
    error::AppError,
    format::RequestedKind,
    orchestrator::Orchestrator,
    progress::{human_size, humanize_duration},
    session::{HistoryStore, SessionRegistry, TaskHandle},
    ytdlp::{MediaProvider, YtDlpClient},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::{fmt::Display, path::PathBuf, sync::Arc};
use teloxide::{
    dispatching::DpHandlerDescription,
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId, UserId},
    ApiError, RequestError,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppServices {
    pub config: Arc<Config>,
    pub sessions: SessionRegistry,
    pending: Arc<DashMap<UserId, PendingRequest>>,
    media: Arc<dyn MediaProvider>,
    orchestrator: Arc<Orchestrator>,
}

/// A probed URL waiting for the user to pick audio/video/both. In-memory
/// only; after a restart the user just resends the link.
#[derive(Clone)]
struct PendingRequest {
    url: String,
    title: Option<String>,
    offered_at: DateTime<Utc>,
}

impl AppServices {
    pub async fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let history = HistoryStore::load(config.history_db.clone(), config.history_limit).await;
        let sessions = SessionRegistry::new(history);
        let client = Arc::new(YtDlpClient::new(&config));
        let orchestrator = Arc::new(Orchestrator::new(
            config.clone(),
            client.clone(),
            client.clone(),
            sessions.clone(),
        ));
        Self {
            config,
            sessions,
            pending: Arc::new(DashMap::new()),
            media: client,
            orchestrator,
        }
    }
}

/// Inbound events as a tagged dispatch: commands, URL messages, and button
/// callbacks each get their own branch with the fields they require.
pub fn build_handler(
) -> Handler<'static, DependencyMap, Result<(), AppError>, DpHandlerDescription> {
    dptree::entry()
        .branch(
            Update::filter_message()
                .filter_map(extract_command)
                .endpoint(handle_command),
        )
        .branch(
            Update::filter_message()
                .filter_map(extract_url)
                .endpoint(handle_url),
        )
        .branch(Update::filter_callback_query().endpoint(handle_choice))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
    Start,
    Downloads,
    Cancel,
    ClearDownloads,
}

fn extract_command(msg: Message) -> Option<(Message, Command)> {
    let text = msg.text()?.trim();
    let word = text.split_whitespace().next()?;
    let word = word.split('@').next().unwrap_or(word);
    let command = match word {
        "/start" => Command::Start,
        "/downloads" => Command::Downloads,
        "/cancel" => Command::Cancel,
        "/clear_downloads" => Command::ClearDownloads,
        _ => return None,
    };
    Some((msg, command))
}

fn extract_url(msg: Message) -> Option<(Message, String)> {
    let text = msg.text()?.trim().to_string();
    if text.starts_with("http://") || text.starts_with("https://") {
        Some((msg, text))
    } else {
        None
    }
}

const KIND_CALLBACK_PREFIX: &str = "kind:";

pub fn build_kind_callback(kind: RequestedKind) -> String {
    let value = match kind {
        RequestedKind::Audio => "audio",
        RequestedKind::Video => "video",
        RequestedKind::Both => "both",
    };
    format!("{KIND_CALLBACK_PREFIX}{value}")
}

pub fn parse_kind_callback(data: &str) -> Option<RequestedKind> {
    match data.strip_prefix(KIND_CALLBACK_PREFIX)? {
        "audio" => Some(RequestedKind::Audio),
        "video" => Some(RequestedKind::Video),
        "both" => Some(RequestedKind::Both),
        _ => None,
    }
}

async fn handle_command(
    bot: Bot,
    services: AppServices,
    msg_and_command: (Message, Command),
) -> Result<(), AppError> {
    let (msg, command) = msg_and_command;
    let chat_id = msg.chat.id;
    let Some(user) = msg.from().map(|u| u.id) else {
        return Ok(());
    };

    match command {
        Command::Start => {
            bot.send_message(
                chat_id,
                "Hi! Send me a video link and I'll fetch it for you as audio or video.\n\
                 Commands: /downloads, /cancel, /clear_downloads",
            )
            .await?;
        }
        Command::Downloads => {
            let text = downloads_summary(&services, user).await;
            bot.send_message(chat_id, text).await?;
        }
        Command::Cancel => {
            let text = if services.sessions.cancel(user) {
                "Cancellation requested. ⏹️"
            } else {
                "There are no active downloads to cancel."
            };
            bot.send_message(chat_id, text).await?;
        }
        Command::ClearDownloads => {
            let removed = services.sessions.clear(user).await;
            bot.send_message(
                chat_id,
                format!("Cleanup complete. Removed {removed} download(s)."),
            )
            .await?;
        }
    }
    Ok(())
}

async fn downloads_summary(services: &AppServices, user: UserId) -> String {
    let mut text = String::new();
    if let Some(task) = services.sessions.status(user).await {
        text.push_str(&format!(
            "Active: {} [{}] → {}\nStarted {} • updated {}\n",
            task.title.as_deref().unwrap_or(&task.url),
            task.kind,
            task.state,
            task.created_at.format("%H:%M:%S"),
            task.updated_at.format("%H:%M:%S"),
        ));
    }
    let history = services.sessions.history(user).await;
    if !history.is_empty() {
        text.push_str("Recent downloads:\n");
        for record in &history {
            text.push_str(&format!(
                "• {} [{}] • {} • {}\n",
                record.title,
                record.kind,
                human_size(record.bytes),
                record.completed_at.format("%Y-%m-%d %H:%M"),
            ));
        }
    }
    if text.is_empty() {
        return "You have no recorded downloads.".to_string();
    }
    text
}

async fn handle_url(
    bot: Bot,
    services: AppServices,
    msg_and_url: (Message, String),
) -> Result<(), AppError> {
    let (msg, url) = msg_and_url;
    let chat_id = msg.chat.id;
    let Some(user) = msg.from().map(|u| u.id) else {
        return Ok(());
    };
    let placeholder = bot.send_message(chat_id, "🔍 Fetching media info…").await?;

    let info = match services.media.probe(&url).await {
        Ok(info) => info,
        Err(err) => {
            report_user_error(&bot, chat_id, placeholder.id, "Could not inspect that link.", &err)
                .await?;
            return Ok(());
        }
    };

    services
        .pending
        .retain(|_, offer| Utc::now() - offer.offered_at < chrono::Duration::hours(1));
    services.pending.insert(
        user,
        PendingRequest {
            url,
            title: info.title.clone(),
            offered_at: Utc::now(),
        },
    );

    let keyboard = InlineKeyboardMarkup::new(vec![
        vec![InlineKeyboardButton::callback(
            "🎵 Audio",
            build_kind_callback(RequestedKind::Audio),
        )],
        vec![InlineKeyboardButton::callback(
            "🎬 Video",
            build_kind_callback(RequestedKind::Video),
        )],
        vec![InlineKeyboardButton::callback(
            "📦 Both",
            build_kind_callback(RequestedKind::Both),
        )],
    ]);

    let title = info.title.as_deref().unwrap_or("(untitled)");
    let duration = info
        .duration
        .map(|secs| humanize_duration(secs as u64))
        .unwrap_or_else(|| "unknown".to_string());
    bot.edit_message_text(
        chat_id,
        placeholder.id,
        format!("Title: {title}\nDuration: {duration}\nWhat would you like to download?"),
    )
    .reply_markup(keyboard)
    .await?;
    Ok(())
}

async fn handle_choice(bot: Bot, services: AppServices, q: CallbackQuery) -> Result<(), AppError> {
    let Some(kind) = q.data.as_deref().and_then(parse_kind_callback) else {
        return Ok(());
    };
    let Some(message) = q.message.clone() else {
        return Ok(());
    };
    let chat_id = message.chat.id;
    let user = q.from.id;
    bot.answer_callback_query(q.id).await?;

    let Some((_, offer)) = services.pending.remove(&user) else {
        bot.edit_message_text(chat_id, message.id, "⚠️ Session not found. Send the URL again.")
            .await?;
        return Ok(());
    };

    let handle = match services
        .sessions
        .start(user, offer.url.clone(), kind, offer.title.clone())
    {
        Ok(handle) => handle,
        Err(err @ AppError::AlreadyActive) => {
            // Leave the offer usable for after /cancel.
            services.pending.insert(user, offer);
            bot.send_message(chat_id, user_facing_message(&err)).await?;
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    let title = offer.title.as_deref().unwrap_or(&offer.url);
    bot.edit_message_text(chat_id, message.id, format!("⏳ Queued: '{title}' as {kind}…"))
        .await?;

    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let editor = spawn_status_editor(bot.clone(), chat_id, message.id, status_rx);
    tokio::spawn(run_request(
        bot,
        services,
        user,
        chat_id,
        message.id,
        handle,
        status_tx,
        editor,
    ));
    Ok(())
}

/// Owns a request from orchestration through sending the artifacts back.
#[allow(clippy::too_many_arguments)]
async fn run_request(
    bot: Bot,
    services: AppServices,
    user: UserId,
    chat_id: ChatId,
    message_id: MessageId,
    handle: Arc<TaskHandle>,
    status_tx: mpsc::UnboundedSender<String>,
    editor: JoinHandle<()>,
) {
    let result = services.orchestrator.run(user, handle, status_tx).await;
    // The status sink is gone; wait for the editor before the final edit so
    // a late progress line cannot clobber it.
    let _ = editor.await;

    match result {
        Ok(record) => {
            let _ = edit_or_send(
                &bot,
                chat_id,
                message_id,
                format!("📤 Sending '{}'…", record.title),
            )
            .await;
            send_files(&bot, chat_id, &record.title, &record.files).await;
            let _ = edit_or_send(
                &bot,
                chat_id,
                message_id,
                format!(
                    "✅ Download complete for '{}' ({})",
                    record.title,
                    human_size(record.bytes)
                ),
            )
            .await;
            if services.config.cleanup_after_send {
                cleanup_files(&record.files).await;
            }
        }
        Err(err) => {
            let _ = edit_or_send(&bot, chat_id, message_id, user_facing_message(&err)).await;
        }
    }
}

async fn send_files(bot: &Bot, chat_id: ChatId, title: &str, files: &[PathBuf]) {
    for path in files {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        let ext = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let input = InputFile::file(path.clone()).file_name(filename.clone());
        // Send errors (size limits, transient network) are terminal for this
        // attempt; retrying is the transport's business, not ours.
        let result = match ext.as_str() {
            "mp3" => bot
                .send_audio(chat_id, input)
                .title(title.to_string())
                .await
                .map(|_| ()),
            "mp4" | "mkv" | "webm" | "mov" => bot
                .send_video(chat_id, input)
                .supports_streaming(true)
                .await
                .map(|_| ()),
            _ => bot.send_document(chat_id, input).await.map(|_| ()),
        };
        if let Err(err) = result {
            warn!(event = "send_failed", file = %filename, error = %err);
            let _ = bot
                .send_message(chat_id, format!("⚠️ Could not send {filename}: {err}"))
                .await;
        }
    }
}

async fn cleanup_files(files: &[PathBuf]) {
    for path in files {
        if let Err(err) = tokio::fs::remove_file(path).await {
            warn!(event = "cleanup_failed", path = %path.display(), error = %err);
        } else {
            info!(event = "cleanup_removed", path = %path.display());
        }
    }
}

/// Relays throttled status lines into edits of the placeholder message.
/// Ends when the status channel closes.
fn spawn_status_editor(
    bot: Bot,
    chat_id: ChatId,
    message_id: MessageId,
    mut rx: mpsc::UnboundedReceiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_text: Option<String> = None;
        let mut notified = false;
        while let Some(text) = rx.recv().await {
            if last_text.as_deref() == Some(text.as_str()) {
                continue;
            }
            match bot.edit_message_text(chat_id, message_id, text.clone()).await {
                Ok(_) => {
                    last_text = Some(text);
                }
                Err(err) if is_message_not_modified(&err) => {
                    last_text = Some(text);
                }
                Err(err) => {
                    warn!(event = "progress_edit_failed", error = %err);
                    if !notified {
                        let _ = bot
                            .send_message(chat_id, format!("Progress update failed.\nError: {err}"))
                            .await;
                        notified = true;
                    }
                }
            }
        }
    })
}

async fn edit_or_send(
    bot: &Bot,
    chat_id: ChatId,
    message_id: MessageId,
    text: String,
) -> Result<(), AppError> {
    if bot
        .edit_message_text(chat_id, message_id, text.clone())
        .await
        .is_err()
    {
        bot.send_message(chat_id, text).await?;
    }
    Ok(())
}

fn is_message_not_modified(err: &RequestError) -> bool {
    matches!(err, RequestError::Api(ApiError::MessageNotModified))
}

async fn report_user_error(
    bot: &Bot,
    chat_id: ChatId,
    message_id: MessageId,
    context: &str,
    err: impl Display,
) -> Result<(), AppError> {
    let text = format!("⚠️ {context}\nError: {err}");
    if bot
        .edit_message_text(chat_id, message_id, text.clone())
        .await
        .is_err()
    {
        let _ = bot.send_message(chat_id, text).await;
    }
    Ok(())
}

/// One terminal message per reason code; nothing reaches the chat opaque.
pub fn user_facing_message(err: &AppError) -> String {
    match err {
        AppError::Extraction(msg) => format!("⚠️ Could not read that link: {msg}"),
        AppError::NetworkTransient(msg) => {
            format!("⚠️ Network trouble kept the download from finishing: {msg}")
        }
        AppError::SizeExceeded { size, budget } => format!(
            "⚠️ Even the smallest quality came out at {}, over the {} limit.",
            human_size(*size),
            human_size(*budget)
        ),
        AppError::NoFormatAvailable(kind) => {
            format!("⚠️ That source has no {kind} stream to download.")
        }
        AppError::Postprocess(msg) => format!("⚠️ Converting the file failed: {msg}"),
        AppError::AlreadyActive => {
            "⚠️ A download is already in progress. Use /cancel to stop it.".to_string()
        }
        AppError::Cancelled => "⛔ Download cancelled by user.".to_string(),
        other => format!("⚠️ Error: {other}"),
    }
}
