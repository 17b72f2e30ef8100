//! Gateway runtime: drives the sync core against the REST and push-channel
//! transports.
//!
//! All cache mutations happen on the single runtime task. The only
//! suspending operations are the delivery pipeline's durable writes and the
//! push channel's connect/reconnect; those run on spawned tasks and report
//! back through an internal channel, so observers never see a partially
//! merged state and a slow write never blocks other commands.

/// Runtime configuration.
pub mod config;
/// Push-channel transport connection manager.
pub mod push;
/// REST client for the durable path.
pub mod rest;
/// Wire DTOs shared by both transports.
pub mod wire;

use std::{
    collections::HashMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use chatsync_core::{
    ConnectionState, Conversation, DeliveryState, EventStream, Message, MessageCache, MessageId,
    MessageKind, SendOutcome, SyncChannelError, SyncChannels, SyncCommand, SyncError,
    SyncErrorCategory, SyncEvent, normalize_fatal_error, normalize_send_outcome,
};

pub use config::{GatewayConfig, RetryConfig};
pub use push::PushChannel;
pub use rest::RestClient;
use wire::{PushInbound, PushOutbound};

const INBOUND_BUFFER: usize = 64;
const STATUS_BUFFER: usize = 32;
const TASK_BUFFER: usize = 64;

/// Cloneable handle to a spawned gateway runtime.
#[derive(Clone, Debug)]
pub struct GatewayHandle {
    channels: SyncChannels,
    cache: Arc<MessageCache>,
}

impl GatewayHandle {
    /// Enqueue one command for the runtime.
    pub async fn send(&self, command: SyncCommand) -> Result<(), SyncChannelError> {
        self.channels.send_command(command).await
    }

    /// Subscribe to runtime events.
    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    /// The shared cache, for snapshot reads by the rendering layer.
    pub fn cache(&self) -> Arc<MessageCache> {
        self.cache.clone()
    }
}

/// Validate the configuration and spawn the gateway runtime.
pub fn spawn_runtime(config: GatewayConfig) -> Result<GatewayHandle, SyncError> {
    config.validate()?;

    let (channels, command_rx) = SyncChannels::new(config.command_buffer, config.event_buffer);
    let cache = Arc::new(MessageCache::new(
        config.local_user_id,
        config.provisional_match_window_ms,
    ));
    let rest = Arc::new(RestClient::new(&config)?);

    let ws_url = Url::parse(&config.ws_url).map_err(|err| {
        SyncError::new(
            SyncErrorCategory::Config,
            "invalid_ws_url",
            format!("invalid push-channel url '{}': {err}", config.ws_url),
        )
    })?;
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
    let (status_tx, status_rx) = mpsc::channel(STATUS_BUFFER);
    let push = PushChannel::new(ws_url, config.retry.policy(), inbound_tx, status_tx);

    let (task_tx, task_rx) = mpsc::channel(TASK_BUFFER);

    let runtime = GatewayRuntime {
        channels: channels.clone(),
        command_rx,
        cache: cache.clone(),
        rest,
        push,
        inbound_rx,
        status_rx,
        task_tx,
        task_rx,
        fetch_generations: HashMap::new(),
    };
    tokio::spawn(runtime.run());

    Ok(GatewayHandle { channels, cache })
}

/// Completion of a spawned I/O task, applied to the cache on the runtime
/// task.
enum RuntimeTask {
    ConversationsFetched {
        result: Result<Vec<Conversation>, SyncError>,
    },
    MessagesFetched {
        conversation_id: i64,
        generation: u64,
        result: Result<Vec<Message>, SyncError>,
    },
    SendResolved {
        conversation_id: i64,
        provisional_id: MessageId,
        client_txn_id: String,
        result: Result<Message, SyncError>,
    },
    ConversationCreated {
        result: Result<Conversation, SyncError>,
    },
}

struct GatewayRuntime {
    channels: SyncChannels,
    command_rx: mpsc::Receiver<SyncCommand>,
    cache: Arc<MessageCache>,
    rest: Arc<RestClient>,
    push: PushChannel,
    inbound_rx: mpsc::Receiver<PushInbound>,
    status_rx: mpsc::Receiver<ConnectionState>,
    task_tx: mpsc::Sender<RuntimeTask>,
    task_rx: mpsc::Receiver<RuntimeTask>,
    fetch_generations: HashMap<i64, u64>,
}

impl GatewayRuntime {
    async fn run(mut self) {
        let mut cache_updates = self.cache.subscribe();

        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command).await;
                }
                Some(task) = self.task_rx.recv() => self.handle_task(task),
                Some(event) = self.inbound_rx.recv() => self.handle_inbound(event),
                Some(state) = self.status_rx.recv() => {
                    self.channels.emit(SyncEvent::ConnectionChanged { state });
                }
                update = cache_updates.recv() => match update {
                    Ok(update) => self.channels.emit(SyncEvent::CacheUpdated {
                        conversation_id: update.conversation_id,
                    }),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "cache update stream lagged");
                        self.channels.emit(SyncEvent::CacheUpdated { conversation_id: None });
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }

        self.push.disconnect().await;
    }

    async fn handle_command(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::Connect { token } => {
                self.rest.set_token(token.clone());
                self.push.connect(token);
            }
            SyncCommand::Disconnect => {
                self.push.disconnect().await;
                self.channels.emit(SyncEvent::ConnectionChanged {
                    state: ConnectionState::Disconnected,
                });
            }
            SyncCommand::RefreshConversations => {
                let rest = self.rest.clone();
                let task_tx = self.task_tx.clone();
                tokio::spawn(async move {
                    let result = rest.list_conversations().await;
                    let _ = task_tx.send(RuntimeTask::ConversationsFetched { result }).await;
                });
            }
            SyncCommand::OpenConversation { conversation_id } => {
                self.handle_open_conversation(conversation_id);
            }
            SyncCommand::CloseConversation => {
                if let Some(previous) = self.cache.active_conversation() {
                    self.bump_generation(previous);
                }
                self.cache.close_conversation();
            }
            SyncCommand::SendMessage {
                conversation_id,
                client_txn_id,
                content,
                kind,
            } => self.handle_send(conversation_id, client_txn_id, content, kind),
            SyncCommand::RetrySend {
                conversation_id,
                message_id,
                client_txn_id,
            } => self.handle_retry(conversation_id, message_id, client_txn_id),
            SyncCommand::CreateConversation { participant_id } => {
                let rest = self.rest.clone();
                let task_tx = self.task_tx.clone();
                tokio::spawn(async move {
                    let result = rest.create_conversation(participant_id).await;
                    let _ = task_tx.send(RuntimeTask::ConversationCreated { result }).await;
                });
            }
            SyncCommand::SetTyping {
                conversation_id,
                typing,
            } => {
                self.push.send(PushOutbound::Typing {
                    conversation_id,
                    is_typing: typing,
                });
            }
        }
    }

    fn handle_open_conversation(&mut self, conversation_id: i64) {
        // Switching away cancels the previous conversation's in-flight
        // history fetch: its response will observe a bumped generation.
        if let Some(previous) = self.cache.active_conversation()
            && previous != conversation_id
        {
            self.bump_generation(previous);
        }

        if let Some(message_id) = self.cache.open_conversation(conversation_id) {
            self.push.send(PushOutbound::ReadReceipt { message_id });
        }

        let generation = self.generation(conversation_id);
        let rest = self.rest.clone();
        let task_tx = self.task_tx.clone();
        tokio::spawn(async move {
            let result = rest.list_messages(conversation_id).await;
            let _ = task_tx
                .send(RuntimeTask::MessagesFetched {
                    conversation_id,
                    generation,
                    result,
                })
                .await;
        });
    }

    /// Delivery pipeline entry: instant local feedback, then the durable
    /// write and the push mirror run concurrently.
    fn handle_send(
        &mut self,
        conversation_id: i64,
        client_txn_id: String,
        content: String,
        kind: MessageKind,
    ) {
        let message = Message {
            id: MessageId::Provisional(Uuid::new_v4()),
            conversation_id,
            sender_id: self.cache.local_user_id(),
            content: content.clone(),
            kind,
            timestamp_ms: now_ms(),
            delivery: DeliveryState::Pending,
        };
        let provisional_id = message.id;

        if let Err(err) = self.cache.insert_provisional(message) {
            self.channels
                .emit(normalize_send_outcome(client_txn_id, SendOutcome::Failure {
                    error: err,
                }));
            return;
        }

        let mirrored = self.push.send(PushOutbound::SendMessage {
            conversation_id,
            content: content.clone(),
            message_type: kind,
        });
        if mirrored {
            self.cache.mark_sent(conversation_id, provisional_id);
        }

        self.spawn_durable_write(conversation_id, provisional_id, client_txn_id, content, kind);
    }

    fn handle_retry(
        &mut self,
        conversation_id: i64,
        message_id: MessageId,
        client_txn_id: String,
    ) {
        match self.cache.take_for_retry(conversation_id, message_id) {
            Ok(message) => {
                self.spawn_durable_write(
                    conversation_id,
                    message_id,
                    client_txn_id,
                    message.content,
                    message.kind,
                );
            }
            Err(err) => {
                self.channels
                    .emit(normalize_send_outcome(client_txn_id, SendOutcome::Failure {
                        error: err,
                    }));
            }
        }
    }

    fn spawn_durable_write(
        &self,
        conversation_id: i64,
        provisional_id: MessageId,
        client_txn_id: String,
        content: String,
        kind: MessageKind,
    ) {
        let rest = self.rest.clone();
        let task_tx = self.task_tx.clone();
        tokio::spawn(async move {
            let result = rest.send_message(conversation_id, &content, kind).await;
            let _ = task_tx
                .send(RuntimeTask::SendResolved {
                    conversation_id,
                    provisional_id,
                    client_txn_id,
                    result,
                })
                .await;
        });
    }

    fn handle_task(&mut self, task: RuntimeTask) {
        match task {
            RuntimeTask::ConversationsFetched { result } => match result {
                Ok(conversations) => self.cache.upsert_conversations(conversations),
                Err(err) => {
                    warn!(code = %err.code, "conversation list fetch failed");
                    self.channels.emit(normalize_fatal_error(err));
                }
            },
            RuntimeTask::MessagesFetched {
                conversation_id,
                generation,
                result,
            } => {
                if self.generation(conversation_id) != generation {
                    debug!(conversation_id, "discarding stale history fetch");
                    return;
                }
                match result {
                    Ok(messages) => self.apply_messages(conversation_id, messages),
                    Err(err) => {
                        warn!(code = %err.code, conversation_id, "history fetch failed");
                        self.channels.emit(normalize_fatal_error(err));
                    }
                }
            }
            RuntimeTask::SendResolved {
                conversation_id,
                provisional_id,
                client_txn_id,
                result,
            } => match result {
                Ok(message) => {
                    let outcome =
                        match self
                            .cache
                            .resolve_provisional(conversation_id, provisional_id, message)
                        {
                            Ok(final_id) => SendOutcome::Success {
                                message_id: final_id,
                            },
                            Err(error) => SendOutcome::Failure { error },
                        };
                    self.channels
                        .emit(normalize_send_outcome(client_txn_id, outcome));
                }
                Err(err) => {
                    self.cache.mark_failed(conversation_id, provisional_id);
                    self.channels
                        .emit(normalize_send_outcome(client_txn_id, SendOutcome::Failure {
                            error: err,
                        }));
                }
            },
            RuntimeTask::ConversationCreated { result } => match result {
                Ok(conversation) => {
                    let conversation_id = conversation.id;
                    self.cache.upsert_conversations(vec![conversation]);
                    self.channels
                        .emit(SyncEvent::ConversationCreated { conversation_id });
                }
                Err(err) => {
                    warn!(code = %err.code, "conversation create failed");
                    self.channels.emit(normalize_fatal_error(err));
                }
            },
        }
    }

    fn handle_inbound(&mut self, event: PushInbound) {
        match event {
            PushInbound::ChatMessage {
                conversation_id,
                message,
            } => self.apply_messages(conversation_id, vec![message.into_message()]),
            PushInbound::Typing {
                conversation_id,
                user_id,
                is_typing,
            } => {
                if user_id != self.cache.local_user_id() {
                    self.channels.emit(SyncEvent::PeerTyping {
                        conversation_id,
                        user_id,
                        typing: is_typing,
                    });
                }
            }
        }
    }

    fn apply_messages(&self, conversation_id: i64, messages: Vec<Message>) {
        let outcome = self.cache.upsert_messages(conversation_id, messages);
        for id in outcome.conflicts {
            warn!(?id, conversation_id, "divergent copies of one message id");
        }
    }

    fn generation(&mut self, conversation_id: i64) -> u64 {
        *self.fetch_generations.entry(conversation_id).or_insert(0)
    }

    fn bump_generation(&mut self, conversation_id: i64) {
        *self.fetch_generations.entry(conversation_id).or_insert(0) += 1;
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
