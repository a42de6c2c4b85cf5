//! Player command consumer
//!
//! Commands arrive on a durable queue; each one is executed against the
//! session manager and answered with a `CommandReply` notification to the
//! issuing user.

use crate::amqp::messages::{CommandRequest, MessageUtils, PlayerCommand};
use crate::error::{ladder_error, user_facing_message, LadderError, Result};
use crate::notification::{render, NotificationPublisher};
use crate::session::SessionManager;
use crate::store::LadderStore;
use amqprs::{
    channel::{BasicAckArguments, BasicCancelArguments, BasicConsumeArguments, Channel},
    consumer::AsyncConsumer,
    BasicProperties, Deliver,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Executes one decoded command
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle_command(&self, request: CommandRequest);

    /// Payload that could not be decoded into a command
    async fn handle_error(&self, error: anyhow::Error, message_data: &[u8]);
}

/// Runs commands against the session manager and replies with the outcome
pub struct LadderCommandHandler {
    manager: Arc<SessionManager>,
    notifier: Arc<dyn NotificationPublisher>,
    admin_ids: HashSet<String>,
}

impl LadderCommandHandler {
    pub fn new(
        manager: Arc<SessionManager>,
        notifier: Arc<dyn NotificationPublisher>,
        admin_ids: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            manager,
            notifier,
            admin_ids: admin_ids.into_iter().collect(),
        }
    }

    fn is_admin(&self, external_id: &str) -> bool {
        self.admin_ids.contains(external_id)
    }

    /// Text of the success reply
    pub async fn execute(&self, request: &CommandRequest) -> Result<String> {
        let caller = &request.external_id;

        match &request.command {
            PlayerCommand::Register { name } => {
                let player = self.manager.register_player(name, caller).await?;
                Ok(format!(
                    "Welcome {}! You can now join the races of any league.",
                    player.name
                ))
            }
            PlayerCommand::Rename { name } => {
                let player = self.manager.rename_player(caller, name).await?;
                Ok(format!("You are now known as {}.", player.name))
            }
            PlayerCommand::Join { league } => {
                let player = self.manager.player_by_external_id(caller).await?;
                self.manager.join_league(league, player.id).await?;
                Ok(format!(
                    "You joined the next race of league `{}`. Good luck!",
                    league.to_lowercase()
                ))
            }
            PlayerCommand::Cancel { league } => {
                let player = self.manager.player_by_external_id(caller).await?;
                self.manager.cancel_league(league, player.id).await?;
                Ok(format!(
                    "You left the next race of league `{}`.",
                    league.to_lowercase()
                ))
            }
            PlayerCommand::Complete { league } => {
                let player = self.manager.player_by_external_id(caller).await?;
                match league {
                    Some(code) => self.manager.complete_in_league(code, player.id).await?,
                    None => self.manager.complete_for_player(player.id).await?,
                };
                Ok("Your time has been recorded. GG!".to_string())
            }
            PlayerCommand::Forfeit { league } => {
                let player = self.manager.player_by_external_id(caller).await?;
                match league {
                    Some(code) => self.manager.forfeit_in_league(code, player.id).await?,
                    None => self.manager.forfeit_for_player(player.id).await?,
                };
                Ok("You forfeited your race.".to_string())
            }
            PlayerCommand::Recap { league } => {
                let recap = self.manager.get_session_recap(league).await?;
                let store = self.manager.store();
                let mut names = HashMap::new();
                for race in &recap.matches {
                    for entry in &race.entries {
                        if let Some(player) = store.get_player(entry.player_id).await? {
                            names.insert(player.id, player.name);
                        }
                    }
                }
                Ok(format!(
                    "Results of the race of {} for league `{}`:\n{}",
                    recap.session.start_date.format("%Y-%m-%d %H:%M UTC"),
                    recap.league.short_code,
                    render::recap_table(&recap.matches, &names)
                ))
            }
            PlayerCommand::ForceClose { session_id } => {
                if !self.is_admin(caller) {
                    return Err(LadderError::PermissionDenied {
                        action: "force-close a race",
                    }
                    .into());
                }
                self.manager.force_close(*session_id).await?;
                Ok(format!("Session {} has been closed.", session_id))
            }
        }
    }
}

#[async_trait]
impl CommandHandler for LadderCommandHandler {
    async fn handle_command(&self, request: CommandRequest) {
        let command = request.command.name();
        let started = Instant::now();

        let (success, text) = match self.execute(&request).await {
            Ok(text) => (true, text),
            Err(e) => {
                if ladder_error(&e).is_some_and(LadderError::is_public) {
                    debug!(
                        "Command {} from {} rejected: {:#}",
                        command, request.external_id, e
                    );
                } else {
                    error!(
                        "Command {} from {} failed: {:#}",
                        command, request.external_id, e
                    );
                }
                (
                    false,
                    user_facing_message(&e, self.is_admin(&request.external_id)),
                )
            }
        };

        info!(
            "Command {} from {} handled in {:.2}ms (success: {})",
            command,
            request.external_id,
            started.elapsed().as_secs_f64() * 1000.0,
            success
        );

        let reply = render::command_reply(&request.external_id, command, success, &text);
        if !self.notifier.publish(reply).await {
            warn!("Reply to {} for {} was dropped", request.external_id, command);
        }
    }

    async fn handle_error(&self, error: anyhow::Error, message_data: &[u8]) {
        let preview_len = message_data.len().min(100);
        let preview = String::from_utf8_lossy(&message_data[..preview_len]);
        warn!("Discarding undecodable command ({:#}): {:?}", error, preview);
    }
}

/// Consumer for the player command queue
pub struct CommandConsumer {
    handler: Arc<dyn CommandHandler>,
    channel: Channel,
    consumer_tag: String,
}

impl CommandConsumer {
    pub fn new(handler: Arc<dyn CommandHandler>, channel: Channel) -> Self {
        let consumer_tag = format!("command-consumer-{}", uuid::Uuid::new_v4());

        Self {
            handler,
            channel,
            consumer_tag,
        }
    }

    pub async fn start_consuming(&self, queue_name: &str) -> Result<()> {
        let args = BasicConsumeArguments::new(queue_name, &self.consumer_tag);

        self.channel
            .basic_consume(QueueConsumer::new(self.handler.clone()), args)
            .await
            .map_err(|e| LadderError::AmqpConnectionFailed {
                message: format!("Failed to start consuming: {}", e),
            })?;

        info!("Started consuming commands from queue: {}", queue_name);
        Ok(())
    }

    pub async fn stop_consuming(&self) -> Result<()> {
        let args = BasicCancelArguments::new(&self.consumer_tag);

        self.channel
            .basic_cancel(args)
            .await
            .map_err(|e| LadderError::AmqpConnectionFailed {
                message: format!("Failed to stop consuming: {}", e),
            })?;

        info!("Stopped consuming commands");
        Ok(())
    }
}

struct QueueConsumer {
    handler: Arc<dyn CommandHandler>,
}

impl QueueConsumer {
    fn new(handler: Arc<dyn CommandHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl AsyncConsumer for QueueConsumer {
    async fn consume(
        &mut self,
        channel: &Channel,
        deliver: Deliver,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        let delivery_tag = deliver.delivery_tag();
        debug!(
            "Command received - delivery_tag: {}, size: {} bytes",
            delivery_tag,
            content.len()
        );

        match MessageUtils::deserialize_command(&content) {
            Ok(request) => self.handler.handle_command(request).await,
            Err(e) => self.handler.handle_error(e, &content).await,
        }

        // Failures are answered to the caller, so every delivery is settled here
        if let Err(e) = channel
            .basic_ack(BasicAckArguments::new(delivery_tag, false))
            .await
        {
            error!("Failed to ack delivery {}: {}", delivery_tag, e);
        }
    }
}
