//! The flow interpreter: drives one identity's turn through the block graph,
//! handles human handoff, and resumes the flow when a ticket closes.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::TimeDelta;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::business_hours::{self, Availability, ClosedReason, QueueBusinessHoursConfig, QueueSettingsCache};
use crate::clock::Clock;
use crate::error::FlowError;
use crate::matcher::{self, ReplyAliases};
use crate::models::db::Ticket;
use crate::models::flow::{Block, BlockKind, Flow, MessageKind};
use crate::models::payloads::{Identity, InboundMessage, TicketStatusEvent};
use crate::models::vars::{Handover, HandoverStatus, SessionVars, Suspension};
use crate::processors::Processors;
use crate::session::{SessionLocks, SessionStore};
use crate::template;
use crate::tickets::{self, TicketStore};

/// `current_block` value while a conversation is handed to a human.
pub const HUMAN_BLOCK: &str = "human";
const DEFAULT_QUEUE: &str = "default";
const DEFINITION_ERROR_TEXT: &str = "Sorry, this conversation is unavailable right now. Please try again later.";
const OFF_HOURS_TEXT: &str = "Our team is currently unavailable. Please try again during business hours.";
/// Spacing between messages scheduled by one turn, keeping their order.
const SEND_ORDER_GAP: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub farewell_block: String,
    pub human_return_block: String,
    pub max_steps: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            farewell_block: "farewell".into(),
            human_return_block: "on_human_return".into(),
            max_steps: 64,
        }
    }
}

/// Mutable state of one turn.
struct Turn<'a> {
    flow: &'a Flow,
    identity: &'a Identity,
    user_id: String,
    base_vars: &'a Map<String, Value>,
    vars: SessionVars,
    last_sent: Option<Value>,
    /// How far ahead of now this turn's latest message is scheduled.
    send_offset: Duration,
}

impl<'a> Turn<'a> {
    fn new(flow: &'a Flow, identity: &'a Identity, base_vars: &'a Map<String, Value>) -> Self {
        Turn {
            flow,
            identity,
            user_id: identity.key(),
            base_vars,
            vars: SessionVars::default(),
            last_sent: None,
            send_offset: Duration::ZERO,
        }
    }

    /// Delay for the next message of this turn. Delays accumulate, and a
    /// message never overtakes one scheduled before it.
    fn send_delay(&mut self, seconds: u64) -> Duration {
        if !self.send_offset.is_zero() {
            self.send_offset += SEND_ORDER_GAP;
        }
        self.send_offset += Duration::from_secs(seconds);
        self.send_offset
    }

    fn reset_vars(&mut self) {
        self.vars = SessionVars::default();
        self.vars.merge(self.base_vars);
        self.vars.channel = Some(self.identity.channel.as_str().to_string());
    }
}

enum Step {
    Continue,
    /// Conversation is now with a human; the turn ends.
    Handoff,
    /// Skip normal next-block resolution.
    Route(Option<String>),
}

pub struct FlowEngine {
    sessions: Arc<dyn SessionStore>,
    tickets: Arc<dyn TicketStore>,
    queue_settings: Arc<QueueSettingsCache>,
    processors: Processors,
    clock: Arc<dyn Clock>,
    locks: SessionLocks,
    settings: EngineSettings,
    this: Weak<FlowEngine>,
}

impl FlowEngine {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        tickets: Arc<dyn TicketStore>,
        queue_settings: Arc<QueueSettingsCache>,
        processors: Processors,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            sessions,
            tickets,
            queue_settings,
            processors,
            clock,
            locks: SessionLocks::new(),
            settings,
            this: this.clone(),
        })
    }

    /// Runs one inbound turn for `identity` and returns the last content sent,
    /// if any. Failures inside the turn are logged, never returned.
    pub async fn run_turn(
        &self,
        inbound: &InboundMessage,
        flow: &Flow,
        base_vars: &Map<String, Value>,
        identity: &Identity,
    ) -> Option<Value> {
        let mut turn = Turn::new(flow, identity, base_vars);
        let _guard = self.locks.acquire(&turn.user_id).await;

        if let Err(e) = flow.validate() {
            error!(user_id = turn.user_id, flow_id = flow.id, error = %e, "Refusing to run flow");
            return self
                .processors
                .send(identity, MessageKind::Text, &Value::from(DEFINITION_ERROR_TEXT), &Map::new(), Duration::ZERO)
                .await;
        }

        if let Err(e) = self.turn(&mut turn, inbound).await {
            error!(user_id = turn.user_id, flow_id = flow.id, error = %e, "Turn aborted");
        }
        turn.last_sent
    }

    /// Handles an external ticket-status event. A closed ticket hands the
    /// conversation back to the flow.
    pub async fn on_ticket_status(&self, event: &TicketStatusEvent, flow: &Flow, identity: &Identity) -> Option<Value> {
        if !event.is_closed() {
            debug!(user_id = event.user_id, status = event.status, "Ignoring non-closing ticket status");
            return None;
        }
        if let Err(e) = flow.validate() {
            error!(user_id = event.user_id, error = %e, "Cannot resume conversation on an invalid flow");
            return None;
        }

        let empty = Map::new();
        let mut turn = Turn::new(flow, identity, &empty);
        let _guard = self.locks.acquire(&turn.user_id).await;
        if let Err(e) = self.resume_after_human(&mut turn).await {
            error!(user_id = turn.user_id, error = %e, "Resume after ticket close aborted");
        }
        turn.last_sent
    }

    async fn turn(&self, turn: &mut Turn<'_>, inbound: &InboundMessage) -> Result<(), FlowError> {
        let flow = turn.flow;
        let session = self.sessions.load(&turn.user_id).await?;
        turn.vars = session.vars;
        turn.vars.merge(turn.base_vars);
        turn.vars.channel = Some(turn.identity.channel.as_str().to_string());

        if let Some(suspension) = turn.vars.suspended.clone() {
            let block = session.current_block.clone().unwrap_or_else(|| flow.start.clone());
            if suspension.until > self.clock.now() {
                if !inbound.is_empty() {
                    record_inbound(&mut turn.vars, inbound);
                }
                debug!(user_id = turn.user_id, block, until = %suspension.until, "Turn is waiting on a delay, message recorded");
                return self.save(turn, Some(&block)).await;
            }
            info!(user_id = turn.user_id, block, "Delay overdue, continuing flow");
            turn.vars.suspended = None;
            return self.run_from(turn, block).await;
        }

        let start = match session.current_block.as_deref() {
            None => flow.start.clone(),
            Some(stored) if stored == self.settings.farewell_block => {
                info!(user_id = turn.user_id, "Restarting conversation after farewell");
                turn.reset_vars();
                flow.start.clone()
            }
            Some(HUMAN_BLOCK) => return self.continue_human(turn, inbound).await,
            Some(stored) => match flow.block(stored) {
                Some(block) if block.await_response => {
                    if inbound.is_empty() {
                        debug!(user_id = turn.user_id, block = stored, "Awaiting a reply, ignoring empty message");
                        return Ok(());
                    }
                    record_inbound(&mut turn.vars, inbound);
                    let in_error = flow.error_block_id() == Some(stored);
                    match self.next_after_reply(flow, block, &turn.vars, inbound, in_error) {
                        Some(next) => match self.checked_target(flow, &next, &turn.vars) {
                            Some(next) => next,
                            None => {
                                self.save(turn, Some(stored)).await?;
                                return Ok(());
                            }
                        },
                        None => {
                            debug!(user_id = turn.user_id, block = stored, "Reply matched no action");
                            self.save(turn, Some(stored)).await?;
                            return Ok(());
                        }
                    }
                }
                Some(_) => stored.to_string(),
                None => {
                    let e = FlowError::UnknownBlock(stored.to_string());
                    warn!(user_id = turn.user_id, error = %e, "Stored block no longer exists");
                    flow.error_block_id().unwrap_or(flow.start.as_str()).to_string()
                }
            },
        };

        self.run_from(turn, start).await
    }

    /// Executes blocks from `current` until the flow waits, halts or hands off.
    async fn run_from(&self, turn: &mut Turn<'_>, mut current: String) -> Result<(), FlowError> {
        let flow = turn.flow;
        let mut steps = 0usize;

        loop {
            if steps >= self.settings.max_steps {
                error!(
                    user_id = turn.user_id,
                    block = current,
                    steps,
                    "Turn exceeded its step limit, halting"
                );
                self.save(turn, Some(&current)).await?;
                return Ok(());
            }
            steps += 1;

            let Some(block) = flow.block(&current) else {
                // Only reachable for the start of a resume; transitions are checked.
                match self.checked_target(flow, &current, &turn.vars) {
                    Some(target) if target != current => {
                        current = target;
                        continue;
                    }
                    _ => {
                        self.save(turn, Some(&current)).await?;
                        return Ok(());
                    }
                }
            };
            let in_error = flow.error_block_id() == Some(current.as_str());
            info!(user_id = turn.user_id, block = current, kind = ?block.kind, "Executing block");

            let next = match self.execute(turn, &current, block).await? {
                Step::Handoff => return Ok(()),
                Step::Route(next) => next,
                Step::Continue => {
                    if !in_error {
                        turn.vars.previous_block = Some(current.clone());
                    }
                    if block.await_response {
                        self.save(turn, Some(&current)).await?;
                        return Ok(());
                    }
                    self.resolve_next(flow, block, &turn.vars, None, in_error)
                }
            };

            let Some(next) = next.and_then(|n| self.checked_target(flow, &n, &turn.vars)) else {
                debug!(user_id = turn.user_id, block = current, "No transition, halting turn");
                self.save(turn, Some(&current)).await?;
                return Ok(());
            };

            if current == self.settings.farewell_block {
                turn.reset_vars();
            }
            debug!(user_id = turn.user_id, from = current, to = next, "Transition");
            if block.await_time_in_seconds > 0 {
                let wait = turn.send_offset + Duration::from_secs(block.await_time_in_seconds);
                return self.suspend(turn, &next, wait).await;
            }
            self.save(turn, Some(&next)).await?;
            current = next;
        }
    }

    async fn execute(&self, turn: &mut Turn<'_>, id: &str, block: &Block) -> Result<Step, FlowError> {
        match block.kind {
            BlockKind::ApiCall => {
                self.processors.api_call(block, &mut turn.vars).await;
            }
            BlockKind::Script => {
                self.processors.script(block, &mut turn.vars).await;
            }
            BlockKind::Human => return self.enter_human(turn, id, block).await,
            kind => {
                let message_kind = kind.message_kind().unwrap_or_default();
                let content = match flow_error_content(turn.flow, id) {
                    Some(inline) if block.content.is_null() => inline.clone(),
                    _ => block.content.clone(),
                };
                let delay = turn.send_delay(block.send_delay_in_seconds);
                let sent = self
                    .processors
                    .send(turn.identity, message_kind, &content, &turn.vars.to_map(), delay)
                    .await;
                if sent.is_some() {
                    turn.last_sent = sent;
                }
            }
        }
        Ok(Step::Continue)
    }

    /// Next block after a reply to an awaiting block. Interactive blocks try
    /// the reply under each of its aliases.
    fn next_after_reply(
        &self,
        flow: &Flow,
        block: &Block,
        vars: &SessionVars,
        inbound: &InboundMessage,
        in_error: bool,
    ) -> Option<String> {
        let aliases = ReplyAliases::from_block(block);
        if block.kind == BlockKind::Interactive || !aliases.is_empty() || inbound.id.is_some() {
            let candidates = matcher::reply_candidates(
                inbound.text.as_deref(),
                inbound.id.as_deref(),
                inbound.title.as_deref(),
                &aliases,
            );
            return self.resolve_next(flow, block, vars, Some(&candidates), in_error);
        }
        self.resolve_next(flow, block, vars, None, in_error)
    }

    /// Actions in order, then `defaultNext` if it exists, then (inside the
    /// error block) the block the user came from.
    fn resolve_next(
        &self,
        flow: &Flow,
        block: &Block,
        vars: &SessionVars,
        candidates: Option<&[String]>,
        in_error: bool,
    ) -> Option<String> {
        let bag = vars.to_map();
        let matched = match candidates {
            Some(candidates) => matcher::find_action_fuzzy(&block.actions, &bag, candidates).map(|(a, _)| a),
            None => matcher::find_action(&block.actions, &bag),
        };
        if let Some(action) = matched {
            return Some(action.next.clone());
        }
        if let Some(default) = block.default_next.as_deref() {
            let default = template::substitute(default, &bag);
            if flow.has_block(&default) {
                return Some(default);
            }
        }
        if in_error {
            return vars.previous_block.clone();
        }
        None
    }

    /// Applies placeholders in a target id and reroutes dangling targets to
    /// the error block. `None` when there is nowhere to go.
    fn checked_target(&self, flow: &Flow, target: &str, vars: &SessionVars) -> Option<String> {
        let target = if template::has_placeholders(target) {
            template::substitute(target, &vars.to_map())
        } else {
            target.to_string()
        };
        if flow.has_block(&target) {
            return Some(target);
        }
        let e = FlowError::UnknownBlock(target);
        match flow.error_block_id() {
            Some(error_block) => {
                warn!(error = %e, error_block, "Routing to error block");
                Some(error_block.to_string())
            }
            None => {
                warn!(error = %e, "No error block to route to");
                None
            }
        }
    }

    async fn enter_human(&self, turn: &mut Turn<'_>, id: &str, block: &Block) -> Result<Step, FlowError> {
        let queue = block.queue_name().unwrap_or(DEFAULT_QUEUE).to_string();
        turn.vars.fila = Some(queue.clone());

        let config = match self.queue_settings.business_hours(&queue).await {
            Ok(config) => config,
            Err(e) => {
                warn!(queue, error = %e, "Could not load business hours, treating queue as open");
                None
            }
        };
        let now = self.clock.now();
        let availability = config
            .as_ref()
            .map(|c| business_hours::evaluate(c, now))
            .unwrap_or(Availability::Open);

        if let Availability::Closed(reason) = availability {
            info!(user_id = turn.user_id, queue, reason = reason.as_str(), "Queue closed, skipping handoff");
            return Ok(Step::Route(self.off_hours(turn, config.as_ref(), reason).await));
        }
        turn.vars.offhours = Some(false);
        turn.vars.offhours_reason = None;

        let already_notified = turn
            .vars
            .handover
            .as_ref()
            .is_some_and(|h| h.pre_msg_sent && h.status == HandoverStatus::Open);
        turn.vars.handover = Some(Handover {
            status: HandoverStatus::Open,
            origin_block: Some(id.to_string()),
            pre_msg_sent: true,
        });
        self.save(turn, Some(HUMAN_BLOCK)).await?;

        if !already_notified {
            if let Some(pre) = config.as_ref().and_then(|c| c.pre_human.as_ref()) {
                if let Some(message) = &pre.message {
                    let (kind, content) = message.parts();
                    let delay = turn.send_delay(pre.delay_seconds);
                    let sent = self
                        .processors
                        .send(turn.identity, kind, &content, &turn.vars.to_map(), delay)
                        .await;
                    if sent.is_some() {
                        turn.last_sent = sent;
                    }
                }
            }
        }

        self.distribute(turn, &queue, config.as_ref()).await;
        self.save(turn, Some(HUMAN_BLOCK)).await?;
        info!(user_id = turn.user_id, queue, origin = id, "Conversation handed to a human");
        Ok(Step::Handoff)
    }

    /// Sends the off-hours notice and picks where the flow goes instead.
    async fn off_hours(
        &self,
        turn: &mut Turn<'_>,
        config: Option<&QueueBusinessHoursConfig>,
        reason: ClosedReason,
    ) -> Option<String> {
        turn.vars.offhours = Some(true);
        turn.vars.offhours_reason = Some(reason.as_str().to_string());

        let off = config.and_then(|c| c.off_hours.as_ref());
        let holiday = off.and_then(|o| o.holiday.as_ref());
        let closed = off.and_then(|o| o.closed.as_ref());
        let variants = match reason {
            ClosedReason::Holiday => [holiday, closed],
            _ => [closed, None],
        };

        let message = variants
            .iter()
            .flatten()
            .find_map(|v| v.message.as_ref())
            .or_else(|| off.and_then(|o| o.message.as_ref()))
            .map(|m| m.parts())
            .unwrap_or((MessageKind::Text, Value::from(OFF_HOURS_TEXT)));
        let delay = turn.send_delay(0);
        let sent = self
            .processors
            .send(turn.identity, message.0, &message.1, &turn.vars.to_map(), delay)
            .await;
        if sent.is_some() {
            turn.last_sent = sent;
        }

        variants
            .iter()
            .flatten()
            .find_map(|v| v.next.clone())
            .or_else(|| off.and_then(|o| o.next.clone()))
            .or_else(|| turn.flow.error_block_id().map(str::to_string))
    }

    /// Opens or reuses the user's ticket. Never fails the turn.
    async fn distribute(&self, turn: &mut Turn<'_>, queue: &str, config: Option<&QueueBusinessHoursConfig>) {
        let mode = self.queue_settings.distribution_mode().await.unwrap_or_else(|e| {
            warn!(error = %e, "Could not read distribution mode, using default");
            Default::default()
        });
        match self.tickets.distribute(&turn.user_id, queue, mode).await {
            Ok(ticket) => self.note_ticket(turn, &ticket, queue, config),
            Err(e) => {
                let e = FlowError::TicketDistribution(format!("{e:#}"));
                warn!(user_id = turn.user_id, queue, error = %e, "Continuing without a ticket");
            }
        }
    }

    /// Copies the ticket number into the vars, deriving a new protocol when it changed.
    fn note_ticket(&self, turn: &mut Turn<'_>, ticket: &Ticket, queue: &str, config: Option<&QueueBusinessHoursConfig>) {
        let number = ticket.ticket_number.map(|n| n.to_string());
        if turn.vars.protocol.is_none() || turn.vars.ticket_number != number {
            let tz = config
                .and_then(|c| c.timezone.as_deref())
                .map(business_hours::parse_timezone)
                .unwrap_or(chrono_tz::UTC);
            turn.vars.protocol = Some(tickets::protocol(self.clock.now(), tz, ticket.ticket_number));
        }
        turn.vars.ticket_number = number;
        info!(
            user_id = turn.user_id,
            queue,
            ticket_id = %ticket.id,
            assigned_to = ?ticket.assigned_to,
            protocol = ?turn.vars.protocol,
            "Ticket ready"
        );
    }

    /// Inbound message while a human owns the conversation: keep the ticket
    /// in place and wait for it to close.
    async fn continue_human(&self, turn: &mut Turn<'_>, inbound: &InboundMessage) -> Result<(), FlowError> {
        if !inbound.is_empty() {
            record_inbound(&mut turn.vars, inbound);
        }
        let queue = turn.vars.fila.clone().unwrap_or_else(|| DEFAULT_QUEUE.to_string());
        let config = self.queue_settings.business_hours(&queue).await.unwrap_or_else(|e| {
            warn!(queue, error = %e, "Could not load business hours");
            None
        });
        match self.tickets.find_open(&turn.user_id).await {
            Ok(Some(ticket)) => self.note_ticket(turn, &ticket, &queue, config.as_ref()),
            Ok(None) => {
                info!(user_id = turn.user_id, queue, "No open ticket during handoff, distributing again");
                self.distribute(turn, &queue, config.as_ref()).await;
            }
            Err(e) => {
                warn!(user_id = turn.user_id, queue, error = %e, "Could not look up open ticket");
                self.distribute(turn, &queue, config.as_ref()).await;
            }
        }
        self.save(turn, Some(HUMAN_BLOCK)).await?;
        debug!(user_id = turn.user_id, queue, "Message during handoff, interpreter not run");
        Ok(())
    }

    async fn resume_after_human(&self, turn: &mut Turn<'_>) -> Result<(), FlowError> {
        let flow = turn.flow;
        let session = self.sessions.load(&turn.user_id).await?;
        if session.current_block.as_deref() != Some(HUMAN_BLOCK) {
            info!(user_id = turn.user_id, "Ticket closed for a conversation not in handoff, ignoring");
            return Ok(());
        }
        turn.vars = session.vars;
        let mut handover = turn.vars.handover.clone().unwrap_or_default();
        handover.status = HandoverStatus::Closed;
        turn.vars.handover = Some(handover.clone());

        let from_origin = handover
            .origin_block
            .as_deref()
            .and_then(|origin| flow.block(origin).map(|b| (origin, b)))
            .and_then(|(origin, b)| {
                let in_error = flow.error_block_id() == Some(origin);
                self.resolve_next(flow, b, &turn.vars, None, in_error)
            })
            .map(|next| {
                if template::has_placeholders(&next) {
                    template::substitute(&next, &turn.vars.to_map())
                } else {
                    next
                }
            })
            .filter(|next| flow.has_block(next));

        let next = from_origin
            .or_else(|| {
                flow.has_block(&self.settings.human_return_block)
                    .then(|| self.settings.human_return_block.clone())
            })
            .or_else(|| flow.error_block_id().map(str::to_string))
            .unwrap_or_else(|| flow.start.clone());

        info!(user_id = turn.user_id, next, "Ticket closed, resuming flow");
        self.save(turn, Some(&next)).await?;
        self.run_from(turn, next).await
    }

    /// Parks the turn at `next` and schedules its continuation after `wait`.
    /// The worker that ran the turn is released immediately.
    async fn suspend(&self, turn: &mut Turn<'_>, next: &str, wait: Duration) -> Result<(), FlowError> {
        let now = self.clock.now();
        let until = TimeDelta::from_std(wait)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);
        let id = Uuid::new_v4();
        turn.vars.suspended = Some(Suspension { id, until });
        self.save(turn, Some(next)).await?;
        info!(
            user_id = turn.user_id,
            block = next,
            wait_ms = wait.as_millis() as u64,
            "Turn suspended on a delay"
        );

        if let Some(engine) = self.this.upgrade() {
            tokio::spawn(continue_later(
                engine,
                turn.flow.clone(),
                turn.identity.clone(),
                turn.base_vars.clone(),
                id,
                wait,
            ));
        }
        Ok(())
    }

    /// Continues the suspension `id` if it is still the one parked in the session.
    async fn resume_delayed(&self, flow: &Flow, identity: &Identity, base_vars: &Map<String, Value>, id: Uuid) {
        let mut turn = Turn::new(flow, identity, base_vars);
        let _guard = self.locks.acquire(&turn.user_id).await;
        if let Err(e) = self.resume_suspension(&mut turn, id).await {
            error!(user_id = turn.user_id, error = %e, "Delayed continuation aborted");
        }
    }

    async fn resume_suspension(&self, turn: &mut Turn<'_>, id: Uuid) -> Result<(), FlowError> {
        let session = self.sessions.load(&turn.user_id).await?;
        if session.vars.suspended.as_ref().map(|s| s.id) != Some(id) {
            debug!(user_id = turn.user_id, "Delay already handled, nothing to resume");
            return Ok(());
        }
        let block = session.current_block.unwrap_or_else(|| turn.flow.start.clone());
        turn.vars = session.vars;
        turn.vars.suspended = None;
        info!(user_id = turn.user_id, block, "Delay elapsed, continuing flow");
        self.run_from(turn, block).await
    }

    async fn save(&self, turn: &Turn<'_>, block: Option<&str>) -> Result<(), FlowError> {
        let flow_id = Some(turn.flow.id.as_str()).filter(|id| !id.is_empty());
        self.sessions.save(&turn.user_id, block, flow_id, &turn.vars).await?;
        Ok(())
    }
}

fn continue_later(
    engine: Arc<FlowEngine>,
    flow: Flow,
    identity: Identity,
    base_vars: Map<String, Value>,
    id: Uuid,
    wait: Duration,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        tokio::time::sleep(wait).await;
        engine.resume_delayed(&flow, &identity, &base_vars, id).await;
    })
}

/// Inline `onError` content stands in for an error block that has none.
fn flow_error_content<'a>(flow: &'a Flow, id: &str) -> Option<&'a Value> {
    (flow.error_block_id() == Some(id)).then(|| flow.error_content()).flatten()
}

fn record_inbound(vars: &mut SessionVars, inbound: &InboundMessage) {
    vars.last_user_message = inbound.display_text().map(str::to_string);
    vars.last_reply_id = inbound.id.clone();
    vars.last_reply_title = inbound.title.clone();
    vars.last_message_type = Some(inbound.kind.clone().unwrap_or_else(|| "text".to_string()));
}
