//! Protocol state machine
//!
//! The [`ProtocolEngine`] is a cloneable handle to a task that owns one
//! transport connection's [`ProtocolSession`], frame decoder and outbound
//! write path. All session mutation happens on that task; handles talk to
//! it over a command channel and observe it through a watch channel.
//!
//! # Handshake
//!
//! [`initialize`](ProtocolEngine::initialize) walks
//! `idle -> handshaking -> synced`:
//!
//! 1. reset the session (fresh random nonce)
//! 2. settle, then send the wakeup burst on stream transports
//! 3. send `want_config_id = nonce` and wait for the matching completion
//! 4. if ready, synchronize channel slots
//!
//! A handshake that does not complete in time is not an error: the call
//! returns `Ok(false)`, staged updates are released and the session drops
//! to `Unsynced`, where updates pass straight through. A completion that
//! arrives later still moves the session to synced.
//!
//! # Recovery
//!
//! A device reboot, or text on a link that has decoded nothing for a while,
//! restarts the handshake in place: wakeup, fresh `want_config_id`, the same
//! handshake deadline, and a channel re-sync once the device completes.
//!
//! # Admin operations
//!
//! Owner and channel writes and alerts first make sure a session passkey is
//! present, requesting one if the handshake is complete. Without a passkey
//! they are still sent; the device answers with a routing error.

use bytes::Bytes;
use prost::Message;
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::{
    Framing, ProtocolConfig, BROADCAST_ADDR, CHANNEL_SLOTS, DATA_PAYLOAD_MAX, MAX_LONG_NAME,
    MAX_SHORT_NAME,
};
use crate::dispatch::{message_update, PacketDispatcher, ALERT_BELL};
use crate::error::{MeshlinkError, Result};
use crate::framing::{encode_for, wakeup_sequence, DecodeEvent, FrameDecoder};
use crate::interface::RadioTransport;
use crate::model::{
    node_id_string, ChannelInfo, ChannelRole, MeshUpdate, MessageDeliveryState, MessageItem,
    NodePatch,
};
use crate::proto::{
    self, admin_message, from_radio, mesh_packet, AdminMessage, ConfigType, Data, FromRadio,
    LogLevel, MeshPacket, PortNum, ToRadio,
};
use crate::session::{InboundBuffer, ProtocolSession, SessionPhase, SessionSnapshot};
use crate::state::MeshContext;

/// Command channel capacity
const COMMAND_BUFFER: usize = 64;

/// Outcome of a channel sync run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSyncReport {
    /// Rounds that issued requests
    pub rounds: u32,
    /// Slots the device has answered for
    pub answered: BTreeSet<u8>,
    /// Slots still unanswered, assumed disabled
    pub unanswered: Vec<u8>,
}

enum Command {
    Reset {
        reply: oneshot::Sender<u32>,
    },
    AbandonHandshake {
        reply: oneshot::Sender<()>,
    },
    WriteRaw {
        bytes: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        message: ToRadio,
        reply: oneshot::Sender<Result<()>>,
    },
    SendAdmin {
        admin: AdminMessage,
        reply: oneshot::Sender<Result<u32>>,
    },
    Shutdown,
}

/// Handle to the protocol task of one connection
#[derive(Clone)]
pub struct ProtocolEngine {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    ctx: Arc<MeshContext>,
    config: Arc<ProtocolConfig>,
    framing: Framing,
}

impl ProtocolEngine {
    /// Spawn the protocol task for a freshly connected transport
    ///
    /// `inbound` must be the buffer the transport callback pushes into.
    pub fn spawn(
        transport: Arc<dyn RadioTransport>,
        inbound: InboundBuffer,
        ctx: Arc<MeshContext>,
        config: ProtocolConfig,
    ) -> Self {
        let framing = transport.framing();
        let config = Arc::new(config);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let heartbeat = config.heartbeat_interval.filter(|p| !p.is_zero()).map(|period| {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let task = EngineTask {
            decoder: FrameDecoder::from_config(framing, &config),
            dispatcher: PacketDispatcher::new(ctx.clone()),
            session: ProtocolSession::default(),
            transport,
            inbound,
            ctx: ctx.clone(),
            commands: command_rx,
            handle: command_tx.downgrade(),
            snapshot: snapshot_tx,
            heartbeat,
            handshake_deadline: None,
            resync_pending: false,
            framing,
            config: config.clone(),
        };
        tokio::spawn(task.run());

        Self {
            commands: command_tx,
            snapshot: snapshot_rx,
            ctx,
            config,
            framing,
        }
    }

    /// Current session view
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch session changes
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Whether the protocol task is still running
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Run the handshake; `Ok(true)` once the device confirmed its config
    pub async fn initialize(&self) -> Result<bool> {
        let nonce = self.reset().await?;
        debug!(nonce, "Starting handshake");

        time::sleep(self.config.settle_delay).await;
        if self.framing == Framing::Stream && self.config.wakeup_len > 0 {
            self.write_raw(wakeup_sequence(self.config.wakeup_len)).await?;
        }
        self.send(ToRadio::want_config(nonce)).await?;

        let completed = self
            .wait_for(|s| s.config_complete, self.config.handshake_timeout)
            .await;
        if !completed {
            warn!(
                timeout = ?self.config.handshake_timeout,
                "Handshake did not complete, connection not ready"
            );
            self.abandon_handshake().await?;
            return Ok(false);
        }

        let snapshot = self.snapshot();
        info!(node = %node_id_string(snapshot.node_num), "Radio session ready");
        if snapshot.is_ready() {
            let report = self.run_channel_sync().await?;
            debug!(rounds = report.rounds, answered = report.answered.len(), "Channel sync done");
        }
        Ok(true)
    }

    /// Request unanswered channel slots in rounds until a round adds nothing
    pub async fn run_channel_sync(&self) -> Result<ChannelSyncReport> {
        let delay = self.config.request_delay(self.framing);
        let settle = self.config.round_settle(self.framing);
        let mut rounds = 0;

        for round in 1..=self.config.channel_sync_rounds {
            let before = self.snapshot().answered_channels;
            let missing: Vec<u8> = (0..CHANNEL_SLOTS).filter(|i| !before.contains(i)).collect();
            if missing.is_empty() {
                break;
            }
            rounds = round;

            for (n, index) in missing.iter().enumerate() {
                if n > 0 {
                    time::sleep(delay).await;
                }
                self.request_channel(*index).await?;
            }
            time::sleep(settle).await;

            let after = self.snapshot().answered_channels;
            let fresh = after.difference(&before).count();
            debug!(round, requested = missing.len(), fresh, "Channel sync round");
            if fresh == 0 {
                break;
            }
        }

        let answered = self.snapshot().answered_channels;
        let unanswered = (0..CHANNEL_SLOTS).filter(|i| !answered.contains(i)).collect();
        Ok(ChannelSyncReport {
            rounds,
            answered,
            unanswered,
        })
    }

    /// Make sure an admin session passkey is present
    ///
    /// Returns whether one is available afterwards.
    pub async fn ensure_session_passkey(&self) -> Result<bool> {
        let snapshot = self.snapshot();
        if snapshot.has_passkey {
            return Ok(true);
        }
        if !snapshot.config_complete {
            debug!("Handshake incomplete, not requesting session passkey");
            return Ok(false);
        }

        self.send_admin(AdminMessage {
            session_passkey: Vec::new(),
            payload_variant: Some(admin_message::PayloadVariant::GetConfigRequest(
                ConfigType::SessionkeyConfig as i32,
            )),
        })
        .await?;

        let obtained = self
            .wait_for(|s| s.has_passkey, self.config.session_key_timeout)
            .await;
        if !obtained {
            warn!("No session passkey issued, admin writes may be rejected");
        }
        Ok(obtained)
    }

    /// Send a text message; returns the packet id
    ///
    /// The message is echoed into the mesh state as pending right away and
    /// resolved when the routing result arrives.
    pub async fn send_text(&self, text: &str, to: u32, channel: u32) -> Result<u32> {
        if text.is_empty() {
            return Err(MeshlinkError::InvalidArgument("empty message".to_string()));
        }
        if text.len() > DATA_PAYLOAD_MAX {
            return Err(MeshlinkError::MessageTooLarge {
                size: text.len(),
                max: DATA_PAYLOAD_MAX,
            });
        }
        if channel >= u32::from(CHANNEL_SLOTS) {
            return Err(MeshlinkError::InvalidArgument(format!(
                "channel index {} out of range",
                channel
            )));
        }

        let local = self.snapshot().node_num;
        let id = random_packet_id();
        let packet = MeshPacket {
            from: 0,
            to,
            channel,
            id,
            hop_limit: u32::from(self.config.hop_limit),
            want_ack: true,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(Data {
                portnum: PortNum::TextMessageApp as i32,
                payload: text.as_bytes().to_vec(),
                ..Default::default()
            })),
            ..Default::default()
        };

        self.ctx.tracker().track(id, to);
        self.ctx.apply(message_update(
            MessageItem {
                packet_id: Some(id),
                timestamp: chrono::Utc::now(),
                from: local,
                to,
                channel,
                text: text.to_string(),
                delivery: MessageDeliveryState::Pending,
            },
            local,
        ));

        if let Err(e) = self.send(ToRadio::packet(packet)).await {
            self.ctx.tracker().untrack(id);
            self.ctx.apply(MeshUpdate::Delivery {
                packet_id: id,
                state: MessageDeliveryState::Failed {
                    reason: e.to_string(),
                    can_retry: true,
                },
            });
            return Err(e);
        }
        debug!(id, to, channel, "Text message sent");
        Ok(id)
    }

    /// Broadcast or send an alert (text prefixed with the bell marker)
    pub async fn send_alert(&self, text: &str, to: u32, channel: u32) -> Result<u32> {
        self.ensure_session_passkey().await?;
        let alert = format!("{}{}", ALERT_BELL, text);
        self.send_text(&alert, to, channel).await
    }

    /// Broadcast an alert on the primary channel
    pub async fn broadcast_alert(&self, text: &str) -> Result<u32> {
        self.send_alert(text, BROADCAST_ADDR, 0).await
    }

    /// Change the local node's owner names
    pub async fn set_owner(&self, long_name: &str, short_name: &str) -> Result<u32> {
        validate_owner(long_name, short_name)?;
        self.ensure_session_passkey().await?;

        let node = self.snapshot().node_num;
        let user = proto::User {
            id: node_id_string(node),
            long_name: long_name.to_string(),
            short_name: short_name.to_string(),
            ..Default::default()
        };
        let id = self
            .send_admin(AdminMessage {
                session_passkey: Vec::new(),
                payload_variant: Some(admin_message::PayloadVariant::SetOwner(user.clone())),
            })
            .await?;

        // The device sends no response to set_owner; reflect it locally
        self.ctx.apply(MeshUpdate::Node(NodePatch {
            user: Some((&user).into()),
            ..NodePatch::new(node)
        }));
        Ok(id)
    }

    /// Write a channel slot, then read it back from the device
    pub async fn set_channel(&self, channel: &ChannelInfo) -> Result<u32> {
        if channel.index >= CHANNEL_SLOTS {
            return Err(MeshlinkError::InvalidArgument(format!(
                "channel index {} out of range",
                channel.index
            )));
        }
        self.ensure_session_passkey().await?;

        let id = self
            .send_admin(AdminMessage {
                session_passkey: Vec::new(),
                payload_variant: Some(admin_message::PayloadVariant::SetChannel(
                    channel.to_proto(),
                )),
            })
            .await?;
        self.request_channel(channel.index).await?;
        Ok(id)
    }

    /// Disable a secondary channel slot
    pub async fn delete_channel(&self, index: u8) -> Result<u32> {
        if index == 0 {
            return Err(MeshlinkError::InvalidArgument(
                "the primary channel cannot be deleted".to_string(),
            ));
        }
        self.set_channel(&ChannelInfo {
            index,
            name: String::new(),
            psk: Vec::new(),
            role: ChannelRole::Disabled,
            uplink: false,
            downlink: false,
        })
        .await
    }

    /// Start a traceroute to `dest`; the reply arrives as a mesh update
    pub async fn traceroute(&self, dest: u32) -> Result<u32> {
        let id = random_packet_id();
        let packet = MeshPacket {
            to: dest,
            id,
            hop_limit: u32::from(self.config.hop_limit),
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(Data {
                portnum: PortNum::TracerouteApp as i32,
                payload: proto::RouteDiscovery::default().encode_to_vec(),
                want_response: true,
                ..Default::default()
            })),
            ..Default::default()
        };
        self.send(ToRadio::packet(packet)).await?;
        debug!(id, dest, "Traceroute sent");
        Ok(id)
    }

    /// Send a keep-alive now
    pub async fn heartbeat(&self) -> Result<()> {
        self.send(ToRadio::heartbeat()).await
    }

    /// Tell the device the client is leaving
    pub async fn send_disconnect(&self) -> Result<()> {
        self.send(ToRadio::disconnect()).await
    }

    /// Stop the protocol task
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn request_channel(&self, index: u8) -> Result<u32> {
        trace!(index, "Requesting channel");
        self.send_admin(AdminMessage {
            session_passkey: Vec::new(),
            payload_variant: Some(admin_message::PayloadVariant::GetChannelRequest(
                u32::from(index) + 1,
            )),
        })
        .await
    }

    async fn wait_for<F>(&self, predicate: F, limit: Duration) -> bool
    where
        F: Fn(&SessionSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let done = matches!(
            time::timeout(limit, rx.wait_for(|s| predicate(s))).await,
            Ok(Ok(_))
        );
        done
    }

    async fn reset(&self) -> Result<u32> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Reset { reply }).await?;
        rx.await.map_err(|_| MeshlinkError::ChannelClosed)
    }

    async fn abandon_handshake(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::AbandonHandshake { reply }).await?;
        rx.await.map_err(|_| MeshlinkError::ChannelClosed)
    }

    async fn write_raw(&self, bytes: Bytes) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::WriteRaw { bytes, reply }).await?;
        rx.await.map_err(|_| MeshlinkError::ChannelClosed)?
    }

    async fn send(&self, message: ToRadio) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send { message, reply }).await?;
        rx.await.map_err(|_| MeshlinkError::ChannelClosed)?
    }

    async fn send_admin(&self, admin: AdminMessage) -> Result<u32> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::SendAdmin { admin, reply }).await?;
        rx.await.map_err(|_| MeshlinkError::ChannelClosed)?
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| MeshlinkError::ChannelClosed)
    }
}

impl std::fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("framing", &self.framing)
            .field("session", &*self.snapshot.borrow())
            .finish()
    }
}

fn random_packet_id() -> u32 {
    rand::thread_rng().gen_range(1..=u32::MAX)
}

fn validate_owner(long_name: &str, short_name: &str) -> Result<()> {
    if long_name.trim().is_empty() || long_name.len() > MAX_LONG_NAME {
        return Err(MeshlinkError::InvalidArgument(format!(
            "long name must be 1-{} bytes",
            MAX_LONG_NAME
        )));
    }
    let short_len = short_name.chars().count();
    if short_len == 0 || short_len > MAX_SHORT_NAME {
        return Err(MeshlinkError::InvalidArgument(format!(
            "short name must be 1-{} characters",
            MAX_SHORT_NAME
        )));
    }
    Ok(())
}

/// State owned by the protocol task
struct EngineTask {
    transport: Arc<dyn RadioTransport>,
    inbound: InboundBuffer,
    decoder: FrameDecoder,
    dispatcher: PacketDispatcher,
    session: ProtocolSession,
    ctx: Arc<MeshContext>,
    commands: mpsc::Receiver<Command>,
    // Weak so that dropping every handle still ends the task
    handle: mpsc::WeakSender<Command>,
    snapshot: watch::Sender<SessionSnapshot>,
    heartbeat: Option<Interval>,
    /// Set while a recovery handshake is outstanding
    handshake_deadline: Option<Instant>,
    /// Channel slots must be re-read once the recovery handshake completes
    resync_pending: bool,
    framing: Framing,
    config: Arc<ProtocolConfig>,
}

impl EngineTask {
    async fn run(mut self) {
        debug!(transport = self.transport.name(), "Protocol task started");
        loop {
            let deadline = self.decoder.next_deadline();
            let handshake_deadline = self.handshake_deadline;
            let synced = self.session.phase == SessionPhase::Synced;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                _ = self.inbound.notified() => self.process_inbound().await,
                _ = sleep_until_opt(deadline) => {
                    let events = self.decoder.poll_timeout(Instant::now());
                    self.handle_events(events).await;
                }
                _ = sleep_until_opt(handshake_deadline) => {
                    warn!(
                        timeout = ?self.config.handshake_timeout,
                        "Recovery handshake did not complete"
                    );
                    self.abandon_handshake();
                }
                _ = tick_opt(&mut self.heartbeat), if synced => {
                    if let Err(e) = self.write_message(&ToRadio::heartbeat()).await {
                        warn!(error = %e, "Heartbeat failed");
                    }
                }
            }
        }
        debug!(transport = self.transport.name(), "Protocol task stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Reset { reply } => {
                let nonce = random_packet_id();
                self.session.reset(nonce);
                self.decoder.reset(Instant::now());
                self.inbound.clear();
                self.handshake_deadline = None;
                self.resync_pending = false;
                self.publish();
                let _ = reply.send(nonce);
            }
            Command::AbandonHandshake { reply } => {
                self.abandon_handshake();
                let _ = reply.send(());
            }
            Command::WriteRaw { bytes, reply } => {
                let _ = reply.send(self.transport.write(&bytes).await);
            }
            Command::Send { message, reply } => {
                let _ = reply.send(self.write_message(&message).await);
            }
            Command::SendAdmin { admin, reply } => {
                let _ = reply.send(self.write_admin(admin).await);
            }
            Command::Shutdown => {}
        }
    }

    /// Address an admin message to the local node, filling in the passkey
    async fn write_admin(&self, mut admin: AdminMessage) -> Result<u32> {
        let node = self.session.node_num;
        if node == 0 {
            return Err(MeshlinkError::NotReady(
                "local node number unknown".to_string(),
            ));
        }
        if admin.session_passkey.is_empty() {
            admin.session_passkey = self.session.passkey.clone();
        }
        let id = random_packet_id();
        let packet = MeshPacket {
            to: node,
            id,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(Data {
                portnum: PortNum::AdminApp as i32,
                payload: admin.encode_to_vec(),
                want_response: true,
                ..Default::default()
            })),
            ..Default::default()
        };
        self.write_message(&ToRadio::packet(packet)).await?;
        Ok(id)
    }

    async fn write_message(&self, message: &ToRadio) -> Result<()> {
        let payload = message.encode_to_vec();
        let bytes = encode_for(self.framing, &payload)?;
        if self.ctx.settings().verbose_frame_logging() {
            trace!(len = bytes.len(), "Writing to radio");
        }
        self.transport.write(&bytes).await
    }

    async fn process_inbound(&mut self) {
        // One chunk per push keeps datagram boundaries
        for chunk in self.inbound.take() {
            let events = self.decoder.push(&chunk, Instant::now());
            self.handle_events(events).await;
        }
    }

    async fn handle_events(&mut self, events: Vec<DecodeEvent>) {
        for event in events {
            match event {
                DecodeEvent::Frame(bytes) => match proto::decode::<FromRadio>(&bytes) {
                    Ok(message) => {
                        self.decoder.mark_decoded(Instant::now());
                        self.handle_from_radio(message).await;
                    }
                    Err(e) => warn!(error = %e, len = bytes.len(), "Undecodable frame"),
                },
                DecodeEvent::Diagnostic(line) => {
                    debug!(target: "meshlink_radio::device", "{}", line);
                }
                DecodeEvent::RecoveryNeeded => self.recover("no messages decoded").await,
            }
        }
    }

    async fn handle_from_radio(&mut self, message: FromRadio) {
        match message.payload_variant {
            Some(from_radio::PayloadVariant::MyInfo(info)) => {
                debug!(node = %node_id_string(info.my_node_num), "Learned local node");
                self.session.node_num = info.my_node_num;
                self.publish();
            }
            Some(from_radio::PayloadVariant::NodeInfo(node)) => {
                self.stage_or_apply(MeshUpdate::Node(NodePatch::from_node_info(&node)));
            }
            Some(from_radio::PayloadVariant::Channel(channel)) => {
                if let Some(info) = ChannelInfo::from_proto(&channel) {
                    self.session.answered_channels.insert(info.index);
                    self.publish();
                    self.stage_or_apply(MeshUpdate::Channel(info));
                }
            }
            Some(from_radio::PayloadVariant::ConfigCompleteId(id)) => {
                match self.session.complete(id) {
                    Some(staged) => {
                        info!(staged = staged.len(), "Handshake complete");
                        self.handshake_deadline = None;
                        for update in staged {
                            self.ctx.apply(update);
                        }
                        self.publish();
                        if std::mem::take(&mut self.resync_pending) {
                            self.spawn_channel_resync();
                        }
                    }
                    None => debug!(
                        id,
                        expected = self.session.config_nonce,
                        "Ignoring unexpected config completion"
                    ),
                }
            }
            Some(from_radio::PayloadVariant::Rebooted(_)) => {
                warn!("Radio rebooted");
                self.recover("device rebooted").await;
            }
            Some(from_radio::PayloadVariant::LogRecord(record)) => log_device_record(&record),
            Some(from_radio::PayloadVariant::Packet(packet)) => {
                let dispatched = self.dispatcher.dispatch(&packet, self.session.node_num);
                if let Some(admin) = dispatched.admin {
                    self.handle_admin(&admin);
                }
                for update in dispatched.updates {
                    self.stage_or_apply(update);
                }
            }
            None => trace!(id = message.id, "Empty message from radio"),
        }
    }

    fn handle_admin(&mut self, admin: &AdminMessage) {
        let mut changed = false;
        if !admin.session_passkey.is_empty() && admin.session_passkey != self.session.passkey {
            debug!("Session passkey updated");
            self.session.passkey = admin.session_passkey.clone();
            changed = true;
        }
        if let Some(admin_message::PayloadVariant::GetChannelResponse(channel)) =
            &admin.payload_variant
        {
            if let Ok(index) = u8::try_from(channel.index) {
                if index < CHANNEL_SLOTS {
                    changed |= self.session.answered_channels.insert(index);
                }
            }
        }
        if changed {
            self.publish();
        }
    }

    fn stage_or_apply(&mut self, update: MeshUpdate) {
        if let Some(update) = self.session.stage(update) {
            self.ctx.apply(update);
        }
    }

    /// Release staged updates and let later ones pass straight through
    fn abandon_handshake(&mut self) {
        self.handshake_deadline = None;
        if let Some(staged) = self.session.abandon_handshake() {
            debug!(staged = staged.len(), "Releasing updates staged during handshake");
            for update in staged {
                self.ctx.apply(update);
            }
            self.publish();
        }
    }

    /// Re-read channel slots through a temporary handle
    fn spawn_channel_resync(&self) {
        if !self.session.snapshot().is_ready() {
            return;
        }
        let Some(commands) = self.handle.upgrade() else {
            return;
        };
        let engine = ProtocolEngine {
            commands,
            snapshot: self.snapshot.subscribe(),
            ctx: self.ctx.clone(),
            config: self.config.clone(),
            framing: self.framing,
        };
        tokio::spawn(async move {
            match engine.run_channel_sync().await {
                Ok(report) => debug!(
                    rounds = report.rounds,
                    answered = report.answered.len(),
                    "Channel re-sync done"
                ),
                Err(e) => warn!(error = %e, "Channel re-sync failed"),
            }
        });
    }

    /// Wake the device and request a fresh config without dropping the link
    async fn recover(&mut self, reason: &str) {
        info!(reason, "Recovering radio session");
        let nonce = random_packet_id();
        self.session.restart_handshake(nonce);
        self.decoder.mark_decoded(Instant::now());
        self.handshake_deadline = Some(Instant::now() + self.config.handshake_timeout);
        self.resync_pending = true;
        self.publish();

        if self.framing == Framing::Stream && self.config.wakeup_len > 0 {
            if let Err(e) = self.transport.write(&wakeup_sequence(self.config.wakeup_len)).await {
                warn!(error = %e, "Wakeup write failed");
                return;
            }
        }
        if let Err(e) = self.write_message(&ToRadio::want_config(nonce)).await {
            warn!(error = %e, "Config request failed during recovery");
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.session.snapshot());
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_device_record(record: &proto::LogRecord) {
    let level = LogLevel::try_from(record.level).unwrap_or(LogLevel::Unset);
    let source = record.source.as_str();
    match level {
        LogLevel::Critical | LogLevel::Error => {
            error!(target: "meshlink_radio::device", source, "{}", record.message)
        }
        LogLevel::Warning => warn!(target: "meshlink_radio::device", source, "{}", record.message),
        LogLevel::Info => info!(target: "meshlink_radio::device", source, "{}", record.message),
        LogLevel::Debug | LogLevel::Unset => {
            debug!(target: "meshlink_radio::device", source, "{}", record.message)
        }
        LogLevel::Trace => trace!(target: "meshlink_radio::device", source, "{}", record.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_validation() {
        assert!(validate_owner("Base Camp", "BC").is_ok());
        assert!(validate_owner("", "BC").is_err());
        assert!(validate_owner(&"x".repeat(40), "BC").is_err());
        assert!(validate_owner(&"x".repeat(39), "BC").is_ok());
        assert!(validate_owner("Base Camp", "").is_err());
        assert!(validate_owner("Base Camp", "ABCDE").is_err());
        // characters, not bytes
        assert!(validate_owner("Base Camp", "🏕️").is_ok());
    }

    #[test]
    fn test_packet_ids_non_zero() {
        for _ in 0..1000 {
            assert_ne!(random_packet_id(), 0);
        }
    }
}
