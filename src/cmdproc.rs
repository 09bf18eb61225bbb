use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, error, trace, warn};

use crate::command::{Command, Verb};
use crate::message::Message;
use crate::transaction::{History, Transaction};
use crate::transport::TransportWriter;

/// Handler for an inbound command line. The handler receives the dispatcher mutably so it can
///  send follow-up transactions or register a payload handler from inside the callback.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn on_command(&self, cmdproc: &mut CmdProc, cmd: &Command);
}

/// Handler for a complete (reassembled) message of a registered content type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, cmdproc: &mut CmdProc, msg: &Message);
}

/// Handler for a numeric error reply. `trans` is the transaction the error was correlated to,
///  or `None` if the code did not match any outstanding transaction.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn on_error(&self, cmdproc: &mut CmdProc, trans: Option<&Transaction>, code: u32);
}

/// One-shot override for the next payload block, registered by a command handler while its
///  command is being dispatched. Without one, the payload is parsed as a [`Message`] and fed
///  through [`CmdProc::process_msg`].
#[async_trait]
pub trait PayloadHandler: Send + Sync {
    async fn on_payload(&self, cmdproc: &mut CmdProc, cmd: &Command, payload: &[u8]);
}

struct ChunkReassembly {
    msg: Message,
    total_chunks: u32,
    received_chunks: u32,
}

/// The command dispatcher of one logical connection: routes inbound lines to callbacks,
///  matches replies and error codes to outstanding transactions via its [`History`], and
///  reassembles chunked messages. Owned exclusively by its connection; destroying it drops all
///  queued transactions, history entries and partial reassemblies.
pub struct CmdProc {
    history: History,
    outgoing_queue: VecDeque<Transaction>,
    command_handlers: FxHashMap<Verb, Arc<dyn CommandHandler>>,
    fallback_handler: Option<Arc<dyn CommandHandler>>,
    message_handlers: FxHashMap<String, Arc<dyn MessageHandler>>,
    error_handlers: FxHashMap<Verb, Arc<dyn ErrorHandler>>,
    unmatched_error_handler: Option<Arc<dyn ErrorHandler>>,
    payload_handler: Option<Arc<dyn PayloadHandler>>,
    pending_chunks: FxHashMap<String, ChunkReassembly>,
    last_command: Option<Command>,
    writer: Arc<dyn TransportWriter>,
}

impl CmdProc {
    /// Chunk counts are only accepted strictly below this bound (and above zero) - this caps
    ///  the memory a peer can tie up in reassembly state by claiming an enormous chunk count.
    pub const MAX_CHUNK_COUNT: u32 = 1024;

    pub fn new(writer: Arc<dyn TransportWriter>) -> CmdProc {
        CmdProc {
            history: History::new(),
            outgoing_queue: VecDeque::new(),
            command_handlers: FxHashMap::default(),
            fallback_handler: None,
            message_handlers: FxHashMap::default(),
            error_handlers: FxHashMap::default(),
            unmatched_error_handler: None,
            payload_handler: None,
            pending_chunks: FxHashMap::default(),
            last_command: None,
            writer,
        }
    }

    pub fn register_command_handler(&mut self, verb: Verb, handler: Arc<dyn CommandHandler>) {
        if self.command_handlers.insert(verb.clone(), handler).is_some() {
            warn!("replacing a previously registered handler for verb {}", verb);
        }
    }

    pub fn set_fallback_handler(&mut self, handler: Arc<dyn CommandHandler>) {
        self.fallback_handler = Some(handler);
    }

    pub fn register_message_handler(&mut self, content_type: &str, handler: Arc<dyn MessageHandler>) {
        if self.message_handlers.insert(content_type.to_string(), handler).is_some() {
            warn!("replacing a previously registered handler for content type {}", content_type);
        }
    }

    pub fn register_error_handler(&mut self, verb: Verb, handler: Arc<dyn ErrorHandler>) {
        self.error_handlers.insert(verb, handler);
    }

    pub fn set_unmatched_error_handler(&mut self, handler: Arc<dyn ErrorHandler>) {
        self.unmatched_error_handler = Some(handler);
    }

    /// Registers the one-shot payload handler for the payload declared by the command
    ///  currently being dispatched.
    pub fn set_payload_handler(&mut self, handler: Arc<dyn PayloadHandler>) {
        self.payload_handler = Some(handler);
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut History {
        &mut self.history
    }

    /// Assigns a transaction id, serializes and writes the transaction (line plus payload),
    ///  and retains it in the history for reply correlation. Returns the assigned id.
    pub async fn send_trans(&mut self, trans: Transaction) -> anyhow::Result<u32> {
        let id = self.history.add(trans);
        let buf = self.history.find_mut(id)
            .expect("transaction was just added")
            .wire_bytes();

        trace!("sending transaction {} ({} bytes)", id, buf.len());
        self.writer.write(&buf).await?;

        Ok(id)
    }

    /// Appends a transaction to the outgoing queue without sending it; it goes on the wire
    ///  when [`CmdProc::process_queue`] is invoked. Used to hold commands back until a
    ///  precondition (transport ready, roster joined) holds.
    pub fn queue_trans(&mut self, trans: Transaction) {
        self.outgoing_queue.push_back(trans);
    }

    /// Sends all queued transactions, in FIFO order.
    pub async fn process_queue(&mut self) -> anyhow::Result<()> {
        while let Some(trans) = self.outgoing_queue.pop_front() {
            self.send_trans(trans).await?;
        }
        Ok(())
    }

    /// Writes a command without assigning a transaction id and without history bookkeeping -
    ///  for fire-and-forget commands that the server never correlates a reply to.
    pub async fn send_quick(&mut self, verb: Verb, params: &str, payload: Option<Bytes>) -> anyhow::Result<()> {
        let line = if params.is_empty() {
            format!("{}\r\n", verb)
        }
        else {
            format!("{} {}\r\n", verb, params)
        };

        let mut buf = BytesMut::with_capacity(line.len());
        buf.put_slice(line.as_bytes());
        if let Some(payload) = payload {
            buf.put_slice(&payload);
        }

        self.writer.write(&buf).await?;
        Ok(())
    }

    /// Parses and dispatches one command line. Returns the payload length the command
    ///  declares, so the framer knows how many raw bytes to collect next. A line that fails to
    ///  parse is dropped (logged), never fatal.
    pub async fn process_cmd_text(&mut self, line: &str) -> usize {
        match Command::parse(line) {
            Ok(cmd) => self.process_cmd(cmd).await,
            Err(e) => {
                warn!("dropping unparseable command line: {:#}", e);
                0
            }
        }
    }

    /// Dispatches one parsed command. Handler resolution order: a globally registered handler
    ///  for the verb, then the matching transaction's own reply handler table, then the
    ///  fallback. Exactly one handler (or none) runs; an unhandled verb is logged and dropped.
    pub async fn process_cmd(&mut self, cmd: Command) -> usize {
        trace!("processing command {:?}", cmd);

        if let Some(code) = cmd.error_code() {
            // error replies never flow into the verb dispatch below
            self.process_error(&cmd, code).await;
            return 0;
        }

        if let Some(trid) = cmd.transaction_id {
            if let Some(trans) = self.history.find_mut(trid) {
                // the reply arrived in time, so the retry timer must never fire
                trans.cancel_retry_timer();
            }
        }

        let handler = self.command_handlers.get(&cmd.verb).cloned()
            .or_else(|| cmd.transaction_id
                .and_then(|trid| self.history.find(trid))
                .and_then(|trans| trans.reply_handler(&cmd.verb)))
            .or_else(|| self.fallback_handler.clone());

        match handler {
            Some(handler) => handler.on_command(self, &cmd).await,
            None => debug!("no handler for command verb {} - dropping", cmd.verb),
        }

        // a dependent request held back behind this reply goes on the wire now, preserving
        //  program order
        let pendant = cmd.transaction_id
            .and_then(|trid| self.history.find_mut(trid))
            .and_then(|trans| trans.take_pendant());
        if let Some(pendant) = pendant {
            if let Err(e) = self.send_trans(pendant).await {
                error!("error sending pendant transaction: {:#}", e);
            }
        }

        let declared_payload_len = cmd.declared_payload_len;
        if declared_payload_len == 0 {
            // a one-shot handler only covers the payload its own command declared; with none
            //  declared it must not survive to hijack the next command's payload
            self.payload_handler = None;
        }
        self.last_command = Some(cmd);
        declared_payload_len
    }

    async fn process_error(&mut self, cmd: &Command, code: u32) {
        let trans = cmd.transaction_id.and_then(|trid| self.history.remove(trid));

        match trans {
            Some(mut trans) => {
                trans.cancel_retry_timer();

                let handler = trans.error_handler()
                    .or_else(|| self.error_handlers.get(trans.verb()).cloned())
                    .or_else(|| self.unmatched_error_handler.clone());
                match handler {
                    Some(handler) => handler.on_error(self, Some(&trans), code).await,
                    None => warn!("unhandled error code {} for {:?}", code, trans),
                }
            }
            None => {
                match self.unmatched_error_handler.clone() {
                    Some(handler) => handler.on_error(self, None, code).await,
                    None => warn!("error code {} does not match any outstanding transaction", code),
                }
            }
        }
    }

    /// Consumes the payload block declared by the most recently dispatched command. With a
    ///  registered one-shot payload handler, that handler runs; otherwise the payload is
    ///  parsed as a [`Message`] and dispatched through [`CmdProc::process_msg`].
    pub async fn process_payload(&mut self, payload: &[u8]) {
        let Some(cmd) = self.last_command.take() else {
            warn!("received {} payload bytes without a preceding command - discarding", payload.len());
            return;
        };

        if let Some(handler) = self.payload_handler.take() {
            handler.on_payload(self, &cmd, payload).await;
        }
        else {
            match Message::parse_payload(payload) {
                Ok(mut msg) => {
                    if cmd.verb.is_message_bearing() {
                        msg.remote_user = cmd.param(0).map(str::to_string);
                    }
                    self.process_msg(msg).await;
                }
                Err(e) => warn!("dropping unparseable payload for {}: {:#}", cmd.verb, e),
            }
        }

        self.last_command = Some(cmd);
    }

    /// Reassembles chunked messages and dispatches complete ones by content type. An
    ///  unmatched content type is logged and dropped, never fatal.
    pub async fn process_msg(&mut self, msg: Message) {
        let msg = match self.reassemble(msg) {
            Some(msg) => msg,
            None => return, // waiting for more chunks, or discarded
        };

        let handler = msg.content_type()
            .and_then(|content_type| self.message_handlers.get(content_type).cloned());
        match handler {
            Some(handler) => handler.on_message(self, &msg).await,
            None => debug!("no handler for content type {:?} - dropping message", msg.content_type()),
        }
    }

    /// Returns the complete message, or `None` while chunks are outstanding (or the message
    ///  was discarded). A message without a `Message-ID` header is complete as-is; one with
    ///  `Chunks: n` starts a reassembly; one with a `Chunk` header continues it.
    fn reassemble(&mut self, msg: Message) -> Option<Message> {
        let Some(message_id) = msg.header("Message-ID").map(str::to_string) else {
            return Some(msg);
        };

        if let Some(raw_total) = msg.header("Chunks") {
            let total = raw_total.parse::<u32>().unwrap_or(0);
            if total == 0 || total >= Self::MAX_CHUNK_COUNT {
                warn!("message {} declares {} chunks, outside (0, {}) - discarding", message_id, raw_total, Self::MAX_CHUNK_COUNT);
                return None;
            }
            if total == 1 {
                return Some(msg);
            }

            trace!("message {} starts reassembly with {} chunks", message_id, total);
            self.pending_chunks.insert(message_id, ChunkReassembly {
                msg,
                total_chunks: total,
                received_chunks: 1,
            });
            None
        }
        else if msg.header("Chunk").is_some() {
            let Some(pending) = self.pending_chunks.get_mut(&message_id) else {
                warn!("continuation chunk for unknown message {} - discarding", message_id);
                return None;
            };

            pending.msg.append_body(msg.body());
            pending.received_chunks += 1;

            if pending.received_chunks < pending.total_chunks {
                return None;
            }

            trace!("message {} reassembly complete", message_id);
            self.pending_chunks.remove(&message_id).map(|pending| pending.msg)
        }
        else {
            Some(msg)
        }
    }

    /// Drops all queued transactions, history entries (cancelling their retry timers) and
    ///  partial reassemblies. Called when the owning connection goes away.
    pub fn shutdown(&mut self) {
        self.outgoing_queue.clear();
        self.history.clear();
        self.pending_chunks.clear();
        self.payload_handler = None;
        self.last_command = None;
    }
}
