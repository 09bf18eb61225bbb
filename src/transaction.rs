use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cmdproc::{CommandHandler, ErrorHandler};
use crate::command::Verb;

/// One outgoing request. Created by a caller, then handed to the dispatcher for sending; the
///  transaction id is assigned (overwritten) by [`History`] at send time, and the [`History`]
///  owns the transaction exclusively from then on until it is matched-and-removed or evicted.
pub struct Transaction {
    transaction_id: u32,
    verb: Verb,
    params: String,
    payload: Option<Bytes>,
    reply_handlers: FxHashMap<Verb, Arc<dyn CommandHandler>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    retry_handle: Option<JoinHandle<()>>,
    pendant: Option<Box<Transaction>>,
}

impl Debug for Transaction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transaction{{id:{}, verb:{}, params:{:?}}}", self.transaction_id, self.verb, self.params)
    }
}

impl Transaction {
    pub fn new(verb: Verb, params: &str) -> Transaction {
        Transaction {
            transaction_id: 0,
            verb,
            params: params.to_string(),
            payload: None,
            reply_handlers: FxHashMap::default(),
            error_handler: None,
            retry_handle: None,
            pendant: None,
        }
    }

    pub fn with_payload(mut self, payload: Bytes) -> Transaction {
        self.payload = Some(payload);
        self
    }

    pub fn id(&self) -> u32 {
        self.transaction_id
    }

    pub fn verb(&self) -> &Verb {
        &self.verb
    }

    pub fn params(&self) -> &str {
        &self.params
    }

    pub fn set_reply_handler(&mut self, verb: Verb, handler: Arc<dyn CommandHandler>) {
        self.reply_handlers.insert(verb, handler);
    }

    pub fn reply_handler(&self, verb: &Verb) -> Option<Arc<dyn CommandHandler>> {
        self.reply_handlers.get(verb).cloned()
    }

    pub fn set_error_handler(&mut self, handler: Arc<dyn ErrorHandler>) {
        self.error_handler = Some(handler);
    }

    pub fn error_handler(&self) -> Option<Arc<dyn ErrorHandler>> {
        self.error_handler.clone()
    }

    /// Registers a retry timer task for this transaction. A previously registered timer is
    ///  cancelled first - at most one timer may be pending per transaction.
    pub fn set_retry_handle(&mut self, handle: JoinHandle<()>) {
        self.cancel_retry_timer();
        self.retry_handle = Some(handle);
    }

    /// Cancels the pending retry timer, if any. A cancelled timer never fires.
    pub fn cancel_retry_timer(&mut self) {
        if let Some(handle) = self.retry_handle.take() {
            handle.abort();
        }
    }

    /// Attaches a follow-up transaction that is sent automatically once the reply to this one
    ///  arrives - this serializes dependent requests without the caller having to track the
    ///  reply itself.
    pub fn set_pendant(&mut self, pendant: Transaction) {
        self.pendant = Some(Box::new(pendant));
    }

    pub fn take_pendant(&mut self) -> Option<Transaction> {
        self.pendant.take().map(|b| *b)
    }

    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// Serializes the full wire representation: `VERB id[ params]\r\n` followed directly by the
    ///  payload bytes (no additional delimiter). The payload is taken out of the transaction so
    ///  a later retry of the bookkeeping entry can never re-send it.
    pub fn wire_bytes(&mut self) -> Bytes {
        let line = if self.params.is_empty() {
            format!("{} {}\r\n", self.verb, self.transaction_id)
        }
        else {
            format!("{} {} {}\r\n", self.verb, self.transaction_id, self.params)
        };

        let mut buf = BytesMut::with_capacity(line.len());
        buf.put_slice(line.as_bytes());
        if let Some(payload) = self.payload.take() {
            buf.put_slice(&payload);
        }

        buf.freeze()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.cancel_retry_timer();
    }
}

/// A bounded FIFO of in-flight transactions, keyed by transaction id.
///
/// Servers reply to some requests out of order and never reply to others, so this is a lossy
///  correlation cache: insertion-ordered, scanned by id, oldest entry dropped once the
///  capacity bound is exceeded. Losing correlation for a very old un-replied transaction is
///  an accepted tradeoff against unbounded growth.
pub struct History {
    next_id: u32,
    queue: VecDeque<Transaction>,
    capacity: usize,
}

impl History {
    pub const DEFAULT_CAPACITY: usize = 20;

    pub fn new() -> History {
        History::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> History {
        History {
            next_id: 1,
            queue: VecDeque::new(),
            capacity,
        }
    }

    /// Stamps the transaction with the next id, stores it, and returns the assigned id. Ids are
    ///  strictly increasing and unique within the window.
    pub fn add(&mut self, mut trans: Transaction) -> u32 {
        let id = self.next_id;
        self.next_id += 1;

        trans.transaction_id = id;
        self.queue.push_back(trans);

        if self.queue.len() > self.capacity {
            // the evicted transaction is destroyed, not just forgotten - any late reply to it
            //  is treated as unmatched
            if let Some(evicted) = self.queue.pop_front() {
                debug!("history full - evicting {:?}", evicted);
            }
        }

        id
    }

    /// Linear scan; acceptable because the capacity bound is a small constant.
    pub fn find(&self, id: u32) -> Option<&Transaction> {
        self.queue.iter().find(|t| t.transaction_id == id)
    }

    pub fn find_mut(&mut self, id: u32) -> Option<&mut Transaction> {
        self.queue.iter_mut().find(|t| t.transaction_id == id)
    }

    pub fn remove(&mut self, id: u32) -> Option<Transaction> {
        let pos = self.queue.iter().position(|t| t.transaction_id == id)?;
        self.queue.remove(pos)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl Default for History {
    fn default() -> Self {
        History::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use tokio::time;

    #[rstest]
    fn test_add_assigns_monotonic_ids() {
        let mut history = History::new();

        let ids: Vec<u32> = (0..5)
            .map(|_| history.add(Transaction::new(Verb::Chg, "NLN")))
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        for id in ids {
            assert_eq!(history.find(id).unwrap().id(), id);
        }
        assert!(history.find(99).is_none());
    }

    #[rstest]
    fn test_eviction_drops_oldest() {
        let mut history = History::with_capacity(3);

        for _ in 0..4 {
            history.add(Transaction::new(Verb::Adl, ""));
        }

        assert_eq!(history.len(), 3);
        assert!(history.find(1).is_none(), "oldest entry must be evicted");
        for id in 2..=4 {
            assert!(history.find(id).is_some());
        }
    }

    #[rstest]
    fn test_remove() {
        let mut history = History::new();
        history.add(Transaction::new(Verb::Adl, "a"));
        let id = history.add(Transaction::new(Verb::Rml, "b"));
        history.add(Transaction::new(Verb::Adl, "c"));

        let removed = history.remove(id).unwrap();
        assert_eq!(removed.verb(), &Verb::Rml);
        assert_eq!(history.len(), 2);
        assert!(history.find(id).is_none());
        assert!(history.remove(id).is_none());
    }

    #[rstest]
    #[case::with_params(Verb::Chg, "NLN 0", None, b"CHG 3 NLN 0\r\n".to_vec())]
    #[case::no_params(Verb::Png, "", None, b"PNG 3\r\n".to_vec())]
    #[case::with_payload(Verb::Uux, "12", Some(b"<Data></Data>".to_vec()), b"UUX 3 12\r\n<Data></Data>".to_vec())]
    fn test_wire_bytes(
        #[case] verb: Verb,
        #[case] params: &str,
        #[case] payload: Option<Vec<u8>>,
        #[case] expected: Vec<u8>,
    ) {
        let mut history = History::new();
        history.add(Transaction::new(Verb::Adl, ""));
        history.add(Transaction::new(Verb::Adl, ""));

        let mut trans = Transaction::new(verb, params);
        if let Some(payload) = payload {
            trans = trans.with_payload(Bytes::from(payload));
        }
        let id = history.add(trans);
        assert_eq!(id, 3);

        let trans = history.find_mut(id).unwrap();
        assert_eq!(trans.wire_bytes().as_ref(), expected.as_slice());
    }

    #[rstest]
    fn test_wire_bytes_clears_payload() {
        let mut trans = Transaction::new(Verb::Msg, "N 5").with_payload(Bytes::from_static(b"hello"));
        trans.transaction_id = 9;

        assert_eq!(trans.wire_bytes().as_ref(), b"MSG 9 N 5\r\nhello");
        assert!(!trans.has_payload());
        // a second serialization (retry bookkeeping) must not re-send the payload
        assert_eq!(trans.wire_bytes().as_ref(), b"MSG 9 N 5\r\n");
    }

    #[rstest]
    fn test_drop_aborts_retry_timer() {
        let runtime = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        runtime.block_on(async {
            let fired = Arc::new(AtomicBool::new(false));

            let mut trans = Transaction::new(Verb::Chg, "NLN 0");
            let fired_in_timer = fired.clone();
            trans.set_retry_handle(tokio::spawn(async move {
                time::sleep(Duration::from_secs(60)).await;
                fired_in_timer.store(true, Ordering::SeqCst);
            }));

            // dropping the transaction (eviction, disconnect) must take the timer with it
            drop(trans);

            time::sleep(Duration::from_secs(300)).await;
            assert!(!fired.load(Ordering::SeqCst), "an aborted timer must never fire");
        });
    }

    #[rstest]
    fn test_set_retry_handle_aborts_the_previous_timer() {
        let runtime = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        runtime.block_on(async {
            let fired = Arc::new(AtomicBool::new(false));

            let mut trans = Transaction::new(Verb::Chg, "NLN 0");
            let fired_in_timer = fired.clone();
            trans.set_retry_handle(tokio::spawn(async move {
                time::sleep(Duration::from_secs(60)).await;
                fired_in_timer.store(true, Ordering::SeqCst);
            }));
            trans.set_retry_handle(tokio::spawn(async {}));

            time::sleep(Duration::from_secs(300)).await;
            assert!(!fired.load(Ordering::SeqCst));
        });
    }

    #[rstest]
    fn test_pendant_taken_once() {
        let mut trans = Transaction::new(Verb::Adl, "");
        trans.set_pendant(Transaction::new(Verb::Rml, "x"));

        let pendant = trans.take_pendant().unwrap();
        assert_eq!(pendant.verb(), &Verb::Rml);
        assert!(trans.take_pendant().is_none());
    }
}
