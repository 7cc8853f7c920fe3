//! Outgoing and pending-ack queues owned by the connection.

use std::collections::VecDeque;

use crate::deferred::Resolver;
use crate::protocol::{Action, ProtocolMessage};
use crate::types::PresenceAction;

/// Who to tell when an envelope is acknowledged or rejected.
pub(crate) enum AckTarget {
    /// A caller waiting on a [`Deferred`](crate::Deferred).
    Caller(Resolver<()>),
    /// A local presence action; success is signalled by its reflection, so
    /// only failure is reported.
    LocalPresence {
        channel: String,
        client_id: String,
        action: PresenceAction,
    },
    /// Automatic re-entry of a local member.
    ReEnter { channel: String, client_id: String },
}

/// An ack-required protocol message plus everyone waiting on it.
pub(crate) struct Envelope {
    pub(crate) msg: ProtocolMessage,
    pub(crate) targets: Vec<AckTarget>,
}

impl Envelope {
    pub(crate) fn new(msg: ProtocolMessage, targets: Vec<AckTarget>) -> Self {
        Envelope { msg, targets }
    }

    pub(crate) fn channel(&self) -> Option<&str> {
        self.msg.channel.as_deref()
    }

    fn serial(&self) -> Option<i64> {
        self.msg.msg_serial
    }
}

/// Strict FIFO queues: `outgoing` holds envelopes not yet handed to the
/// transport, `pending` holds sent envelopes awaiting ACK/NACK in serial order.
#[derive(Default)]
pub(crate) struct MessageQueue {
    outgoing: VecDeque<Envelope>,
    pending: VecDeque<Envelope>,
}

/// Result of matching an ACK or NACK against the pending queue.
pub(crate) struct Settled {
    /// Envelopes inside the acknowledged serial range.
    pub(crate) matched: Vec<Envelope>,
    /// Envelopes older than the range; the server will never answer them.
    pub(crate) lost: Vec<Envelope>,
}

impl MessageQueue {
    /// Queue an envelope, merging MESSAGE envelopes for the same channel into
    /// the last queued one while the combined batch stays within limits.
    pub(crate) fn push(&mut self, mut envelope: Envelope, max_batch: usize, max_size: usize) {
        if let Some(last) = self.outgoing.back_mut()
            && can_bundle(&last.msg, &envelope.msg, max_batch, max_size)
            && let Some(extra) = envelope.msg.messages.take()
            && let Some(messages) = last.msg.messages.as_mut()
        {
            messages.extend(extra);
            last.targets.append(&mut envelope.targets);
            return;
        }
        self.outgoing.push_back(envelope);
    }

    pub(crate) fn pop_outgoing(&mut self) -> Option<Envelope> {
        self.outgoing.pop_front()
    }

    pub(crate) fn push_pending(&mut self, envelope: Envelope) {
        self.pending.push_back(envelope);
    }

    #[cfg(test)]
    pub(crate) fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Match `[serial, serial + count - 1]` against the pending queue.
    pub(crate) fn settle(&mut self, serial: i64, count: i64) -> Settled {
        let end = serial.saturating_add(count.max(1) - 1);
        let mut settled = Settled {
            matched: Vec::new(),
            lost: Vec::new(),
        };
        while let Some(front) = self.pending.front() {
            let Some(front_serial) = front.serial() else {
                // Never sent with a serial; nothing can acknowledge it.
                if let Some(env) = self.pending.pop_front() {
                    settled.lost.push(env);
                }
                continue;
            };
            if front_serial > end {
                break;
            }
            let Some(env) = self.pending.pop_front() else {
                break;
            };
            if front_serial < serial {
                settled.lost.push(env);
            } else {
                settled.matched.push(env);
            }
        }
        settled
    }

    /// After a successful resume, sent-but-unacknowledged envelopes go back
    /// to the front of the outgoing queue, keeping their serials and order.
    pub(crate) fn requeue_pending(&mut self) {
        while let Some(env) = self.pending.pop_back() {
            self.outgoing.push_front(env);
        }
    }

    /// Remove every queued and pending envelope, pending first.
    pub(crate) fn drain_all(&mut self) -> Vec<Envelope> {
        let mut all: Vec<Envelope> = self.pending.drain(..).collect();
        all.extend(self.outgoing.drain(..));
        all
    }

    /// Remove the envelopes addressed to one channel.
    pub(crate) fn drain_channel(&mut self, channel: &str) -> Vec<Envelope> {
        let mut removed = Vec::new();
        for queue in [&mut self.pending, &mut self.outgoing] {
            let mut kept = VecDeque::with_capacity(queue.len());
            for env in queue.drain(..) {
                if env.channel() == Some(channel) {
                    removed.push(env);
                } else {
                    kept.push_back(env);
                }
            }
            *queue = kept;
        }
        removed
    }
}

fn can_bundle(
    last: &ProtocolMessage,
    next: &ProtocolMessage,
    max_batch: usize,
    max_size: usize,
) -> bool {
    if last.action != Action::Message || next.action != Action::Message {
        return false;
    }
    if last.channel != next.channel || last.msg_serial.is_some() {
        return false;
    }
    let (Some(a), Some(b)) = (&last.messages, &next.messages) else {
        return false;
    };
    // Caller-supplied ids must stay in the envelope they were published in.
    if a.iter().chain(b.iter()).any(|m| m.id.is_some()) {
        return false;
    }
    let size: usize = a.iter().chain(b.iter()).map(|m| m.size()).sum();
    a.len() + b.len() <= max_batch && size <= max_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::Deferred;
    use crate::types::Message;

    fn message_env(channel: &str, names: &[&str]) -> (Envelope, Deferred<()>) {
        let (resolver, deferred) = Deferred::pair();
        let mut msg = ProtocolMessage::for_channel(Action::Message, channel);
        msg.messages = Some(
            names
                .iter()
                .map(|n| Message::new(*n, serde_json::Value::Null))
                .collect(),
        );
        (Envelope::new(msg, vec![AckTarget::Caller(resolver)]), deferred)
    }

    fn sent(mut env: Envelope, serial: i64) -> Envelope {
        env.msg.msg_serial = Some(serial);
        env
    }

    #[test]
    fn bundles_same_channel_messages() {
        let mut q = MessageQueue::default();
        let (a, _da) = message_env("ch", &["a"]);
        let (b, _db) = message_env("ch", &["b", "c"]);
        let (c, _dc) = message_env("other", &["d"]);
        q.push(a, 50, 65_536);
        q.push(b, 50, 65_536);
        q.push(c, 50, 65_536);

        let first = q.pop_outgoing().unwrap();
        assert_eq!(first.msg.messages.as_ref().unwrap().len(), 3);
        assert_eq!(first.targets.len(), 2);
        let second = q.pop_outgoing().unwrap();
        assert_eq!(second.channel(), Some("other"));
        assert!(q.pop_outgoing().is_none());
    }

    #[test]
    fn bundling_respects_batch_limit() {
        let mut q = MessageQueue::default();
        let names: Vec<String> = (0..30).map(|i| format!("m{i}")).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let (a, _da) = message_env("ch", &names);
        let (b, _db) = message_env("ch", &names);
        q.push(a, 50, 65_536);
        q.push(b, 50, 65_536);
        assert_eq!(q.pop_outgoing().unwrap().msg.messages.unwrap().len(), 30);
        assert_eq!(q.pop_outgoing().unwrap().msg.messages.unwrap().len(), 30);
    }

    #[tokio::test]
    async fn settle_matches_range_and_reports_lost() {
        let mut q = MessageQueue::default();
        let mut waiting = Vec::new();
        for serial in 0..4 {
            let (env, d) = message_env("ch", &["x"]);
            q.push_pending(sent(env, serial));
            waiting.push(d);
        }
        let settled = q.settle(1, 2);
        assert_eq!(settled.lost.len(), 1);
        assert_eq!(settled.lost[0].msg.msg_serial, Some(0));
        let serials: Vec<_> = settled.matched.iter().map(|e| e.msg.msg_serial).collect();
        assert_eq!(serials, vec![Some(1), Some(2)]);
        assert_eq!(q.pending_len(), 1);
    }

    #[test]
    fn settle_clamps_out_of_range_serials() {
        let mut q = MessageQueue::default();
        let (env, _d) = message_env("ch", &["x"]);
        q.push_pending(sent(env, 5));

        let settled = q.settle(i64::MAX, 2);
        assert!(settled.matched.is_empty());
        assert_eq!(settled.lost.len(), 1);
        assert_eq!(q.pending_len(), 0);

        let settled = MessageQueue::default().settle(i64::MAX, i64::MAX);
        assert!(settled.matched.is_empty() && settled.lost.is_empty());
    }

    #[test]
    fn requeue_preserves_order_ahead_of_new_messages() {
        let mut q = MessageQueue::default();
        let (queued, _d0) = message_env("ch", &["new"]);
        q.push(queued, 50, 65_536);
        for serial in [3, 4] {
            let (env, _d) = message_env("ch", &["old"]);
            q.push_pending(sent(env, serial));
        }
        q.requeue_pending();
        let order: Vec<_> = std::iter::from_fn(|| q.pop_outgoing())
            .map(|e| e.msg.msg_serial)
            .collect();
        assert_eq!(order, vec![Some(3), Some(4), None]);
    }

    #[test]
    fn drain_channel_keeps_other_channels() {
        let mut q = MessageQueue::default();
        let (a, _da) = message_env("a", &["1"]);
        let (b, _db) = message_env("b", &["2"]);
        q.push_pending(sent(a, 0));
        q.push(b, 50, 65_536);
        let removed = q.drain_channel("a");
        assert_eq!(removed.len(), 1);
        assert!(q.has_outgoing());
        assert_eq!(q.drain_all().len(), 1);
    }
}
