//! Subscription set and inbound dispatch
//!
//! The set is the single source of truth for what the session re-subscribes after a
//! reconnect. Every registered handler gets its own dispatcher task fed through an
//! unbounded channel, so a slow handler never blocks packet intake and messages for
//! one subscription are handled in arrival order.

use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;

use super::packet::{Message, QoS};
use crate::error::{NodeError, NodeResult, TaskFault};

/// Handler invoked for each matching inbound message
pub type MessageHandler = Rc<dyn Fn(Message) -> LocalBoxFuture<'static, ()>>;

/// Receives handler panics; the dispatcher keeps serving later messages
pub type FaultSink = Rc<dyn Fn(TaskFault)>;

type SharedSink = Rc<RefCell<Option<FaultSink>>>;

/// MQTT topic filter matching with `+` and `#` wildcards.
///
/// Topics starting with `$` are never matched by a filter whose first level is a
/// wildcard.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Reject filters the broker would refuse.
pub fn validate_filter(filter: &str) -> NodeResult<()> {
    if filter.is_empty() {
        return Err(NodeError::invalid_input("empty topic filter"));
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err(NodeError::invalid_input(format!(
                "'#' must be the last level in '{}'",
                filter
            )));
        }
        if level.contains('+') && *level != "+" {
            return Err(NodeError::invalid_input(format!(
                "'+' must occupy a whole level in '{}'",
                filter
            )));
        }
    }
    Ok(())
}

struct Subscription {
    pattern: String,
    qos: QoS,
    handler: MessageHandler,
    dispatcher: Option<mpsc::UnboundedSender<Message>>,
}

impl Subscription {
    fn deliver(&mut self, message: Message, sink: &SharedSink) {
        if let Some(tx) = &self.dispatcher {
            match tx.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => {
                    self.dispatcher = None;
                    self.spawn_dispatcher(sink).send(message).ok();
                }
            }
        } else {
            self.spawn_dispatcher(sink).send(message).ok();
        }
    }

    // Started lazily so the set can be populated before the scheduler runs.
    fn spawn_dispatcher(&mut self, sink: &SharedSink) -> &mpsc::UnboundedSender<Message> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let handler = self.handler.clone();
        let task = format!("subscription '{}'", self.pattern);
        let sink = sink.clone();
        tokio::task::spawn_local(async move {
            while let Some(message) = rx.recv().await {
                let topic = message.topic.clone();
                if let Err(payload) = AssertUnwindSafe(handler(message)).catch_unwind().await {
                    let mut fault = TaskFault::from_panic(&task, payload);
                    fault.message = format!("{} while handling '{}'", fault.message, topic);
                    let reporter = sink.borrow().clone();
                    match reporter {
                        Some(report) => report(fault),
                        None => log::error!("{}", fault),
                    }
                }
            }
        });
        self.dispatcher.insert(tx)
    }
}

#[derive(Default)]
pub struct SubscriptionSet {
    entries: Vec<Subscription>,
    sink: SharedSink,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route handler panics to `sink` instead of only logging them. Applies to
    /// dispatchers already running as well.
    pub fn set_fault_sink(&mut self, sink: FaultSink) {
        *self.sink.borrow_mut() = Some(sink);
    }

    /// Register a handler. Returns true when the pattern was not subscribed before.
    pub fn add(&mut self, pattern: &str, qos: QoS, handler: MessageHandler) -> bool {
        let is_new = !self.contains(pattern);
        self.entries.push(Subscription {
            pattern: pattern.to_string(),
            qos,
            handler,
            dispatcher: None,
        });
        is_new
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.entries.iter().any(|s| s.pattern == pattern)
    }

    /// Distinct patterns in registration order, each with the highest QoS requested
    pub fn patterns(&self) -> Vec<(String, QoS)> {
        let mut out: Vec<(String, QoS)> = Vec::new();
        for sub in &self.entries {
            match out.iter_mut().find(|(p, _)| *p == sub.pattern) {
                Some((_, qos)) => *qos = (*qos).max(sub.qos),
                None => out.push((sub.pattern.clone(), sub.qos)),
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hand a message to every matching subscription. Returns the number of handlers
    /// it was queued for.
    ///
    /// Must be called from within a `LocalSet`.
    pub fn dispatch(&mut self, message: &Message) -> usize {
        let mut matched = 0;
        for sub in self
            .entries
            .iter_mut()
            .filter(|s| topic_matches(&s.pattern, &message.topic))
        {
            sub.deliver(message.clone(), &self.sink);
            matched += 1;
        }
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_wildcard_matching() {
        assert!(topic_matches("home/+/status", "home/kitchen/status"));
        assert!(!topic_matches("home/+/status", "home/kitchen/door/status"));
        assert!(topic_matches("home/#", "home"));
        assert!(topic_matches("home/#", "home/a/b/c"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("home/a", "home/a/b"));
        assert!(!topic_matches("home/a/b", "home/a"));
        assert!(topic_matches("+/+", "a/b"));
    }

    #[test]
    fn test_dollar_topics_excluded_from_leading_wildcards() {
        assert!(!topic_matches("#", "$SYS/uptime"));
        assert!(!topic_matches("+/uptime", "$SYS/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/uptime"));
    }

    #[test]
    fn test_validate_filter() {
        assert!(validate_filter("home/+/status").is_ok());
        assert!(validate_filter("home/#").is_ok());
        assert!(validate_filter("home/#/x").is_err());
        assert!(validate_filter("home/a+").is_err());
        assert!(validate_filter("").is_err());
    }

    #[test]
    fn test_patterns_are_distinct_with_highest_qos() {
        let noop: MessageHandler = Rc::new(|_: Message| async {}.boxed_local());
        let mut set = SubscriptionSet::new();
        assert!(set.add("a/#", QoS::AtMostOnce, noop.clone()));
        assert!(set.add("b", QoS::AtMostOnce, noop.clone()));
        assert!(!set.add("a/#", QoS::AtLeastOnce, noop));
        assert_eq!(
            set.patterns(),
            vec![
                ("a/#".to_string(), QoS::AtLeastOnce),
                ("b".to_string(), QoS::AtMostOnce)
            ]
        );
        assert_eq!(set.len(), 3);
    }

    #[tokio::test]
    async fn test_dispatch_preserves_order_per_subscription() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let seen = Rc::new(RefCell::new(Vec::new()));
                let sink = seen.clone();
                let handler: MessageHandler = Rc::new(move |m: Message| {
                    let sink = sink.clone();
                    async move {
                        tokio::task::yield_now().await;
                        sink.borrow_mut().push(m.payload_str().unwrap_or("").to_string());
                    }
                    .boxed_local()
                });

                let mut set = SubscriptionSet::new();
                set.add("s/+", QoS::AtMostOnce, handler);
                for i in 0..5 {
                    assert_eq!(set.dispatch(&Message::new("s/x", format!("{}", i))), 1);
                }
                assert_eq!(set.dispatch(&Message::new("other", "x")), 0);

                for _ in 0..20 {
                    tokio::task::yield_now().await;
                }
                assert_eq!(*seen.borrow(), vec!["0", "1", "2", "3", "4"]);
            })
            .await;
    }

    #[tokio::test]
    async fn test_handler_panic_reaches_fault_sink() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let faults = Rc::new(RefCell::new(Vec::new()));
                let seen = Rc::new(RefCell::new(0));
                let counter = seen.clone();
                let handler: MessageHandler = Rc::new(move |m: Message| {
                    let counter = counter.clone();
                    async move {
                        if m.payload_str() == Some("bad") {
                            panic!("cannot parse");
                        }
                        *counter.borrow_mut() += 1;
                    }
                    .boxed_local()
                });

                let mut set = SubscriptionSet::new();
                let sink = faults.clone();
                set.set_fault_sink(Rc::new(move |fault: TaskFault| sink.borrow_mut().push(fault)));
                set.add("cmd/#", QoS::AtMostOnce, handler);
                set.dispatch(&Message::new("cmd/a", "bad"));
                set.dispatch(&Message::new("cmd/a", "good"));
                for _ in 0..10 {
                    tokio::task::yield_now().await;
                }

                let faults = faults.borrow();
                assert_eq!(faults.len(), 1);
                assert!(faults[0].panicked);
                assert_eq!(faults[0].task, "subscription 'cmd/#'");
                assert!(faults[0].message.contains("cannot parse"));
                assert!(faults[0].message.contains("cmd/a"));
                // the dispatcher keeps serving
                assert_eq!(*seen.borrow(), 1);
            })
            .await;
    }
}
