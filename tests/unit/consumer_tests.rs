//! Unit tests for log consumers and the consumer list.

use std::sync::{Arc, Mutex};

use berth::logs::{ChannelConsumer, ConsumerList, LogConsumer, LogFrame, TracingConsumer};

#[test]
fn delivers_in_registration_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let list = ConsumerList::new();

    for name in ["first", "second", "third"] {
        let seen = Arc::clone(&seen);
        list.push(Arc::new(move |frame: &LogFrame| {
            seen.lock().unwrap().push(format!("{name}:{}", frame.text()));
        }));
    }

    list.deliver(&LogFrame::stdout("a"));

    assert_eq!(
        *seen.lock().unwrap(),
        vec!["first:a", "second:a", "third:a"]
    );
}

#[test]
fn channel_consumer_forwards_frames() {
    let (consumer, mut rx) = ChannelConsumer::new();

    consumer.accept(&LogFrame::stderr("boom"));
    consumer.accept(&LogFrame::stdout("ok"));

    assert_eq!(rx.try_recv().unwrap(), LogFrame::stderr("boom"));
    assert_eq!(rx.try_recv().unwrap(), LogFrame::stdout("ok"));
}

#[test]
fn channel_consumer_survives_dropped_receiver() {
    let (consumer, rx) = ChannelConsumer::new();
    drop(rx);

    consumer.accept(&LogFrame::stdout("nobody listening"));
}

#[test]
fn tracing_consumer_accepts_both_streams() {
    let consumer = TracingConsumer::new("session-1");
    consumer.accept(&LogFrame::stdout("line\n"));
    consumer.accept(&LogFrame::stderr("err\r\n"));
}

#[test]
fn consumers_may_register_more_consumers_during_delivery() {
    let list = ConsumerList::new();
    let inner = list.clone();
    list.push(Arc::new(move |_: &LogFrame| {
        if inner.len() < 3 {
            inner.push(Arc::new(|_: &LogFrame| {}));
        }
    }));

    list.deliver(&LogFrame::stdout("x"));
    list.deliver(&LogFrame::stdout("y"));

    assert_eq!(list.len(), 3);
}

#[test]
fn empty_list_reports_empty() {
    let list = ConsumerList::new();
    assert!(list.is_empty());
    list.deliver(&LogFrame::stdout("dropped"));
}
