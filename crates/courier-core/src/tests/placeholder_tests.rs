use super::{drain_events, inbound_message, jid, open, test_config, Harness};
use crate::events::CoreEvent;
use crate::placeholder::PlaceholderOutcome;
use courier_types::{MessageContent, MessageId, MessageKey, PeerDataRequest, Stanza};
use std::time::Duration;
use tokio::time::sleep;

fn unavailable(id: &str) -> Stanza {
    Stanza::new("message")
        .attr("id", id)
        .attr("from", "200@user")
        .attr("type", "text")
        .children(vec![Stanza::new("unavailable")])
}

async fn peer_messages(h: &Harness) -> Vec<Stanza> {
    h.messages_sent()
        .await
        .into_iter()
        .filter(|m| m.get_attr("category") == Some("peer"))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn unavailable_message_requests_resend_after_grace() {
    let h = Harness::new(test_config()).await;

    h.core.process_node(unavailable("P1")).await;

    let ack = h.conn.sent_with_tag("ack").await.remove(0);
    assert_eq!(ack.get_attr("from"), Some("100:2@user"));
    assert_eq!(ack.get_attr("type"), Some("text"));

    sleep(Duration::from_millis(100)).await;
    assert!(h.core.retry().placeholders().is_pending(&MessageId::new("P1")).await);
    assert!(peer_messages(&h).await.is_empty());

    sleep(Duration::from_millis(200)).await;
    let sent = peer_messages(&h).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].get_attr("to"), Some("100@user"));
    let enc = sent[0].child("enc").expect("enc");
    let content = MessageContent::decode(&open(enc.content_bytes().expect("bytes")))
        .expect("content");
    match content {
        MessageContent::PeerData(PeerDataRequest::PlaceholderResend { keys }) => {
            assert_eq!(keys.len(), 1);
            assert_eq!(keys[0].id, MessageId::new("P1"));
            assert_eq!(keys[0].remote, jid("200@user"));
        }
        other => panic!("unexpected content {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn content_arriving_during_grace_cancels_request() {
    let h = Harness::new(test_config()).await;
    let mut rx = h.core.subscribe();

    h.core.process_node(unavailable("P2")).await;
    sleep(Duration::from_millis(50)).await;
    h.core
        .process_node(inbound_message("P2", "200@user", &MessageContent::text("late")))
        .await;
    sleep(Duration::from_millis(500)).await;

    assert!(peer_messages(&h).await.is_empty());
    assert!(!h.core.retry().placeholders().is_pending(&MessageId::new("P2")).await);
    let upserted = drain_events(&mut rx).into_iter().any(|e| {
        matches!(
            e,
            CoreEvent::MessageUpserted {
                content: Some(_),
                ..
            }
        )
    });
    assert!(upserted);
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_for_one_message_are_merged() {
    let h = Harness::new(test_config()).await;
    let placeholders = h.core.retry().placeholders().clone();
    let key = MessageKey {
        remote: jid("200@user"),
        id: MessageId::new("P3"),
        from_me: false,
        participant: None,
    };

    let (first, second) = tokio::join!(
        placeholders.request(key.clone()),
        placeholders.request(key.clone())
    );

    assert!(matches!(first.expect("first"), PlaceholderOutcome::Sent(_)));
    assert_eq!(second.expect("second"), PlaceholderOutcome::AlreadyPending);
    assert_eq!(peer_messages(&h).await.len(), 1);
    assert!(placeholders.is_pending(&key.id).await);

    sleep(Duration::from_millis(1_100)).await;
    assert!(!placeholders.is_pending(&key.id).await);
}
