use super::{jid, participant_nodes, to_content, test_config, Harness};
use crate::error::{CoreError, TransportError};
use crate::relay::RelayOptions;
use courier_types::{AccountId, MessageContent, MessageId, MessageKey};
use std::collections::HashSet;

async fn two_accounts(h: &Harness) {
    h.directory
        .register(AccountId::primary("200"), &[0, 1, 2])
        .await;
    h.directory
        .register(AccountId::primary("100"), &[0, 2, 5])
        .await;
}

#[tokio::test]
async fn one_ciphertext_per_device() {
    let h = Harness::new(test_config()).await;
    two_accounts(&h).await;

    h.core
        .relay(&jid("200@user"), &MessageContent::text("hi"), &RelayOptions::default())
        .await
        .expect("relay");

    let sent = h.messages_sent().await;
    assert_eq!(sent.len(), 1);
    let message = &sent[0];
    assert_eq!(message.get_attr("to"), Some("200@user"));
    assert_eq!(message.get_attr("type"), Some("text"));

    let tos = participant_nodes(message);
    let jids: HashSet<String> = tos
        .iter()
        .map(|t| t.get_attr("jid").expect("jid").to_string())
        .collect();
    let expected: HashSet<String> = ["200@user", "200:1@user", "200:2@user", "100@user", "100:5@user"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(jids, expected);

    let ciphertexts: HashSet<Vec<u8>> = tos
        .iter()
        .map(|t| {
            t.child("enc")
                .and_then(|e| e.content_bytes())
                .expect("ciphertext")
                .to_vec()
        })
        .collect();
    assert_eq!(ciphertexts.len(), tos.len());
    assert!(message.child("device-identity").is_some());
    assert_eq!(h.key_queries().await.len(), 1);
}

#[tokio::test]
async fn own_devices_receive_device_sent_copy() {
    let h = Harness::new(test_config()).await;
    two_accounts(&h).await;

    h.core
        .relay(&jid("200@user"), &MessageContent::text("hi"), &RelayOptions::default())
        .await
        .expect("relay");

    let message = h.messages_sent().await.remove(0);
    for to in participant_nodes(&message) {
        let target = to.get_attr("jid").expect("jid");
        let content = to_content(&to);
        if target.starts_with("100") {
            assert_eq!(
                content,
                MessageContent::DeviceSent {
                    destination: jid("200@user"),
                    message: Box::new(MessageContent::text("hi")),
                }
            );
        } else {
            assert_eq!(content, MessageContent::text("hi"));
        }
    }
}

#[tokio::test]
async fn duplicate_relay_is_sent_once() {
    let h = Harness::new(test_config()).await;
    two_accounts(&h).await;
    let options = RelayOptions {
        message_id: Some(MessageId::new("DUP1")),
        ..RelayOptions::default()
    };

    let first = h
        .core
        .relay(&jid("200@user"), &MessageContent::text("a"), &options)
        .await
        .expect("first");
    let second = h
        .core
        .relay(&jid("200@user"), &MessageContent::text("a"), &options)
        .await
        .expect("second");

    assert_eq!(first, second);
    assert_eq!(h.messages_sent().await.len(), 1);
}

#[tokio::test]
async fn established_sessions_are_reused() {
    let h = Harness::new(test_config()).await;
    two_accounts(&h).await;

    for body in ["one", "two"] {
        h.core
            .relay(&jid("200@user"), &MessageContent::text(body), &RelayOptions::default())
            .await
            .expect("relay");
    }

    let sent = h.messages_sent().await;
    assert_eq!(sent.len(), 2);
    assert!(sent[1].child("device-identity").is_none());
    let kinds: HashSet<String> = participant_nodes(&sent[1])
        .iter()
        .filter_map(|t| t.child("enc").and_then(|e| e.get_attr("type")))
        .map(str::to_string)
        .collect();
    assert_eq!(kinds, HashSet::from(["msg".to_string()]));
    assert_eq!(h.key_queries().await.len(), 1);
    assert_eq!(h.directory.queries().await.len(), 1);
}

#[tokio::test]
async fn transient_send_failure_is_retried() {
    let h = Harness::new(test_config()).await;
    two_accounts(&h).await;
    h.conn
        .fail_next_sends(vec![CoreError::Transport(TransportError::Status(
            503,
            "busy".to_string(),
        ))])
        .await;

    h.core
        .relay(&jid("200@user"), &MessageContent::text("hi"), &RelayOptions::default())
        .await
        .expect("relay");

    assert_eq!(h.messages_sent().await.len(), 1);
}

#[tokio::test]
async fn permission_error_is_not_retried() {
    let h = Harness::new(test_config()).await;
    two_accounts(&h).await;
    let options = RelayOptions {
        message_id: Some(MessageId::new("DENIED")),
        ..RelayOptions::default()
    };
    h.conn
        .fail_next_sends(vec![CoreError::Transport(TransportError::Status(
            406,
            "not acceptable".to_string(),
        ))])
        .await;

    let err = h
        .core
        .relay(&jid("200@user"), &MessageContent::text("hi"), &options)
        .await
        .expect_err("406");
    assert_eq!(
        err,
        CoreError::Transport(TransportError::Status(406, "not acceptable".to_string()))
    );
    assert!(h.messages_sent().await.is_empty());

    h.core
        .relay(&jid("200@user"), &MessageContent::text("hi"), &options)
        .await
        .expect("second attempt");
    assert_eq!(h.messages_sent().await.len(), 1);
}

#[tokio::test]
async fn peer_message_goes_to_own_primary() {
    let h = Harness::new(test_config()).await;
    two_accounts(&h).await;

    h.core
        .send_peer_message(&MessageContent::text("ping"), RelayOptions::default())
        .await
        .expect("peer");

    let message = h.messages_sent().await.remove(0);
    assert_eq!(message.get_attr("to"), Some("100@user"));
    assert_eq!(message.get_attr("category"), Some("peer"));
    assert_eq!(message.get_attr("push_priority"), Some("high_force"));
    assert!(message.child("participants").is_none());
    let enc = message.child("enc").expect("bare enc");
    assert_eq!(enc.get_attr("type"), Some("pkmsg"));
    assert!(h.directory.queries().await.is_empty());
}

#[tokio::test]
async fn participant_restricted_direct_send() {
    let h = Harness::new(test_config()).await;
    two_accounts(&h).await;
    let options = RelayOptions {
        message_id: Some(MessageId::new("ONE")),
        participant: Some(jid("200:1@user")),
        ..RelayOptions::default()
    };

    h.core
        .relay(&jid("200@user"), &MessageContent::text("again"), &options)
        .await
        .expect("relay");

    let message = h.messages_sent().await.remove(0);
    assert_eq!(message.get_attr("to"), Some("200:1@user"));
    assert_eq!(message.get_attr("device_fanout"), Some("false"));
    let tos = participant_nodes(&message);
    assert_eq!(tos.len(), 1);
    assert_eq!(tos[0].get_attr("jid"), Some("200:1@user"));
}

#[tokio::test]
async fn channel_revoke_reuses_target_id() {
    let h = Harness::new(test_config()).await;
    let target = MessageKey {
        remote: jid("news@channel"),
        id: MessageId::new("POST1"),
        from_me: true,
        participant: None,
    };

    let id = h
        .core
        .relay(
            &jid("news@channel"),
            &MessageContent::Revoke { key: target },
            &RelayOptions::default(),
        )
        .await
        .expect("relay");

    assert_eq!(id, MessageId::new("POST1"));
    let message = h.messages_sent().await.remove(0);
    let plaintext = message.child("plaintext").expect("plaintext");
    assert_eq!(
        MessageContent::decode(plaintext.content_bytes().expect("bytes")).expect("decode"),
        MessageContent::Empty
    );
    assert!(h.key_queries().await.is_empty());
}

#[tokio::test]
async fn relay_requires_credentials() {
    let h = Harness::unauthenticated(test_config()).await;
    let err = h
        .core
        .relay(&jid("200@user"), &MessageContent::text("hi"), &RelayOptions::default())
        .await
        .expect_err("no creds");
    assert_eq!(err, CoreError::NotAuthenticated);
    assert!(h.conn.sent().await.is_empty());
}

#[tokio::test]
async fn server_destination_is_rejected() {
    let h = Harness::new(test_config()).await;
    let err = h
        .core
        .relay(&jid("@server"), &MessageContent::text("hi"), &RelayOptions::default())
        .await
        .expect_err("server");
    assert!(matches!(err, CoreError::Validation(_)));
}
