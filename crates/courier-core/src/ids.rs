use courier_types::MessageId;
use uuid::Uuid;

/// Upper-case hex without hyphens, the shape peers expect for stanza ids.
pub fn generate_message_id() -> MessageId {
    MessageId::new(Uuid::new_v4().simple().to_string().to_uppercase())
}
