use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::SessionError;
use crate::participants::Roster;
use crate::transport::SocketTransport;

/// A chat message as carried by `sendMessage` / `receiveMessage`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub sender: String,
    pub receivers: Vec<String>,
    pub message: String,
    pub timestamp: String,
    pub group: bool,
}

/// Per-room-type message caps, keyed by room name prefix.
pub fn message_cap(room_name: &str) -> Option<usize> {
    match room_name.chars().next() {
        Some('d') => Some(100),
        Some('s') => Some(500),
        Some('p') => Some(100_000),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageLog {
    pub messages: Vec<Message>,
    pub unread: bool,
}

/// Who is reading, for badge and ban filtering.
pub struct Reader<'a> {
    pub member: &'a str,
    pub islevel: &'a str,
    pub event_type: &'a str,
}

impl MessageLog {
    /// Append an incoming message and drop messages from banned senders.
    ///
    /// Outside broadcast/chat events only senders present in the roster are
    /// kept. Returns true when the unread badge was raised.
    pub fn receive(&mut self, message: Message, roster: &Roster, reader: &Reader<'_>) -> bool {
        let open_event = matches!(reader.event_type, "broadcast" | "chat");
        let incoming = message.clone();
        self.messages.push(message);
        self.messages.retain(|m| match roster.participants_all().iter().find(|p| p.name == m.sender) {
            Some(p) => !p.is_banned,
            None => open_event || m.sender == reader.member,
        });

        let kept = self.messages.iter().any(|m| *m == incoming);
        if !kept || open_event || incoming.sender == reader.member {
            return false;
        }
        let addressed = incoming.group || incoming.receivers.iter().any(|r| r == reader.member);
        let moderator = reader.islevel == "2" || roster.co_host() == reader.member;
        if addressed || moderator {
            self.unread = true;
            return true;
        }
        false
    }

    pub fn mark_read(&mut self) {
        self.unread = false;
    }
}

/// Inputs for an outgoing message.
pub struct OutgoingMessage<'a> {
    pub member: &'a str,
    pub islevel: &'a str,
    pub room_name: &'a str,
    pub chat_setting: &'a str,
    pub message: &'a str,
    pub receivers: Vec<String>,
    pub group: bool,
    pub sender: &'a str,
}

/// Apply the send rules and build the message object.
pub fn prepare_message(
    out: &OutgoingMessage<'_>,
    log: &MessageLog,
    roster: &Roster,
    timestamp: String,
) -> Result<Message, SessionError> {
    if message_cap(out.room_name).is_some_and(|cap| log.messages.len() > cap) {
        return Err(SessionError::Config(
            "You have reached the maximum number of messages allowed.".to_string(),
        ));
    }
    if out.message.trim().is_empty() || (out.member.is_empty() && out.sender.is_empty()) {
        return Err(SessionError::Config("Message is not valid.".to_string()));
    }
    let privileged = out.islevel == "2" || roster.co_host_can(out.member, "chat");
    if !privileged && out.chat_setting != "allow" {
        return Err(SessionError::Config(
            "You are not allowed to send a message in this event room".to_string(),
        ));
    }
    let sender = if out.sender.is_empty() { out.member } else { out.sender };
    Ok(Message {
        id: Some(uuid::Uuid::new_v4().to_string()),
        sender: sender.to_string(),
        receivers: out.receivers.clone(),
        message: out.message.to_string(),
        timestamp,
        group: out.group,
    })
}

/// Local wall-clock `HH:MM:SS` stamp for outgoing messages.
pub fn local_timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

pub async fn send_message(
    socket: &dyn SocketTransport,
    room_name: &str,
    message: &Message,
) -> Result<(), SessionError> {
    let payload: Value = json!({
        "messageObject": message,
        "roomName": room_name,
    });
    socket.emit("sendMessage", payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participants::Participant;
    use crate::transport::fake::FakeSocket;

    fn roster_with(names: &[(&str, bool)]) -> Roster {
        let mut roster = Roster::new();
        let members = names
            .iter()
            .map(|(name, banned)| Participant {
                id: Some(format!("id-{name}")),
                name: name.to_string(),
                is_banned: *banned,
                ..Participant::default()
            })
            .collect();
        roster.apply_members(members, Vec::new(), None, None, false);
        roster
    }

    fn msg(sender: &str, group: bool, receivers: &[&str]) -> Message {
        Message {
            sender: sender.into(),
            receivers: receivers.iter().map(|r| r.to_string()).collect(),
            message: "hi".into(),
            timestamp: "10:00:00".into(),
            group,
            ..Message::default()
        }
    }

    fn outgoing<'a>(room: &'a str, setting: &'a str, islevel: &'a str) -> OutgoingMessage<'a> {
        OutgoingMessage {
            member: "alice",
            islevel,
            room_name: room,
            chat_setting: setting,
            message: "hello",
            receivers: Vec::new(),
            group: true,
            sender: "",
        }
    }

    #[test]
    fn banned_senders_are_dropped() {
        let roster = roster_with(&[("alice", false), ("mallory", true)]);
        let mut log = MessageLog::default();
        let reader = Reader { member: "alice", islevel: "1", event_type: "conference" };

        log.receive(msg("mallory", true, &[]), &roster, &reader);
        assert!(log.messages.is_empty());
        assert!(!log.unread);
    }

    #[test]
    fn group_message_from_other_raises_badge() {
        let roster = roster_with(&[("alice", false), ("bob", false)]);
        let mut log = MessageLog::default();
        let reader = Reader { member: "alice", islevel: "1", event_type: "conference" };

        assert!(log.receive(msg("bob", true, &[]), &roster, &reader));
        assert!(log.unread);
        log.mark_read();

        // Direct message to someone else.
        assert!(!log.receive(msg("bob", false, &["carol"]), &roster, &reader));
        assert_eq!(log.messages.len(), 2);
    }

    #[test]
    fn chat_events_never_raise_badge() {
        let roster = roster_with(&[("bob", false)]);
        let mut log = MessageLog::default();
        let reader = Reader { member: "alice", islevel: "1", event_type: "chat" };
        assert!(!log.receive(msg("guest", true, &[]), &roster, &reader));
        assert_eq!(log.messages.len(), 1);
    }

    #[test]
    fn send_rules() {
        let roster = roster_with(&[("alice", false)]);
        let log = MessageLog::default();

        let err = prepare_message(&outgoing("s1234567", "disallow", "1"), &log, &roster, "t".into())
            .unwrap_err();
        assert_eq!(
            err.user_message(),
            "You are not allowed to send a message in this event room"
        );
        assert!(prepare_message(&outgoing("s1234567", "disallow", "2"), &log, &roster, "t".into()).is_ok());

        let mut empty = outgoing("s1234567", "allow", "1");
        empty.message = "  ";
        assert_eq!(
            prepare_message(&empty, &log, &roster, "t".into()).unwrap_err().user_message(),
            "Message is not valid."
        );

        let full = MessageLog {
            messages: vec![msg("alice", true, &[]); 101],
            unread: false,
        };
        assert_eq!(
            prepare_message(&outgoing("d1234567", "allow", "2"), &full, &roster, "t".into())
                .unwrap_err()
                .user_message(),
            "You have reached the maximum number of messages allowed."
        );
        assert!(prepare_message(&outgoing("s1234567", "allow", "1"), &full, &roster, "t".into()).is_ok());
    }

    #[tokio::test]
    async fn send_emits_message_object() {
        let socket = FakeSocket::new(true);
        let roster = roster_with(&[("alice", false)]);
        let message = prepare_message(
            &outgoing("s1234567", "allow", "1"),
            &MessageLog::default(),
            &roster,
            "09:15:00".into(),
        )
        .unwrap();

        send_message(socket.as_ref(), "s1234567", &message).await.unwrap();
        let payload = socket.last_emit("sendMessage").unwrap();
        assert_eq!(payload["roomName"], "s1234567");
        assert_eq!(payload["messageObject"]["sender"], "alice");
        assert_eq!(payload["messageObject"]["timestamp"], "09:15:00");
    }
}
