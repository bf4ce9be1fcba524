use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::SessionError;
use crate::events::{Alert, EventEmitter};
use crate::transport::SocketTransport;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Poll {
    pub id: Option<String>,
    pub question: String,
    #[serde(rename = "type")]
    pub poll_type: Option<String>,
    pub options: Vec<String>,
    pub votes: Vec<i64>,
    pub status: Option<String>,
    pub voters: HashMap<String, i64>,
}

/// `pollUpdated` payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PollUpdate {
    pub polls: Option<Vec<Poll>>,
    pub poll: Poll,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollState {
    pub polls: Vec<Poll>,
    pub current: Option<Poll>,
    pub modal_visible: bool,
}

impl PollState {
    /// Merge a `pollUpdated` push. Returns the alert to surface, if any.
    pub fn apply_update(&mut self, update: PollUpdate, member: &str, islevel: &str) -> Option<Alert> {
        let previous_id = self
            .current
            .as_ref()
            .and_then(|p| p.id.clone())
            .filter(|id| !id.is_empty());

        match update.polls.filter(|p| !p.is_empty()) {
            Some(polls) => self.polls = polls,
            None => match self.polls.iter_mut().find(|p| p.id == update.poll.id) {
                Some(existing) => *existing = update.poll.clone(),
                None => self.polls.push(update.poll.clone()),
            },
        }

        match update.status.as_str() {
            "started" => {
                self.current = Some(update.poll.clone());
                if islevel != "2" && !update.poll.voters.contains_key(member) {
                    self.modal_visible = true;
                    return Some(Alert::success("New poll started"));
                }
                None
            }
            "ended" => {
                let was_current = previous_id.is_some() && previous_id == update.poll.id;
                self.current = Some(update.poll);
                was_current.then(|| Alert::danger("Poll ended"))
            }
            _ => {
                self.current = Some(update.poll);
                None
            }
        }
    }
}

/// A poll to create.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewPoll {
    pub question: String,
    #[serde(rename = "type")]
    pub poll_type: String,
    pub options: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PollAck {
    success: bool,
    reason: Option<String>,
}

/// Poll commands; each alerts with the server's verdict.
pub struct PollCommands<'a> {
    pub socket: &'a dyn SocketTransport,
    pub emitter: &'a EventEmitter,
    pub room_name: &'a str,
    pub ack_timeout: Duration,
}

impl PollCommands<'_> {
    pub async fn create(&self, poll: &NewPoll) -> Result<(), SessionError> {
        if poll.question.trim().is_empty() || poll.options.len() < 2 {
            self.emitter.alert(Alert::danger("Please enter a question and at least two options"));
            return Err(SessionError::Config("invalid poll".to_string()));
        }
        self.acked(
            "createPoll",
            json!({"roomName": self.room_name, "poll": poll}),
            "Poll created successfully",
            "Failed to create poll",
        )
        .await
    }

    pub async fn vote(&self, poll_id: &str, member: &str, choice: usize) -> Result<(), SessionError> {
        self.acked(
            "votePoll",
            json!({"roomName": self.room_name, "poll_id": poll_id, "member": member, "choice": choice}),
            "Vote submitted successfully",
            "Failed to submit vote",
        )
        .await
    }

    pub async fn end(&self, poll_id: &str) -> Result<(), SessionError> {
        self.acked(
            "endPoll",
            json!({"roomName": self.room_name, "poll_id": poll_id}),
            "Poll ended successfully",
            "Failed to end poll",
        )
        .await
    }

    async fn acked(
        &self,
        event: &str,
        payload: Value,
        success: &str,
        failure: &str,
    ) -> Result<(), SessionError> {
        let ack = match self.socket.emit_with_ack(event, payload, self.ack_timeout).await {
            Ok(value) => serde_json::from_value::<PollAck>(value).unwrap_or_default(),
            Err(e) => {
                tracing::warn!("{event} failed: {e}");
                self.emitter.alert(Alert::danger(format!("{failure}: {e}")));
                return Err(e);
            }
        };
        if ack.success {
            self.emitter.alert(Alert::success(success));
            Ok(())
        } else {
            let reason = ack.reason.unwrap_or_else(|| failure.to_string());
            self.emitter.alert(Alert::danger(reason.clone()));
            Err(SessionError::Emit(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::EventCapture;
    use crate::transport::fake::FakeSocket;

    fn poll(id: &str, voters: &[&str]) -> Poll {
        Poll {
            id: Some(id.into()),
            question: "Lunch?".into(),
            poll_type: Some("yesNo".into()),
            options: vec!["Yes".into(), "No".into()],
            voters: voters.iter().map(|v| (v.to_string(), 0)).collect(),
            ..Poll::default()
        }
    }

    #[test]
    fn started_poll_prompts_participants_who_have_not_voted() {
        let mut state = PollState::default();
        let alert = state.apply_update(
            PollUpdate { poll: poll("p1", &[]), status: "started".into(), ..PollUpdate::default() },
            "alice",
            "1",
        );
        assert_eq!(alert, Some(Alert::success("New poll started")));
        assert!(state.modal_visible);
        assert_eq!(state.polls.len(), 1);

        let mut host = PollState::default();
        assert_eq!(
            host.apply_update(
                PollUpdate { poll: poll("p1", &[]), status: "started".into(), ..PollUpdate::default() },
                "hank",
                "2",
            ),
            None
        );
    }

    #[test]
    fn single_updates_upsert_by_id() {
        let mut state = PollState::default();
        state.apply_update(PollUpdate { poll: poll("p1", &["alice"]), status: "started".into(), ..PollUpdate::default() }, "alice", "1");
        state.apply_update(PollUpdate { poll: poll("p2", &[]), status: "".into(), ..PollUpdate::default() }, "alice", "1");
        let mut updated = poll("p1", &["alice", "bob"]);
        updated.votes = vec![2, 0];
        state.apply_update(PollUpdate { poll: updated.clone(), status: "".into(), ..PollUpdate::default() }, "alice", "1");

        assert_eq!(state.polls.len(), 2);
        assert_eq!(state.polls[0], updated);
    }

    #[test]
    fn ending_the_current_poll_alerts() {
        let mut state = PollState::default();
        state.apply_update(PollUpdate { poll: poll("p1", &["alice"]), status: "started".into(), ..PollUpdate::default() }, "alice", "1");
        let alert = state.apply_update(PollUpdate { poll: poll("p1", &["alice"]), status: "ended".into(), ..PollUpdate::default() }, "alice", "1");
        assert_eq!(alert, Some(Alert::danger("Poll ended")));

        let other = state.apply_update(PollUpdate { poll: poll("p9", &[]), status: "ended".into(), ..PollUpdate::default() }, "alice", "1");
        assert_eq!(other, None);
    }

    #[test]
    fn full_list_replaces_polls() {
        let mut state = PollState::default();
        state.apply_update(PollUpdate { poll: poll("p1", &[]), status: "".into(), ..PollUpdate::default() }, "a", "1");
        state.apply_update(
            PollUpdate {
                polls: Some(vec![poll("p7", &[]), poll("p8", &[])]),
                poll: poll("p8", &[]),
                status: "".into(),
            },
            "a",
            "1",
        );
        let ids: Vec<_> = state.polls.iter().filter_map(|p| p.id.clone()).collect();
        assert_eq!(ids, vec!["p7", "p8"]);
    }

    #[tokio::test]
    async fn vote_alerts_server_reason_on_failure() {
        let socket = FakeSocket::new(true);
        socket.push_ack(json!({"success": false, "reason": "Already voted"}));
        let emitter = EventEmitter::new();
        let capture = EventCapture::attach(&emitter);
        let commands = PollCommands {
            socket: socket.as_ref(),
            emitter: &emitter,
            room_name: "s1234567",
            ack_timeout: Duration::from_secs(30),
        };

        assert!(commands.vote("p1", "alice", 1).await.is_err());
        assert_eq!(capture.alerts(), vec!["Already voted".to_string()]);
        let payload = socket.last_emit("votePoll").unwrap();
        assert_eq!(payload["poll_id"], "p1");
        assert_eq!(payload["choice"], 1);
    }

    #[tokio::test]
    async fn create_sends_only_question_type_and_options() {
        let socket = FakeSocket::new(true);
        socket.push_ack(json!({"success": true}));
        let emitter = EventEmitter::new();
        let commands = PollCommands {
            socket: socket.as_ref(),
            emitter: &emitter,
            room_name: "s1234567",
            ack_timeout: Duration::from_secs(30),
        };
        commands
            .create(&NewPoll {
                question: "Lunch?".into(),
                poll_type: "yesNo".into(),
                options: vec!["Yes".into(), "No".into()],
            })
            .await
            .unwrap();
        let payload = socket.last_emit("createPoll").unwrap();
        assert_eq!(
            payload["poll"],
            json!({"question": "Lunch?", "type": "yesNo", "options": ["Yes", "No"]})
        );
    }
}
