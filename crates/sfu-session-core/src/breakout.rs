use std::collections::HashSet;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::SessionError;
use crate::events::{Alert, EventEmitter, StateSlice};
use crate::participants::{Participant, Roster};
use crate::state::MeetingState;
use crate::transport::SocketTransport;

pub const MAX_BREAKOUT_ROOMS: usize = 10;

/// A participant reference inside a breakout room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BreakoutParticipant {
    pub name: String,
    pub break_room: Option<i32>,
}

/// Ordered rooms of ordered participants.
///
/// A name appears in at most one room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakoutAssignment {
    rooms: Vec<Vec<BreakoutParticipant>>,
}

fn check_room_count(num_rooms: usize) -> Result<(), SessionError> {
    if num_rooms == 0 {
        return Err(SessionError::Breakout("Please enter a valid number of rooms.".to_string()));
    }
    if num_rooms > MAX_BREAKOUT_ROOMS {
        return Err(SessionError::Breakout(format!(
            "Maximum {MAX_BREAKOUT_ROOMS} rooms allowed."
        )));
    }
    Ok(())
}

impl BreakoutAssignment {
    /// `num_rooms` empty rooms for manual assignment.
    pub fn manual(num_rooms: usize) -> Result<Self, SessionError> {
        check_room_count(num_rooms)?;
        Ok(Self { rooms: vec![Vec::new(); num_rooms] })
    }

    /// Shuffle every non-host participant and deal them round-robin.
    pub fn random<R: Rng + ?Sized>(
        participants: &[Participant],
        num_rooms: usize,
        rng: &mut R,
    ) -> Result<Self, SessionError> {
        check_room_count(num_rooms)?;
        let mut pool: Vec<&Participant> = participants.iter().filter(|p| !p.is_host()).collect();
        pool.shuffle(rng);

        let mut rooms = vec![Vec::new(); num_rooms];
        for (i, participant) in pool.into_iter().enumerate() {
            let room = i % num_rooms;
            rooms[room].push(BreakoutParticipant {
                name: participant.name.clone(),
                break_room: Some(room as i32),
            });
        }
        Ok(Self { rooms })
    }

    pub fn from_rooms(rooms: Vec<Vec<BreakoutParticipant>>) -> Self {
        Self { rooms }
    }

    pub fn rooms(&self) -> &[Vec<BreakoutParticipant>] {
        &self.rooms
    }

    pub fn into_rooms(self) -> Vec<Vec<BreakoutParticipant>> {
        self.rooms
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Room index holding `name`, if assigned.
    pub fn room_of(&self, name: &str) -> Option<usize> {
        self.rooms
            .iter()
            .position(|room| room.iter().any(|p| p.name == name))
    }

    pub fn add_room(&mut self) -> Result<(), SessionError> {
        check_room_count(self.rooms.len() + 1)?;
        self.rooms.push(Vec::new());
        Ok(())
    }

    /// Drop a room; its members become unassigned and later rooms shift down.
    pub fn remove_room(&mut self, index: usize) -> Option<Vec<BreakoutParticipant>> {
        if index >= self.rooms.len() {
            return None;
        }
        let removed = self.rooms.remove(index);
        for (i, room) in self.rooms.iter_mut().enumerate().skip(index) {
            for p in room.iter_mut() {
                p.break_room = Some(i as i32);
            }
        }
        Some(removed)
    }

    pub fn add_participant(
        &mut self,
        room_index: usize,
        name: &str,
        capacity: usize,
    ) -> Result<(), SessionError> {
        let Some(room) = self.rooms.get(room_index) else {
            return Err(SessionError::Breakout(format!("Room {} does not exist.", room_index + 1)));
        };
        if room.len() >= capacity {
            return Err(SessionError::Breakout(format!(
                "Room is at capacity ({capacity} max)."
            )));
        }
        if self.room_of(name).is_some() {
            return Err(SessionError::Breakout(format!("{name} is already assigned to a room.")));
        }
        self.rooms[room_index].push(BreakoutParticipant {
            name: name.to_string(),
            break_room: Some(room_index as i32),
        });
        Ok(())
    }

    pub fn remove_participant(&mut self, room_index: usize, name: &str) -> bool {
        let Some(room) = self.rooms.get_mut(room_index) else {
            return false;
        };
        let before = room.len();
        room.retain(|p| p.name != name);
        before != room.len()
    }

    /// Check the assignment before it is sent to the server.
    pub fn validate(&self, capacity: usize) -> Result<(), SessionError> {
        if self.rooms.is_empty() {
            return Err(SessionError::Breakout("There are no breakout rooms to start.".to_string()));
        }
        if self.rooms.len() > MAX_BREAKOUT_ROOMS {
            return Err(SessionError::Breakout(format!(
                "Maximum {MAX_BREAKOUT_ROOMS} rooms allowed."
            )));
        }
        let mut seen = HashSet::new();
        for room in &self.rooms {
            if room.is_empty() {
                return Err(SessionError::Breakout(
                    "All rooms must have at least one participant.".to_string(),
                ));
            }
            if room.iter().any(|p| !seen.insert(p.name.as_str())) {
                return Err(SessionError::Breakout(
                    "Duplicate participant names found in a room.".to_string(),
                ));
            }
            if room.len() > capacity {
                return Err(SessionError::Breakout(format!(
                    "Room exceeds capacity limit of {capacity}."
                )));
            }
        }
        Ok(())
    }

    fn wire_rooms(&self) -> Value {
        let rooms: Vec<Vec<Value>> = self
            .rooms
            .iter()
            .map(|room| {
                room.iter()
                    .map(|p| json!({"name": p.name, "breakRoom": p.break_room.unwrap_or(-1)}))
                    .collect()
            })
            .collect();
        json!(rooms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakoutState {
    pub rooms: Vec<Vec<BreakoutParticipant>>,
    pub started: bool,
    pub ended: bool,
    /// Room the host is watching, when the server moves them.
    pub host_new_room: Option<i32>,
}

/// `breakoutRoomUpdated` payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BreakoutUpdate {
    pub for_host: Option<bool>,
    pub new_room: Option<i32>,
    pub members: Option<Vec<Participant>>,
    pub breakout_rooms: Option<Vec<Vec<BreakoutParticipant>>>,
    pub status: Option<String>,
}

impl BreakoutState {
    /// Merge a `breakoutRoomUpdated` push and list the touched slices.
    pub fn apply_update(
        &mut self,
        update: BreakoutUpdate,
        islevel: &str,
        roster: &mut Roster,
        meeting: &mut MeetingState,
    ) -> Vec<StateSlice> {
        if update.for_host == Some(true) {
            if let Some(room) = update.new_room {
                self.host_new_room = Some(room);
            }
            return vec![StateSlice::Breakout];
        }

        let mut touched = vec![StateSlice::Breakout];
        if islevel == "2" {
            if let Some(members) = update.members {
                roster.replace_members(members);
                touched.push(StateSlice::Roster);
            }
        }
        if let Some(rooms) = update.breakout_rooms {
            self.rooms = rooms;
        }

        match update.status.as_deref() {
            Some("started") if self.started || !self.ended => {
                self.started = true;
                self.ended = false;
                meeting.prev_display_type = meeting.display_type.clone();
                meeting.display_type = "all".to_string();
                touched.push(StateSlice::Meeting);
            }
            Some("ended") => {
                self.ended = true;
                self.started = false;
                if !meeting.prev_display_type.is_empty() {
                    meeting.display_type = meeting.prev_display_type.clone();
                }
                touched.push(StateSlice::Meeting);
            }
            _ => {}
        }
        touched
    }

    /// Local bookkeeping after the server accepted a start or update.
    pub fn mark_started(&mut self, meeting: &mut MeetingState) {
        if !self.started {
            meeting.prev_display_type = meeting.display_type.clone();
        }
        self.started = true;
        self.ended = false;
        meeting.display_type = "all".to_string();
    }

    /// Local bookkeeping after the server accepted a stop.
    pub fn mark_stopped(&mut self, meeting: &mut MeetingState) {
        self.started = false;
        self.ended = true;
        if !meeting.prev_display_type.is_empty() {
            meeting.display_type = meeting.prev_display_type.clone();
        }
    }

    /// Whether a start should be sent as an update of running rooms.
    pub fn is_running(&self) -> bool {
        self.started && !self.ended
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BreakoutAck {
    success: bool,
    reason: Option<String>,
}

/// Host-side breakout commands.
pub struct BreakoutCommands<'a> {
    pub socket: &'a dyn SocketTransport,
    pub emitter: &'a EventEmitter,
    pub room_name: &'a str,
    pub ack_timeout: Duration,
}

impl BreakoutCommands<'_> {
    /// Start the rooms, or update them when they are already running.
    ///
    /// Refused while a screen share is active or when the assignment does
    /// not validate against `capacity`.
    pub async fn start(
        &self,
        assignment: &BreakoutAssignment,
        new_participant_action: &str,
        running: bool,
        screen_share_active: bool,
        capacity: usize,
    ) -> Result<(), SessionError> {
        if screen_share_active {
            let msg = "You cannot start breakout rooms while screen sharing is active";
            self.emitter.alert(Alert::danger(msg));
            return Err(SessionError::Breakout(msg.to_string()));
        }
        if let Err(e) = assignment.validate(capacity) {
            self.emitter.alert(Alert::danger(e.user_message()));
            return Err(e);
        }

        let event = if running { "updateBreakout" } else { "startBreakout" };
        let payload = json!({
            "breakoutRooms": assignment.wire_rooms(),
            "newParticipantAction": new_participant_action,
            "roomName": self.room_name,
        });
        self.acked(event, payload, "Breakout rooms active", "Failed to start breakout rooms")
            .await
    }

    pub async fn stop(&self) -> Result<(), SessionError> {
        self.acked(
            "stopBreakout",
            json!({"roomName": self.room_name}),
            "Breakout rooms stopped",
            "Failed to stop breakout rooms",
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
            Ok(value) => serde_json::from_value::<BreakoutAck>(value).unwrap_or_default(),
            Err(e) => {
                tracing::warn!("{event} failed: {e}");
                self.emitter.alert(Alert::danger(failure));
                return Err(e);
            }
        };
        if ack.success {
            tracing::info!("{event} accepted");
            self.emitter.alert(Alert::success(success));
            Ok(())
        } else {
            let reason = ack.reason.unwrap_or_else(|| failure.to_string());
            self.emitter.alert(Alert::danger(reason.clone()));
            Err(SessionError::Breakout(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::EventCapture;
    use crate::transport::fake::FakeSocket;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn member(name: &str, islevel: &str) -> Participant {
        Participant {
            id: Some(format!("id-{name}")),
            name: name.to_string(),
            islevel: Some(islevel.to_string()),
            ..Participant::default()
        }
    }

    fn rooms_of(names: &[&[&str]]) -> BreakoutAssignment {
        BreakoutAssignment::from_rooms(
            names
                .iter()
                .enumerate()
                .map(|(i, room)| {
                    room.iter()
                        .map(|n| BreakoutParticipant { name: n.to_string(), break_room: Some(i as i32) })
                        .collect()
                })
                .collect(),
        )
    }

    #[test]
    fn random_assignment_skips_host_and_balances_rooms() {
        let people = vec![
            member("hank", "2"),
            member("a", "1"),
            member("b", "1"),
            member("c", "0"),
            member("d", "1"),
            member("e", "1"),
        ];
        let mut rng = StdRng::seed_from_u64(7);
        let assignment = BreakoutAssignment::random(&people, 2, &mut rng).unwrap();

        let sizes: Vec<usize> = assignment.rooms().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 2]);
        assert!(assignment.room_of("hank").is_none());
        for (i, room) in assignment.rooms().iter().enumerate() {
            assert!(room.iter().all(|p| p.break_room == Some(i as i32)));
        }
    }

    #[test]
    fn room_count_bounds() {
        assert_eq!(
            BreakoutAssignment::manual(0).unwrap_err().user_message(),
            "Please enter a valid number of rooms."
        );
        assert_eq!(
            BreakoutAssignment::manual(11).unwrap_err().user_message(),
            "Maximum 10 rooms allowed."
        );
        let mut ten = BreakoutAssignment::manual(10).unwrap();
        assert!(ten.add_room().is_err());
    }

    #[test]
    fn add_enforces_capacity_and_single_membership() {
        let mut assignment = BreakoutAssignment::manual(2).unwrap();
        assignment.add_participant(0, "a", 2).unwrap();
        assignment.add_participant(0, "b", 2).unwrap();
        assert_eq!(
            assignment.add_participant(0, "c", 2).unwrap_err().user_message(),
            "Room is at capacity (2 max)."
        );
        assert!(assignment.add_participant(1, "a", 2).is_err());
        assert!(assignment.remove_participant(0, "a"));
        assignment.add_participant(1, "a", 2).unwrap();
        assert_eq!(assignment.room_of("a"), Some(1));
    }

    #[test]
    fn validation_rules() {
        assert_eq!(
            rooms_of(&[&["a"], &[]]).validate(4).unwrap_err().user_message(),
            "All rooms must have at least one participant."
        );
        assert_eq!(
            rooms_of(&[&["a", "a"]]).validate(4).unwrap_err().user_message(),
            "Duplicate participant names found in a room."
        );
        assert_eq!(
            rooms_of(&[&["a", "b", "c"]]).validate(2).unwrap_err().user_message(),
            "Room exceeds capacity limit of 2."
        );
        assert!(rooms_of(&[&["a"], &["b", "c"]]).validate(4).is_ok());
    }

    #[test]
    fn removing_a_room_renumbers_later_rooms() {
        let mut assignment = rooms_of(&[&["a"], &["b"], &["c"]]);
        assignment.remove_room(0).unwrap();
        assert_eq!(assignment.rooms()[0][0].break_room, Some(0));
        assert_eq!(assignment.rooms()[1][0].break_room, Some(1));
    }

    #[test]
    fn started_update_switches_display_and_ended_restores_it() {
        let mut state = BreakoutState::default();
        let mut roster = Roster::new();
        let mut meeting = MeetingState { display_type: "video".into(), ..MeetingState::default() };

        let touched = state.apply_update(
            BreakoutUpdate {
                breakout_rooms: Some(rooms_of(&[&["a"]]).into_rooms()),
                status: Some("started".into()),
                ..BreakoutUpdate::default()
            },
            "1",
            &mut roster,
            &mut meeting,
        );
        assert!(state.started);
        assert_eq!(meeting.display_type, "all");
        assert!(touched.contains(&StateSlice::Meeting));

        state.apply_update(
            BreakoutUpdate { status: Some("ended".into()), ..BreakoutUpdate::default() },
            "1",
            &mut roster,
            &mut meeting,
        );
        assert!(state.ended);
        assert!(!state.started);
        assert_eq!(meeting.display_type, "video");
        assert_eq!(state.rooms.len(), 1);
    }

    #[test]
    fn for_host_update_only_moves_the_host() {
        let mut state = BreakoutState::default();
        let mut roster = Roster::new();
        let mut meeting = MeetingState::default();
        let touched = state.apply_update(
            BreakoutUpdate {
                for_host: Some(true),
                new_room: Some(3),
                breakout_rooms: Some(rooms_of(&[&["a"]]).into_rooms()),
                status: Some("started".into()),
                ..BreakoutUpdate::default()
            },
            "2",
            &mut roster,
            &mut meeting,
        );
        assert_eq!(touched, vec![StateSlice::Breakout]);
        assert_eq!(state.host_new_room, Some(3));
        assert!(state.rooms.is_empty());
        assert!(!state.started);
    }

    #[test]
    fn host_receives_member_refresh() {
        let mut state = BreakoutState::default();
        let mut roster = Roster::new();
        let mut meeting = MeetingState::default();
        let mut banned = member("m", "1");
        banned.is_banned = true;

        state.apply_update(
            BreakoutUpdate { members: Some(vec![member("a", "1"), banned]), ..BreakoutUpdate::default() },
            "2",
            &mut roster,
            &mut meeting,
        );
        assert_eq!(roster.participants_all().len(), 2);
        assert_eq!(roster.participants().len(), 1);
    }

    #[tokio::test]
    async fn start_emits_rooms_and_switches_to_update_when_running() {
        let socket = FakeSocket::new(true);
        socket.push_ack(json!({"success": true}));
        socket.push_ack(json!({"success": false, "reason": "Not allowed"}));
        let emitter = EventEmitter::new();
        let capture = EventCapture::attach(&emitter);
        let commands = BreakoutCommands {
            socket: socket.as_ref(),
            emitter: &emitter,
            room_name: "s1234567",
            ack_timeout: Duration::from_secs(30),
        };
        let assignment = rooms_of(&[&["a"], &["b"]]);

        commands.start(&assignment, "autoAssignNewRoom", false, false, 4).await.unwrap();
        let payload = socket.last_emit("startBreakout").unwrap();
        assert_eq!(payload["breakoutRooms"][1][0], json!({"name": "b", "breakRoom": 1}));
        assert_eq!(payload["newParticipantAction"], "autoAssignNewRoom");

        assert!(commands.start(&assignment, "manual", true, false, 4).await.is_err());
        assert!(socket.last_emit("updateBreakout").is_some());
        assert_eq!(capture.alerts(), vec!["Breakout rooms active", "Not allowed"]);
    }

    #[tokio::test]
    async fn start_refused_during_screen_share() {
        let socket = FakeSocket::new(true);
        let emitter = EventEmitter::new();
        let commands = BreakoutCommands {
            socket: socket.as_ref(),
            emitter: &emitter,
            room_name: "s1234567",
            ack_timeout: Duration::from_secs(30),
        };
        let assignment = rooms_of(&[&["a"]]);
        assert!(commands.start(&assignment, "manual", false, true, 4).await.is_err());
        assert!(socket.emitted_names().is_empty());
    }
}
